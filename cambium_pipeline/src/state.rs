// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! State-group masks and the lazily allocated "big state" blocks.
//!
//! Each bit of [`StateMask`] / [`LayerStateMask`] names one independently
//! trackable configuration group. A set bit on a node means that node is the
//! *authority* for the group: it holds the canonical value instead of
//! deferring to an ancestor.

use kurbo::Affine;

use crate::types::{
    AlphaState, BlendState, CombineState, DepthState, FogState, LightingState, ProgramHandle,
};

bitflags::bitflags! {
    /// Pipeline-level state groups.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StateMask: u16 {
        /// The pipeline color.
        const COLOR = 1 << 0;
        /// The blend mode selector (automatic/enabled/disabled).
        const BLEND_ENABLE = 1 << 1;
        /// The set of texture layers and their count.
        const LAYERS = 1 << 2;
        /// Material lighting parameters.
        const LIGHTING = 1 << 3;
        /// The alpha test.
        const ALPHA_FUNC = 1 << 4;
        /// The detailed blend configuration.
        const BLEND = 1 << 5;
        /// A user-supplied shader program.
        const USER_PROGRAM = 1 << 6;
        /// Depth test configuration.
        const DEPTH = 1 << 7;
        /// Fog configuration.
        const FOG = 1 << 8;
        /// Point size.
        const POINT_SIZE = 1 << 9;
        /// The derived "is blending actually on" flag. Not a sparse group:
        /// every node caches it, so it never appears in a `differences` mask.
        const REAL_BLEND_ENABLE = 1 << 10;

        /// Every sparse group; the root pipeline is authority for all of
        /// these by construction.
        const ALL_SPARSE = Self::COLOR.bits()
            | Self::BLEND_ENABLE.bits()
            | Self::LAYERS.bits()
            | Self::LIGHTING.bits()
            | Self::ALPHA_FUNC.bits()
            | Self::BLEND.bits()
            | Self::USER_PROGRAM.bits()
            | Self::DEPTH.bits()
            | Self::FOG.bits()
            | Self::POINT_SIZE.bits();

        /// Groups whose values live in the lazily allocated [`BigState`].
        const NEEDS_BIG_STATE = Self::LIGHTING.bits()
            | Self::ALPHA_FUNC.bits()
            | Self::BLEND.bits()
            | Self::USER_PROGRAM.bits()
            | Self::DEPTH.bits()
            | Self::FOG.bits()
            | Self::POINT_SIZE.bits();

        /// Groups that can flip the automatic blend-enable decision.
        const AFFECTS_BLENDING = Self::COLOR.bits()
            | Self::BLEND_ENABLE.bits()
            | Self::LAYERS.bits()
            | Self::LIGHTING.bits()
            | Self::BLEND.bits()
            | Self::USER_PROGRAM.bits();
    }
}

bitflags::bitflags! {
    /// Layer-level state groups.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct LayerStateMask: u16 {
        /// The render-order texture unit index.
        const UNIT = 1 << 0;
        /// The texture bound to the layer.
        const TEXTURE = 1 << 1;
        /// Min/mag sampling filters.
        const FILTERS = 1 << 2;
        /// The three wrap modes.
        const WRAP_MODES = 1 << 3;
        /// The texture combine function and arguments.
        const COMBINE = 1 << 4;
        /// The combine constant color.
        const COMBINE_CONSTANT = 1 << 5;
        /// The user texture-coordinate matrix.
        const USER_MATRIX = 1 << 6;
        /// Point sprite coordinate generation.
        const POINT_SPRITE_COORDS = 1 << 7;

        /// Every layer group; the root layer is authority for all of these.
        const ALL_SPARSE = Self::UNIT.bits()
            | Self::TEXTURE.bits()
            | Self::FILTERS.bits()
            | Self::WRAP_MODES.bits()
            | Self::COMBINE.bits()
            | Self::COMBINE_CONSTANT.bits()
            | Self::USER_MATRIX.bits()
            | Self::POINT_SPRITE_COORDS.bits();

        /// Groups whose values live in the lazily allocated
        /// [`LayerBigState`].
        const NEEDS_BIG_STATE = Self::COMBINE.bits()
            | Self::COMBINE_CONSTANT.bits()
            | Self::USER_MATRIX.bits()
            | Self::POINT_SPRITE_COORDS.bits();
    }
}

/// Infrequently set pipeline state, allocated only once a node becomes an
/// authority for any group stored here.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct BigState {
    pub(crate) lighting: LightingState,
    pub(crate) alpha: AlphaState,
    pub(crate) blend: BlendState,
    pub(crate) user_program: Option<ProgramHandle>,
    pub(crate) depth: DepthState,
    pub(crate) fog: FogState,
    pub(crate) point_size: f32,
}

impl BigState {
    pub(crate) fn with_defaults() -> Self {
        Self {
            point_size: 1.0,
            ..Self::default()
        }
    }
}

/// Infrequently set layer state, allocated on demand like [`BigState`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LayerBigState {
    pub(crate) combine: CombineState,
    pub(crate) combine_constant: [f32; 4],
    pub(crate) user_matrix: Affine,
    pub(crate) point_sprite_coords: bool,
}

impl Default for LayerBigState {
    fn default() -> Self {
        Self {
            combine: CombineState::default(),
            combine_constant: [0.0; 4],
            user_matrix: Affine::IDENTITY,
            point_sprite_coords: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_masks_cover_the_expected_groups() {
        assert!(StateMask::ALL_SPARSE.contains(StateMask::COLOR));
        assert!(StateMask::ALL_SPARSE.contains(StateMask::POINT_SIZE));
        assert!(!StateMask::ALL_SPARSE.contains(StateMask::REAL_BLEND_ENABLE));
        assert!(!StateMask::NEEDS_BIG_STATE.contains(StateMask::COLOR));
        assert!(StateMask::NEEDS_BIG_STATE.contains(StateMask::FOG));
    }

    #[test]
    fn layer_masks_cover_the_expected_groups() {
        assert_eq!(
            LayerStateMask::ALL_SPARSE.bits().count_ones(),
            8,
            "every layer group is sparse"
        );
        assert!(!LayerStateMask::NEEDS_BIG_STATE.contains(LayerStateMask::TEXTURE));
        assert!(LayerStateMask::NEEDS_BIG_STATE.contains(LayerStateMask::USER_MATRIX));
    }
}
