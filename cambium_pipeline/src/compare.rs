// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Structural diffing and render-equivalence.
//!
//! [`PipelineTree::compare_differences`] walks two nodes' ancestor chains to
//! their common ancestor and ORs every mask in between: a conservative
//! over-approximation of the groups that might differ. [`PipelineTree::equal`]
//! then resolves both authorities for each flagged group and applies a
//! group-specific comparator. False positives (unequal verdicts for equal
//! configurations) cost a redundant state change; false negatives would
//! corrupt rendering and are never allowed.

use alloc::vec::Vec;

use crate::state::{LayerStateMask, StateMask};
use crate::tree::{LayerId, PipelineId, PipelineTree};
use crate::types::CombineState;

impl PipelineTree {
    /// A conservative mask of the state groups that might differ between
    /// two pipelines.
    pub fn compare_differences(&self, p0: PipelineId, p1: PipelineId) -> StateMask {
        let chain0: Vec<PipelineId> = self.pipeline_ancestors(p0).collect();
        let chain1: Vec<PipelineId> = self.pipeline_ancestors(p1).collect();

        // Align the chains at the root (always shared) and scan inward for
        // the first divergence; the common ancestor is just above it. With
        // no divergence one node is a direct ancestor of the other and the
        // last node compared is the common ancestor itself.
        let len0 = chain0.len();
        let len1 = chain1.len();
        let mut common_ancestor = None;
        let mut last_shared = chain0[len0 - 1];
        for i in 0..len0.min(len1) - 1 {
            let n0 = chain0[len0 - 2 - i];
            let n1 = chain1[len1 - 2 - i];
            if n0 != n1 {
                common_ancestor = Some(self.parent(n0).expect("divergence is below the root"));
                break;
            }
            last_shared = n0;
        }
        let common_ancestor = common_ancestor.unwrap_or(last_shared);

        let mut differences = StateMask::empty();
        for &n in chain0.iter().take_while(|&&n| n != common_ancestor) {
            differences |= self.entry(n).differences;
        }
        for &n in chain1.iter().take_while(|&&n| n != common_ancestor) {
            differences |= self.entry(n).differences;
        }
        differences
    }

    /// Layer counterpart of [`PipelineTree::compare_differences`].
    pub fn layer_compare_differences(&self, l0: LayerId, l1: LayerId) -> LayerStateMask {
        let chain0: Vec<LayerId> = self.layer_ancestors(l0).collect();
        let chain1: Vec<LayerId> = self.layer_ancestors(l1).collect();

        let len0 = chain0.len();
        let len1 = chain1.len();
        let mut common_ancestor = None;
        let mut last_shared = chain0[len0 - 1];
        for i in 0..len0.min(len1) - 1 {
            let n0 = chain0[len0 - 2 - i];
            let n1 = chain1[len1 - 2 - i];
            if n0 != n1 {
                common_ancestor =
                    Some(self.layer_parent(n0).expect("divergence is below the root"));
                break;
            }
            last_shared = n0;
        }
        let common_ancestor = common_ancestor.unwrap_or(last_shared);

        let mut differences = LayerStateMask::empty();
        for &n in chain0.iter().take_while(|&&n| n != common_ancestor) {
            differences |= self.layer(n).differences;
        }
        for &n in chain1.iter().take_while(|&&n| n != common_ancestor) {
            differences |= self.layer(n).differences;
        }
        differences
    }

    /// Whether two pipelines are render-equivalent: drawing with either
    /// produces the same output. Used by batching to split geometry only
    /// where state really changes.
    pub fn equal(&mut self, p0: PipelineId, p1: PipelineId) -> bool {
        self.equal_internal(p0, p1, false)
    }

    /// [`PipelineTree::equal`] minus the color group, for callers that log
    /// color per primitive rather than as pipeline state.
    pub fn equal_ignoring_color(&mut self, p0: PipelineId, p1: PipelineId) -> bool {
        self.equal_internal(p0, p1, true)
    }

    fn equal_internal(&mut self, p0: PipelineId, p1: PipelineId, skip_color: bool) -> bool {
        if p0 == p1 {
            return true;
        }

        // Non-sparse fast field first.
        if self.entry(p0).real_blend_enable != self.entry(p1).real_blend_enable {
            return false;
        }

        let differences = self.compare_differences(p0, p1);

        if differences.contains(StateMask::COLOR)
            && !skip_color
            && !self.simple_property_equal(p0, p1, StateMask::COLOR, Self::color_equal)
        {
            return false;
        }
        if differences.contains(StateMask::LIGHTING)
            && !self.simple_property_equal(p0, p1, StateMask::LIGHTING, Self::lighting_equal)
        {
            return false;
        }
        if differences.contains(StateMask::ALPHA_FUNC)
            && !self.simple_property_equal(p0, p1, StateMask::ALPHA_FUNC, Self::alpha_equal)
        {
            return false;
        }
        // The detailed blend configuration is unreachable while blending is
        // off, and BLEND_ENABLE itself is already reflected in
        // real_blend_enable checked above.
        if self.entry(p0).real_blend_enable
            && differences.contains(StateMask::BLEND)
            && !self.simple_property_equal(p0, p1, StateMask::BLEND, Self::blend_equal)
        {
            return false;
        }
        if differences.contains(StateMask::DEPTH)
            && !self.simple_property_equal(p0, p1, StateMask::DEPTH, Self::depth_equal)
        {
            return false;
        }
        if differences.contains(StateMask::FOG)
            && !self.simple_property_equal(p0, p1, StateMask::FOG, Self::fog_equal)
        {
            return false;
        }
        if differences.contains(StateMask::POINT_SIZE)
            && !self.simple_property_equal(p0, p1, StateMask::POINT_SIZE, Self::point_size_equal)
        {
            return false;
        }
        if differences.contains(StateMask::USER_PROGRAM)
            && !self.simple_property_equal(
                p0,
                p1,
                StateMask::USER_PROGRAM,
                Self::user_program_equal,
            )
        {
            return false;
        }
        if differences.contains(StateMask::LAYERS) {
            let authority0 = self.authority(p0, StateMask::LAYERS);
            let authority1 = self.authority(p1, StateMask::LAYERS);
            if !self.layers_equal(authority0, authority1) {
                return false;
            }
        }

        true
    }

    fn simple_property_equal(
        &self,
        p0: PipelineId,
        p1: PipelineId,
        state: StateMask,
        comparator: fn(&Self, PipelineId, PipelineId) -> bool,
    ) -> bool {
        comparator(
            self,
            self.authority(p0, state),
            self.authority(p1, state),
        )
    }

    // --- pipeline group comparators (applied to resolved authorities) ---

    pub(crate) fn color_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.entry(a0).color == self.entry(a1).color
    }

    pub(crate) fn blend_mode_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.entry(a0).blend_mode == self.entry(a1).blend_mode
    }

    pub(crate) fn lighting_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.big(a0).lighting == self.big(a1).lighting
    }

    pub(crate) fn alpha_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.big(a0).alpha == self.big(a1).alpha
    }

    pub(crate) fn blend_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.big(a0).blend == self.big(a1).blend
    }

    pub(crate) fn user_program_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.big(a0).user_program == self.big(a1).user_program
    }

    pub(crate) fn depth_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        let d0 = self.big(a0).depth;
        let d1 = self.big(a1).depth;
        // With the test off on both sides the remaining fields are
        // unreachable.
        if !d0.test_enabled && !d1.test_enabled {
            return true;
        }
        d0 == d1
    }

    pub(crate) fn fog_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.big(a0).fog == self.big(a1).fog
    }

    pub(crate) fn point_size_equal(&self, a0: PipelineId, a1: PipelineId) -> bool {
        self.big(a0).point_size == self.big(a1).point_size
    }

    // --- layers ---

    fn layers_equal(&mut self, authority0: PipelineId, authority1: PipelineId) -> bool {
        if self.entry(authority0).n_layers != self.entry(authority1).n_layers {
            return false;
        }
        let layers0 = self.layers(authority0);
        let layers1 = self.layers(authority1);
        layers0
            .iter()
            .zip(layers1.iter())
            .all(|(&l0, &l1)| self.layer_equal(l0, l1))
    }

    /// Whether two layers are render-equivalent.
    pub fn layer_equal(&self, l0: LayerId, l1: LayerId) -> bool {
        if l0 == l1 {
            return true;
        }
        let differences = self.layer_compare_differences(l0, l1);

        if differences.contains(LayerStateMask::TEXTURE)
            && !self.layer_state_equal(l0, l1, LayerStateMask::TEXTURE, Self::layer_texture_equal)
        {
            return false;
        }
        if differences.contains(LayerStateMask::COMBINE)
            && !self.layer_state_equal(l0, l1, LayerStateMask::COMBINE, Self::layer_combine_equal)
        {
            return false;
        }
        if differences.contains(LayerStateMask::COMBINE_CONSTANT)
            && !self.layer_state_equal(
                l0,
                l1,
                LayerStateMask::COMBINE_CONSTANT,
                Self::layer_combine_constant_equal,
            )
        {
            return false;
        }
        if differences.contains(LayerStateMask::FILTERS)
            && !self.layer_state_equal(l0, l1, LayerStateMask::FILTERS, Self::layer_filters_equal)
        {
            return false;
        }
        if differences.contains(LayerStateMask::WRAP_MODES)
            && !self.layer_state_equal(
                l0,
                l1,
                LayerStateMask::WRAP_MODES,
                Self::layer_wrap_modes_equal,
            )
        {
            return false;
        }
        if differences.contains(LayerStateMask::USER_MATRIX)
            && !self.layer_state_equal(
                l0,
                l1,
                LayerStateMask::USER_MATRIX,
                Self::layer_user_matrix_equal,
            )
        {
            return false;
        }
        if differences.contains(LayerStateMask::POINT_SPRITE_COORDS)
            && !self.layer_state_equal(
                l0,
                l1,
                LayerStateMask::POINT_SPRITE_COORDS,
                Self::layer_point_sprite_equal,
            )
        {
            return false;
        }

        true
    }

    fn layer_state_equal(
        &self,
        l0: LayerId,
        l1: LayerId,
        state: LayerStateMask,
        comparator: fn(&Self, LayerId, LayerId) -> bool,
    ) -> bool {
        comparator(
            self,
            self.layer_authority(l0, state),
            self.layer_authority(l1, state),
        )
    }

    fn layer_texture_equal(&self, a0: LayerId, a1: LayerId) -> bool {
        self.layer(a0).texture == self.layer(a1).texture
    }

    fn layer_combine_equal(&self, a0: LayerId, a1: LayerId) -> bool {
        Self::combine_args_equal(&self.layer_big(a0).combine, &self.layer_big(a1).combine)
    }

    /// Compare combine configurations, only looking at the argument slots
    /// their functions actually consume.
    pub(crate) fn combine_args_equal(c0: &CombineState, c1: &CombineState) -> bool {
        if c0.rgb_func != c1.rgb_func || c0.alpha_func != c1.alpha_func {
            return false;
        }
        for i in 0..c0.rgb_func.n_args() {
            if c0.rgb_src[i] != c1.rgb_src[i] || c0.rgb_op[i] != c1.rgb_op[i] {
                return false;
            }
        }
        for i in 0..c0.alpha_func.n_args() {
            if c0.alpha_src[i] != c1.alpha_src[i] || c0.alpha_op[i] != c1.alpha_op[i] {
                return false;
            }
        }
        true
    }

    fn layer_combine_constant_equal(&self, a0: LayerId, a1: LayerId) -> bool {
        self.layer_big(a0).combine_constant == self.layer_big(a1).combine_constant
    }

    fn layer_filters_equal(&self, a0: LayerId, a1: LayerId) -> bool {
        let (e0, e1) = (self.layer(a0), self.layer(a1));
        e0.min_filter == e1.min_filter && e0.mag_filter == e1.mag_filter
    }

    fn layer_wrap_modes_equal(&self, a0: LayerId, a1: LayerId) -> bool {
        let (e0, e1) = (self.layer(a0), self.layer(a1));
        e0.wrap_s == e1.wrap_s && e0.wrap_t == e1.wrap_t && e0.wrap_p == e1.wrap_p
    }

    fn layer_user_matrix_equal(&self, a0: LayerId, a1: LayerId) -> bool {
        self.layer_big(a0).user_matrix == self.layer_big(a1).user_matrix
    }

    fn layer_point_sprite_equal(&self, a0: LayerId, a1: LayerId) -> bool {
        self.layer_big(a0).point_sprite_coords == self.layer_big(a1).point_sprite_coords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlendFactor, BlendMode, Color, TextureHandle};

    fn tex(id: u64) -> Option<TextureHandle> {
        Some(TextureHandle {
            id,
            has_alpha: false,
        })
    }

    #[test]
    fn equal_is_reflexive() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_color(a, Color::new(1, 2, 3, 200));
        assert!(tree.equal(a, a));
    }

    #[test]
    fn fresh_copies_are_equal_both_ways() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_color(a, Color::new(1, 2, 3, 255));
        tree.set_point_size(a, 2.0);
        let b = tree.copy(a);
        assert!(tree.equal(a, b));
        assert!(tree.equal(b, a));
    }

    #[test]
    fn color_change_is_detected() {
        // Pipeline A opaque white, B a copy gone translucent: the diff mask
        // must include COLOR and equality must fail.
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_color(a, Color::WHITE);
        let b = tree.copy(a);
        tree.set_color(b, Color::new(0xff, 0xff, 0xff, 0x80));

        assert!(
            tree.compare_differences(a, b).contains(StateMask::COLOR),
            "color group must appear in the diff mask"
        );
        assert!(!tree.equal(a, b));
        assert!(!tree.equal(b, a));
    }

    #[test]
    fn equal_values_on_different_authorities_still_compare_equal() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_point_size(a, 3.0);
        let b = tree.new_pipeline();
        tree.set_point_size(b, 3.0);

        // Both pipelines are authorities for POINT_SIZE, so the conservative
        // diff flags the group; the value comparator then resolves it.
        assert!(tree.compare_differences(a, b).contains(StateMask::POINT_SIZE));
        assert!(tree.equal(a, b));
    }

    #[test]
    fn compare_differences_handles_direct_descendants() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_color(a, Color::new(1, 1, 1, 255));
        let b = tree.copy(a);
        tree.set_depth_test_enabled(b, true);

        // a is the common ancestor: only b's local mask contributes.
        let diff = tree.compare_differences(a, b);
        assert!(diff.contains(StateMask::DEPTH));
        assert!(!diff.contains(StateMask::COLOR));
    }

    #[test]
    fn blend_details_are_ignored_while_blending_is_off() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let b = tree.new_pipeline();

        // Give b a different blend function but keep blending disabled on
        // both sides.
        tree.set_blend_mode(a, BlendMode::Disabled);
        tree.set_blend_mode(b, BlendMode::Disabled);
        let mut blend = tree.blend(b);
        blend.src_factor_rgb = BlendFactor::DstColor;
        tree.set_blend(b, blend);

        assert!(
            tree.equal(a, b),
            "unreachable blend fields must not split batches"
        );

        // Forcing blending on makes the difference observable.
        tree.set_blend_mode(a, BlendMode::Enabled);
        tree.set_blend_mode(b, BlendMode::Enabled);
        assert!(!tree.equal(a, b));
    }

    #[test]
    fn depth_fields_are_ignored_while_both_tests_are_off() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let b = tree.new_pipeline();
        tree.set_depth_writing_enabled(b, false);
        assert!(tree.equal(a, b), "depth test off on both sides");

        tree.set_depth_test_enabled(a, true);
        tree.set_depth_test_enabled(b, true);
        assert!(!tree.equal(a, b), "write flag now observable");
    }

    #[test]
    fn layer_textures_split_equality() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_layer_texture(a, 0, tex(1));
        let b = tree.copy(a);
        assert!(tree.equal(a, b));

        tree.set_layer_texture(b, 0, tex(2));
        assert!(!tree.equal(a, b));

        // Same texture again: equal, even though b owns a derived layer.
        tree.set_layer_texture(b, 0, tex(1));
        assert!(tree.equal(a, b));
    }

    #[test]
    fn layer_counts_split_equality() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_layer_texture(a, 0, tex(1));
        let b = tree.copy(a);
        tree.set_layer_texture(b, 1, tex(2));
        assert!(!tree.equal(a, b), "layer counts differ");
    }

    #[test]
    fn equal_ignoring_color_skips_only_color() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let b = tree.copy(a);
        tree.set_color(b, Color::new(9, 9, 9, 255));
        assert!(!tree.equal(a, b));
        assert!(tree.equal_ignoring_color(a, b));

        tree.set_point_size(b, 5.0);
        assert!(
            !tree.equal_ignoring_color(a, b),
            "non-color differences still count"
        );
    }

    #[test]
    fn authority_chain_is_unique() {
        // For any pipeline and group, nodes strictly between the pipeline
        // and its authority never hold the group bit.
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_point_size(a, 2.0);
        let b = tree.copy(a);
        tree.set_color(b, Color::new(4, 4, 4, 255));
        let c = tree.copy(b);

        for group in [
            StateMask::COLOR,
            StateMask::POINT_SIZE,
            StateMask::DEPTH,
            StateMask::FOG,
        ] {
            let authority = tree.authority(c, group);
            assert!(tree.entry(authority).differences.intersects(group));
            let mut cur = c;
            while cur != authority {
                if cur != c {
                    assert!(
                        !tree.entry(cur).differences.intersects(group),
                        "no intermediate node may hold the bit"
                    );
                }
                cur = tree.parent(cur).expect("authority is an ancestor");
            }
        }
    }

    #[test]
    fn combine_comparison_ignores_unused_arg_slots() {
        use crate::types::{CombineFunc, CombineSource};
        let mut c0 = CombineState::default();
        let mut c1 = CombineState::default();
        c0.rgb_func = CombineFunc::Replace;
        c1.rgb_func = CombineFunc::Replace;
        // Divergence in the second slot, which Replace never reads.
        c1.rgb_src[1] = CombineSource::Constant;
        assert!(PipelineTree::combine_args_equal(&c0, &c1));

        c1.rgb_src[0] = CombineSource::Constant;
        assert!(!PipelineTree::combine_args_equal(&c0, &c1));
    }
}
