// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pipeline-level getters and setters.
//!
//! Every getter resolves the authority for its group and reads from there;
//! every setter follows the same protocol: resolve the authority, early-out
//! when the value would not change, run the pre-change notification, write,
//! then either revert authority to an ancestor or extend the local mask and
//! prune newly redundant ancestry.

use crate::state::StateMask;
use crate::tree::{PipelineId, PipelineTree};
use crate::types::{
    AlphaFunc, AlphaState, BlendMode, BlendState, Color, DepthState, DepthTestFunction, FogState,
    PipelineError, ProgramHandle,
};

impl PipelineTree {
    // --- color ---

    /// Effective pipeline color.
    pub fn color(&self, p: PipelineId) -> Color {
        let authority = self.authority(p, StateMask::COLOR);
        self.entry(authority).color
    }

    /// Set the pipeline color.
    pub fn set_color(&mut self, p: PipelineId, color: Color) {
        let state = StateMask::COLOR;
        let authority = self.authority(p, state);
        if self.entry(authority).color == color {
            return;
        }
        self.pre_change_notify(p, state, Some(color));
        self.entry_mut(p).color = color;
        self.update_authority(p, authority, state, Self::color_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    // --- blend mode ---

    /// Effective blend mode selector.
    pub fn blend_mode(&self, p: PipelineId) -> BlendMode {
        let authority = self.authority(p, StateMask::BLEND_ENABLE);
        self.entry(authority).blend_mode
    }

    /// Choose between automatic, forced-on, and forced-off blending.
    pub fn set_blend_mode(&mut self, p: PipelineId, mode: BlendMode) {
        let state = StateMask::BLEND_ENABLE;
        let authority = self.authority(p, state);
        if self.entry(authority).blend_mode == mode {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.entry_mut(p).blend_mode = mode;
        self.update_authority(p, authority, state, Self::blend_mode_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    /// The resolved "is blending actually on" decision, cached on every
    /// node.
    pub fn real_blend_enable(&self, p: PipelineId) -> bool {
        self.entry(p).real_blend_enable
    }

    // --- lighting ---

    /// Effective ambient reflectance.
    pub fn ambient(&self, p: PipelineId) -> [f32; 4] {
        let authority = self.authority(p, StateMask::LIGHTING);
        self.big(authority).lighting.ambient
    }

    /// Set the ambient reflectance.
    pub fn set_ambient(&mut self, p: PipelineId, ambient: [f32; 4]) {
        let state = StateMask::LIGHTING;
        let authority = self.authority(p, state);
        if self.big(authority).lighting.ambient == ambient {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).lighting.ambient = ambient;
        self.update_authority(p, authority, state, Self::lighting_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    /// Effective diffuse reflectance.
    pub fn diffuse(&self, p: PipelineId) -> [f32; 4] {
        let authority = self.authority(p, StateMask::LIGHTING);
        self.big(authority).lighting.diffuse
    }

    /// Set the diffuse reflectance.
    pub fn set_diffuse(&mut self, p: PipelineId, diffuse: [f32; 4]) {
        let state = StateMask::LIGHTING;
        let authority = self.authority(p, state);
        if self.big(authority).lighting.diffuse == diffuse {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).lighting.diffuse = diffuse;
        self.update_authority(p, authority, state, Self::lighting_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    /// Set ambient and diffuse reflectance to the same value.
    pub fn set_ambient_and_diffuse(&mut self, p: PipelineId, color: [f32; 4]) {
        self.set_ambient(p, color);
        self.set_diffuse(p, color);
    }

    /// Effective specular reflectance.
    pub fn specular(&self, p: PipelineId) -> [f32; 4] {
        let authority = self.authority(p, StateMask::LIGHTING);
        self.big(authority).lighting.specular
    }

    /// Set the specular reflectance.
    pub fn set_specular(&mut self, p: PipelineId, specular: [f32; 4]) {
        let state = StateMask::LIGHTING;
        let authority = self.authority(p, state);
        if self.big(authority).lighting.specular == specular {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).lighting.specular = specular;
        self.update_authority(p, authority, state, Self::lighting_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    /// Effective specular exponent.
    pub fn shininess(&self, p: PipelineId) -> f32 {
        let authority = self.authority(p, StateMask::LIGHTING);
        self.big(authority).lighting.shininess
    }

    /// Set the specular exponent. Negative values are rejected and the tree
    /// is left untouched.
    pub fn set_shininess(&mut self, p: PipelineId, shininess: f32) -> Result<(), PipelineError> {
        if shininess < 0.0 {
            return Err(PipelineError::InvalidShininess(shininess));
        }
        let state = StateMask::LIGHTING;
        let authority = self.authority(p, state);
        if self.big(authority).lighting.shininess == shininess {
            return Ok(());
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).lighting.shininess = shininess;
        self.update_authority(p, authority, state, Self::lighting_equal);
        Ok(())
    }

    /// Effective emitted light.
    pub fn emission(&self, p: PipelineId) -> [f32; 4] {
        let authority = self.authority(p, StateMask::LIGHTING);
        self.big(authority).lighting.emission
    }

    /// Set the emitted light.
    pub fn set_emission(&mut self, p: PipelineId, emission: [f32; 4]) {
        let state = StateMask::LIGHTING;
        let authority = self.authority(p, state);
        if self.big(authority).lighting.emission == emission {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).lighting.emission = emission;
        self.update_authority(p, authority, state, Self::lighting_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    // --- alpha test ---

    /// Effective alpha-test configuration.
    pub fn alpha_test(&self, p: PipelineId) -> AlphaState {
        let authority = self.authority(p, StateMask::ALPHA_FUNC);
        self.big(authority).alpha
    }

    /// Configure the alpha test.
    pub fn set_alpha_test(&mut self, p: PipelineId, func: AlphaFunc, reference: f32) {
        let state = StateMask::ALPHA_FUNC;
        let authority = self.authority(p, state);
        let alpha = self.big(authority).alpha;
        if alpha.func == func && alpha.reference == reference {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).alpha = AlphaState { func, reference };
        self.update_authority(p, authority, state, Self::alpha_equal);
    }

    // --- blend ---

    /// Effective blend configuration.
    pub fn blend(&self, p: PipelineId) -> BlendState {
        let authority = self.authority(p, StateMask::BLEND);
        self.big(authority).blend
    }

    /// Set the full blend configuration.
    pub fn set_blend(&mut self, p: PipelineId, blend: BlendState) {
        let state = StateMask::BLEND;
        let authority = self.authority(p, state);
        if self.big(authority).blend == blend {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).blend = blend;
        self.update_authority(p, authority, state, Self::blend_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    /// Set only the blend constant color.
    pub fn set_blend_constant(&mut self, p: PipelineId, constant: Color) {
        let state = StateMask::BLEND;
        let authority = self.authority(p, state);
        if self.big(authority).blend.constant == constant {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).blend.constant = constant;
        self.update_authority(p, authority, state, Self::blend_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    // --- user program ---

    /// Effective user shader program.
    pub fn user_program(&self, p: PipelineId) -> Option<ProgramHandle> {
        let authority = self.authority(p, StateMask::USER_PROGRAM);
        self.big(authority).user_program
    }

    /// Attach or detach a user shader program.
    pub fn set_user_program(&mut self, p: PipelineId, program: Option<ProgramHandle>) {
        let state = StateMask::USER_PROGRAM;
        let authority = self.authority(p, state);
        if self.big(authority).user_program == program {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).user_program = program;
        self.update_authority(p, authority, state, Self::user_program_equal);
        self.handle_automatic_blend_enable(p, state);
    }

    // --- depth ---

    /// Effective depth configuration.
    pub fn depth_state(&self, p: PipelineId) -> DepthState {
        let authority = self.authority(p, StateMask::DEPTH);
        self.big(authority).depth
    }

    /// Whether the depth test is enabled.
    pub fn depth_test_enabled(&self, p: PipelineId) -> bool {
        self.depth_state(p).test_enabled
    }

    /// Enable or disable the depth test.
    pub fn set_depth_test_enabled(&mut self, p: PipelineId, enable: bool) {
        let state = StateMask::DEPTH;
        let authority = self.authority(p, state);
        if self.big(authority).depth.test_enabled == enable {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).depth.test_enabled = enable;
        self.update_authority(p, authority, state, Self::depth_equal);
    }

    /// Whether fragments write their depth.
    pub fn depth_writing_enabled(&self, p: PipelineId) -> bool {
        self.depth_state(p).write_enabled
    }

    /// Enable or disable depth writes.
    pub fn set_depth_writing_enabled(&mut self, p: PipelineId, enable: bool) {
        let state = StateMask::DEPTH;
        let authority = self.authority(p, state);
        if self.big(authority).depth.write_enabled == enable {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).depth.write_enabled = enable;
        self.update_authority(p, authority, state, Self::depth_equal);
    }

    /// The depth comparison function.
    pub fn depth_test_function(&self, p: PipelineId) -> DepthTestFunction {
        self.depth_state(p).test_function
    }

    /// Set the depth comparison function.
    pub fn set_depth_test_function(&mut self, p: PipelineId, function: DepthTestFunction) {
        let state = StateMask::DEPTH;
        let authority = self.authority(p, state);
        if self.big(authority).depth.test_function == function {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).depth.test_function = function;
        self.update_authority(p, authority, state, Self::depth_equal);
    }

    /// The (near, far) depth range mapping.
    pub fn depth_range(&self, p: PipelineId) -> (f32, f32) {
        let depth = self.depth_state(p);
        (depth.range_near, depth.range_far)
    }

    /// Set the depth range mapping.
    pub fn set_depth_range(&mut self, p: PipelineId, near: f32, far: f32) {
        let state = StateMask::DEPTH;
        let authority = self.authority(p, state);
        let depth = self.big(authority).depth;
        if depth.range_near == near && depth.range_far == far {
            return;
        }
        self.pre_change_notify(p, state, None);
        let depth = &mut self.big_mut(p).depth;
        depth.range_near = near;
        depth.range_far = far;
        self.update_authority(p, authority, state, Self::depth_equal);
    }

    // --- fog ---

    /// Effective fog configuration.
    pub fn fog(&self, p: PipelineId) -> FogState {
        let authority = self.authority(p, StateMask::FOG);
        self.big(authority).fog
    }

    /// Set the fog configuration.
    pub fn set_fog(&mut self, p: PipelineId, fog: FogState) {
        let state = StateMask::FOG;
        let authority = self.authority(p, state);
        if self.big(authority).fog == fog {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).fog = fog;
        self.update_authority(p, authority, state, Self::fog_equal);
    }

    // --- point size ---

    /// Effective point size.
    pub fn point_size(&self, p: PipelineId) -> f32 {
        let authority = self.authority(p, StateMask::POINT_SIZE);
        self.big(authority).point_size
    }

    /// Set the point size.
    pub fn set_point_size(&mut self, p: PipelineId, point_size: f32) {
        let state = StateMask::POINT_SIZE;
        let authority = self.authority(p, state);
        if self.big(authority).point_size == point_size {
            return;
        }
        self.pre_change_notify(p, state, None);
        self.big_mut(p).point_size = point_size;
        self.update_authority(p, authority, state, Self::point_size_equal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlendFactor, Capabilities};

    #[test]
    fn defaults_resolve_through_the_root() {
        let tree = PipelineTree::new(Capabilities::default());
        let d = tree.default_pipeline();
        assert_eq!(tree.color(d), Color::WHITE);
        assert_eq!(tree.blend_mode(d), BlendMode::Automatic);
        assert_eq!(tree.point_size(d), 1.0);
        assert_eq!(tree.depth_range(d), (0.0, 1.0));
        assert_eq!(tree.ambient(d), [0.2, 0.2, 0.2, 1.0]);
        assert!(tree.user_program(d).is_none());
        assert!(!tree.fog(d).enabled);
    }

    #[test]
    fn copy_reads_identical_state() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_color(a, Color::new(3, 4, 5, 255));
        tree.set_point_size(a, 9.0);
        tree.set_depth_test_enabled(a, true);

        let b = tree.copy(a);
        assert_eq!(tree.color(b), tree.color(a));
        assert_eq!(tree.point_size(b), tree.point_size(a));
        assert_eq!(tree.depth_state(b), tree.depth_state(a));
        assert_eq!(tree.blend(b), tree.blend(a));
        assert_eq!(tree.fog(b), tree.fog(a));
        assert_eq!(tree.alpha_test(b), tree.alpha_test(a));
    }

    #[test]
    fn setting_the_inherited_value_keeps_authority_upstream() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_point_size(a, 5.0);
        let b = tree.copy(a);

        // Writing the same value the ancestor holds is a no-op; b never
        // becomes an authority.
        tree.set_point_size(b, 5.0);
        assert_eq!(tree.authority(b, StateMask::POINT_SIZE), a);
    }

    #[test]
    fn reverting_to_ancestor_value_drops_authority() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        // The color bit keeps b parented under a instead of pruned past it.
        tree.set_color(a, Color::new(1, 1, 1, 255));
        tree.set_point_size(a, 5.0);
        let b = tree.copy(a);
        tree.set_point_size(b, 7.0);
        assert_eq!(tree.authority(b, StateMask::POINT_SIZE), b);

        // Writing the ancestor's value back makes the local authority
        // redundant; resolution reverts to the ancestor.
        tree.set_point_size(b, 5.0);
        assert_eq!(tree.authority(b, StateMask::POINT_SIZE), a);
    }

    #[test]
    fn negative_shininess_is_rejected_without_side_effects() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let age = tree.age(a);
        assert_eq!(
            tree.set_shininess(a, -1.0),
            Err(PipelineError::InvalidShininess(-1.0))
        );
        assert_eq!(tree.age(a), age, "a rejected change must not mutate");
        assert_eq!(tree.shininess(a), 0.0);
        assert!(tree.set_shininess(a, 2.0).is_ok());
        assert_eq!(tree.shininess(a), 2.0);
    }

    #[test]
    fn blend_factor_changes_force_real_blending() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        assert!(!tree.real_blend_enable(a));
        let mut blend = tree.blend(a);
        blend.src_factor_rgb = BlendFactor::SrcAlpha;
        tree.set_blend(a, blend);
        assert!(
            tree.real_blend_enable(a),
            "a non-opaque-over function always blends"
        );
    }

    #[test]
    fn lighting_fields_are_independent_of_each_other() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_ambient(a, [0.5, 0.5, 0.5, 1.0]);
        // Other lighting fields keep their bootstrapped defaults.
        assert_eq!(tree.diffuse(a), [0.8, 0.8, 0.8, 1.0]);
        assert_eq!(tree.shininess(a), 0.0);

        tree.set_ambient_and_diffuse(a, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(tree.ambient(a), [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(tree.diffuse(a), [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn user_program_toggles_blending() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_user_program(a, Some(ProgramHandle(77)));
        assert!(
            tree.real_blend_enable(a),
            "an unknown shader may output alpha"
        );
        tree.set_user_program(a, None);
        assert!(!tree.real_blend_enable(a));
    }
}
