// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Texture layers: their own copy-on-write tree, exclusive pipeline
//! ownership, and the unit-index bookkeeping that keeps render order
//! contiguous.
//!
//! Layers are keyed by a stable `index` chosen by the caller but rendered at
//! a contiguous `unit_index`. Inserting or removing a layer shifts the units
//! of the layers above it; each shift may itself copy-on-write a shared
//! layer into the mutating pipeline.

use alloc::vec::Vec;

use kurbo::Affine;

use crate::state::{LayerStateMask, StateMask};
use crate::tree::{LayerEntry, LayerId, PipelineId, PipelineTree};
use crate::types::{CombineState, Filter, PipelineError, TextureHandle, WrapMode};

/// Scratch state for locating a layer by stable index and collecting the
/// layers whose units must shift to make room (or close a gap).
pub(crate) struct LayerInfo {
    index: i32,
    pub(crate) layer: Option<LayerId>,
    insert_after: Option<usize>,
    pub(crate) layers_to_shift: Vec<LayerId>,
    ignore_shift_layers_if_found: bool,
}

impl LayerInfo {
    pub(crate) fn new(index: i32, ignore_shift_layers_if_found: bool) -> Self {
        Self {
            index,
            layer: None,
            insert_after: None,
            layers_to_shift: Vec::new(),
            ignore_shift_layers_if_found,
        }
    }

    /// Unit index for a layer inserted at `self.index`.
    fn insertion_unit(&self) -> usize {
        self.insert_after.map_or(0, |unit| unit + 1)
    }
}

impl PipelineTree {
    // --- layer lifecycle ---

    /// Derive a new layer sharing all state with `src`.
    pub(crate) fn layer_copy(&mut self, src: LayerId) -> LayerId {
        let index = self.layer(src).index;
        let l = LayerId(self.layers.insert(LayerEntry::derived(index)));
        let zeroed = self.layers.set_parent(l.0, src.0, true);
        debug_assert!(zeroed.is_none(), "src is alive, so it was referenced");
        l
    }

    /// Drop a reference to a layer, destroying it at zero.
    pub(crate) fn release_layer(&mut self, l: LayerId) {
        if self.layers.release(l.0) {
            self.destroy_layer(l);
        }
    }

    fn destroy_layer(&mut self, l: LayerId) {
        debug_assert!(
            self.layer(l).owner.is_none(),
            "an owned layer is kept alive by its owner"
        );
        let zeroed = self.layers.unparent(l.0);
        debug_assert!(
            !self.layers.has_children(l.0),
            "children keep a layer alive"
        );
        let _ = self.layers.remove(l.0);
        if let Some(parent) = zeroed {
            self.destroy_layer(LayerId(parent));
        }
    }

    fn set_layer_parent(&mut self, l: LayerId, parent: LayerId) {
        let zeroed = self.layers.set_parent(l.0, parent.0, true);
        if let Some(old) = zeroed {
            self.destroy_layer(LayerId(old));
        }
    }

    /// Stable logical index of a layer.
    pub fn layer_index(&self, l: LayerId) -> i32 {
        self.layer(l).index
    }

    /// Render-order unit index of a layer.
    pub fn layer_unit_index(&self, l: LayerId) -> usize {
        let authority = self.layer_authority(l, LayerStateMask::UNIT);
        self.layer(authority).unit_index
    }

    // --- the layer pre-change protocol ---

    /// Make a layer safe to mutate on behalf of `required_owner`, deriving a
    /// new owned layer when the given one is shared. Returns the layer to
    /// write to, which may differ from `l`.
    ///
    /// `required_owner` may only be `None` for freshly created layers with
    /// no owner and no dependants.
    pub(crate) fn layer_pre_change_notify(
        &mut self,
        required_owner: Option<PipelineId>,
        l: LayerId,
        change: LayerStateMask,
    ) -> LayerId {
        let mut l = l;
        let is_new = !self.layers.has_children(l.0) && self.layer(l).owner.is_none();
        if !is_new {
            let owner =
                required_owner.expect("only fresh unowned layers may change without an owner");
            // A layer change is indirectly a change of its owner, so the
            // owner runs the full pipeline protocol first (flush, weak
            // teardown, copy-on-write).
            self.pre_change_notify(owner, StateMask::LAYERS, None);

            // Unlike pipelines, layers are simply immutable once shared:
            // either through dependants or through another owner.
            if self.layers.has_children(l.0) || self.layer(l).owner != Some(owner) {
                let new = self.layer_copy(l);
                if self.layer(l).owner == Some(owner) {
                    self.remove_layer_difference(owner, l, false);
                }
                self.add_layer_difference(owner, new, false);
                self.release_layer(new);
                l = new;
            }
        }

        if let Some(owner) = required_owner {
            self.entry_mut(owner).age += 1;
        }

        // Materialize the group about to change so the write has a
        // consistent baseline (multi-field groups may be partially written).
        let authority = self.layer_authority(l, change);
        self.initialize_layer_state(l, authority, change);

        l
    }

    /// Copy the value for every group in `differences` from `src` and mark
    /// `dest` as their authority.
    fn initialize_layer_state(&mut self, dest: LayerId, src: LayerId, differences: LayerStateMask) {
        self.layer_mut(dest).differences |= differences;
        if dest == src {
            return;
        }
        if differences.contains(LayerStateMask::UNIT) {
            let unit = self.layer(src).unit_index;
            self.layer_mut(dest).unit_index = unit;
        }
        if differences.contains(LayerStateMask::TEXTURE) {
            let texture = self.layer(src).texture;
            self.layer_mut(dest).texture = texture;
        }
        if differences.contains(LayerStateMask::FILTERS) {
            let (min, mag) = (self.layer(src).min_filter, self.layer(src).mag_filter);
            let d = self.layer_mut(dest);
            d.min_filter = min;
            d.mag_filter = mag;
        }
        if differences.contains(LayerStateMask::WRAP_MODES) {
            let (s, t, p) = (
                self.layer(src).wrap_s,
                self.layer(src).wrap_t,
                self.layer(src).wrap_p,
            );
            let d = self.layer_mut(dest);
            d.wrap_s = s;
            d.wrap_t = t;
            d.wrap_p = p;
        }
        if differences.intersects(LayerStateMask::NEEDS_BIG_STATE) {
            let src_big = self
                .layer(src)
                .big
                .as_ref()
                .expect("the source is an authority for a big-state group")
                .clone();
            let dest_big = self.layer_mut(dest).big.get_or_insert_default();
            if differences.contains(LayerStateMask::COMBINE) {
                dest_big.combine = src_big.combine;
            }
            if differences.contains(LayerStateMask::COMBINE_CONSTANT) {
                dest_big.combine_constant = src_big.combine_constant;
            }
            if differences.contains(LayerStateMask::USER_MATRIX) {
                dest_big.user_matrix = src_big.user_matrix;
            }
            if differences.contains(LayerStateMask::POINT_SPRITE_COORDS) {
                dest_big.point_sprite_coords = src_big.point_sprite_coords;
            }
        }
    }

    /// Reparent a layer past ancestors whose whole mask it overrides.
    fn layer_prune_redundant_ancestry(&mut self, l: LayerId) {
        let differences = self.layer(l).differences;
        let Some(mut new_parent) = self.layer_parent(l) else {
            return;
        };
        loop {
            let Some(grand) = self.layer_parent(new_parent) else {
                break;
            };
            if (self.layer(new_parent).differences | differences) == differences {
                new_parent = grand;
            } else {
                break;
            }
        }
        if Some(new_parent) != self.layer_parent(l) {
            self.set_layer_parent(l, new_parent);
        }
    }

    // --- layer differences and ownership ---

    pub(crate) fn add_layer_difference(
        &mut self,
        p: PipelineId,
        l: LayerId,
        inc_n_layers: bool,
    ) {
        debug_assert!(
            self.layer(l).owner.is_none(),
            "a layer has at most one owner"
        );
        self.layer_mut(l).owner = Some(p);
        self.layers.retain(l.0);

        self.pre_change_notify(p, StateMask::LAYERS, None);

        let e = self.entry_mut(p);
        e.differences |= StateMask::LAYERS;
        e.layer_differences.push(l);
        if inc_n_layers {
            e.n_layers += 1;
        }
    }

    pub(crate) fn remove_layer_difference(
        &mut self,
        p: PipelineId,
        l: LayerId,
        dec_n_layers: bool,
    ) {
        debug_assert!(
            self.layer(l).owner == Some(p),
            "only the owner may remove a layer difference"
        );
        self.pre_change_notify(p, StateMask::LAYERS, None);

        self.layer_mut(l).owner = None;
        let e = self.entry_mut(p);
        e.differences |= StateMask::LAYERS;
        e.layer_differences.retain(|&x| x != l);
        if dec_n_layers {
            e.n_layers -= 1;
        }
        self.release_layer(l);
    }

    /// A `LAYERS` authority with no local differences and an unchanged count
    /// can defer to the previous authority again.
    pub(crate) fn try_reverting_layers_authority(
        &mut self,
        authority: PipelineId,
        old_authority: Option<PipelineId>,
    ) {
        if !self.entry(authority).layer_differences.is_empty() {
            return;
        }
        let Some(parent) = self.parent(authority) else {
            return;
        };
        let old =
            old_authority.unwrap_or_else(|| self.authority(parent, StateMask::LAYERS));
        if self.entry(old).n_layers == self.entry(authority).n_layers {
            self.entry_mut(authority).differences -= StateMask::LAYERS;
        }
    }

    /// Drop a difference entry whose layer no longer differs from its
    /// parent, either by referencing the parent directly or by removing the
    /// entry when the parent would take over anyway.
    fn prune_empty_layer_difference(&mut self, p: PipelineId, l: LayerId) {
        debug_assert!(self.layer(l).differences.is_empty(), "entry must be empty");
        let parent = self
            .layer_parent(l)
            .expect("a derived layer always has a parent");

        if self.layer(parent).index == self.layer(l).index && self.layer(parent).owner.is_none() {
            // The parent is unowned: reference it in place of the empty
            // derived layer.
            self.layers.retain(parent.0);
            self.layer_mut(parent).owner = Some(p);
            let e = self.entry_mut(p);
            let pos = e
                .layer_differences
                .iter()
                .position(|&x| x == l)
                .expect("an empty difference is still owned");
            e.layer_differences[pos] = parent;
            self.layer_mut(l).owner = None;
            self.release_layer(l);
            self.invalidate_layer_caches(p);
            return;
        }

        // Find the layer that would become the authority for this index if
        // the difference went away.
        let Some(pipeline_parent) = self.parent(p) else {
            return;
        };
        let old_layers_authority = self.authority(pipeline_parent, StateMask::LAYERS);
        let mut info = LayerInfo::new(self.layer(l).index, true);
        self.gather_layer_info(old_layers_authority, &mut info);
        let Some(found) = info.layer else {
            // This entry is the defining layer for its index; keep it.
            return;
        };
        if found == parent {
            self.remove_layer_difference(p, l, false);
            self.try_reverting_layers_authority(p, Some(old_layers_authority));
        }
    }

    // --- the layers cache ---

    /// Rebuild the unit-index -> layer cache of a `LAYERS` authority.
    ///
    /// A node's `layer_differences` only covers layers changed relative to
    /// its parent; the rest are found by walking ancestors, keeping the
    /// nearest definition for each unit. Ancestor layers with units beyond
    /// `n_layers` are ignored.
    pub(crate) fn update_layers_cache(&mut self, p: PipelineId) {
        let n_layers = self.entry(p).n_layers;
        if self.entry(p).layers_cache.is_some() || n_layers == 0 {
            return;
        }
        let mut cache: Vec<Option<LayerId>> = alloc::vec![None; n_layers];
        let mut found = 0;
        let chain: Vec<PipelineId> = self.pipeline_ancestors(p).collect();
        'chain: for current in chain {
            if !self.entry(current).differences.contains(StateMask::LAYERS) {
                continue;
            }
            for l in self.entry(current).layer_differences.clone() {
                let unit = self.layer_unit_index(l);
                if unit < n_layers && cache[unit].is_none() {
                    cache[unit] = Some(l);
                    found += 1;
                    if found == n_layers {
                        break 'chain;
                    }
                }
            }
        }
        debug_assert!(found == n_layers, "every unit must resolve to a layer");
        self.entry_mut(p).layers_cache =
            Some(cache.into_iter().map(|slot| slot.expect("unit gap")).collect());
    }

    /// Number of layers visible through `p`.
    pub fn n_layers(&self, p: PipelineId) -> usize {
        let authority = self.authority(p, StateMask::LAYERS);
        self.entry(authority).n_layers
    }

    /// The authoritative layers of `p` in unit order.
    ///
    /// The returned snapshot stays valid until the layer set of `p` (or an
    /// ancestor) is next mutated; use [`PipelineTree::layer_indices`] when
    /// mutating while iterating.
    pub fn layers(&mut self, p: PipelineId) -> Vec<LayerId> {
        let authority = self.authority(p, StateMask::LAYERS);
        if self.entry(authority).n_layers == 0 {
            return Vec::new();
        }
        self.update_layers_cache(authority);
        self.entry(authority)
            .layers_cache
            .clone()
            .expect("cache was just rebuilt")
    }

    /// Stable layer indices of `p` in unit order. Indices survive layer
    /// mutations, unlike [`LayerId`]s which may be superseded by derived
    /// copies.
    pub fn layer_indices(&mut self, p: PipelineId) -> Vec<i32> {
        let layers = self.layers(p);
        layers.iter().map(|&l| self.layer(l).index).collect()
    }

    fn gather_layer_info(&mut self, authority: PipelineId, info: &mut LayerInfo) {
        for l in self.layers(authority) {
            let index = self.layer(l).index;
            if index == info.index {
                info.layer = Some(l);
                if info.ignore_shift_layers_if_found {
                    break;
                }
            } else if index < info.index {
                info.insert_after = Some(self.layer_unit_index(l));
            } else {
                info.layers_to_shift.push(l);
            }
        }
    }

    // --- unit assignment ---

    /// Move a layer to a new unit, deriving an owned copy when the layer is
    /// shared. Returns the layer actually written.
    pub(crate) fn set_layer_unit(
        &mut self,
        required_owner: Option<PipelineId>,
        l: LayerId,
        unit_index: usize,
    ) -> LayerId {
        let change = LayerStateMask::UNIT;
        let authority = self.layer_authority(l, change);
        if self.layer(authority).unit_index == unit_index {
            return l;
        }

        let new = self.layer_pre_change_notify(required_owner, l, change);
        let l = if new != l {
            new
        } else {
            // Still writing in place: maybe an ancestor already holds the
            // wanted unit and we can revert instead.
            if l == authority
                && let Some(parent) = self.layer_parent(authority)
            {
                let old_authority = self.layer_authority(parent, change);
                if self.layer(old_authority).unit_index == unit_index {
                    self.layer_mut(l).differences -= change;
                    return l;
                }
            }
            l
        };

        self.layer_mut(l).unit_index = unit_index;

        if l != authority {
            self.layer_mut(l).differences |= change;
            self.layer_prune_redundant_ancestry(l);
        }
        l
    }

    // --- finding and creating layers ---

    /// The layer at stable index `index`, created on demand.
    ///
    /// A created layer is inserted in `index` order: every existing layer
    /// with a higher index is shifted up one unit first (possibly deriving
    /// owned copies of shared layers), then the new layer is spliced in.
    pub fn get_layer(&mut self, p: PipelineId, index: i32) -> LayerId {
        let authority = self.authority(p, StateMask::LAYERS);
        let mut info = LayerInfo::new(index, true);
        self.gather_layer_info(authority, &mut info);
        if let Some(l) = info.layer {
            return l;
        }

        let unit_index = info.insertion_unit();
        let layer = if unit_index == 0 {
            self.layer_copy(self.default_layer_0)
        } else {
            let layer = self.layer_copy(self.default_layer_n);
            let moved = self.set_layer_unit(None, layer, unit_index);
            debug_assert!(moved == layer, "a fresh layer is directly mutable");
            layer
        };
        self.layer_mut(layer).index = index;

        for shift in info.layers_to_shift {
            let unit = self.layer_unit_index(shift);
            self.set_layer_unit(Some(p), shift, unit + 1);
        }

        self.add_layer_difference(p, layer, true);
        self.release_layer(layer);
        layer
    }

    /// Remove the layer at stable index `index`, shifting the layers above
    /// it down a unit. No-op when no such layer exists.
    pub fn remove_layer(&mut self, p: PipelineId, index: i32) {
        let authority = self.authority(p, StateMask::LAYERS);
        let mut info = LayerInfo::new(index, false);
        self.gather_layer_info(authority, &mut info);
        let Some(found) = info.layer else {
            return;
        };

        for shift in info.layers_to_shift {
            let unit = self.layer_unit_index(shift);
            self.set_layer_unit(Some(p), shift, unit - 1);
        }

        if self.layer(found).owner == Some(p) {
            self.remove_layer_difference(p, found, true);
        } else {
            // The layer is inherited: this pipeline just narrows its visible
            // range. The shifted copies above shadow the removed unit.
            self.pre_change_notify(p, StateMask::LAYERS, None);
            let e = self.entry_mut(p);
            e.differences |= StateMask::LAYERS;
            e.n_layers -= 1;
        }
        self.try_reverting_layers_authority(p, None);
        self.handle_automatic_blend_enable(p, StateMask::LAYERS);
    }

    /// Shrink the visible layer range of `p` to the first `keep_n` layers,
    /// unlinking any owned differences past the cut.
    pub fn prune_to_n_layers(&mut self, p: PipelineId, keep_n: usize) {
        let authority = self.authority(p, StateMask::LAYERS);
        if keep_n >= self.entry(authority).n_layers {
            return;
        }
        let cache = self.layers(p);
        let cutoff = self.layer(cache[keep_n]).index;

        self.pre_change_notify(p, StateMask::LAYERS, None);
        {
            let e = self.entry_mut(p);
            e.differences |= StateMask::LAYERS;
            e.n_layers = keep_n;
        }

        // Discarded differences are unlinked by stable index, not by
        // authority lookup: a shadowed entry would never be found through
        // the authority chain but must still go.
        let owned = self.entry(p).layer_differences.clone();
        for l in owned {
            if self.layer(l).index > cutoff {
                self.entry_mut(p).layer_differences.retain(|&x| x != l);
                self.layer_mut(l).owner = None;
                self.release_layer(l);
            }
        }
    }

    // --- per-layer getters (by pipeline and stable index) ---

    /// Texture of the layer at `index`, creating the layer on demand.
    pub fn layer_texture(&mut self, p: PipelineId, index: i32) -> Option<TextureHandle> {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::TEXTURE);
        self.layer(authority).texture
    }

    /// Min/mag filters of the layer at `index`.
    pub fn layer_filters(&mut self, p: PipelineId, index: i32) -> (Filter, Filter) {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::FILTERS);
        let e = self.layer(authority);
        (e.min_filter, e.mag_filter)
    }

    /// Minification filter of the layer at `index`.
    pub fn layer_min_filter(&mut self, p: PipelineId, index: i32) -> Filter {
        self.layer_filters(p, index).0
    }

    /// Magnification filter of the layer at `index`.
    pub fn layer_mag_filter(&mut self, p: PipelineId, index: i32) -> Filter {
        self.layer_filters(p, index).1
    }

    /// Wrap mode for the s coordinate of the layer at `index`.
    pub fn layer_wrap_mode_s(&mut self, p: PipelineId, index: i32) -> WrapMode {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::WRAP_MODES);
        self.layer(authority).wrap_s
    }

    /// Wrap mode for the t coordinate of the layer at `index`.
    pub fn layer_wrap_mode_t(&mut self, p: PipelineId, index: i32) -> WrapMode {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::WRAP_MODES);
        self.layer(authority).wrap_t
    }

    /// Wrap mode for the p coordinate of the layer at `index`.
    pub fn layer_wrap_mode_p(&mut self, p: PipelineId, index: i32) -> WrapMode {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::WRAP_MODES);
        self.layer(authority).wrap_p
    }

    /// Combine configuration of the layer at `index`.
    pub fn layer_combine(&mut self, p: PipelineId, index: i32) -> CombineState {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::COMBINE);
        self.layer_big(authority).combine
    }

    /// Combine constant of the layer at `index`.
    pub fn layer_combine_constant(&mut self, p: PipelineId, index: i32) -> [f32; 4] {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::COMBINE_CONSTANT);
        self.layer_big(authority).combine_constant
    }

    /// User texture-coordinate matrix of the layer at `index`.
    pub fn layer_matrix(&mut self, p: PipelineId, index: i32) -> Affine {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::USER_MATRIX);
        self.layer_big(authority).user_matrix
    }

    /// Whether the layer at `index` overrides the identity user matrix
    /// anywhere below the root layer.
    pub fn layer_has_user_matrix(&mut self, p: PipelineId, index: i32) -> bool {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::USER_MATRIX);
        // Only the root layer carries the never-written default.
        self.layer_parent(authority).is_some()
    }

    /// Whether point sprite coordinates are enabled for the layer at
    /// `index`.
    pub fn layer_point_sprite_coords(&mut self, p: PipelineId, index: i32) -> bool {
        let l = self.get_layer(p, index);
        let authority = self.layer_authority(l, LayerStateMask::POINT_SPRITE_COORDS);
        self.layer_big(authority).point_sprite_coords
    }

    // --- layer setters ---

    /// Bind `texture` to the layer at `index`, creating the layer on
    /// demand.
    pub fn set_layer_texture(
        &mut self,
        p: PipelineId,
        index: i32,
        texture: Option<TextureHandle>,
    ) {
        let change = LayerStateMask::TEXTURE;
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, change);
        if self.layer(authority).texture == texture {
            return;
        }

        let new = self.layer_pre_change_notify(Some(p), layer, change);
        let layer = if new != layer {
            new
        } else {
            if layer == authority
                && let Some(parent) = self.layer_parent(authority)
            {
                let old_authority = self.layer_authority(parent, change);
                if self.layer(old_authority).texture == texture {
                    self.layer_mut(layer).differences -= change;
                    debug_assert!(self.layer(layer).owner == Some(p), "in-place writes are owned");
                    if self.layer(layer).differences.is_empty() {
                        self.prune_empty_layer_difference(p, layer);
                    }
                    self.handle_automatic_blend_enable(p, StateMask::LAYERS);
                    return;
                }
            }
            layer
        };

        self.layer_mut(layer).texture = texture;

        if layer != authority {
            self.layer_mut(layer).differences |= change;
            self.layer_prune_redundant_ancestry(layer);
        }
        self.handle_automatic_blend_enable(p, StateMask::LAYERS);
    }

    /// Set min/mag filters for the layer at `index`.
    pub fn set_layer_filters(&mut self, p: PipelineId, index: i32, min: Filter, mag: Filter) {
        let change = LayerStateMask::FILTERS;
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, change);
        if self.layer(authority).min_filter == min && self.layer(authority).mag_filter == mag {
            return;
        }

        let new = self.layer_pre_change_notify(Some(p), layer, change);
        let layer = if new != layer {
            new
        } else {
            if layer == authority
                && let Some(parent) = self.layer_parent(authority)
            {
                let old_authority = self.layer_authority(parent, change);
                if self.layer(old_authority).min_filter == min
                    && self.layer(old_authority).mag_filter == mag
                {
                    self.layer_mut(layer).differences -= change;
                    debug_assert!(self.layer(layer).owner == Some(p), "in-place writes are owned");
                    if self.layer(layer).differences.is_empty() {
                        self.prune_empty_layer_difference(p, layer);
                    }
                    return;
                }
            }
            layer
        };

        let e = self.layer_mut(layer);
        e.min_filter = min;
        e.mag_filter = mag;

        if layer != authority {
            self.layer_mut(layer).differences |= change;
            self.layer_prune_redundant_ancestry(layer);
        }
    }

    fn set_layer_wrap_modes(
        &mut self,
        p: PipelineId,
        layer: LayerId,
        authority: LayerId,
        wrap_s: WrapMode,
        wrap_t: WrapMode,
        wrap_p: WrapMode,
    ) {
        let change = LayerStateMask::WRAP_MODES;
        {
            let a = self.layer(authority);
            if a.wrap_s == wrap_s && a.wrap_t == wrap_t && a.wrap_p == wrap_p {
                return;
            }
        }

        let new = self.layer_pre_change_notify(Some(p), layer, change);
        let layer = if new != layer {
            new
        } else {
            if layer == authority
                && let Some(parent) = self.layer_parent(authority)
            {
                let old_authority = self.layer_authority(parent, change);
                let old = self.layer(old_authority);
                if old.wrap_s == wrap_s && old.wrap_t == wrap_t && old.wrap_p == wrap_p {
                    self.layer_mut(layer).differences -= change;
                    debug_assert!(self.layer(layer).owner == Some(p), "in-place writes are owned");
                    if self.layer(layer).differences.is_empty() {
                        self.prune_empty_layer_difference(p, layer);
                    }
                    return;
                }
            }
            layer
        };

        let e = self.layer_mut(layer);
        e.wrap_s = wrap_s;
        e.wrap_t = wrap_t;
        e.wrap_p = wrap_p;

        if layer != authority {
            self.layer_mut(layer).differences |= change;
            self.layer_prune_redundant_ancestry(layer);
        }
    }

    /// Set the wrap mode for the s coordinate of the layer at `index`.
    pub fn set_layer_wrap_mode_s(&mut self, p: PipelineId, index: i32, mode: WrapMode) {
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, LayerStateMask::WRAP_MODES);
        let (t, pr) = (self.layer(authority).wrap_t, self.layer(authority).wrap_p);
        self.set_layer_wrap_modes(p, layer, authority, mode, t, pr);
    }

    /// Set the wrap mode for the t coordinate of the layer at `index`.
    pub fn set_layer_wrap_mode_t(&mut self, p: PipelineId, index: i32, mode: WrapMode) {
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, LayerStateMask::WRAP_MODES);
        let (s, pr) = (self.layer(authority).wrap_s, self.layer(authority).wrap_p);
        self.set_layer_wrap_modes(p, layer, authority, s, mode, pr);
    }

    /// Set the wrap mode for the p coordinate of the layer at `index`.
    pub fn set_layer_wrap_mode_p(&mut self, p: PipelineId, index: i32, mode: WrapMode) {
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, LayerStateMask::WRAP_MODES);
        let (s, t) = (self.layer(authority).wrap_s, self.layer(authority).wrap_t);
        self.set_layer_wrap_modes(p, layer, authority, s, t, mode);
    }

    /// Set all three wrap modes of the layer at `index` at once.
    pub fn set_layer_wrap_mode(&mut self, p: PipelineId, index: i32, mode: WrapMode) {
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, LayerStateMask::WRAP_MODES);
        self.set_layer_wrap_modes(p, layer, authority, mode, mode, mode);
    }

    /// Set the texture combine configuration of the layer at `index`.
    pub fn set_layer_combine(&mut self, p: PipelineId, index: i32, combine: CombineState) {
        let change = LayerStateMask::COMBINE;
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, change);
        if Self::combine_args_equal(&self.layer_big(authority).combine, &combine) {
            return;
        }

        let layer = self.layer_pre_change_notify(Some(p), layer, change);
        self.layer_big_mut(layer).combine = combine;

        if layer == authority
            && let Some(parent) = self.layer_parent(authority)
        {
            let old_authority = self.layer_authority(parent, change);
            let old = self.layer_big(old_authority).combine;
            if Self::combine_args_equal(&old, &combine) {
                self.layer_mut(layer).differences -= change;
                debug_assert!(self.layer(layer).owner == Some(p), "in-place writes are owned");
                if self.layer(layer).differences.is_empty() {
                    self.prune_empty_layer_difference(p, layer);
                }
                self.handle_automatic_blend_enable(p, StateMask::LAYERS);
                return;
            }
        }

        if layer != authority {
            self.layer_mut(layer).differences |= change;
            self.layer_prune_redundant_ancestry(layer);
        }
        self.handle_automatic_blend_enable(p, StateMask::LAYERS);
    }

    /// Set the combine constant of the layer at `index`.
    pub fn set_layer_combine_constant(&mut self, p: PipelineId, index: i32, constant: [f32; 4]) {
        let change = LayerStateMask::COMBINE_CONSTANT;
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, change);
        if self.layer_big(authority).combine_constant == constant {
            return;
        }

        let new = self.layer_pre_change_notify(Some(p), layer, change);
        let layer = if new != layer {
            new
        } else {
            if layer == authority
                && let Some(parent) = self.layer_parent(authority)
            {
                let old_authority = self.layer_authority(parent, change);
                if self.layer_big(old_authority).combine_constant == constant {
                    self.layer_mut(layer).differences -= change;
                    debug_assert!(self.layer(layer).owner == Some(p), "in-place writes are owned");
                    if self.layer(layer).differences.is_empty() {
                        self.prune_empty_layer_difference(p, layer);
                    }
                    self.handle_automatic_blend_enable(p, StateMask::LAYERS);
                    return;
                }
            }
            layer
        };

        self.layer_big_mut(layer).combine_constant = constant;

        if layer != authority {
            self.layer_mut(layer).differences |= change;
            self.layer_prune_redundant_ancestry(layer);
        }
        self.handle_automatic_blend_enable(p, StateMask::LAYERS);
    }

    /// Set the user texture-coordinate matrix of the layer at `index`.
    pub fn set_layer_matrix(&mut self, p: PipelineId, index: i32, matrix: Affine) {
        let change = LayerStateMask::USER_MATRIX;
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, change);
        if self.layer_big(authority).user_matrix == matrix {
            return;
        }

        let new = self.layer_pre_change_notify(Some(p), layer, change);
        let layer = if new != layer {
            new
        } else {
            if layer == authority
                && let Some(parent) = self.layer_parent(authority)
            {
                let old_authority = self.layer_authority(parent, change);
                if self.layer_big(old_authority).user_matrix == matrix {
                    self.layer_mut(layer).differences -= change;
                    debug_assert!(self.layer(layer).owner == Some(p), "in-place writes are owned");
                    if self.layer(layer).differences.is_empty() {
                        self.prune_empty_layer_difference(p, layer);
                    }
                    return;
                }
            }
            layer
        };

        self.layer_big_mut(layer).user_matrix = matrix;

        if layer != authority {
            self.layer_mut(layer).differences |= change;
            self.layer_prune_redundant_ancestry(layer);
        }
    }

    /// Enable or disable point sprite coordinates for the layer at `index`.
    /// Fails without touching the tree when the renderer lacks support.
    pub fn set_layer_point_sprite_coords(
        &mut self,
        p: PipelineId,
        index: i32,
        enable: bool,
    ) -> Result<(), PipelineError> {
        if enable && !self.caps.point_sprite_coords {
            return Err(PipelineError::PointSpriteCoordsUnsupported);
        }

        let change = LayerStateMask::POINT_SPRITE_COORDS;
        let layer = self.get_layer(p, index);
        let authority = self.layer_authority(layer, change);
        if self.layer_big(authority).point_sprite_coords == enable {
            return Ok(());
        }

        let new = self.layer_pre_change_notify(Some(p), layer, change);
        let layer = if new != layer {
            new
        } else {
            if layer == authority
                && let Some(parent) = self.layer_parent(authority)
            {
                let old_authority = self.layer_authority(parent, change);
                if self.layer_big(old_authority).point_sprite_coords == enable {
                    self.layer_mut(layer).differences -= change;
                    debug_assert!(self.layer(layer).owner == Some(p), "in-place writes are owned");
                    if self.layer(layer).differences.is_empty() {
                        self.prune_empty_layer_difference(p, layer);
                    }
                    return Ok(());
                }
            }
            layer
        };

        self.layer_big_mut(layer).point_sprite_coords = enable;

        if layer != authority {
            self.layer_mut(layer).differences |= change;
            self.layer_prune_redundant_ancestry(layer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Capabilities, Color};

    fn tex(id: u64) -> Option<TextureHandle> {
        Some(TextureHandle {
            id,
            has_alpha: false,
        })
    }

    fn unit_indices(tree: &mut PipelineTree, p: PipelineId) -> Vec<usize> {
        let layers = tree.layers(p);
        layers.iter().map(|&l| tree.layer_unit_index(l)).collect()
    }

    #[test]
    fn layers_insert_in_stable_index_order() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        assert_eq!(tree.n_layers(p), 0);

        // First layer: whatever the index, it lands at unit 0.
        let l2 = tree.get_layer(p, 2);
        assert_eq!(tree.layer_unit_index(l2), 0);
        assert_eq!(tree.layer_index(l2), 2);
        assert_eq!(tree.n_layers(p), 1);

        // A lower index inserts before it, shifting it up.
        let l1 = tree.get_layer(p, 1);
        assert_eq!(tree.layer_unit_index(l1), 0);
        assert_eq!(tree.n_layers(p), 2);
        assert_eq!(tree.layer_indices(p), [1, 2]);
        assert_eq!(unit_indices(&mut tree, p), [0, 1]);
    }

    #[test]
    fn get_layer_is_idempotent() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let a = tree.get_layer(p, 5);
        let b = tree.get_layer(p, 5);
        assert_eq!(a, b);
        assert_eq!(tree.n_layers(p), 1);
    }

    #[test]
    fn unit_indices_stay_contiguous_across_churn() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        for index in [7, 3, 9, 5, 1] {
            let _ = tree.get_layer(p, index);
        }
        assert_eq!(tree.layer_indices(p), [1, 3, 5, 7, 9]);
        assert_eq!(unit_indices(&mut tree, p), [0, 1, 2, 3, 4]);

        tree.remove_layer(p, 5);
        tree.remove_layer(p, 1);
        assert_eq!(tree.layer_indices(p), [3, 7, 9]);
        assert_eq!(unit_indices(&mut tree, p), [0, 1, 2]);

        let _ = tree.get_layer(p, 4);
        assert_eq!(tree.layer_indices(p), [3, 4, 7, 9]);
        assert_eq!(unit_indices(&mut tree, p), [0, 1, 2, 3]);
    }

    #[test]
    fn remove_layer_without_a_match_is_a_no_op() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let _ = tree.get_layer(p, 1);
        tree.remove_layer(p, 42);
        assert_eq!(tree.n_layers(p), 1);
    }

    #[test]
    fn shared_layers_copy_on_write_per_pipeline() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_layer_texture(a, 0, tex(1));
        let b = tree.copy(a);

        // b inherits a's layer; mutating it through b must not disturb a.
        tree.set_layer_texture(b, 0, tex(2));
        assert_eq!(tree.layer_texture(a, 0), tex(1));
        assert_eq!(tree.layer_texture(b, 0), tex(2));
        assert_eq!(tree.n_layers(a), 1);
        assert_eq!(tree.n_layers(b), 1);
    }

    #[test]
    fn layer_count_is_inherited_until_overridden() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_layer_texture(a, 0, tex(1));
        tree.set_layer_texture(a, 1, tex(2));
        let b = tree.copy(a);
        assert_eq!(tree.n_layers(b), 2);
        assert_eq!(
            tree.authority(b, StateMask::LAYERS),
            a,
            "b defers to a for layer state"
        );
    }

    #[test]
    fn writing_the_inherited_texture_back_reverts_authority() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        // Extra authority bits keep b (and its derived layer) parented
        // under a rather than pruned straight to the roots.
        tree.set_color(a, Color::new(1, 1, 1, 255));
        tree.set_layer_texture(a, 0, tex(1));
        tree.set_layer_filters(a, 0, Filter::Nearest, Filter::Nearest);
        let b = tree.copy(a);

        tree.set_layer_texture(b, 0, tex(9));
        assert_eq!(tree.authority(b, StateMask::LAYERS), b);

        // Writing a's value back makes b's whole layer difference empty, so
        // it is pruned and authority reverts to a.
        tree.set_layer_texture(b, 0, tex(1));
        assert_eq!(tree.layer_texture(b, 0), tex(1));
        assert_eq!(tree.authority(b, StateMask::LAYERS), a);
    }

    #[test]
    fn filters_and_wrap_modes_resolve_through_layer_ancestry() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        tree.set_layer_texture(p, 0, tex(1));
        assert_eq!(
            tree.layer_filters(p, 0),
            (Filter::Linear, Filter::Linear),
            "defaults come from the root layer"
        );

        tree.set_layer_filters(p, 0, Filter::Nearest, Filter::Linear);
        assert_eq!(tree.layer_filters(p, 0), (Filter::Nearest, Filter::Linear));

        tree.set_layer_wrap_mode_s(p, 0, WrapMode::Repeat);
        assert_eq!(tree.layer_wrap_mode_s(p, 0), WrapMode::Repeat);
        assert_eq!(tree.layer_wrap_mode_t(p, 0), WrapMode::Automatic);

        tree.set_layer_wrap_mode(p, 0, WrapMode::ClampToEdge);
        assert_eq!(tree.layer_wrap_mode_t(p, 0), WrapMode::ClampToEdge);
        assert_eq!(tree.layer_wrap_mode_p(p, 0), WrapMode::ClampToEdge);
    }

    #[test]
    fn user_matrix_is_detected() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        tree.set_layer_texture(p, 0, tex(1));
        assert!(!tree.layer_has_user_matrix(p, 0));
        tree.set_layer_matrix(p, 0, Affine::scale(2.0));
        assert!(tree.layer_has_user_matrix(p, 0));
        assert_eq!(tree.layer_matrix(p, 0), Affine::scale(2.0));
    }

    #[test]
    fn point_sprite_coords_respect_capabilities() {
        let mut tree = PipelineTree::new(Capabilities {
            point_sprite_coords: false,
        });
        let p = tree.new_pipeline();
        let age = tree.age(p);
        assert_eq!(
            tree.set_layer_point_sprite_coords(p, 0, true),
            Err(PipelineError::PointSpriteCoordsUnsupported)
        );
        assert_eq!(tree.age(p), age, "a rejected change must not mutate");
        // Disabling is always allowed.
        assert_eq!(tree.set_layer_point_sprite_coords(p, 0, false), Ok(()));

        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        assert_eq!(tree.set_layer_point_sprite_coords(p, 0, true), Ok(()));
        assert!(tree.layer_point_sprite_coords(p, 0));
    }

    #[test]
    fn prune_to_n_layers_unlinks_discarded_differences() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        for index in 0..4 {
            tree.set_layer_texture(p, index, tex(index as u64 + 1));
        }
        assert_eq!(tree.n_layers(p), 4);

        tree.prune_to_n_layers(p, 2);
        assert_eq!(tree.n_layers(p), 2);
        assert_eq!(tree.layer_indices(p), [0, 1]);
        assert_eq!(unit_indices(&mut tree, p), [0, 1]);
    }

    #[test]
    fn layer_combine_round_trips() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let mut combine = CombineState::default();
        combine.rgb_func = crate::types::CombineFunc::Add;
        tree.set_layer_combine(p, 0, combine);
        assert_eq!(tree.layer_combine(p, 0).rgb_func, crate::types::CombineFunc::Add);

        tree.set_layer_combine_constant(p, 0, [0.5, 0.5, 0.5, 1.0]);
        assert_eq!(tree.layer_combine_constant(p, 0), [0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn scripted_insertion_scenario() {
        // Start with a copy of the default pipeline (0 layers). Asking for
        // index 2 creates the first layer at unit 0; asking for index 1
        // inserts before it and shifts it to unit 1.
        let mut tree = PipelineTree::default();
        let p = tree.copy(tree.default_pipeline());

        let l2 = tree.get_layer(p, 2);
        assert_eq!(tree.layer_unit_index(l2), 0);
        assert_eq!(tree.layer_index(l2), 2);
        assert_eq!(tree.n_layers(p), 1);

        let l1 = tree.get_layer(p, 1);
        assert_eq!(tree.layer_unit_index(l1), 0);
        assert_eq!(tree.n_layers(p), 2);
        let shifted = tree.layers(p)[1];
        assert_eq!(tree.layer_index(shifted), 2);
        assert_eq!(tree.layer_unit_index(shifted), 1);
    }

    #[test]
    fn color_of_transparent_texture_enables_blending() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        tree.set_layer_texture(
            p,
            0,
            Some(TextureHandle {
                id: 1,
                has_alpha: true,
            }),
        );
        assert!(tree.real_blend_enable(p), "alpha texture forces blending");

        tree.set_layer_texture(
            p,
            0,
            Some(TextureHandle {
                id: 2,
                has_alpha: false,
            }),
        );
        assert!(!tree.real_blend_enable(p));
    }
}
