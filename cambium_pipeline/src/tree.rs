// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The pipeline tree container: node storage, lifecycle, authority
//! resolution, and the pre-change protocol that makes copy-on-write safe.

use alloc::boxed::Box;
use alloc::vec::Vec;

use cambium_forest::{Forest, NodeId};

use crate::state::{BigState, LayerBigState, LayerStateMask, StateMask};
use crate::types::{BlendMode, Capabilities, Color, Filter, TextureHandle, WrapMode};

/// Handle to a pipeline node. Stale once the pipeline is destroyed; check
/// with [`PipelineTree::is_alive`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineId(pub(crate) NodeId);

/// Handle to a layer node. Stale once the layer is destroyed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayerId(pub(crate) NodeId);

pub(crate) struct PipelineEntry {
    /// State groups this node is the authority for.
    pub(crate) differences: StateMask,
    pub(crate) is_weak: bool,
    /// Bumped on every successful mutation; dependent caches compare ages to
    /// detect staleness.
    pub(crate) age: u64,
    /// Queued render batches referencing this pipeline's current state.
    pub(crate) batch_count: u32,
    pub(crate) label: Option<&'static str>,
    // Sparse fast fields, stored inline so no big-state allocation is needed
    // for the common color/blend-mode changes. Only valid on an authority.
    pub(crate) color: Color,
    pub(crate) blend_mode: BlendMode,
    /// Not sparse: cached on every node for fast render-equivalence checks.
    pub(crate) real_blend_enable: bool,
    /// Total layers visible through this node; only valid on a `LAYERS`
    /// authority. May exceed `layer_differences.len()` when some layers are
    /// inherited.
    pub(crate) n_layers: usize,
    /// Layers this node owns, added or overridden relative to its parent.
    pub(crate) layer_differences: Vec<LayerId>,
    /// Unit index -> authoritative layer, rebuilt lazily. `None` means dirty.
    pub(crate) layers_cache: Option<Vec<LayerId>>,
    pub(crate) big: Option<Box<BigState>>,
    pub(crate) on_destroy: Option<Box<dyn FnMut(PipelineId)>>,
}

impl PipelineEntry {
    fn derived(real_blend_enable: bool, is_weak: bool) -> Self {
        Self {
            differences: StateMask::empty(),
            is_weak,
            age: 0,
            batch_count: 0,
            label: None,
            color: Color::WHITE,
            blend_mode: BlendMode::Automatic,
            real_blend_enable,
            n_layers: 0,
            layer_differences: Vec::new(),
            layers_cache: None,
            big: None,
            on_destroy: None,
        }
    }
}

pub(crate) struct LayerEntry {
    /// The single pipeline currently holding this layer in its
    /// `layer_differences`; ownership is exclusive.
    pub(crate) owner: Option<PipelineId>,
    /// Stable logical index, chosen by the caller.
    pub(crate) index: i32,
    pub(crate) differences: LayerStateMask,
    /// Contiguous render-order position; only valid on a `UNIT` authority.
    pub(crate) unit_index: usize,
    // Sparse fast fields; only valid on an authority.
    pub(crate) texture: Option<TextureHandle>,
    pub(crate) min_filter: Filter,
    pub(crate) mag_filter: Filter,
    pub(crate) wrap_s: WrapMode,
    pub(crate) wrap_t: WrapMode,
    pub(crate) wrap_p: WrapMode,
    pub(crate) big: Option<Box<LayerBigState>>,
}

impl LayerEntry {
    pub(crate) fn derived(index: i32) -> Self {
        Self {
            owner: None,
            index,
            differences: LayerStateMask::empty(),
            unit_index: 0,
            texture: None,
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            wrap_s: WrapMode::Automatic,
            wrap_t: WrapMode::Automatic,
            wrap_p: WrapMode::Automatic,
            big: None,
        }
    }
}

/// A copy-on-write tree of pipeline and layer configurations.
///
/// Every pipeline is (directly or indirectly) derived from the default
/// pipeline, which is the authority for every state group by construction.
/// Copies start with zero local differences and share all state with their
/// source; mutation copies only what is needed, when it is needed.
///
/// All operations run to completion on the calling thread; callers serialize
/// access externally (typically by confining a tree to the render thread).
pub struct PipelineTree {
    pub(crate) caps: Capabilities,
    pub(crate) pipelines: Forest<PipelineEntry>,
    pub(crate) layers: Forest<LayerEntry>,
    default_pipeline: PipelineId,
    pub(crate) default_layer_0: LayerId,
    pub(crate) default_layer_n: LayerId,
    // Keeps both default layers permanently shared and therefore immutable.
    #[allow(dead_code, reason = "Held for its dependant link, never accessed.")]
    dummy_layer_dependant: LayerId,
    flush_hook: Option<Box<dyn FnMut()>>,
    flushed: Option<PipelineId>,
    flushed_changes: StateMask,
}

impl core::fmt::Debug for PipelineTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineTree")
            .field("pipelines", &self.pipelines)
            .field("layers", &self.layers)
            .field("default_pipeline", &self.default_pipeline)
            .field("flushed", &self.flushed)
            .finish_non_exhaustive()
    }
}

impl Default for PipelineTree {
    fn default() -> Self {
        Self::new(Capabilities::default())
    }
}

impl PipelineTree {
    /// Create a tree containing the default pipeline and default layers.
    pub fn new(caps: Capabilities) -> Self {
        let mut pipelines = Forest::new();
        let default_pipeline = PipelineId(pipelines.insert(PipelineEntry {
            differences: StateMask::ALL_SPARSE,
            is_weak: false,
            age: 0,
            batch_count: 0,
            label: Some("default pipeline"),
            color: Color::WHITE,
            blend_mode: BlendMode::Automatic,
            real_blend_enable: false,
            n_layers: 0,
            layer_differences: Vec::new(),
            layers_cache: None,
            big: Some(Box::new(BigState::with_defaults())),
            on_destroy: None,
        }));

        let mut layers = Forest::new();
        let default_layer_0 = LayerId(layers.insert(LayerEntry {
            owner: None,
            index: 0,
            differences: LayerStateMask::ALL_SPARSE,
            unit_index: 0,
            texture: None,
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            wrap_s: WrapMode::Automatic,
            wrap_t: WrapMode::Automatic,
            wrap_p: WrapMode::Automatic,
            big: Some(Box::new(LayerBigState::default())),
        }));

        let mut tree = Self {
            caps,
            pipelines,
            layers,
            default_pipeline,
            default_layer_0,
            default_layer_n: default_layer_0,
            dummy_layer_dependant: default_layer_0,
            flush_hook: None,
            flushed: None,
            flushed_changes: StateMask::empty(),
        };

        // Layers above unit 0 derive from a shared sibling of the root layer
        // that only overrides the unit index. A dummy dependant keeps both
        // default layers shared, so no mutation can ever touch them in place.
        let layer_n = tree.layer_copy(default_layer_0);
        let moved = tree.set_layer_unit(None, layer_n, 1);
        debug_assert!(moved == layer_n, "a fresh layer is directly mutable");
        tree.default_layer_n = layer_n;
        tree.dummy_layer_dependant = tree.layer_copy(layer_n);

        tree
    }

    /// The root pipeline every other pipeline derives from.
    pub fn default_pipeline(&self) -> PipelineId {
        self.default_pipeline
    }

    /// True while `p` refers to a live pipeline.
    pub fn is_alive(&self, p: PipelineId) -> bool {
        self.pipelines.is_alive(p.0)
    }

    /// Mutation counter for `p`. Bumped on every successful mutation, so
    /// dependent caches can detect staleness cheaply.
    pub fn age(&self, p: PipelineId) -> u64 {
        self.entry(p).age
    }

    /// Attach a diagnostic label, shown in [`PipelineTree::dump_dot`] output.
    pub fn set_label(&mut self, p: PipelineId, label: &'static str) {
        self.entry_mut(p).label = Some(label);
    }

    // --- entry access ---

    pub(crate) fn entry(&self, p: PipelineId) -> &PipelineEntry {
        self.pipelines.get(p.0)
    }

    pub(crate) fn entry_mut(&mut self, p: PipelineId) -> &mut PipelineEntry {
        self.pipelines.get_mut(p.0)
    }

    pub(crate) fn layer(&self, l: LayerId) -> &LayerEntry {
        self.layers.get(l.0)
    }

    pub(crate) fn layer_mut(&mut self, l: LayerId) -> &mut LayerEntry {
        self.layers.get_mut(l.0)
    }

    /// Big-state block of a node known to be an authority for a big-state
    /// group.
    pub(crate) fn big(&self, p: PipelineId) -> &BigState {
        self.entry(p)
            .big
            .as_ref()
            .expect("a big-state authority always carries a big-state block")
    }

    pub(crate) fn big_mut(&mut self, p: PipelineId) -> &mut BigState {
        self.entry_mut(p)
            .big
            .as_mut()
            .expect("a big-state authority always carries a big-state block")
    }

    pub(crate) fn layer_big(&self, l: LayerId) -> &LayerBigState {
        self.layer(l)
            .big
            .as_ref()
            .expect("a big-state authority always carries a big-state block")
    }

    pub(crate) fn layer_big_mut(&mut self, l: LayerId) -> &mut LayerBigState {
        self.layer_mut(l)
            .big
            .as_mut()
            .expect("a big-state authority always carries a big-state block")
    }

    // --- ancestry ---

    /// Parent of `p`, or `None` for the default pipeline.
    pub fn parent(&self, p: PipelineId) -> Option<PipelineId> {
        self.pipelines.parent(p.0).map(PipelineId)
    }

    pub(crate) fn layer_parent(&self, l: LayerId) -> Option<LayerId> {
        self.layers.parent(l.0).map(LayerId)
    }

    pub(crate) fn pipeline_ancestors(&self, p: PipelineId) -> impl Iterator<Item = PipelineId> {
        self.pipelines.ancestors(p.0).map(PipelineId)
    }

    pub(crate) fn layer_ancestors(&self, l: LayerId) -> impl Iterator<Item = LayerId> {
        self.layers.ancestors(l.0).map(LayerId)
    }

    /// The nearest node, starting at `p` itself, that is the authority for
    /// `group`. The default pipeline is an authority for everything, which
    /// guarantees termination; callers keep chains short via ancestry
    /// pruning.
    pub fn authority(&self, p: PipelineId, group: StateMask) -> PipelineId {
        let mut authority = p;
        while !self.entry(authority).differences.intersects(group) {
            authority = self
                .parent(authority)
                .expect("the root is an authority for every group");
        }
        authority
    }

    /// Layer counterpart of [`PipelineTree::authority`].
    pub fn layer_authority(&self, l: LayerId, group: LayerStateMask) -> LayerId {
        let mut authority = l;
        while !self.layer(authority).differences.intersects(group) {
            authority = self
                .layer_parent(authority)
                .expect("the root layer is an authority for every group");
        }
        authority
    }

    // --- lifecycle ---

    /// Derive a new pipeline from the default pipeline.
    pub fn new_pipeline(&mut self) -> PipelineId {
        let p = self.copy(self.default_pipeline);
        self.entry_mut(p).label = Some("new");
        p
    }

    /// Strong copy: an independently mutable pipeline sharing all state with
    /// `src` until mutated.
    pub fn copy(&mut self, src: PipelineId) -> PipelineId {
        self.copy_internal(src, false)
    }

    /// Weak copy: an ephemeral dependant that does not keep `src` alive and
    /// is destroyed (hook invoked, handle goes stale) as soon as any state it
    /// inherits is about to change.
    ///
    /// By the time `on_destroy` runs, the id it receives is already stale;
    /// the hook must not call back into the tree.
    pub fn weak_copy(
        &mut self,
        src: PipelineId,
        on_destroy: impl FnMut(PipelineId) + 'static,
    ) -> PipelineId {
        let p = self.copy_internal(src, true);
        self.entry_mut(p).on_destroy = Some(Box::new(on_destroy));
        p
    }

    fn copy_internal(&mut self, src: PipelineId, is_weak: bool) -> PipelineId {
        let real_blend_enable = self.entry(src).real_blend_enable;
        let p = PipelineId(
            self.pipelines
                .insert(PipelineEntry::derived(real_blend_enable, is_weak)),
        );
        self.set_pipeline_parent(p, src, !is_weak);
        // Copying through a weak source temporarily promotes its weak
        // ancestors to strong ones, for as long as the copy lives.
        if !is_weak {
            self.promote_weak_ancestors(p);
        }
        p
    }

    /// Bump `p`'s reference count.
    pub fn retain(&mut self, p: PipelineId) {
        self.pipelines.retain(p.0);
    }

    /// Drop a reference to `p`, destroying it when the last one goes away.
    pub fn release(&mut self, p: PipelineId) {
        if self.pipelines.release(p.0) {
            self.destroy_pipeline(p);
        }
    }

    fn destroy_pipeline(&mut self, p: PipelineId) {
        self.destroy_weak_children(p);
        debug_assert!(
            !self.pipelines.has_children(p.0),
            "a pipeline must have no strong dependants when destroyed"
        );
        if self.flushed == Some(p) {
            self.flushed = None;
        }
        // Capture the promoted ancestor chain before unlinking: the
        // promotion refs are dropped only once this node is fully gone, so
        // an ancestor torn down by the drop no longer sees us as a child.
        let promoted = if self.entry(p).is_weak {
            Vec::new()
        } else {
            self.promoted_ancestors(p)
        };
        let zeroed = self.pipelines.unparent(p.0);
        let entry = self.pipelines.remove(p.0);
        for l in entry.layer_differences {
            self.layer_mut(l).owner = None;
            self.release_layer(l);
        }
        if let Some(parent) = zeroed {
            self.destroy_pipeline(PipelineId(parent));
        }
        for n in promoted {
            if self.pipelines.release(n.0) {
                self.destroy_pipeline(n);
            }
        }
    }

    /// A weak pipeline with a strong child is effectively strong: it must
    /// survive for the child's sake.
    pub(crate) fn pipeline_is_weak(&self, p: PipelineId) -> bool {
        self.entry(p).is_weak && !self.has_strong_children(p)
    }

    fn has_strong_children(&self, p: PipelineId) -> bool {
        self.pipelines
            .children(p.0)
            .iter()
            .any(|&c| !self.pipeline_is_weak(PipelineId(c)))
    }

    /// Tear down every weak child of `p`, depth first: a weak child's own
    /// weak children go before it, so its hook runs only after its subtree
    /// is gone. Handles held by weak-copy creators simply go stale.
    pub(crate) fn destroy_weak_children(&mut self, p: PipelineId) {
        let children: Vec<NodeId> = self.pipelines.children(p.0).to_vec();
        for c in children {
            let c = PipelineId(c);
            if !self.pipeline_is_weak(c) {
                continue;
            }
            self.destroy_weak_children(c);
            let hook = self.entry_mut(c).on_destroy.take();
            // The weak link never counted toward p, so no cascade here.
            let zeroed = self.pipelines.unparent(c.0);
            debug_assert!(zeroed.is_none(), "weak links do not keep parents alive");
            if self.flushed == Some(c) {
                self.flushed = None;
            }
            let entry = self.pipelines.remove(c.0);
            for l in entry.layer_differences {
                self.layer_mut(l).owner = None;
                self.release_layer(l);
            }
            if let Some(mut hook) = hook {
                hook(c);
            }
        }
    }

    /// A strong copy reached through weak ancestors keeps that whole chain
    /// alive, up to and including the first strong ancestor, until the copy
    /// is destroyed.
    fn promote_weak_ancestors(&mut self, strong: PipelineId) {
        debug_assert!(!self.entry(strong).is_weak, "only strong copies promote");
        for n in self.promoted_ancestors(strong) {
            self.pipelines.retain(n.0);
        }
    }

    /// The ancestors [`Self::promote_weak_ancestors`] pins: empty unless the
    /// direct parent is weak, otherwise every weak ancestor plus the first
    /// strong one.
    fn promoted_ancestors(&self, strong: PipelineId) -> Vec<PipelineId> {
        let mut chain = Vec::new();
        let Some(parent) = self.parent(strong) else {
            return chain;
        };
        if !self.entry(parent).is_weak {
            return chain;
        }
        let mut next = Some(parent);
        while let Some(n) = next {
            chain.push(n);
            if !self.entry(n).is_weak {
                break;
            }
            next = self.parent(n);
        }
        chain
    }

    /// Reparent `p`, invalidating layer caches that depended on the old
    /// ancestry.
    pub(crate) fn set_pipeline_parent(&mut self, p: PipelineId, parent: PipelineId, strong: bool) {
        let zeroed = self.pipelines.set_parent(p.0, parent.0, strong);
        if self.entry(p).differences.contains(StateMask::LAYERS) {
            self.invalidate_layer_caches(p);
        }
        if let Some(old) = zeroed {
            self.destroy_pipeline(PipelineId(old));
        }
    }

    /// Drop the `layers_cache` of `p` and every descendant. If a node is
    /// already dirty so is its whole subtree, which bounds the traversal.
    pub(crate) fn invalidate_layer_caches(&mut self, p: PipelineId) {
        let mut stack: Vec<PipelineId> = alloc::vec![p];
        while let Some(cur) = stack.pop() {
            let e = self.entry_mut(cur);
            if e.layers_cache.is_none() {
                continue;
            }
            e.layers_cache = None;
            stack.extend(self.pipelines.children(cur.0).iter().map(|&n| PipelineId(n)));
        }
    }

    // --- the pre-change protocol ---

    /// Make `p` safe to mutate for `change`:
    ///
    /// - flush queued batches that reference the current state (skippable
    ///   for color changes that provably cannot flip blending);
    /// - tear down weak dependants;
    /// - copy-on-write when strong dependants remain, leaving `p` childless;
    /// - bump the age;
    /// - bootstrap the sparse state for `change` from the current authority
    ///   so the following write has a consistent baseline;
    /// - invalidate layer caches for layer-set changes;
    /// - record the change against the most recently flushed pipeline.
    pub(crate) fn pre_change_notify(
        &mut self,
        p: PipelineId,
        change: StateMask,
        new_color: Option<Color>,
    ) {
        if self.entry(p).batch_count > 0 {
            // Color values are logged per primitive, so a color change only
            // forces a flush when it flips the need for blending.
            let mut skip_flush = false;
            if change == StateMask::COLOR
                && let Some(color) = new_color
            {
                let will_need = self.needs_blending_enabled(p, StateMask::COLOR, Some(color));
                skip_flush = will_need == self.entry(p).real_blend_enable;
            }
            if !skip_flush && let Some(mut hook) = self.flush_hook.take() {
                hook();
                if self.flush_hook.is_none() {
                    self.flush_hook = Some(hook);
                }
            }
        }

        // Weak dependants never force a copy-on-write; they are invalidated
        // instead.
        self.destroy_weak_children(p);

        if self.pipelines.has_children(p.0) {
            // Some descendant resolves part of its state through this node,
            // so it cannot change in place. Stand up a copy of our parent
            // carrying a conservative superset of everything this node could
            // be an authority on, and move the dependants over to it.
            let parent = self
                .parent(p)
                .expect("the default pipeline is never mutated while shared");
            let new_authority = self.copy(parent);
            self.entry_mut(new_authority).label = Some("copy-on-write");
            let differences = self.entry(p).differences;
            self.copy_differences(new_authority, p, differences);

            let children: Vec<NodeId> = self.pipelines.children(p.0).to_vec();
            for c in children {
                self.set_pipeline_parent(PipelineId(c), new_authority, true);
            }
            // The reparented dependants keep the copy alive from here on.
            let zeroed = self.pipelines.release(new_authority.0);
            debug_assert!(!zeroed, "dependants must keep the new authority alive");
        }

        self.entry_mut(p).age += 1;

        if change.intersects(StateMask::ALL_SPARSE) && !self.entry(p).differences.intersects(change)
        {
            let authority = self.authority(p, change);
            self.initialize_sparse_state(p, authority, change);
        }

        if change == StateMask::LAYERS {
            self.invalidate_layer_caches(p);
        }

        if self.flushed == Some(p) {
            self.flushed_changes |= change;
        }
    }

    /// Copy the value of every group in `differences` from `src` to `dest`
    /// and extend `dest`'s authority mask accordingly.
    pub(crate) fn copy_differences(
        &mut self,
        dest: PipelineId,
        src: PipelineId,
        differences: StateMask,
    ) {
        if differences.contains(StateMask::COLOR) {
            let color = self.entry(src).color;
            self.entry_mut(dest).color = color;
        }
        if differences.contains(StateMask::BLEND_ENABLE) {
            let mode = self.entry(src).blend_mode;
            self.entry_mut(dest).blend_mode = mode;
        }
        if differences.contains(StateMask::LAYERS) {
            if self.entry(dest).differences.contains(StateMask::LAYERS) {
                let old = core::mem::take(&mut self.entry_mut(dest).layer_differences);
                for l in old {
                    self.layer_mut(l).owner = None;
                    self.release_layer(l);
                }
            }
            // A layer has at most one owner, so the source's differences
            // cannot be shared directly; derive fresh layers instead.
            let src_layers = self.entry(src).layer_differences.clone();
            for l in src_layers {
                let copy = self.layer_copy(l);
                self.add_layer_difference(dest, copy, false);
                self.release_layer(copy);
            }
            // Set after adding: becoming a LAYERS authority above reset the
            // count to the inherited value.
            let n_layers = self.entry(src).n_layers;
            self.entry_mut(dest).n_layers = n_layers;
        }
        if differences.intersects(StateMask::NEEDS_BIG_STATE) {
            let src_big = *self
                .entry(src)
                .big
                .as_ref()
                .expect("the source is an authority for a big-state group")
                .clone();
            let dest_big = self
                .entry_mut(dest)
                .big
                .get_or_insert_with(|| Box::new(BigState::default()));
            if differences.contains(StateMask::LIGHTING) {
                dest_big.lighting = src_big.lighting;
            }
            if differences.contains(StateMask::ALPHA_FUNC) {
                dest_big.alpha = src_big.alpha;
            }
            if differences.contains(StateMask::BLEND) {
                dest_big.blend = src_big.blend;
            }
            if differences.contains(StateMask::USER_PROGRAM) {
                dest_big.user_program = src_big.user_program;
            }
            if differences.contains(StateMask::DEPTH) {
                dest_big.depth = src_big.depth;
            }
            if differences.contains(StateMask::FOG) {
                dest_big.fog = src_big.fog;
            }
            if differences.contains(StateMask::POINT_SIZE) {
                dest_big.point_size = src_big.point_size;
            }
        }
        if differences.intersects(StateMask::AFFECTS_BLENDING) {
            self.handle_automatic_blend_enable(dest, differences);
        }
        self.entry_mut(dest).differences |= differences;
    }

    /// Materialize the value for `state` on `dest` by copying it from the
    /// current authority. For `LAYERS` only the count is inherited and the
    /// authority bit is deliberately left unset; the caller sets it once a
    /// concrete layer difference exists.
    fn initialize_sparse_state(&mut self, dest: PipelineId, src: PipelineId, state: StateMask) {
        if dest == src {
            return;
        }
        debug_assert!(
            StateMask::ALL_SPARSE.contains(state),
            "only sparse groups are bootstrapped"
        );
        if state != StateMask::LAYERS {
            self.copy_differences(dest, src, state);
        } else {
            let n_layers = self.entry(src).n_layers;
            let e = self.entry_mut(dest);
            e.n_layers = n_layers;
            e.layer_differences = Vec::new();
        }
    }

    // --- authority updates and pruning ---

    /// After writing a value: either revert to an ancestor being the
    /// authority (the new value matches the old authority's), or extend the
    /// local mask and prune ancestry that just became redundant.
    pub(crate) fn update_authority(
        &mut self,
        p: PipelineId,
        authority: PipelineId,
        state: StateMask,
        equal: fn(&Self, PipelineId, PipelineId) -> bool,
    ) {
        if p == authority {
            if let Some(parent) = self.parent(authority) {
                let old_authority = self.authority(parent, state);
                if equal(self, authority, old_authority) {
                    self.entry_mut(p).differences -= state;
                }
            }
        } else {
            self.entry_mut(p).differences |= state;
            self.prune_redundant_ancestry(p);
        }
    }

    /// Reparent `p` past any ancestor whose whole mask is overridden
    /// locally. Resolved values are unchanged; authority chains get shorter.
    pub(crate) fn prune_redundant_ancestry(&mut self, p: PipelineId) {
        // A LAYERS authority may still defer to ancestors for the state of
        // individual layers (for example after only shrinking n_layers), in
        // which case it cannot be moved past them.
        let e = self.entry(p);
        if e.differences.contains(StateMask::LAYERS) && e.n_layers != e.layer_differences.len() {
            return;
        }
        let differences = e.differences;
        let Some(mut new_parent) = self.parent(p) else {
            return;
        };
        loop {
            let Some(grand) = self.parent(new_parent) else {
                break;
            };
            if (self.entry(new_parent).differences | differences) == differences {
                new_parent = grand;
            } else {
                break;
            }
        }
        if Some(new_parent) != self.parent(p) {
            let strong = !self.pipeline_is_weak(p);
            self.set_pipeline_parent(p, new_parent, strong);
        }
    }

    // --- automatic blend enable ---

    /// Whether the configuration reachable from `p` needs blending, looking
    /// only at the groups named in `changes` (plus everything they imply).
    pub(crate) fn needs_blending_enabled(
        &mut self,
        p: PipelineId,
        changes: StateMask,
        override_color: Option<Color>,
    ) -> bool {
        let enable_authority = self.authority(p, StateMask::BLEND_ENABLE);
        match self.entry(enable_authority).blend_mode {
            BlendMode::Enabled => return true,
            BlendMode::Disabled => return false,
            BlendMode::Automatic => {}
        }

        let blend_authority = self.authority(p, StateMask::BLEND);
        if !self.big(blend_authority).blend.is_effectively_opaque_over() {
            return true;
        }

        // With an opaque-over function the only remaining question is
        // whether any source alpha can drop below one.

        let mut changes = changes;
        if changes.contains(StateMask::LAYERS) {
            // Layer alpha chains start from the pipeline color, so a layer
            // change means re-checking everything.
            changes = StateMask::AFFECTS_BLENDING;
        }

        if let Some(color) = override_color
            && !color.is_opaque()
        {
            return true;
        }

        if changes.contains(StateMask::COLOR) && !self.color(p).is_opaque() {
            return true;
        }

        if changes.contains(StateMask::USER_PROGRAM) && self.user_program(p).is_some() {
            // No assumptions can be made about a user shader's alpha output.
            return true;
        }

        if changes.contains(StateMask::LAYERS) {
            for l in self.layers(p) {
                if self.layer_produces_alpha(l) {
                    return true;
                }
            }
        } else {
            let other = StateMask::AFFECTS_BLENDING - changes;
            if !other.is_empty() && self.needs_blending_enabled(p, other, None) {
                return true;
            }
        }

        false
    }

    /// Tracks the alpha status of the running previous-layer chain: true if
    /// this layer can produce alpha < 1 given an opaque input.
    fn layer_produces_alpha(&self, l: LayerId) -> bool {
        let combine_authority = self.layer_authority(l, LayerStateMask::COMBINE);
        if !self
            .layer_big(combine_authority)
            .combine
            .alpha_is_default_modulate()
        {
            return true;
        }
        // The default combine only modulates by the texture alpha; a missing
        // texture falls back to an opaque default.
        let texture_authority = self.layer_authority(l, LayerStateMask::TEXTURE);
        self.layer(texture_authority)
            .texture
            .is_some_and(|t| t.has_alpha)
    }

    /// Recompute the cached blending decision after `change`, paying for a
    /// protected mutation only when the answer flips.
    pub(crate) fn handle_automatic_blend_enable(&mut self, p: PipelineId, change: StateMask) {
        let enable = self.needs_blending_enabled(p, change, None);
        if enable != self.entry(p).real_blend_enable {
            self.pre_change_notify(p, StateMask::REAL_BLEND_ENABLE, None);
            self.entry_mut(p).real_blend_enable = enable;
        }
    }

    // --- batch / flush tracking ---

    /// Record that a queued render batch references `p`'s current state.
    /// Mutating `p` will force a flush first.
    pub fn batch_retain(&mut self, p: PipelineId) {
        self.entry_mut(p).batch_count += 1;
        self.pipelines.retain(p.0);
    }

    /// Drop a queued-batch reference taken with
    /// [`PipelineTree::batch_retain`].
    pub fn batch_release(&mut self, p: PipelineId) {
        let e = self.entry_mut(p);
        debug_assert!(e.batch_count > 0, "batch_release without batch_retain");
        e.batch_count -= 1;
        self.release(p);
    }

    /// Install the hook that flushes queued batches before a protected
    /// mutation. The hook must not call back into the tree.
    pub fn set_flush_hook(&mut self, hook: impl FnMut() + 'static) {
        self.flush_hook = Some(Box::new(hook));
    }

    /// Note that `p` is the pipeline most recently applied to the GPU;
    /// subsequent changes to it accumulate in
    /// [`PipelineTree::changes_since_flush`] so redundant state changes can
    /// be skipped on the next flush.
    pub fn mark_flushed(&mut self, p: PipelineId) {
        self.flushed = Some(p);
        self.flushed_changes = StateMask::empty();
    }

    /// State groups of the most recently flushed pipeline that changed since
    /// [`PipelineTree::mark_flushed`].
    pub fn changes_since_flush(&self) -> StateMask {
        self.flushed_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMask;
    use alloc::rc::Rc;
    use core::cell::Cell;

    #[test]
    fn default_pipeline_is_authority_for_everything() {
        let tree = PipelineTree::default();
        let d = tree.default_pipeline();
        assert_eq!(tree.entry(d).differences, StateMask::ALL_SPARSE);
        assert_eq!(tree.authority(d, StateMask::FOG), d);
    }

    #[test]
    fn copy_shares_state_with_source() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let b = tree.copy(a);
        assert!(tree.entry(b).differences.is_empty());
        assert_eq!(tree.parent(b), Some(a));
        // Authority for any group resolves through the shared chain.
        assert_eq!(
            tree.authority(b, StateMask::COLOR),
            tree.default_pipeline()
        );
    }

    #[test]
    fn mutating_a_childless_pipeline_never_allocates() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let before = tree.pipelines.len();
        tree.set_color(a, Color::new(10, 20, 30, 255));
        assert_eq!(tree.pipelines.len(), before, "no copy-on-write expected");
    }

    #[test]
    fn copy_on_write_preserves_dependants_view() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_color(a, Color::new(1, 2, 3, 255));
        let b = tree.copy(a);

        // Mutating a while b depends on it must not change what b resolves.
        tree.set_color(a, Color::new(9, 9, 9, 255));
        assert_eq!(tree.color(b), Color::new(1, 2, 3, 255));
        assert_eq!(tree.color(a), Color::new(9, 9, 9, 255));
        // b was reparented onto the copy-on-write node, away from a.
        assert_ne!(tree.parent(b), Some(a));
    }

    #[test]
    fn age_bumps_on_every_mutation() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let age0 = tree.age(a);
        tree.set_color(a, Color::new(5, 5, 5, 255));
        assert!(tree.age(a) > age0);
    }

    #[test]
    fn weak_copy_is_destroyed_by_incompatible_mutation() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let destroyed = Rc::new(Cell::new(0_u32));
        let counter = destroyed.clone();
        let w = tree.weak_copy(p, move |_| counter.set(counter.get() + 1));

        assert!(tree.is_alive(w));
        tree.set_color(p, Color::new(0, 0, 0, 255));
        assert!(!tree.is_alive(w), "weak copy must not survive the mutation");
        assert_eq!(destroyed.get(), 1, "destroy hook runs exactly once");

        // The mutation itself went through in place, no copy-on-write.
        assert_eq!(tree.color(p), Color::new(0, 0, 0, 255));
    }

    #[test]
    fn weak_teardown_is_depth_first() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let order = Rc::new(Cell::new(0_u32));
        let (o1, o2) = (order.clone(), order.clone());
        let w1 = tree.weak_copy(p, move |_| {
            assert_eq!(o1.get(), 1, "parent hook runs after the child's");
            o1.set(2);
        });
        let _w2 = tree.weak_copy(w1, move |_| {
            assert_eq!(o2.get(), 0);
            o2.set(1);
        });

        tree.set_color(p, Color::new(0, 0, 0, 255));
        assert_eq!(order.get(), 2);
    }

    #[test]
    fn weak_copy_does_not_keep_source_alive() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let w = tree.weak_copy(p, |_| {});
        tree.release(p);
        assert!(!tree.is_alive(p), "a weak child must not keep p alive");
        assert!(!tree.is_alive(w), "destroying p tears the weak child down");
    }

    #[test]
    fn strong_copy_of_weak_promotes_ancestors() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let w = tree.weak_copy(p, |_| {});
        let s = tree.copy(w);

        // Releasing the creator's handle on p must keep the chain alive: the
        // strong copy promoted its weak ancestor's parent link.
        tree.release(p);
        assert!(tree.is_alive(p));
        assert!(tree.is_alive(w));

        tree.release(s);
        assert!(!tree.is_alive(w), "promotion ends with the strong copy");
        assert!(!tree.is_alive(p));
    }

    #[test]
    fn release_destroys_chain() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        let b = tree.copy(a);
        let alive_before = tree.pipelines.len();
        tree.release(a);
        // a survives: b still resolves through it.
        assert!(tree.is_alive(a));
        assert_eq!(tree.pipelines.len(), alive_before);
        tree.release(b);
        assert!(!tree.is_alive(a));
        assert!(!tree.is_alive(b));
    }

    #[test]
    fn prune_skips_fully_overridden_ancestors() {
        let mut tree = PipelineTree::default();
        let a = tree.new_pipeline();
        tree.set_color(a, Color::new(1, 1, 1, 255));
        let b = tree.copy(a);
        // b overrides the only group a is an authority for, so b reparents
        // directly under a's parent.
        tree.set_color(b, Color::new(2, 2, 2, 255));
        assert_eq!(tree.parent(b), tree.parent(a));
    }

    #[test]
    fn flush_hook_fires_before_protected_mutation() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        let flushes = Rc::new(Cell::new(0_u32));
        let f = flushes.clone();
        tree.set_flush_hook(move || f.set(f.get() + 1));

        tree.batch_retain(p);
        tree.set_depth_test_enabled(p, true);
        assert_eq!(flushes.get(), 1);

        // An opaque-to-opaque color change cannot flip blending and skips
        // the flush.
        tree.set_color(p, Color::new(7, 7, 7, 255));
        assert_eq!(flushes.get(), 1);

        // A translucent color flips the blending decision: must flush.
        tree.set_color(p, Color::new(7, 7, 7, 128));
        assert!(flushes.get() >= 2, "a blending flip must flush");
        tree.batch_release(p);
    }

    #[test]
    fn changes_since_flush_accumulate_for_flushed_pipeline() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        tree.mark_flushed(p);
        assert!(tree.changes_since_flush().is_empty());
        tree.set_point_size(p, 4.0);
        assert!(tree.changes_since_flush().contains(StateMask::POINT_SIZE));
        let q = tree.new_pipeline();
        tree.set_point_size(q, 2.0);
        assert!(
            !tree.changes_since_flush().contains(StateMask::DEPTH),
            "changes to other pipelines are not recorded"
        );
    }

    #[test]
    fn automatic_blend_enable_follows_alpha() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        assert!(!tree.real_blend_enable(p));
        tree.set_color(p, Color::new(0, 0, 0, 128));
        assert!(tree.real_blend_enable(p));
        tree.set_color(p, Color::new(0, 0, 0, 255));
        assert!(!tree.real_blend_enable(p));

        tree.set_blend_mode(p, BlendMode::Enabled);
        assert!(tree.real_blend_enable(p));
        tree.set_blend_mode(p, BlendMode::Disabled);
        assert!(!tree.real_blend_enable(p));
    }
}
