// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cambium Forest: a generational node arena with strong/weak parent links.
//!
//! Cambium Forest is the linkage primitive under the Cambium pipeline tree.
//! It stores payloads of type `T` in slot-addressed nodes, each with an
//! optional parent link and a child list, and tracks a per-node strong count
//! so higher layers can implement reference-counted lifetimes without raw
//! pointers.
//!
//! - A child may hold a *strong* link on its parent (the link contributes to
//!   the parent's strong count) or a *weak* one (it does not).
//! - The forest never frees a node on its own. Operations that drop a strong
//!   count report any node that reached zero, and the caller performs its own
//!   teardown before calling [`Forest::remove`]. This keeps domain-specific
//!   destruction (callbacks, cascades) out of the container.
//!
//! # Example
//!
//! ```rust
//! use cambium_forest::Forest;
//!
//! let mut forest: Forest<&str> = Forest::new();
//! let root = forest.insert("root");
//! let child = forest.insert("child");
//! forest.set_parent(child, root, true);
//!
//! assert_eq!(forest.parent(child), Some(root));
//! assert_eq!(forest.children(root), &[child]);
//!
//! // Dropping the creating handle does not free `root`: the strong child
//! // link still counts.
//! assert!(!forest.release(root));
//! ```
//!
//! This crate is `no_std` and uses `alloc`.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

/// Identifier for a node in a forest.
///
/// This is a small, copyable handle that stays stable across updates but
/// becomes invalid when the underlying slot is reused.
/// It consists of a slot index and a generation counter.
///
/// ## Semantics
///
/// - On insert, a fresh slot is allocated with generation `1`.
/// - On remove, the slot is freed; any existing `NodeId` that pointed to that
///   slot is now stale.
/// - On reuse of a freed slot, its generation is incremented, producing a new,
///   distinct `NodeId`.
///
/// Use [`Forest::is_alive`] to check whether a `NodeId` still refers to a live
/// node. Stale `NodeId`s never alias a different live node because the
/// generation must match.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(u32, u32);

impl NodeId {
    const fn new(idx: u32, generation: u32) -> Self {
        Self(idx, generation)
    }

    const fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
struct Node<T> {
    generation: u32,
    parent: Option<NodeId>,
    strong_parent_link: bool,
    children: Vec<NodeId>,
    strong_count: u32,
    data: T,
}

impl<T> Node<T> {
    fn new(generation: u32, data: T) -> Self {
        Self {
            generation,
            parent: None,
            strong_parent_link: false,
            children: Vec::new(),
            strong_count: 1,
            data,
        }
    }
}

/// A forest of payload-carrying nodes addressed by [`NodeId`].
pub struct Forest<T> {
    nodes: Vec<Option<Node<T>>>, // slots
    generations: Vec<u32>,       // last generation per slot (persists across frees)
    free_list: Vec<usize>,
}

impl<T> core::fmt::Debug for Forest<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let total = self.nodes.len();
        let alive = self.nodes.iter().filter(|n| n.is_some()).count();
        f.debug_struct("Forest")
            .field("nodes_total", &total)
            .field("nodes_alive", &alive)
            .field("free_list", &self.free_list.len())
            .finish_non_exhaustive()
    }
}

impl<T> Default for Forest<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Forest<T> {
    /// Create a new empty forest.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            generations: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Insert a new root node with a strong count of one (the creating
    /// handle).
    pub fn insert(&mut self, data: T) -> NodeId {
        let (idx, generation) = if let Some(idx) = self.free_list.pop() {
            let generation = self.generations[idx].saturating_add(1);
            self.generations[idx] = generation;
            self.nodes[idx] = Some(Node::new(generation, data));
            #[allow(
                clippy::cast_possible_truncation,
                reason = "NodeId uses 32-bit indices by design."
            )]
            (idx as u32, generation)
        } else {
            let generation = 1_u32;
            self.nodes.push(Some(Node::new(generation, data)));
            self.generations.push(generation);
            #[allow(
                clippy::cast_possible_truncation,
                reason = "NodeId uses 32-bit indices by design."
            )]
            ((self.nodes.len() - 1) as u32, generation)
        };
        NodeId::new(idx, generation)
    }

    /// Returns true if `id` refers to a live node.
    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.idx())
            .and_then(|n| n.as_ref())
            .map(|n| n.generation == id.1)
            .unwrap_or(false)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// True if the forest holds no live nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.iter().all(|n| n.is_none())
    }

    /// Bump a node's strong count.
    pub fn retain(&mut self, id: NodeId) {
        self.node_mut(id).strong_count += 1;
    }

    /// Drop a node's strong count. Returns true when the count reached zero;
    /// the node is *not* freed — the caller tears it down and then calls
    /// [`Forest::remove`].
    pub fn release(&mut self, id: NodeId) -> bool {
        let n = self.node_mut(id);
        debug_assert!(n.strong_count > 0, "release on a node with zero count");
        n.strong_count -= 1;
        n.strong_count == 0
    }

    /// Current strong count of a node.
    pub fn strong_count(&self, id: NodeId) -> u32 {
        self.node(id).strong_count
    }

    /// Link `id` under `parent`.
    ///
    /// The new parent is retained *before* the old link is severed, so a
    /// common ancestor that is only kept alive through the old chain keeps a
    /// nonzero count across the switch. If `strong` is false that temporary
    /// count is dropped once the child-list link exists, leaving only the
    /// non-counting back-reference.
    ///
    /// Returns a node whose strong count reached zero during the switch, if
    /// any, for the caller to tear down.
    pub fn set_parent(&mut self, id: NodeId, parent: NodeId, strong: bool) -> Option<NodeId> {
        debug_assert!(id != parent, "node cannot parent itself");
        self.node_mut(parent).strong_count += 1;

        let mut zeroed = self.unparent(id);

        self.node_mut(parent).children.push(id);
        let n = self.node_mut(id);
        n.parent = Some(parent);
        n.strong_parent_link = strong;

        if !strong {
            let p = self.node_mut(parent);
            p.strong_count -= 1;
            if p.strong_count == 0 {
                zeroed = zeroed.or(Some(parent));
            }
        }
        zeroed
    }

    /// Remove `id` from its parent's child list, dropping the parent's strong
    /// count if this child held a strong link. No-op without a parent.
    ///
    /// Returns the parent if its count reached zero.
    pub fn unparent(&mut self, id: NodeId) -> Option<NodeId> {
        let (parent, strong) = {
            let n = self.node_mut(id);
            let Some(parent) = n.parent.take() else {
                return None;
            };
            (parent, core::mem::take(&mut n.strong_parent_link))
        };
        let p = self.node_mut(parent);
        p.children.retain(|c| *c != id);
        if strong {
            debug_assert!(p.strong_count > 0, "parent count underflow");
            p.strong_count -= 1;
            if p.strong_count == 0 {
                return Some(parent);
            }
        }
        None
    }

    /// Free a node's slot, returning its payload.
    ///
    /// The node must already be fully unlinked: no parent and no children.
    pub fn remove(&mut self, id: NodeId) -> T {
        let node = self.nodes[id.idx()].take().expect("remove of a dead NodeId");
        debug_assert!(node.generation == id.1, "remove of a stale NodeId");
        debug_assert!(node.parent.is_none(), "remove of a parented node");
        debug_assert!(node.children.is_empty(), "remove of a node with children");
        self.free_list.push(id.idx());
        node.data
    }

    /// A node's parent, if linked.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Whether this child holds a strong link on its parent.
    pub fn has_strong_parent_link(&self, id: NodeId) -> bool {
        self.node(id).strong_parent_link
    }

    /// A node's children, oldest link first.
    ///
    /// The order is stable between mutations. Do not add or remove children
    /// while iterating a borrowed slice; clone it first if the visit mutates.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// True if the node has at least one child.
    pub fn has_children(&self, id: NodeId) -> bool {
        !self.node(id).children.is_empty()
    }

    /// Iterate `id` and then each ancestor up to the root.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_, T> {
        Ancestors {
            forest: self,
            next: Some(id),
        }
    }

    /// Borrow a node's payload. Panics on a stale id.
    pub fn get(&self, id: NodeId) -> &T {
        &self.node(id).data
    }

    /// Mutably borrow a node's payload. Panics on a stale id.
    pub fn get_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.node_mut(id).data
    }

    fn node(&self, id: NodeId) -> &Node<T> {
        let n = self.nodes[id.idx()].as_ref().expect("dangling NodeId");
        debug_assert!(n.generation == id.1, "stale NodeId");
        n
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        let n = self.nodes[id.idx()].as_mut().expect("dangling NodeId");
        debug_assert!(n.generation == id.1, "stale NodeId");
        n
    }
}

/// Iterator over a node and its ancestors. See [`Forest::ancestors`].
#[derive(Debug)]
pub struct Ancestors<'a, T> {
    forest: &'a Forest<T>,
    next: Option<NodeId>,
}

impl<T> Iterator for Ancestors<'_, T> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let cur = self.next?;
        self.next = self.forest.parent(cur);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn insert_link_and_walk() {
        let mut f: Forest<u32> = Forest::new();
        let root = f.insert(0);
        let a = f.insert(1);
        let b = f.insert(2);
        f.set_parent(a, root, true);
        f.set_parent(b, a, true);

        assert_eq!(f.parent(b), Some(a));
        assert_eq!(f.children(root), &[a]);
        let chain: Vec<_> = f.ancestors(b).collect();
        assert_eq!(chain, [b, a, root]);
    }

    #[test]
    fn strong_children_keep_parent_alive() {
        let mut f: Forest<()> = Forest::new();
        let root = f.insert(());
        let child = f.insert(());
        f.set_parent(child, root, true);

        // The creating handle goes away, but the child link remains.
        assert!(!f.release(root));
        assert_eq!(f.strong_count(root), 1);

        // Unlinking the last strong child reports the zeroed parent.
        assert_eq!(f.unparent(child), Some(root));
    }

    #[test]
    fn weak_links_do_not_count() {
        let mut f: Forest<()> = Forest::new();
        let root = f.insert(());
        let weak = f.insert(());
        f.set_parent(weak, root, false);

        assert_eq!(f.strong_count(root), 1);
        assert!(f.release(root), "only the creating handle kept root alive");
        // Weak unlink never reports a zero.
        assert_eq!(f.unparent(weak), None);
    }

    #[test]
    fn reparent_retains_new_parent_across_switch() {
        let mut f: Forest<u8> = Forest::new();
        let root = f.insert(0);
        let mid = f.insert(1);
        let leaf = f.insert(2);
        f.set_parent(mid, root, true);
        f.set_parent(leaf, mid, true);

        // Reparent leaf directly under root; mid loses its only strong ref
        // once we also drop the creating handles.
        assert!(!f.release(mid));
        assert_eq!(f.set_parent(leaf, root, true), Some(mid));
        assert_eq!(f.parent(leaf), Some(root));
        assert_eq!(f.strong_count(mid), 0);
    }

    #[test]
    fn slot_reuse_goes_stale() {
        let mut f: Forest<u8> = Forest::new();
        let a = f.insert(7);
        assert!(f.release(a));
        f.remove(a);
        assert!(!f.is_alive(a));

        let b = f.insert(8);
        assert!(f.is_alive(b));
        assert!(!f.is_alive(a), "old id must stay stale after reuse");
        if a.0 == b.0 {
            assert!(b.1 > a.1, "generation must increase on reuse");
        }
    }

    #[test]
    fn remove_returns_payload() {
        let mut f: Forest<&str> = Forest::new();
        let a = f.insert("payload");
        assert!(f.release(a));
        assert_eq!(f.remove(a), "payload");
        assert!(f.is_empty());
    }
}
