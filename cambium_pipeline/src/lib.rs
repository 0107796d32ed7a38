// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cambium Pipeline: a copy-on-write tree of renderable pipeline state.
//!
//! Cambium Pipeline is the state-management core of a GPU abstraction layer.
//! It models pipeline configurations (color, blend, depth, fog, texture
//! layers, ...) as nodes in a tree that share unmodified state with their
//! ancestors:
//!
//! - Copying a pipeline is O(1): the copy starts with zero local differences
//!   and resolves every state group through its ancestry.
//! - Mutating a pipeline copies only when shared descendants would otherwise
//!   observe the change (copy-on-write), and only the groups involved.
//! - Two pipelines can be diffed or compared for render equivalence without
//!   reading most of their state, by walking to their common ancestor and
//!   ORing the difference masks in between.
//!
//! The backend that turns a configuration into GPU commands, the texture
//! objects themselves, and the batching journal are external collaborators;
//! this crate only decides *what* the effective configuration is and *when*
//! a copy has to be made.
//!
//! ## Authority
//!
//! Each node carries a [`StateMask`] of the groups it defines locally. The
//! nearest ancestor (including the node itself) with a group's bit set is
//! that group's *authority* and holds the canonical value. The default
//! pipeline at the root defines every group, so resolution always
//! terminates; redundant ancestry is pruned as masks grow to keep the walks
//! short.
//!
//! ## Layers
//!
//! Texture layers form a second copy-on-write tree of their own. A pipeline
//! only records the layers it adds or overrides relative to its parent
//! (each exclusively owned), with a stable caller-chosen index and a derived
//! contiguous unit index for render order.
//!
//! ## Weak copies
//!
//! [`PipelineTree::weak_copy`] creates an ephemeral dependant that never
//! forces a copy-on-write: it is destroyed, with a notification hook, as
//! soon as state it inherits is about to change. Backends use this to cache
//! derived data against a snapshot without pinning it.
//!
//! # Example
//!
//! ```rust
//! use cambium_pipeline::{Capabilities, Color, PipelineTree};
//!
//! let mut tree = PipelineTree::new(Capabilities::default());
//!
//! let opaque = tree.new_pipeline();
//! tree.set_color(opaque, Color::new(0xff, 0x00, 0x00, 0xff));
//!
//! // A copy shares everything until it diverges.
//! let translucent = tree.copy(opaque);
//! assert!(tree.equal(opaque, translucent));
//!
//! tree.set_color(translucent, Color::new(0xff, 0x00, 0x00, 0x80));
//! assert!(!tree.equal(opaque, translucent));
//! assert!(tree.real_blend_enable(translucent));
//! assert_eq!(tree.color(opaque), Color::new(0xff, 0x00, 0x00, 0xff));
//! ```
//!
//! This crate is `no_std` and uses `alloc`.

#![no_std]

extern crate alloc;

mod compare;
mod dump;
mod layer;
mod ops;
mod state;
mod tree;
mod types;

pub use state::{LayerStateMask, StateMask};
pub use tree::{LayerId, PipelineId, PipelineTree};
pub use types::{
    AlphaFunc, AlphaState, BlendEquation, BlendFactor, BlendMode, BlendState, Capabilities, Color,
    CombineFunc, CombineOp, CombineSource, CombineState, DepthState, DepthTestFunction, Filter,
    FogMode, FogState, LightingState, PipelineError, ProgramHandle, TextureHandle, WrapMode,
};
