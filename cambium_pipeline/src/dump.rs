// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Graphviz dump of the whole pipeline and layer graph, for debugging.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::state::{LayerStateMask, StateMask};
use crate::tree::{LayerId, PipelineId, PipelineTree};

struct DumpState {
    graph: String,
    layer_ids: Vec<(LayerId, usize)>,
    next_id: usize,
}

impl DumpState {
    fn layer_name(&self, l: LayerId) -> Option<usize> {
        self.layer_ids
            .iter()
            .find(|(id, _)| *id == l)
            .map(|(_, n)| *n)
    }
}

impl PipelineTree {
    /// Render the entire layer and pipeline graph as a Graphviz digraph.
    ///
    /// Test and debug only; the output shape is not a stable interface.
    pub fn dump_dot(&self) -> String {
        let mut state = DumpState {
            graph: String::new(),
            layer_ids: Vec::new(),
            next_id: 0,
        };
        let _ = writeln!(state.graph, "digraph {{");
        self.dump_layer(&mut state, self.default_layer_0, None, 2);
        state.next_id = 0;
        self.dump_pipeline(&mut state, self.default_pipeline(), None, 2);
        let _ = writeln!(state.graph, "}}");
        state.graph
    }

    fn dump_layer(&self, state: &mut DumpState, l: LayerId, parent: Option<usize>, indent: usize) {
        let id = state.next_id;
        state.next_id += 1;
        state.layer_ids.push((l, id));

        if let Some(parent) = parent {
            let _ = writeln!(
                state.graph,
                "{:indent$}layer{parent} -> layer{id};",
                ""
            );
        }

        let entry = self.layer(l);
        let mut changes = String::new();
        if entry.differences.contains(LayerStateMask::UNIT) {
            let _ = write!(changes, "\\lunit={}", entry.unit_index);
        }
        if entry.differences.contains(LayerStateMask::TEXTURE) {
            match entry.texture {
                Some(t) => {
                    let _ = write!(changes, "\\ltexture={}", t.id);
                }
                None => changes.push_str("\\ltexture=none"),
            }
        }
        let _ = writeln!(
            state.graph,
            "{:indent$}layer{id} [label=\"index={}{changes}\" color=\"blue\"];",
            "",
            entry.index
        );

        for &child in self.layers.children(l.0) {
            self.dump_layer(state, LayerId(child), Some(id), indent + 2);
        }
    }

    fn dump_pipeline(
        &self,
        state: &mut DumpState,
        p: PipelineId,
        parent: Option<usize>,
        indent: usize,
    ) {
        let id = state.next_id;
        state.next_id += 1;

        if let Some(parent) = parent {
            let _ = writeln!(
                state.graph,
                "{:indent$}pipeline{parent} -> pipeline{id};",
                ""
            );
        }

        let entry = self.entry(p);
        let mut changes = String::new();
        if entry.differences.contains(StateMask::COLOR) {
            let c = entry.color;
            let _ = write!(
                changes,
                "\\lcolor=0x{:02X}{:02X}{:02X}{:02X}",
                c.r, c.g, c.b, c.a
            );
        }
        if entry.differences.contains(StateMask::BLEND_ENABLE) {
            let _ = write!(changes, "\\lblend={:?}", entry.blend_mode);
        }
        if entry.differences.contains(StateMask::LAYERS) {
            let _ = write!(changes, "\\ln_layers={}", entry.n_layers);
        }
        let _ = writeln!(
            state.graph,
            "{:indent$}pipeline{id} [label=\"{}{}{changes}\" color=\"red\"];",
            "",
            entry.label.unwrap_or("-"),
            if entry.is_weak { " (weak)" } else { "" },
        );

        for &l in &entry.layer_differences {
            if let Some(layer_name) = state.layer_name(l) {
                let _ = writeln!(
                    state.graph,
                    "{:indent$}pipeline{id} -> layer{layer_name};",
                    ""
                );
            }
        }

        for &child in self.pipelines.children(p.0) {
            self.dump_pipeline(state, PipelineId(child), Some(id), indent + 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, TextureHandle};

    #[test]
    fn dump_covers_pipelines_and_layers() {
        let mut tree = PipelineTree::default();
        let p = tree.new_pipeline();
        tree.set_color(p, Color::new(0x11, 0x22, 0x33, 0xff));
        tree.set_layer_texture(
            p,
            0,
            Some(TextureHandle {
                id: 42,
                has_alpha: false,
            }),
        );

        let dot = tree.dump_dot();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.trim_end().ends_with('}'));
        assert!(dot.contains("default pipeline"));
        assert!(dot.contains("color=0x112233FF"));
        assert!(dot.contains("texture=42"));
        // The owning pipeline cross-references its layer difference.
        assert!(dot.contains("-> layer"));
    }
}
