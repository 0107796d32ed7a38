// Copyright 2025 the Cambium Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};

use cambium_pipeline::{Capabilities, Color, PipelineId, PipelineTree, TextureHandle};

/// A chain of copies, each diverging in one state group, as produced by a
/// scene where most actors tweak a shared base material.
fn build_copy_chain(tree: &mut PipelineTree, depth: usize) -> Vec<PipelineId> {
    let mut out = Vec::with_capacity(depth + 1);
    let mut current = tree.new_pipeline();
    out.push(current);
    for i in 0..depth {
        let next = tree.copy(current);
        #[allow(clippy::cast_possible_truncation)]
        tree.set_color(next, Color::new(i as u8, 0x40, 0x80, 0xff));
        out.push(next);
        current = next;
    }
    out
}

fn bench_copy_and_mutate(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_mutate");
    for depth in [4_usize, 32, 256] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_function(format!("chain_{depth}"), |b| {
            b.iter_batched(
                || PipelineTree::new(Capabilities::default()),
                |mut tree| {
                    let chain = build_copy_chain(&mut tree, depth);
                    black_box(chain.len())
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_copy_on_write(c: &mut Criterion) {
    c.bench_function("copy_on_write_with_dependant", |b| {
        b.iter_batched(
            || {
                let mut tree = PipelineTree::new(Capabilities::default());
                let base = tree.new_pipeline();
                tree.set_color(base, Color::new(1, 2, 3, 0xff));
                let dependant = tree.copy(base);
                (tree, base, dependant)
            },
            |(mut tree, base, _dependant)| {
                // The dependant forces a copy-on-write on every first write.
                tree.set_point_size(base, 5.0);
                black_box(tree.age(base))
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_equal(c: &mut Criterion) {
    let mut group = c.benchmark_group("equal");

    group.bench_function("deep_siblings", |b| {
        let mut tree = PipelineTree::new(Capabilities::default());
        let chain = build_copy_chain(&mut tree, 64);
        let a = tree.copy(chain[40]);
        let z = tree.copy(chain[60]);
        b.iter(|| black_box(tree.equal(a, z)));
    });

    group.bench_function("layered_equal", |b| {
        let mut tree = PipelineTree::new(Capabilities::default());
        let base = tree.new_pipeline();
        for i in 0..8_i32 {
            tree.set_layer_texture(
                base,
                i,
                Some(TextureHandle {
                    id: i as u64,
                    has_alpha: false,
                }),
            );
        }
        let other = tree.copy(base);
        tree.set_layer_texture(
            other,
            7,
            Some(TextureHandle {
                id: 99,
                has_alpha: false,
            }),
        );
        b.iter(|| black_box(tree.equal(base, other)));
    });

    group.finish();
}

criterion_group!(benches, bench_copy_and_mutate, bench_copy_on_write, bench_equal);
criterion_main!(benches);
