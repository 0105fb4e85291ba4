//! Compares task counts and planning cost between the leaf-granular and
//! coalescing schedulers over a large synthetic geometry with scattered
//! gaps, the shape a long-running mirror accumulates in practice.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;
use tempfile::tempdir;

use verimirror::scheduler::Scheduler;
use verimirror::state::State;
use verimirror::tree::ReferenceTree;

const CHUNK_SIZE: u64 = 4096;
const N_LEAVES: u64 = 4096;

fn build_sparse_state() -> (verimirror::TreeGeometry, State, tempfile::TempDir) {
    let total_size = N_LEAVES * CHUNK_SIZE;
    let content = vec![7u8; total_size as usize];
    let reference = ReferenceTree::build(Cursor::new(&content), total_size, CHUNK_SIZE).unwrap();
    let dir = tempdir().unwrap();
    let mut state = State::create(&reference, &dir.path().join("bench.mrkl")).unwrap();

    // Mark every third leaf valid, leaving long runs of missing leaves
    // interspersed with scattered single-leaf gaps.
    for i in (0..N_LEAVES).step_by(3) {
        let start = (i * CHUNK_SIZE) as usize;
        let end = start + CHUNK_SIZE as usize;
        state.save_if_valid(i, &content[start..end], || Ok(())).unwrap();
    }

    (*reference.geometry(), state, dir)
}

fn bench_schedulers(c: &mut Criterion) {
    let (geometry, state, _dir) = build_sparse_state();
    let total_size = geometry.total_size();

    let mut group = c.benchmark_group("scheduler_plan");
    group.bench_function("leaf_only", |b| {
        b.iter(|| {
            let tasks = Scheduler::LeafOnly
                .plan(0, total_size, &geometry, &state)
                .unwrap();
            black_box(tasks.len())
        })
    });
    group.bench_function("coalescing_threshold_4", |b| {
        b.iter(|| {
            let tasks = Scheduler::Coalescing { threshold: 4 }
                .plan(0, total_size, &geometry, &state)
                .unwrap();
            black_box(tasks.len())
        })
    });
    let adaptive = Scheduler::adaptive();
    group.bench_function("adaptive", |b| {
        b.iter(|| {
            let tasks = adaptive.plan(0, total_size, &geometry, &state).unwrap();
            black_box(tasks.len())
        })
    });
    group.finish();
}

criterion_group!(benches, bench_schedulers);
criterion_main!(benches);
