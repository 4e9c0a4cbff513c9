//! Benchmarks for state store operations

#![recursion_limit = "512"]

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ripple_engine::{Mutable, State, UniverseId};
use ripple_state::FailFast;
use ripple_test::TestModel;

fn populated(model: &TestModel, count: usize) -> (State, Vec<Mutable>) {
    let nodes: Vec<Mutable> = (0..count).map(|i| model.node(&format!("n{}", i))).collect();
    let state = nodes
        .iter()
        .enumerate()
        .fold(State::new(UniverseId(1)), |state, (i, node)| {
            model.source.set(&state, node, i as i64)
        });
    (state, nodes)
}

fn bench_state_set(c: &mut Criterion) {
    let model = TestModel::new();
    let (state, nodes) = populated(&model, 1000);
    let node = nodes[500].clone();

    c.bench_function("state_set", |b| {
        b.iter(|| black_box(model.source.set(&state, black_box(&node), 42)))
    });
}

fn bench_state_get(c: &mut Criterion) {
    let model = TestModel::new();
    let (state, nodes) = populated(&model, 1000);
    let node = nodes[500].clone();

    c.bench_function("state_get", |b| {
        b.iter(|| black_box(model.source.get(&state, black_box(&node))))
    });
}

fn bench_state_diff(c: &mut Criterion) {
    let model = TestModel::new();
    let (base, nodes) = populated(&model, 1000);
    let changed = nodes
        .iter()
        .step_by(10)
        .fold(base.clone(), |state, node| model.target.set(&state, node, 1));

    c.bench_function("state_diff_100_of_1000", |b| {
        b.iter(|| black_box(base.diff(black_box(&changed)).entries().count()))
    });
}

fn bench_state_merge(c: &mut Criterion) {
    let model = TestModel::new();
    let (base, nodes) = populated(&model, 1000);
    // Four branches writing disjoint objects
    let branches: Vec<State> = (0..4)
        .map(|branch| {
            nodes
                .iter()
                .skip(branch)
                .step_by(4)
                .take(25)
                .fold(base.clone(), |state, node| model.target.set(&state, node, branch as i64 + 1))
        })
        .collect();

    c.bench_function("state_merge_4_branches", |b| {
        b.iter(|| black_box(base.merge(&FailFast, black_box(&branches))))
    });
}

criterion_group!(
    benches,
    bench_state_set,
    bench_state_get,
    bench_state_diff,
    bench_state_merge,
);
criterion_main!(benches);
