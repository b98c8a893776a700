//! Performance benchmarks for the dependency graph engine.
//!
//! Run with: `cargo bench --bench graph`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Cycle check | <50µs p99 | 200-step chain, worst-case back edge |
//! | Forward pass | <200µs p99 | 200-step diamond ladder |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeMap;

use routing_engine::{DependencyGraph, DependencyType, SegmentTiming, StepId};
use uuid::Uuid;

fn make_step(id: u128) -> StepId {
    StepId::new(Uuid::from_u128(id))
}

/// Chain 1 -> 2 -> ... -> n.
fn make_chain(n: usize) -> (DependencyGraph, Vec<StepId>) {
    let steps: Vec<StepId> = (1..=n as u128).map(make_step).collect();
    let mut graph = DependencyGraph::new();
    for step in &steps {
        graph.add_step(*step);
    }
    for pair in steps.windows(2) {
        graph
            .add_edge(pair[0], pair[1], DependencyType::FinishToStart)
            .unwrap();
    }
    (graph, steps)
}

/// Ladder of diamonds: each rung fans out to two steps and joins again.
fn make_diamonds(n: usize) -> (DependencyGraph, Vec<StepId>) {
    let steps: Vec<StepId> = (1..=n as u128).map(make_step).collect();
    let mut graph = DependencyGraph::new();
    for step in &steps {
        graph.add_step(*step);
    }
    let mut i = 0;
    while i + 3 < n {
        let (top, left, right, bottom) = (steps[i], steps[i + 1], steps[i + 2], steps[i + 3]);
        graph.add_edge(top, left, DependencyType::FinishToStart).unwrap();
        graph.add_edge(top, right, DependencyType::StartToStart).unwrap();
        graph.add_edge(left, bottom, DependencyType::FinishToStart).unwrap();
        graph.add_edge(right, bottom, DependencyType::FinishToFinish).unwrap();
        i += 3;
    }
    (graph, steps)
}

fn make_timings(steps: &[StepId]) -> BTreeMap<StepId, SegmentTiming> {
    steps
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, SegmentTiming::new(60, 300 + (i as u64 % 7) * 30, 30)))
        .collect()
}

/// Benchmark the worst-case cycle check: an edge from the tail back to the head.
fn bench_cycle_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_check");

    for n in [10, 50, 200] {
        let (graph, steps) = make_chain(n);
        let (head, tail) = (steps[0], steps[n - 1]);

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("chain", n), &graph, |b, graph| {
            b.iter(|| {
                let rejected = graph.would_introduce_cycle(black_box(&tail), black_box(&head));
                assert!(rejected);
                rejected
            })
        });
    }

    group.finish();
}

/// Benchmark the forward pass over chains and diamond ladders.
fn bench_forward_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_pass");

    for n in [10, 50, 200] {
        let (chain, chain_steps) = make_chain(n);
        let chain_timings = make_timings(&chain_steps);
        let (diamonds, diamond_steps) = make_diamonds(n);
        let diamond_timings = make_timings(&diamond_steps);

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(
            BenchmarkId::new("chain", n),
            &(chain, chain_timings),
            |b, (graph, timings)| b.iter(|| graph.forward_pass(black_box(timings)).unwrap()),
        );
        group.bench_with_input(
            BenchmarkId::new("diamonds", n),
            &(diamonds, diamond_timings),
            |b, (graph, timings)| b.iter(|| graph.forward_pass(black_box(timings)).unwrap()),
        );
    }

    group.finish();
}

/// Benchmark building a graph edge by edge, checking each insertion.
fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");

    for n in [10, 50, 200] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("diamonds", n), &n, |b, &n| {
            b.iter(|| make_diamonds(black_box(n)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cycle_check, bench_forward_pass, bench_build);
criterion_main!(benches);
