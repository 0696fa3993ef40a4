//! Microbenchmarks for bucketing and reduction.
//!
//! Run with: `cargo bench -p tierdown -- reduce`

#![allow(missing_docs, clippy::cast_precision_loss)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tierdown::reduce::{AggregationFn, reduce};

/// One raw table worth of 10 second points, shuffled by a fixed stride.
fn points(count: u64) -> Vec<(u64, f64)> {
    (0..count)
        .map(|i| {
            let slot = (i * 7919) % count;
            (3600 + slot * 10, (slot % 97) as f64)
        })
        .collect()
}

fn bench_reduce_functions(c: &mut Criterion) {
    let input = points(360);
    let mut group = c.benchmark_group("reduce/function");

    for function in [
        AggregationFn::Average,
        AggregationFn::Min,
        AggregationFn::Max,
        AggregationFn::Sum,
        AggregationFn::Count,
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(function.name()),
            &function,
            |b, &function| {
                b.iter(|| reduce("cpu", black_box(input.iter().copied()), 300, function));
            },
        );
    }

    group.finish();
}

fn bench_reduce_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce/points");

    for count in [360u64, 3_600, 36_000] {
        let input = points(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &input, |b, input| {
            b.iter(|| reduce("cpu", black_box(input.iter().copied()), 3600, AggregationFn::Average));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reduce_functions, bench_reduce_sizes);
criterion_main!(benches);
