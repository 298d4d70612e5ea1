//! Benchmark: sweep pause time, foreground vs background, full vs partial.
//!
//! Each iteration allocates a batch of small objects, keeps a fraction of
//! them rooted and runs one collection cycle.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rudo_sweep::{CollectOptions, Collector, ObjectKind, ObjectRef, SweepConfig};
use std::hint::black_box;

const MIB: usize = 1024 * 1024;

fn config() -> SweepConfig {
    SweepConfig::default().with_verify_accounting(false)
}

fn allocate(c: &mut Collector, count: usize) -> Vec<ObjectRef> {
    (0..count)
        .map(|i| {
            let kind = if i % 3 == 0 {
                ObjectKind::Leaf
            } else {
                ObjectKind::Normal
            };
            c.alloc(kind, 16 + (i % 8) * 8).unwrap()
        })
        .collect()
}

fn run_cycle(c: &mut Collector, count: usize, options: CollectOptions) {
    let objs = allocate(c, count);
    let metrics = c
        .collect_with(options, |c| {
            for obj in objs.iter().step_by(4) {
                c.mark(*obj);
            }
        })
        .unwrap();
    black_box(metrics);
}

fn bench_full_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_sweep");
    for count in [1_000, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut collector = Collector::new(config());
                run_cycle(
                    &mut collector,
                    count,
                    CollectOptions::full().with_rescan_root_bytes(6 * MIB),
                );
            });
        });
    }
    group.finish();
}

fn bench_partial_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("partial_sweep");
    for count in [1_000, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut collector = Collector::new(config());
                run_cycle(&mut collector, count, CollectOptions::partial(MIB));
                run_cycle(&mut collector, count, CollectOptions::partial(MIB));
            });
        });
    }
    group.finish();
}

fn bench_background_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("background_sweep");
    for count in [10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut collector = Collector::new(config());
            b.iter(|| {
                run_cycle(
                    &mut collector,
                    count,
                    CollectOptions::full()
                        .with_rescan_root_bytes(6 * MIB)
                        .with_background(true),
                );
            });
        });
    }
    group.finish();
}

fn bench_empty_block_reuse(c: &mut Criterion) {
    c.bench_function("empty_block_reuse", |b| {
        let mut collector = Collector::new(config());
        b.iter(|| {
            allocate(&mut collector, 4_096);
            let metrics = collector
                .collect(CollectOptions::full().with_rescan_root_bytes(6 * MIB))
                .unwrap();
            black_box(metrics.blocks_pooled);
        });
    });
}

criterion_group!(
    benches,
    bench_full_sweep,
    bench_partial_sweep,
    bench_background_sweep,
    bench_empty_block_reuse
);
criterion_main!(benches);
