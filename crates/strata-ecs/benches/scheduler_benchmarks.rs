//! Scheduler Benchmarks
//!
//! Tick overhead and fork-join fan-out of the system scheduler

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use strata_ecs::{Registry, System, SystemContext, SystemFn, SystemResult};

#[derive(Debug, Clone, PartialEq)]
struct Counter(u64);

struct IncrementSystem {
    counter: Arc<AtomicU64>,
}

impl System for IncrementSystem {
    fn run(&self, _ctx: &SystemContext) -> SystemResult {
        self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "increment"
    }
}

fn bench_empty_tick(c: &mut Criterion) {
    let registry = Arc::new(Registry::default());
    let scheduler = registry.create_scheduler().expect("scheduler");

    c.bench_function("empty_tick", |b| {
        b.iter(|| black_box(scheduler.update()));
    });
}

fn bench_sequential_systems(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_systems");

    for count in [1, 8, 32].iter() {
        let registry = Arc::new(Registry::default());
        let scheduler = registry.create_scheduler().expect("scheduler");
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..*count {
            scheduler.schedule(IncrementSystem { counter: counter.clone() });
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(scheduler.update()));
        });
    }

    group.finish();
}

fn bench_parallel_cluster(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_cluster");

    for count in [2, 8, 32].iter() {
        let registry = Arc::new(Registry::default());
        let scheduler = registry.create_scheduler().expect("scheduler");
        let counter = Arc::new(AtomicU64::new(0));
        let systems: Vec<Box<dyn System>> = (0..*count)
            .map(|_| Box::new(IncrementSystem { counter: counter.clone() }) as Box<dyn System>)
            .collect();
        scheduler.schedule_parallel(systems);

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(scheduler.update()));
        });
    }

    group.finish();
}

fn bench_fork_join_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("fork_join_view");

    for count in [1000, 10000].iter() {
        let registry = Arc::new(Registry::default());
        for i in 0..*count {
            registry.emplace((Counter(i),));
        }
        let scheduler = registry.create_scheduler().expect("scheduler");
        scheduler.schedule(SystemFn::new("bump", |ctx: &SystemContext| {
            ctx.registry().view::<(Counter,)>().par_for_each(|entry| {
                entry.components().0 .0 += 1;
            });
            Ok(())
        }));

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(scheduler.update()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_empty_tick,
    bench_sequential_systems,
    bench_parallel_cluster,
    bench_fork_join_view,
);

criterion_main!(benches);
