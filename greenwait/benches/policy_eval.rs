//! Benchmarks for the dispatch decision and a full tick using criterion.
//!
//! - Single policy evaluation against a full history ring
//! - Policy sweep over a batch of pending jobs
//! - One scheduler tick over 500 held jobs (in-memory store)

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use greenwait::*;
use greenwait_testkit::{JobFixture, MockCompletionProvider, ScriptedIntensitySource, sample, trend};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn history(len: usize) -> Vec<IntensitySample> {
    let values: Vec<f64> = (0..len).map(|i| 300.0 + (i % 7) as f64 * 15.0).collect();
    trend(&values)
}

/// Benchmark: one evaluation that falls through every rule.
fn bench_evaluate_single(c: &mut Criterion) {
    let policy = DispatchPolicy::default();
    let job = JobFixture::new().baseline(250.0).build();
    let latest = sample(420.0);
    let now = Utc::now();

    let mut group = c.benchmark_group("evaluate_single");
    for len in [3usize, 24, 96] {
        let history = history(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &history, |b, history| {
            b.iter(|| policy.evaluate(&job, Some(&latest), history, now));
        });
    }
    group.finish();
}

/// Benchmark: evaluate a batch of jobs with mixed deadlines.
fn bench_evaluate_batch(c: &mut Criterion) {
    let policy = DispatchPolicy::default();
    let latest = sample(380.0);
    let history = history(24);
    let now = Utc::now();

    let mut group = c.benchmark_group("evaluate_batch");
    for size in [100usize, 1000] {
        let jobs: Vec<Job> = (0..size)
            .map(|i| {
                JobFixture::new()
                    .baseline(300.0 + (i % 200) as f64)
                    .submitted_ago(Duration::minutes((i % 500) as i64))
                    .build()
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &jobs, |b, jobs| {
            b.iter(|| {
                jobs.iter()
                    .filter(|job| policy.evaluate(job, Some(&latest), &history, now).is_some())
                    .count()
            });
        });
    }
    group.finish();
}

/// Benchmark: one tick where every job is held.
///
/// Measures listing, evaluation and the skip of unchanged intensity
/// refreshes without any execution cost.
fn bench_tick_held(c: &mut Criterion) {
    let rt = create_runtime();

    let store = InMemoryJobStore::new();
    rt.block_on(async {
        for _ in 0..500 {
            JobFixture::new()
                .baseline(100.0)
                .window(Window::FortyEightHours)
                .insert_into(&store)
                .await;
        }
    });

    let oracle = Arc::new(IntensityOracle::new(
        Arc::new(ScriptedIntensitySource::steady(100.5)),
        &OracleConfig {
            min_refresh_interval_secs: 0,
            ..OracleConfig::default()
        },
    ));
    let adapter = Arc::new(ExecutionAdapter::new(
        Arc::new(MockCompletionProvider::new()),
        ExecutionConfig::default(),
    ));
    let scheduler = SchedulerLoopBuilder::new(SchedulerConfig::default())
        .with_store(Arc::new(store))
        .with_oracle(oracle)
        .with_adapter(adapter)
        // A flat grid would otherwise turn into a trough after three ticks.
        .with_policy(DispatchPolicy::new(PolicyConfig {
            trough_min_samples: usize::MAX,
        }))
        .build()
        .expect("build scheduler");

    let mut group = c.benchmark_group("tick");
    group.throughput(Throughput::Elements(500));
    group.bench_function("held_500", |b| {
        b.to_async(&rt).iter(|| async {
            let report = scheduler.tick().await.expect("tick should succeed");
            assert_eq!(report.held, 500);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_evaluate_single,
    bench_evaluate_batch,
    bench_tick_held
);
criterion_main!(benches);
