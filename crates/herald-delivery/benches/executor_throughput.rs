//! Throughput benchmarks for the grouped executor and retry computations.
//!
//! Tracks the hot paths of delivery: submitting tasks across many groups and
//! computing backoff for failed attempts.

use std::{
    hint::black_box,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use herald_delivery::{BackoffStrategy, ExecutorConfig, GTask, GroupedExecutor, RetryPolicy};
use tokio::runtime::Runtime;

/// Submits a batch of no-op tasks spread over `groups` groups and drains it.
async fn run_batch(tasks: usize, groups: usize) {
    let executor = GroupedExecutor::new(ExecutorConfig::default());
    let completed = Arc::new(AtomicUsize::new(0));

    for task in 0..tasks {
        let completed = completed.clone();
        let group = format!("group-{}", task % groups);
        let submitted = executor.submit(GTask::new(group, 2, async move {
            completed.fetch_add(1, Ordering::Relaxed);
        }));
        if submitted.is_err() {
            return;
        }
    }

    let _ = executor.shutdown(Duration::from_secs(60)).await;
    black_box(completed.load(Ordering::Relaxed));
}

fn bench_executor(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor");
    group.sample_size(20);
    let Ok(runtime) = Runtime::new() else {
        return;
    };

    for groups in [1, 16, 256] {
        let tasks = 10_000;
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::new("submit_and_drain", groups), &groups, |b, &groups| {
            b.to_async(&runtime).iter(|| run_batch(tasks, groups));
        });
    }

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");

    for strategy in [BackoffStrategy::Fixed, BackoffStrategy::Linear, BackoffStrategy::Exponential] {
        let policy = RetryPolicy { backoff_strategy: strategy, jitter_factor: 0.1, ..RetryPolicy::default() };
        group.bench_with_input(BenchmarkId::new("backoff_for", format!("{strategy:?}")), &policy, |b, policy| {
            b.iter(|| {
                for retry in 1..=10 {
                    black_box(policy.backoff_for(black_box(retry)));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_executor, bench_backoff);
criterion_main!(benches);
