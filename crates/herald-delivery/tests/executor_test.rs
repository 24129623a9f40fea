//! Integration tests for the grouped executor under load.
//!
//! Covers the guarantees the engine builds on: no task is lost or run twice
//! under heavy concurrent submission, per-group concurrency is never
//! exceeded, and a saturated group never blocks other groups.

use std::{
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{ensure, Result};
use herald_delivery::{ExecutorConfig, GTask, GroupedExecutor};
use herald_testing::{init_test_tracing, wait_until};
use tokio::sync::oneshot;

const PRODUCERS: usize = 1_000;
const TASKS_PER_PRODUCER: usize = 600;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn no_task_lost_under_pressure() -> Result<()> {
    init_test_tracing();
    let executor = Arc::new(GroupedExecutor::new(ExecutorConfig::default()));
    let total = PRODUCERS * TASKS_PER_PRODUCER;
    let runs: Arc<Vec<AtomicU8>> = Arc::new((0..total).map(|_| AtomicU8::new(0)).collect());
    let completions = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let executor = executor.clone();
            let runs = runs.clone();
            let completions = completions.clone();
            tokio::spawn(async move {
                for task in 0..TASKS_PER_PRODUCER {
                    let index = producer * TASKS_PER_PRODUCER + task;
                    let runs = runs.clone();
                    let completions = completions.clone();
                    let group = format!("group-{}", producer % 64);
                    let concurrency = 1 + producer % 4;
                    executor.submit(GTask::new(group, concurrency, async move {
                        runs[index].fetch_add(1, Ordering::SeqCst);
                        completions.fetch_add(1, Ordering::SeqCst);
                    }))?;
                }
                anyhow::Ok(())
            })
        })
        .collect();

    for producer in producers {
        producer.await??;
    }
    executor.shutdown(Duration::from_secs(120)).await?;

    assert_eq!(completions.load(Ordering::SeqCst), total);
    let duplicates_or_missing = runs.iter().filter(|runs| runs.load(Ordering::SeqCst) != 1).count();
    assert_eq!(duplicates_or_missing, 0, "every task runs exactly once");
    assert_eq!(executor.active_groups(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn group_concurrency_never_exceeded() -> Result<()> {
    let executor = GroupedExecutor::new(ExecutorConfig { worker_count: 16, ..Default::default() });
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    for _ in 0..200 {
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        executor.submit(GTask::new("orders::audit", 3, async move {
            let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }))?;
    }

    if let Some(snapshot) = executor.group_snapshot("orders::audit") {
        ensure!(snapshot.running <= 3, "running above limit: {snapshot:?}");
        ensure!(snapshot.concurrency == 3, "unexpected limit: {snapshot:?}");
    }

    executor.shutdown(Duration::from_secs(30)).await?;
    let observed = max_in_flight.load(Ordering::SeqCst);
    assert!(observed <= 3, "observed {observed} concurrent tasks");
    assert!(observed >= 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturated_group_does_not_block_others() -> Result<()> {
    let executor = GroupedExecutor::new(ExecutorConfig { worker_count: 4, ..Default::default() });
    let (release_tx, release_rx) = oneshot::channel::<()>();

    executor.submit(GTask::new("slow", 1, async move {
        let _ = release_rx.await;
    }))?;
    for _ in 0..10 {
        executor.submit(GTask::new("slow", 1, async {}))?;
    }

    let fast_done = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let fast_done = fast_done.clone();
        executor.submit(GTask::new("fast", 2, async move {
            fast_done.fetch_add(1, Ordering::SeqCst);
        }))?;
    }

    wait_until(Duration::from_secs(5), "fast group to drain", || {
        let fast_done = fast_done.clone();
        async move { fast_done.load(Ordering::SeqCst) == 100 }
    })
    .await?;

    let slow = executor.group_snapshot("slow");
    assert_eq!(slow.map(|snapshot| (snapshot.running, snapshot.queued)), Some((1, 10)));

    let _ = release_tx.send(());
    executor.shutdown(Duration::from_secs(5)).await?;
    assert_eq!(executor.outstanding(), 0);
    Ok(())
}

#[tokio::test]
async fn concurrency_follows_latest_submission() -> Result<()> {
    let executor = GroupedExecutor::new(ExecutorConfig { worker_count: 8, ..Default::default() });
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    for concurrency in [1, 1, 4] {
        let mut release_rx = release_rx.clone();
        executor.submit(GTask::new("resizable", concurrency, async move {
            let _ = release_rx.wait_for(|released| *released).await;
        }))?;
    }

    let snapshot = executor.group_snapshot("resizable");
    assert_eq!(snapshot.map(|snapshot| snapshot.concurrency), Some(4));

    release_tx.send(true)?;
    executor.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn raised_concurrency_keeps_queued_tasks_first() -> Result<()> {
    let executor = GroupedExecutor::new(ExecutorConfig { worker_count: 4, ..Default::default() });
    let started = Arc::new(std::sync::Mutex::new(Vec::<&'static str>::new()));
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let task = |name: &'static str, concurrency: usize| {
        let started = started.clone();
        let mut release_rx = release_rx.clone();
        GTask::new("reordered", concurrency, async move {
            started.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(name);
            let _ = release_rx.wait_for(|released| *released).await;
        })
    };
    let started_count = |count: usize| {
        let started = started.clone();
        move || {
            let started = started.clone();
            async move { started.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len() == count }
        }
    };

    executor.submit(task("first", 1))?;
    wait_until(Duration::from_secs(5), "first task to start", started_count(1)).await?;
    executor.submit(task("second", 1))?;
    executor.submit(task("third", 2))?;
    wait_until(Duration::from_secs(5), "second task to start", started_count(2)).await?;

    let order = started.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
    assert_eq!(order, ["first", "second"]);
    let snapshot = executor.group_snapshot("reordered");
    assert_eq!(snapshot.map(|snapshot| (snapshot.running, snapshot.queued)), Some((2, 1)));

    release_tx.send(true)?;
    executor.shutdown(Duration::from_secs(5)).await?;
    assert_eq!(started.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len(), 3);
    Ok(())
}
