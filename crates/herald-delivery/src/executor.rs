//! Bounded-parallelism task execution partitioned by group key.
//!
//! Every consumer handler is a group. A group runs at most `concurrency`
//! tasks at once and queues the rest in submission order; different groups
//! share one fixed pool of workers and never wait on each other.
//!
//! # Architecture
//!
//! ```text
//!  submit(GTask)                      ┌──────────────┐
//!  ─────────────▶ group table ──────▶ │ ready queue  │ ──▶ worker 0..N
//!                 running < limit?    └──────────────┘        │
//!                   yes: ready          ▲                     │ completion
//!                   no:  group FIFO     └─── next queued ◀────┘
//! ```
//!
//! Group bookkeeping is created on first submission and removed as soon as
//! the group has nothing running and nothing queued, so memory stays bounded
//! by the number of busy groups rather than by every key ever seen.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DeliveryError, Result};

/// Boxed zero-argument action run by the executor.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Unit of work submitted to the [`GroupedExecutor`].
pub struct GTask {
    group: String,
    concurrency: usize,
    action: TaskFuture,
}

impl GTask {
    /// Creates a task for `group`.
    ///
    /// `concurrency` is a property of the group; the value on the most
    /// recently submitted task wins. Zero is treated as one.
    pub fn new<F>(group: impl Into<String>, concurrency: usize, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self { group: group.into(), concurrency: concurrency.max(1), action: Box::pin(action) }
    }

    /// Group key of the task.
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl std::fmt::Debug for GTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GTask")
            .field("group", &self.group)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Configuration of the shared worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of workers shared by all groups.
    pub worker_count: usize,
    /// Maximum queued plus running tasks before submissions fail fast.
    pub max_pending: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { worker_count: crate::DEFAULT_EXECUTOR_WORKERS, max_pending: crate::DEFAULT_MAX_PENDING }
    }
}

/// Point-in-time view of one group's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Tasks currently executing.
    pub running: usize,
    /// Tasks waiting for a slot.
    pub queued: usize,
    /// Declared concurrency limit.
    pub concurrency: usize,
}

#[derive(Default)]
struct GroupState {
    running: usize,
    concurrency: usize,
    queue: VecDeque<TaskFuture>,
}

impl GroupState {
    /// Moves queued tasks into free slots, oldest first.
    fn promote(&mut self) -> Vec<TaskFuture> {
        let mut ready = Vec::new();
        while self.running < self.concurrency {
            let Some(action) = self.queue.pop_front() else { break };
            self.running += 1;
            ready.push(action);
        }
        ready
    }
}

struct ReadyTask {
    group: String,
    action: TaskFuture,
}

struct Shared {
    groups: Mutex<HashMap<String, GroupState>>,
    ready_tx: mpsc::UnboundedSender<ReadyTask>,
    accepting: AtomicBool,
    outstanding: AtomicUsize,
    drained: Notify,
    max_pending: usize,
}

impl Shared {
    fn groups(&self) -> MutexGuard<'_, HashMap<String, GroupState>> {
        // A poisoned table only means a panic happened while the lock was
        // held; the bookkeeping itself is updated atomically per call.
        self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn send_ready(&self, group: &str, actions: Vec<TaskFuture>) {
        for action in actions {
            if self.ready_tx.send(ReadyTask { group: group.to_string(), action }).is_err() {
                error!(group, "ready queue closed, dropping task");
                self.finish_one();
            }
        }
    }

    /// Called by a worker after a task for `group` finished.
    fn complete(&self, group: &str) {
        let next = {
            let mut groups = self.groups();
            let mut next = Vec::new();
            let mut reclaim = false;

            if let Some(state) = groups.get_mut(group) {
                state.running = state.running.saturating_sub(1);
                next = state.promote();
                reclaim = state.running == 0 && state.queue.is_empty();
            } else {
                error!(group, "completion for unknown group");
            }

            if reclaim {
                groups.remove(group);
            }
            next
        };

        self.send_ready(group, next);
        self.finish_one();
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Task scheduler bounding parallelism per group over a shared worker pool.
pub struct GroupedExecutor {
    shared: Arc<Shared>,
    config: ExecutorConfig,
    cancellation_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupedExecutor {
    /// Creates the executor and spawns its workers.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(config: ExecutorConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));

        let shared = Arc::new(Shared {
            groups: Mutex::new(HashMap::new()),
            ready_tx,
            accepting: AtomicBool::new(true),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            max_pending: config.max_pending.max(1),
        });
        let cancellation_token = CancellationToken::new();

        let worker_handles = (0..worker_count)
            .map(|worker_id| {
                let shared = shared.clone();
                let ready_rx = ready_rx.clone();
                let token = cancellation_token.clone();
                tokio::spawn(run_worker(worker_id, shared, ready_rx, token))
            })
            .collect();

        info!(worker_count, max_pending = config.max_pending, "grouped executor started");

        Self { shared, config, cancellation_token, worker_handles: Mutex::new(worker_handles) }
    }

    /// Submits a task without blocking.
    ///
    /// The task runs exactly once unless the executor is shut down before it
    /// gets a slot.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Rejected`] after shutdown started and
    /// [`DeliveryError::QueueFull`] when `max_pending` tasks are outstanding.
    pub fn submit(&self, task: GTask) -> Result<()> {
        let GTask { group, concurrency, action } = task;

        // Count the task before checking `accepting`; shutdown stores
        // `accepting` before reading `outstanding`, so one side always
        // observes the other.
        let previous = self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if !self.shared.accepting.load(Ordering::SeqCst) {
            self.shared.finish_one();
            return Err(DeliveryError::rejected(group));
        }
        if previous >= self.shared.max_pending {
            self.shared.finish_one();
            return Err(DeliveryError::QueueFull { group, capacity: self.shared.max_pending });
        }

        // Queue behind older tasks even when a raised limit frees a slot.
        let ready = {
            let mut groups = self.shared.groups();
            let state = groups.entry(group.clone()).or_default();
            state.concurrency = concurrency;
            state.queue.push_back(action);
            state.promote()
        };

        self.shared.send_ready(&group, ready);
        Ok(())
    }

    /// Stops accepting tasks and waits up to `timeout` for queued and running
    /// tasks to finish, then stops the workers.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] with the number of
    /// abandoned tasks if the drain did not finish in time. Abandoned tasks
    /// are logged per group.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.shared.accepting.store(false, Ordering::SeqCst);
        info!(
            outstanding = self.outstanding(),
            timeout_ms = timeout.as_millis(),
            "draining grouped executor"
        );

        let drained = tokio::time::timeout(timeout, self.shared.wait_drained()).await.is_ok();
        self.cancellation_token.cancel();

        let handles = std::mem::take(
            &mut *self.worker_handles.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for (worker_id, handle) in handles.into_iter().enumerate() {
            if let Err(join_error) = handle.await {
                error!(worker_id, error = %join_error, "executor worker failed during shutdown");
            }
        }

        if drained {
            info!("grouped executor shut down");
            return Ok(());
        }

        let abandoned = self.shared.outstanding.load(Ordering::SeqCst);
        {
            let mut groups = self.shared.groups();
            for (group, state) in groups.iter() {
                warn!(
                    group = %group,
                    running = state.running,
                    queued = state.queue.len(),
                    "abandoning tasks at shutdown"
                );
            }
            groups.clear();
        }
        error!(abandoned, timeout_ms = timeout.as_millis(), "grouped executor shutdown timed out");
        Err(DeliveryError::ShutdownTimeout { timeout, abandoned })
    }

    /// Whether new submissions are accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Tasks submitted but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Number of groups with queued or running tasks.
    pub fn active_groups(&self) -> usize {
        self.shared.groups().len()
    }

    /// Bookkeeping of one group, or `None` when the group is idle.
    pub fn group_snapshot(&self, group: &str) -> Option<GroupSnapshot> {
        self.shared.groups().get(group).map(|state| GroupSnapshot {
            running: state.running,
            queued: state.queue.len(),
            concurrency: state.concurrency,
        })
    }

    /// Pool configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

impl std::fmt::Debug for GroupedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupedExecutor")
            .field("config", &self.config)
            .field("outstanding", &self.outstanding())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

impl Drop for GroupedExecutor {
    fn drop(&mut self) {
        if !self.cancellation_token.is_cancelled() {
            let outstanding = self.outstanding();
            if outstanding > 0 {
                warn!(
                    outstanding,
                    "GroupedExecutor dropped without shutdown; abandoning outstanding tasks"
                );
            }
            self.cancellation_token.cancel();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    shared: Arc<Shared>,
    ready_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ReadyTask>>>,
    token: CancellationToken,
) {
    debug!(worker_id, "executor worker starting");

    loop {
        let next = tokio::select! {
            biased;
            () = token.cancelled() => break,
            task = async { ready_rx.lock().await.recv().await } => task,
        };
        let Some(ReadyTask { group, action }) = next else { break };

        let mut handle = tokio::spawn(action);
        let outcome = tokio::select! {
            outcome = &mut handle => outcome,
            () = token.cancelled() => {
                handle.abort();
                warn!(worker_id, group = %group, "aborting running task at shutdown");
                break;
            },
        };

        if let Err(join_error) = outcome {
            if join_error.is_panic() {
                warn!(worker_id, group = %group, "task panicked; counted as completed");
            } else {
                warn!(worker_id, group = %group, error = %join_error, "task cancelled");
            }
        }
        shared.complete(&group);
    }

    debug!(worker_id, "executor worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn executor(worker_count: usize) -> GroupedExecutor {
        GroupedExecutor::new(ExecutorConfig { worker_count, ..Default::default() })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_one_preserves_submission_order() {
        let executor = executor(8);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let order = order.clone();
            executor
                .submit(GTask::new("sequential", 1, async move {
                    tokio::task::yield_now().await;
                    order.lock().unwrap().push(i);
                }))
                .unwrap();
        }

        executor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let executor = executor(2);
        executor.shutdown(Duration::from_secs(1)).await.unwrap();

        let result = executor.submit(GTask::new("late", 1, async {}));
        assert!(matches!(result, Err(DeliveryError::Rejected { ref group }) if group == "late"));
        assert!(!executor.is_accepting());
        assert_eq!(executor.outstanding(), 0);
    }

    #[tokio::test]
    async fn idle_groups_are_reclaimed() {
        let executor = executor(4);
        let done = Arc::new(AtomicUsize::new(0));

        for group in 0..100 {
            let done = done.clone();
            executor
                .submit(GTask::new(format!("group-{group}"), 2, async move {
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        executor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 100);
        assert_eq!(executor.active_groups(), 0);
    }

    #[tokio::test]
    async fn panicking_task_counts_as_completed() {
        let executor = executor(1);
        let after = Arc::new(AtomicUsize::new(0));

        executor.submit(GTask::new("faulty", 1, async { panic!("handler blew up") })).unwrap();
        let counter = after.clone();
        executor
            .submit(GTask::new("faulty", 1, async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        executor.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn admission_bound_fails_fast() {
        let executor = GroupedExecutor::new(ExecutorConfig { worker_count: 1, max_pending: 2 });
        let gate = Arc::new(Notify::new());

        for _ in 0..2 {
            let gate = gate.clone();
            executor.submit(GTask::new("bounded", 1, async move { gate.notified().await })).unwrap();
        }

        let result = executor.submit(GTask::new("bounded", 1, async {}));
        assert!(matches!(result, Err(DeliveryError::QueueFull { capacity: 2, .. })));

        let snapshot = executor.group_snapshot("bounded").unwrap();
        assert_eq!(snapshot.concurrency, 1);
        assert_eq!(snapshot.running + snapshot.queued, 2);

        let result = executor.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(DeliveryError::ShutdownTimeout { abandoned: 2, .. })));
    }

    #[tokio::test]
    async fn shutdown_timeout_reports_abandoned_tasks() {
        let executor = executor(1);
        let gate = Arc::new(Notify::new());

        for _ in 0..3 {
            let gate = gate.clone();
            executor.submit(GTask::new("stuck", 1, async move { gate.notified().await })).unwrap();
        }

        let result = executor.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(DeliveryError::ShutdownTimeout { abandoned: 3, .. })));
        assert_eq!(executor.active_groups(), 0);
    }
}
