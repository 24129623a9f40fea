//! Delay scheduler turning a persisted due-store into deliveries.
//!
//! Every poll fetches the entries due by now, claims each through a
//! short-lived lock, hands the decoded message to the engine and only then
//! removes the entry. Several processes may poll the same store; the lock
//! makes sure one of them at a time owns each entry. An entry the engine
//! refuses, or one whose poller dies before removing it, stays in the store
//! and the lock TTL makes it claimable again.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use herald_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
    storage::{DueEntry, DueStore},
};

/// Poll loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between polls.
    pub poll_interval: Duration,
    /// Maximum entries fetched per poll.
    pub batch_size: usize,
    /// Lifetime of a claim lock. Must exceed the poll interval.
    pub lock_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(crate::DEFAULT_POLL_INTERVAL_SECONDS),
            batch_size: crate::DEFAULT_POLL_BATCH_SIZE,
            lock_timeout: Duration::from_secs(crate::DEFAULT_LOCK_TIMEOUT_SECONDS),
        }
    }
}

impl SchedulerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the lock would expire before the
    /// next poll or the batch size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout <= self.poll_interval {
            return Err(DeliveryError::configuration(format!(
                "delay lock timeout {:?} must exceed poll interval {:?}",
                self.lock_timeout, self.poll_interval
            )));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("poll batch size must be positive"));
        }
        Ok(())
    }
}

/// Result of one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This poller owns the entry.
    Claimed,
    /// Another poller holds the lock.
    Conflict,
}

/// Counts from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    /// Due entries returned by the store.
    pub fetched: usize,
    /// Entries this poller claimed.
    pub claimed: usize,
    /// Entries locked by another poller.
    pub conflicts: usize,
    /// Deliveries handed to the engine.
    pub dispatched: usize,
    /// Claimed entries that could not be decoded and were dropped.
    pub malformed: usize,
    /// Claimed entries the engine did not take. They stay in the store and
    /// are claimed again after the lock expires.
    pub deferred: usize,
}

/// Polls a [`DueStore`] and dispatches due messages.
#[derive(Debug)]
pub struct DelayScheduler {
    store: Arc<dyn DueStore>,
    engine: DeliveryEngine,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    observations: Mutex<HashMap<String, u32>>,
}

impl DelayScheduler {
    /// Creates a scheduler over `store`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `config` is invalid.
    pub fn new(
        store: Arc<dyn DueStore>,
        engine: DeliveryEngine,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, engine, clock, config, observations: Mutex::new(HashMap::new()) })
    }

    /// Tries to take ownership of `entry`.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the store cannot be reached.
    pub async fn claim(&self, entry: &DueEntry) -> Result<ClaimOutcome> {
        if self.store.claim(entry, self.config.lock_timeout).await? {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Conflict)
        }
    }

    /// Runs one poll cycle.
    ///
    /// # Errors
    ///
    /// Returns transport errors from the store and submission errors from
    /// the engine. Claim conflicts are reported, not returned.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let mut report = PollReport::default();
        if !self.engine.is_accepting() {
            debug!("engine not accepting, skipping poll");
            return Ok(report);
        }

        let now = self.clock.now_utc();
        let entries = self.store.fetch_due(now, self.config.batch_size).await?;
        report.fetched = entries.len();

        let mut seen = HashSet::with_capacity(entries.len());
        let outcome = self.process_batch(&entries, &mut seen, &mut report).await;
        self.observations().retain(|lock_key, _| seen.contains(lock_key));
        outcome?;

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                claimed = report.claimed,
                conflicts = report.conflicts,
                dispatched = report.dispatched,
                deferred = report.deferred,
                "delay poll completed"
            );
        }
        Ok(report)
    }

    async fn process_batch(
        &self,
        entries: &[DueEntry],
        seen: &mut HashSet<String>,
        report: &mut PollReport,
    ) -> Result<()> {
        for entry in entries {
            seen.insert(entry.lock_key.clone());

            if !self.engine.is_accepting() {
                debug!("engine stopped accepting mid-batch, leaving remaining entries");
                break;
            }

            if self.claim(entry).await? == ClaimOutcome::Conflict {
                *self.observations().entry(entry.lock_key.clone()).or_default() += 1;
                report.conflicts += 1;
                debug!(lock_key = %entry.lock_key, "due entry claimed elsewhere, skipping");
                continue;
            }
            report.claimed += 1;

            let prior_observations = self.observations().remove(&entry.lock_key).unwrap_or(0);
            let mut message = match entry.decode() {
                Ok(message) => message,
                Err(error) => {
                    report.malformed += 1;
                    error!(lock_key = %entry.lock_key, error = %error, "dropping undecodable due entry");
                    self.store.remove(entry).await?;
                    continue;
                },
            };
            message.polling_count = message.polling_count.saturating_add(prior_observations + 1);

            let request_id = message.request_id.clone();
            match self.engine.dispatch(message) {
                Ok(deliveries) => report.dispatched += deliveries,
                Err(error) => {
                    // The entry stays; it is claimable again once the lock expires.
                    report.dispatched += error.delivered();
                    report.deferred += 1;
                    self.observations().insert(entry.lock_key.clone(), prior_observations + 1);
                    warn!(
                        request_id = %request_id,
                        lock_key = %entry.lock_key,
                        delivered = error.delivered(),
                        retry_in_ms = duration_ms(self.config.lock_timeout),
                        error = %error,
                        "claimed delayed message not dispatched, leaving it for redelivery"
                    );
                    if error.is_backpressure() {
                        break;
                    }
                    continue;
                },
            }

            if !self.store.remove(entry).await? {
                warn!(
                    request_id = %request_id,
                    lock_key = %entry.lock_key,
                    "due entry removed elsewhere after dispatch, delivery may be duplicated"
                );
            }
        }
        Ok(())
    }

    /// Polls every `poll_interval` until `token` is cancelled. Poll errors
    /// are logged and the loop continues.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            poll_interval_ms = duration_ms(self.config.poll_interval),
            batch_size = self.config.batch_size,
            "delay scheduler starting"
        );

        loop {
            if token.is_cancelled() {
                break;
            }
            if let Err(error) = self.poll_once().await {
                warn!(error = %error, "delay poll failed");
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = self.clock.sleep(self.config.poll_interval) => {},
            }
        }

        info!("delay scheduler stopped");
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn observations(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.observations.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use herald_core::{Message, TestClock, Topic};

    use super::*;
    use crate::{
        engine::{EngineConfig, Handler, Trigger, TriggerRegistry},
        error::HandlerError,
        storage::mock::MemoryDueStore,
    };

    #[derive(Debug, Default)]
    struct PollingCountRecorder {
        last_polling_count: AtomicU32,
    }

    #[async_trait]
    impl Handler for PollingCountRecorder {
        async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
            self.last_polling_count.store(message.polling_count, Ordering::SeqCst);
            Ok(())
        }
    }

    fn topic() -> Topic {
        Topic::new("orders", "expire")
    }

    #[test]
    fn lock_timeout_must_exceed_poll_interval() {
        let config = SchedulerConfig {
            poll_interval: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DeliveryError::Configuration { .. })));
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(SchedulerConfig { batch_size: 0, ..Default::default() }.validate().is_err());
    }

    #[tokio::test]
    async fn conflicts_feed_polling_count() {
        let clock = TestClock::new();
        let store = Arc::new(MemoryDueStore::new(Arc::new(clock.clone())));
        let recorder = Arc::new(PollingCountRecorder::default());
        let mut registry = TriggerRegistry::new();
        registry.register(Trigger::new(topic(), "expiry", recorder.clone())).unwrap();
        let engine = DeliveryEngine::builder(EngineConfig::default(), registry)
            .clock(Arc::new(clock.clone()))
            .build();
        let scheduler = DelayScheduler::new(
            store.clone(),
            engine.clone(),
            Arc::new(clock.clone()),
            SchedulerConfig::default(),
        )
        .unwrap();

        let entry = store.schedule(&Message::new(topic(), "x"), clock.now_utc()).await.unwrap();
        // Another process holds the lock for the next two polls.
        assert!(store.claim(&entry, Duration::from_secs(2)).await.unwrap());

        assert_eq!(scheduler.poll_once().await.unwrap().conflicts, 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.poll_once().await.unwrap().conflicts, 1);
        clock.advance(Duration::from_secs(1));

        let report = scheduler.poll_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.dispatched, 1);

        engine.shutdown().await.unwrap();
        assert_eq!(recorder.last_polling_count.load(Ordering::SeqCst), 3);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn stopped_engine_is_not_fed() {
        let clock = TestClock::new();
        let store = Arc::new(MemoryDueStore::new(Arc::new(clock.clone())));
        let engine = DeliveryEngine::builder(EngineConfig::default(), TriggerRegistry::new())
            .clock(Arc::new(clock.clone()))
            .build();
        let scheduler = DelayScheduler::new(
            store.clone(),
            engine.clone(),
            Arc::new(clock.clone()),
            SchedulerConfig::default(),
        )
        .unwrap();
        store.schedule(&Message::new(topic(), "x"), clock.now_utc()).await.unwrap();

        engine.shutdown().await.unwrap();

        assert_eq!(scheduler.poll_once().await.unwrap(), PollReport::default());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.claim_attempts(), 0);
    }

    #[tokio::test]
    async fn malformed_entries_are_dropped() {
        let clock = TestClock::new();
        let store = Arc::new(MemoryDueStore::new(Arc::new(clock.clone())));
        let engine = DeliveryEngine::builder(EngineConfig::default(), TriggerRegistry::new())
            .clock(Arc::new(clock.clone()))
            .build();
        let scheduler = DelayScheduler::new(
            store.clone(),
            engine.clone(),
            Arc::new(clock.clone()),
            SchedulerConfig::default(),
        )
        .unwrap();
        store.insert(DueEntry::new(b"{not an envelope".to_vec(), clock.now_utc())).await;

        let report = scheduler.poll_once().await.unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(report.dispatched, 0);
        assert!(store.is_empty().await);
        engine.shutdown().await.unwrap();
    }
}
