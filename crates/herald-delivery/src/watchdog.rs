//! Connection watchdog gating listener containers on broker health.
//!
//! A failed probe only records when the loss started. Containers are torn
//! down once the connection has stayed lost for the loss threshold, so a
//! short blip never interrupts consumption. The first successful probe
//! after a teardown registers them again.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use herald_core::{Clock, ConnectivityProbe, ListenerContainer};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Time between probes.
    pub check_interval: Duration,
    /// How long the connection must stay lost before containers are
    /// destroyed.
    pub loss_threshold: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(crate::DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS),
            loss_threshold: Duration::from_secs(crate::DEFAULT_CONNECTION_LOSS_THRESHOLD_SECONDS),
        }
    }
}

/// What a single check changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTransition {
    /// Nothing changed.
    Unchanged,
    /// The connection was restored and containers were registered.
    Registered,
    /// First failed probe of a loss; containers keep running.
    LossDetected,
    /// The loss outlasted the threshold and containers were destroyed.
    Destroyed,
}

/// Periodic connectivity check driving container lifecycle.
#[derive(Debug)]
pub struct ConnectionWatchdog {
    probe: Arc<dyn ConnectivityProbe>,
    containers: Vec<Arc<dyn ListenerContainer>>,
    clock: Arc<dyn Clock>,
    config: WatchdogConfig,
    active: AtomicBool,
    first_lost: Mutex<Option<Instant>>,
}

impl ConnectionWatchdog {
    /// Creates a watchdog. Containers are assumed to be registered already.
    pub fn new(
        probe: Arc<dyn ConnectivityProbe>,
        containers: Vec<Arc<dyn ListenerContainer>>,
        clock: Arc<dyn Clock>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            probe,
            containers,
            clock,
            config,
            active: AtomicBool::new(true),
            first_lost: Mutex::new(None),
        }
    }

    /// Whether containers are considered registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Probes once and applies the resulting transition.
    pub async fn check_once(&self) -> WatchdogTransition {
        let connected = match self.probe.test_connection().await {
            Ok(connected) => connected,
            Err(error) => {
                warn!(error = %error, "connectivity probe failed");
                false
            },
        };

        // Held across container calls so concurrent checks apply in order.
        let mut first_lost = self.first_lost.lock().await;

        if connected {
            let mut transition = WatchdogTransition::Unchanged;
            if !self.is_active() {
                let registered = self.register_all().await;
                self.active.store(true, Ordering::SeqCst);
                info!(registered, "connection restored, containers registered");
                transition = WatchdogTransition::Registered;
            }
            if first_lost.take().is_some() && transition == WatchdogTransition::Unchanged {
                info!("connection recovered before loss threshold");
            }
            return transition;
        }

        let now = self.clock.now();
        let transition = match *first_lost {
            Some(_) => WatchdogTransition::Unchanged,
            None => {
                *first_lost = Some(now);
                warn!(
                    threshold_secs = self.config.loss_threshold.as_secs(),
                    "connection lost, waiting for threshold"
                );
                WatchdogTransition::LossDetected
            },
        };

        let lost_for = first_lost.map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        if lost_for >= self.config.loss_threshold && self.is_active() {
            let destroyed = self.destroy_all().await;
            self.active.store(false, Ordering::SeqCst);
            error!(
                destroyed,
                lost_for_secs = lost_for.as_secs(),
                "connection lost beyond threshold, containers destroyed"
            );
            return WatchdogTransition::Destroyed;
        }

        transition
    }

    async fn register_all(&self) -> usize {
        let mut registered = 0;
        for container in &self.containers {
            if container.is_active() {
                continue;
            }
            match container.register().await {
                Ok(()) => registered += 1,
                Err(error) => {
                    error!(container = container.name(), error = %error, "container registration failed");
                },
            }
        }
        registered
    }

    async fn destroy_all(&self) -> usize {
        let mut destroyed = 0;
        for container in &self.containers {
            if !container.is_active() {
                continue;
            }
            match container.destroy().await {
                Ok(()) => destroyed += 1,
                Err(error) => {
                    error!(container = container.name(), error = %error, "container teardown failed");
                },
            }
        }
        destroyed
    }

    /// Checks every `check_interval` until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            loss_threshold_secs = self.config.loss_threshold.as_secs(),
            containers = self.containers.len(),
            "connection watchdog starting"
        );

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = self.clock.sleep(self.config.check_interval) => {},
            }

            let transition = self.check_once().await;
            debug!(?transition, "connection check completed");
        }

        info!("connection watchdog stopped");
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use herald_core::{TestClock, TransportError, TransportResult};

    use super::*;

    #[derive(Debug)]
    struct ErroringProbe;

    #[async_trait]
    impl ConnectivityProbe for ErroringProbe {
        async fn test_connection(&self) -> TransportResult<bool> {
            Err(TransportError::connection("refused"))
        }
    }

    #[derive(Debug, Default)]
    struct Container {
        active: AtomicBool,
        destroys: AtomicUsize,
    }

    #[async_trait]
    impl ListenerContainer for Container {
        fn name(&self) -> &str {
            "orders"
        }

        async fn register(&self) -> TransportResult<()> {
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn destroy(&self) -> TransportResult<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn probe_errors_count_as_loss() {
        let clock = TestClock::new();
        let container = Arc::new(Container { active: AtomicBool::new(true), ..Default::default() });
        let watchdog = ConnectionWatchdog::new(
            Arc::new(ErroringProbe),
            vec![container.clone()],
            Arc::new(clock.clone()),
            WatchdogConfig { check_interval: Duration::from_secs(15), loss_threshold: Duration::from_secs(60) },
        );

        assert_eq!(watchdog.check_once().await, WatchdogTransition::LossDetected);
        clock.advance(Duration::from_secs(30));
        assert_eq!(watchdog.check_once().await, WatchdogTransition::Unchanged);
        clock.advance(Duration::from_secs(30));
        assert_eq!(watchdog.check_once().await, WatchdogTransition::Destroyed);
        assert_eq!(watchdog.check_once().await, WatchdogTransition::Unchanged);

        assert!(!watchdog.is_active());
        assert_eq!(container.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_threshold_destroys_on_first_loss() {
        let clock = TestClock::new();
        let container = Arc::new(Container { active: AtomicBool::new(true), ..Default::default() });
        let watchdog = ConnectionWatchdog::new(
            Arc::new(ErroringProbe),
            vec![container.clone()],
            Arc::new(clock),
            WatchdogConfig { check_interval: Duration::from_secs(1), loss_threshold: Duration::ZERO },
        );

        assert_eq!(watchdog.check_once().await, WatchdogTransition::Destroyed);
        assert!(!container.is_active());
    }
}
