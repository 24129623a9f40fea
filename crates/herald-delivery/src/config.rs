//! Layered configuration for the delivery core.

use std::{path::Path, sync::Arc, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_core::{Topic, Transport};
use serde::{Deserialize, Serialize};

use crate::{
    delay::SchedulerConfig,
    engine::{EngineConfig, Handler, RetryRoute, Trigger},
    error::{DeliveryError, Result},
    executor::ExecutorConfig,
    retry::{BackoffStrategy, RetryPolicy},
    watchdog::WatchdogConfig,
};

const CONFIG_FILE: &str = "herald.toml";
const ENV_PREFIX: &str = "HERALD_";

/// Retry route selected in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryRouteKind {
    /// Timer on the engine's runtime.
    #[default]
    InProcess,
    /// The transport's due-store.
    DelayStore,
}

/// Complete delivery configuration.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed with `HERALD_` (highest priority)
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use herald_delivery::HeraldConfig;
///
/// let config = HeraldConfig::load()?;
/// let retry_policy = config.to_retry_policy();
/// # Ok::<(), herald_delivery::DeliveryError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeraldConfig {
    // Retry
    /// Consumer failures allowed per message.
    ///
    /// Environment variable: `HERALD_RETRY_MAX_COUNT`
    #[serde(default = "default_retry_max_count")]
    pub retry_max_count: u32,
    /// Base backoff in seconds.
    ///
    /// Environment variable: `HERALD_RETRY_BACKOFF_SECONDS`
    #[serde(default = "default_retry_backoff_seconds")]
    pub retry_backoff_seconds: u64,
    /// Backoff growth across retries.
    ///
    /// Environment variable: `HERALD_RETRY_STRATEGY`
    #[serde(default = "default_retry_strategy")]
    pub retry_strategy: BackoffStrategy,
    /// Upper bound of the backoff in seconds.
    ///
    /// Environment variable: `HERALD_RETRY_MAX_DELAY_SECONDS`
    #[serde(default = "default_retry_max_delay_seconds")]
    pub retry_max_delay_seconds: u64,
    /// Jitter factor for the backoff (0.0 to 1.0).
    ///
    /// Environment variable: `HERALD_RETRY_JITTER_FACTOR`
    #[serde(default)]
    pub retry_jitter_factor: f64,
    /// Where retries wait.
    ///
    /// Environment variable: `HERALD_RETRY_ROUTE`
    #[serde(default)]
    pub retry_route: RetryRouteKind,

    // Delay polling
    /// Seconds between delay polls.
    ///
    /// Environment variable: `HERALD_POLL_INTERVAL_SECONDS`
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Due entries fetched per poll.
    ///
    /// Environment variable: `HERALD_POLL_BATCH_SIZE`
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,
    /// Claim lock lifetime in seconds.
    ///
    /// Environment variable: `HERALD_DELAY_LOCK_TIMEOUT_SECONDS`
    #[serde(default = "default_delay_lock_timeout_seconds")]
    pub delay_lock_timeout_seconds: u64,

    // Health
    /// Seconds between connectivity probes.
    ///
    /// Environment variable: `HERALD_HEALTH_CHECK_INTERVAL_SECONDS`
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,
    /// Seconds a loss must last before containers are destroyed.
    ///
    /// Environment variable: `HERALD_CONNECTION_LOSS_THRESHOLD_SECONDS`
    #[serde(default = "default_connection_loss_threshold_seconds")]
    pub connection_loss_threshold_seconds: u64,

    // Execution
    /// Default concurrency of each trigger.
    ///
    /// Environment variable: `HERALD_CONSUMER_COUNT`
    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,
    /// Workers shared by all handler groups.
    ///
    /// Environment variable: `HERALD_EXECUTOR_WORKERS`
    #[serde(default = "default_executor_workers")]
    pub executor_workers: usize,
    /// Outstanding tasks admitted before submissions fail fast.
    ///
    /// Environment variable: `HERALD_EXECUTOR_MAX_PENDING`
    #[serde(default = "default_executor_max_pending")]
    pub executor_max_pending: usize,
    /// Seconds shutdown waits for in-flight deliveries.
    ///
    /// Environment variable: `HERALD_SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

impl HeraldConfig {
    /// Loads defaults, `herald.toml` and `HERALD_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value fails to parse or
    /// validate.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment(CONFIG_FILE))
    }

    /// Like [`load`](Self::load) with an explicit configuration file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value fails to parse or
    /// validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path))
    }

    /// Layered figment for the given configuration file.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extracts and validates a configuration from any figment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value fails to parse or
    /// validate.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|error| DeliveryError::configuration(format!("failed to load configuration: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.retry_max_count == 0 {
            return Err(DeliveryError::configuration("retry_max_count must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            return Err(DeliveryError::configuration("retry_jitter_factor must be between 0.0 and 1.0"));
        }

        if self.retry_max_delay_seconds < self.retry_backoff_seconds {
            return Err(DeliveryError::configuration(
                "retry_max_delay_seconds cannot be below retry_backoff_seconds",
            ));
        }

        if self.poll_interval_seconds == 0 {
            return Err(DeliveryError::configuration("poll_interval_seconds must be greater than 0"));
        }

        if self.health_check_interval_seconds == 0 {
            return Err(DeliveryError::configuration(
                "health_check_interval_seconds must be greater than 0",
            ));
        }

        if self.consumer_count == 0 {
            return Err(DeliveryError::configuration("consumer_count must be greater than 0"));
        }

        if self.executor_workers == 0 {
            return Err(DeliveryError::configuration("executor_workers must be greater than 0"));
        }

        if self.executor_max_pending == 0 {
            return Err(DeliveryError::configuration("executor_max_pending must be greater than 0"));
        }

        self.to_scheduler_config().validate()
    }

    /// Retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_count,
            base_delay: Duration::from_secs(self.retry_backoff_seconds),
            max_delay: Duration::from_secs(self.retry_max_delay_seconds),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: self.retry_strategy,
        }
    }

    /// Executor pool configuration.
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig { worker_count: self.executor_workers, max_pending: self.executor_max_pending }
    }

    /// Engine configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the delay-store route is selected
    /// without a transport.
    pub fn to_engine_config(&self, transport: Option<Arc<dyn Transport>>) -> Result<EngineConfig> {
        let retry_route = match (self.retry_route, transport) {
            (RetryRouteKind::InProcess, _) => RetryRoute::InProcess,
            (RetryRouteKind::DelayStore, Some(transport)) => RetryRoute::DelayStore(transport),
            (RetryRouteKind::DelayStore, None) => {
                return Err(DeliveryError::configuration(
                    "retry_route delay_store requires a transport",
                ));
            },
        };

        Ok(EngineConfig {
            retry_policy: self.to_retry_policy(),
            retry_route,
            executor: self.to_executor_config(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        })
    }

    /// Delay scheduler configuration.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            batch_size: self.poll_batch_size,
            lock_timeout: Duration::from_secs(self.delay_lock_timeout_seconds),
        }
    }

    /// Connection watchdog configuration.
    pub fn to_watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_secs(self.health_check_interval_seconds),
            loss_threshold: Duration::from_secs(self.connection_loss_threshold_seconds),
        }
    }

    /// Trigger using the configured consumer concurrency.
    pub fn trigger(&self, topic: Topic, handler_id: impl Into<String>, handler: Arc<dyn Handler>) -> Trigger {
        Trigger::new(topic, handler_id, handler).with_concurrency(self.consumer_count)
    }
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            retry_max_count: default_retry_max_count(),
            retry_backoff_seconds: default_retry_backoff_seconds(),
            retry_strategy: default_retry_strategy(),
            retry_max_delay_seconds: default_retry_max_delay_seconds(),
            retry_jitter_factor: 0.0,
            retry_route: RetryRouteKind::InProcess,
            poll_interval_seconds: default_poll_interval_seconds(),
            poll_batch_size: default_poll_batch_size(),
            delay_lock_timeout_seconds: default_delay_lock_timeout_seconds(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
            connection_loss_threshold_seconds: default_connection_loss_threshold_seconds(),
            consumer_count: default_consumer_count(),
            executor_workers: default_executor_workers(),
            executor_max_pending: default_executor_max_pending(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

fn default_retry_max_count() -> u32 {
    crate::DEFAULT_RETRY_MAX_COUNT
}

fn default_retry_backoff_seconds() -> u64 {
    crate::DEFAULT_RETRY_BACKOFF_SECONDS
}

fn default_retry_strategy() -> BackoffStrategy {
    BackoffStrategy::Fixed
}

fn default_retry_max_delay_seconds() -> u64 {
    300
}

fn default_poll_interval_seconds() -> u64 {
    crate::DEFAULT_POLL_INTERVAL_SECONDS
}

fn default_poll_batch_size() -> usize {
    crate::DEFAULT_POLL_BATCH_SIZE
}

fn default_delay_lock_timeout_seconds() -> u64 {
    crate::DEFAULT_LOCK_TIMEOUT_SECONDS
}

fn default_health_check_interval_seconds() -> u64 {
    crate::DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS
}

fn default_connection_loss_threshold_seconds() -> u64 {
    crate::DEFAULT_CONNECTION_LOSS_THRESHOLD_SECONDS
}

fn default_consumer_count() -> usize {
    crate::DEFAULT_CONSUMER_COUNT
}

fn default_executor_workers() -> usize {
    crate::DEFAULT_EXECUTOR_WORKERS
}

fn default_executor_max_pending() -> usize {
    crate::DEFAULT_MAX_PENDING
}

fn default_shutdown_timeout_seconds() -> u64 {
    crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HeraldConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.retry_max_count, 3);
        assert_eq!(config.retry_backoff_seconds, 3);
        assert_eq!(config.retry_strategy, BackoffStrategy::Fixed);
        assert_eq!(config.poll_interval_seconds, 1);
        assert_eq!(config.poll_batch_size, 100);
        assert_eq!(config.delay_lock_timeout_seconds, 10);
        assert_eq!(config.health_check_interval_seconds, 15);
        assert_eq!(config.connection_loss_threshold_seconds, 60);
        assert_eq!(config.consumer_count, 2);
        assert_eq!(config.executor_workers, 16);
        assert_eq!(config.executor_max_pending, 1_000_000);
        assert_eq!(config.shutdown_timeout_seconds, 30);
        assert_eq!(config.retry_route, RetryRouteKind::InProcess);
    }

    #[test]
    fn file_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "herald.toml",
                r#"
                retry_max_count = 5
                retry_strategy = "exponential"
                poll_batch_size = 50
                "#,
            )?;
            jail.set_env("HERALD_POLL_BATCH_SIZE", "25");
            jail.set_env("HERALD_RETRY_ROUTE", "delay_store");

            let config = HeraldConfig::load().map_err(|error| error.to_string())?;

            assert_eq!(config.retry_max_count, 5);
            assert_eq!(config.retry_strategy, BackoffStrategy::Exponential);
            assert_eq!(config.poll_batch_size, 25);
            assert_eq!(config.retry_route, RetryRouteKind::DelayStore);
            assert_eq!(config.executor_workers, 16);
            Ok(())
        });
    }

    #[test]
    fn lock_timeout_must_exceed_poll_interval() {
        let config = HeraldConfig {
            poll_interval_seconds: 10,
            delay_lock_timeout_seconds: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DeliveryError::Configuration { .. })));
    }

    #[test]
    fn invalid_values_rejected() {
        let invalid = [
            HeraldConfig { retry_max_count: 0, ..Default::default() },
            HeraldConfig { executor_workers: 0, ..Default::default() },
            HeraldConfig { consumer_count: 0, ..Default::default() },
            HeraldConfig { retry_jitter_factor: 1.5, ..Default::default() },
            HeraldConfig { poll_batch_size: 0, ..Default::default() },
        ];
        for config in invalid {
            assert!(config.validate().is_err(), "accepted {config:?}");
        }
    }

    #[test]
    fn unparsable_environment_is_a_configuration_error() {
        Jail::expect_with(|jail| {
            jail.set_env("HERALD_EXECUTOR_WORKERS", "many");

            let error = HeraldConfig::load().unwrap_err();
            assert!(matches!(error, DeliveryError::Configuration { .. }));
            Ok(())
        });
    }

    #[test]
    fn delay_store_route_requires_transport() {
        let config = HeraldConfig { retry_route: RetryRouteKind::DelayStore, ..Default::default() };
        assert!(config.to_engine_config(None).is_err());

        let engine_config = HeraldConfig::default().to_engine_config(None).unwrap();
        assert!(matches!(engine_config.retry_route, RetryRoute::InProcess));
        assert_eq!(engine_config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(engine_config.retry_policy.max_retries, 3);
    }

    #[test]
    fn component_configs_follow_values() {
        let config = HeraldConfig::default();

        let scheduler = config.to_scheduler_config();
        assert_eq!(scheduler.poll_interval, Duration::from_secs(1));
        assert_eq!(scheduler.lock_timeout, Duration::from_secs(10));

        let watchdog = config.to_watchdog_config();
        assert_eq!(watchdog.check_interval, Duration::from_secs(15));
        assert_eq!(watchdog.loss_threshold, Duration::from_secs(60));

        let executor = config.to_executor_config();
        assert_eq!(executor.worker_count, 16);
        assert_eq!(executor.max_pending, 1_000_000);
    }
}
