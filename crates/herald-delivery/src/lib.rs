//! Transport-agnostic delivery core.
//!
//! Turns messages handed over by a broker adapter into handler invocations
//! with at-least-once semantics, bounded retry and failure callbacks.
//!
//! # Architecture
//!
//! ```text
//!  Transport consume ─▶ DeliveryEngine ─▶ GroupedExecutor ─▶ interceptors ─▶ Handler
//!                            ▲    │
//!  DueStore ─▶ DelayScheduler┘    └─▶ RetryPolicy: retry after backoff | fail-callback
//!
//!  ConnectivityProbe ─▶ ConnectionWatchdog ─▶ ListenerContainer register/destroy
//! ```
//!
//! - [`GroupedExecutor`] bounds parallelism per handler while different
//!   handlers share one worker pool.
//! - [`DeliveryAttempt`] is the acknowledgement state machine of one message
//!   for one handler; [`RetryPolicy`] decides between retry and exhaustion.
//! - [`DelayScheduler`] claims due entries from a [`DueStore`] so that one
//!   poller delivers each delayed message.
//! - [`ConnectionWatchdog`] tears consumption down after a sustained loss of
//!   connectivity and brings it back on recovery.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{Message, Topic};
//! use herald_delivery::{
//!     DeliveryEngine, DeliveryError, Handler, HandlerError, HeraldConfig, TriggerRegistry,
//! };
//!
//! #[derive(Debug)]
//! struct AuditLog;
//!
//! #[async_trait::async_trait]
//! impl Handler for AuditLog {
//!     async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
//!         println!("{} {}", message.topic, message.request_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let config = HeraldConfig::load()?;
//! let topic = Topic::new("orders", "created");
//!
//! let mut registry = TriggerRegistry::new();
//! registry.register(config.trigger(topic.clone(), "orders::audit", Arc::new(AuditLog)))?;
//!
//! let engine = DeliveryEngine::builder(config.to_engine_config(None)?, registry).build();
//! engine.dispatch(Message::new(topic, "{\"id\":42}"))?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod delay;
pub mod engine;
pub mod error;
pub mod executor;
pub mod retry;
pub mod storage;
pub mod watchdog;

pub use config::{HeraldConfig, RetryRouteKind};
pub use delay::{ClaimOutcome, DelayScheduler, PollReport, SchedulerConfig};
pub use engine::{
    DeliveryEngine, DeliveryEngineBuilder, EngineConfig, EngineStats, FailCallback, Handler,
    Interception, Interceptor, RetryRoute, Trigger, TriggerRegistry,
};
pub use error::{DeliveryError, HandlerError, Result};
pub use executor::{ExecutorConfig, GTask, GroupSnapshot, GroupedExecutor};
pub use retry::{AttemptState, BackoffStrategy, DeliveryAttempt, NextAction, RetryPolicy};
pub use storage::{DueEntry, DueStore};
pub use watchdog::{ConnectionWatchdog, WatchdogConfig, WatchdogTransition};

/// Default consumer failures allowed per message.
pub const DEFAULT_RETRY_MAX_COUNT: u32 = 3;

/// Default base backoff between retries in seconds.
pub const DEFAULT_RETRY_BACKOFF_SECONDS: u64 = 3;

/// Default seconds between delay polls.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 1;

/// Default due entries fetched per poll.
pub const DEFAULT_POLL_BATCH_SIZE: usize = 100;

/// Default claim lock lifetime in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECONDS: u64 = 10;

/// Default seconds between connectivity probes.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS: u64 = 15;

/// Default seconds a connection loss must last before teardown.
pub const DEFAULT_CONNECTION_LOSS_THRESHOLD_SECONDS: u64 = 60;

/// Default concurrency of a trigger.
pub const DEFAULT_CONSUMER_COUNT: usize = 2;

/// Default number of executor workers.
pub const DEFAULT_EXECUTOR_WORKERS: usize = 16;

/// Default bound on outstanding executor tasks.
pub const DEFAULT_MAX_PENDING: usize = 1_000_000;

/// Default drain timeout at shutdown in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
