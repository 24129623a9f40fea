//! Test infrastructure for the herald delivery core.
//!
//! Provides message fixtures, recording test doubles for every collaborator
//! trait, and helpers for waiting on asynchronous outcomes without sleeping
//! for fixed periods.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, time::Duration};

use anyhow::{bail, Result};

pub mod doubles;
pub mod fixtures;

pub use doubles::{
    CountingContainer, FailingHandler, RecordingEventHandler, RecordingFailCallback,
    RecordingHandler, ShortCircuitInterceptor, ToggleProbe,
};
pub use fixtures::MessageBuilder;
pub use herald_core::{Clock, TestClock};

/// Installs a test-writer tracing subscriber once per process.
///
/// Honors `RUST_LOG` and defaults to errors only.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses.
///
/// # Errors
///
/// Fails with `description` when the condition never held.
pub async fn wait_until<F, Fut>(timeout: Duration, description: &str, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {description}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
