//! Delivery outcome events.
//!
//! The delivery engine reports every attempt outcome as a [`DeliveryEvent`]
//! to an [`EventHandler`]. Audit persistence, metrics exporters and dead
//! letter tooling subscribe here instead of being wired into the engine.
//!
//! ```text
//!                 AttemptStarted/Acked/Failed/Exhausted
//! ┌────────────────┐          events           ┌────────────────────┐
//! │ DeliveryEngine │ ─────────────────────────▶│ MulticastHandler   │
//! └────────────────┘                           └────────────────────┘
//!                                                        │
//!                                         ┌──────────────┴─────────────┐
//!                                         ▼                            ▼
//!                                ┌─────────────────┐        ┌──────────────────┐
//!                                │ audit recorder  │        │ metrics exporter │
//!                                └─────────────────┘        └──────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{RequestId, Topic};

/// Events emitted by the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// A handler invocation is about to start.
    AttemptStarted(AttemptContext),

    /// The handler acknowledged the message, or an interceptor completed it.
    Acked {
        /// Attempt the acknowledgement belongs to.
        attempt: AttemptContext,
        /// Whether a before-interceptor completed handling.
        short_circuited: bool,
    },

    /// The handler failed and a retry was scheduled.
    RetryScheduled {
        /// Attempt that failed.
        attempt: AttemptContext,
        /// Handler error message.
        error_message: String,
        /// Backoff before the redelivery, in milliseconds.
        retry_in_ms: u64,
    },

    /// The handler failed for the last allowed time.
    Exhausted {
        /// Final attempt.
        attempt: AttemptContext,
        /// Last handler error message.
        error_message: String,
    },
}

impl DeliveryEvent {
    /// Returns the attempt context carried by any event variant.
    pub fn attempt(&self) -> &AttemptContext {
        match self {
            Self::AttemptStarted(attempt)
            | Self::Acked { attempt, .. }
            | Self::RetryScheduled { attempt, .. }
            | Self::Exhausted { attempt, .. } => attempt,
        }
    }
}

/// Identifies a single delivery attempt of a message to one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    /// Request id of the delivered message.
    pub request_id: RequestId,
    /// Topic of the delivered message.
    pub topic: Topic,
    /// Handler identity the message was delivered to.
    pub handler_id: String,
    /// Delivery attempt number (1-based).
    pub deliver_count: u32,
    /// Whether the attempt is a redelivery after a failure.
    pub is_retry: bool,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
}

/// Observer of delivery outcomes.
///
/// Implementations must not block delivery: failures are logged by the
/// implementation and never propagated back into the engine.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(deliveries).await;
    }
}
