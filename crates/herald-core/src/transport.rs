//! Contracts implemented by broker adapters.
//!
//! The delivery core never talks to a broker directly. Each adapter (Redis
//! streams and sorted sets, AMQP, a managed queue) implements the traits in
//! this module and the core drives them.

use async_trait::async_trait;

use crate::{error::TransportResult, models::Message};

/// Publish side of a broker adapter.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Publishes a message for immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`](crate::TransportError) when the broker
    /// does not accept the message. The error is surfaced to the producer.
    async fn publish(&self, message: Message) -> TransportResult<()>;

    /// Publishes a message into the transport's due-store so it becomes
    /// deliverable `delay_seconds` from now.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`](crate::TransportError) when the due-store
    /// write fails.
    async fn publish_delayed(&self, message: Message, delay_seconds: u64) -> TransportResult<()>;
}

/// Side-effect-free connectivity check with bounded latency.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + std::fmt::Debug {
    /// Returns `Ok(true)` when the broker is reachable.
    ///
    /// # Errors
    ///
    /// Probe errors are treated exactly like `Ok(false)` by callers.
    async fn test_connection(&self) -> TransportResult<bool>;
}

/// Lifecycle hooks of a consuming listener.
///
/// A container owns the broker-side subscription of one or more triggers.
/// Registering starts consumption; destroying tears the subscription down.
#[async_trait]
pub trait ListenerContainer: Send + Sync + std::fmt::Debug {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Starts consuming.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker subscription cannot be created.
    async fn register(&self) -> TransportResult<()>;

    /// Stops consuming and releases broker-side resources.
    ///
    /// # Errors
    ///
    /// Returns an error when teardown fails.
    async fn destroy(&self) -> TransportResult<()>;

    /// Whether the container is currently consuming.
    fn is_active(&self) -> bool;
}
