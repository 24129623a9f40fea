//! Error types for delivery operations.
//!
//! Separates the errors that escape the delivery core (`Rejected`,
//! `QueueFull`, transport and configuration failures) from
//! [`HandlerError`], which consumers return and which the retry state
//! machine absorbs completely.

use std::{fmt, time::Duration};

use herald_core::TransportError;
use thiserror::Error;

use crate::retry::AttemptState;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors surfaced by the executor, engine, scheduler and configuration.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Task submitted after the executor stopped accepting work.
    #[error("task for group {group} rejected: executor is shut down")]
    Rejected {
        /// Group key of the rejected task
        group: String,
    },

    /// Executor admission bound reached.
    #[error("task for group {group} rejected: {capacity} tasks already outstanding")]
    QueueFull {
        /// Group key of the rejected task
        group: String,
        /// Configured maximum of outstanding tasks
        capacity: usize,
    },

    /// Executor shutdown did not drain before the timeout.
    #[error("shutdown timed out after {timeout:?} with {abandoned} tasks abandoned")]
    ShutdownTimeout {
        /// Drain timeout that elapsed
        timeout: Duration,
        /// Tasks still queued or running when the timeout elapsed
        abandoned: usize,
    },

    /// Delivery attempt state machine misuse.
    #[error("invalid attempt transition from {from} to {to}")]
    InvalidTransition {
        /// State the attempt was in
        from: AttemptState,
        /// State that was requested
        to: AttemptState,
    },

    /// No trigger is registered for the requested handler identity.
    #[error("no trigger registered for handler {handler_id}")]
    UnknownHandler {
        /// Handler identity that was not found
        handler_id: String,
    },

    /// Fan-out stopped after some triggers already received the message.
    #[error("dispatch stopped after {delivered} deliveries: {source}")]
    PartialDispatch {
        /// Deliveries queued before the failure
        delivered: usize,
        /// Failure of the first trigger that could not be queued
        source: Box<DeliveryError>,
    },

    /// Broker adapter failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration value.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a rejected-submission error.
    pub fn rejected(group: impl Into<String>) -> Self {
        Self::Rejected { group: group.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the error means the component is shutting down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.root_cause(), Self::Rejected { .. } | Self::ShutdownTimeout { .. })
    }

    /// Whether the executor turned work away, because it is saturated or
    /// shutting down. Such work can be offered again later.
    pub fn is_backpressure(&self) -> bool {
        matches!(self.root_cause(), Self::QueueFull { .. }) || self.is_shutdown()
    }

    /// Deliveries that were queued before a fan-out failed.
    pub fn delivered(&self) -> usize {
        match self {
            Self::PartialDispatch { delivered, .. } => *delivered,
            _ => 0,
        }
    }

    /// The underlying error of a partial dispatch, or `self`.
    pub fn root_cause(&self) -> &DeliveryError {
        match self {
            Self::PartialDispatch { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Failure reported by a consumer handler.
///
/// Any non-acknowledgement outcome, including a panic inside the handler,
/// becomes a `HandlerError` and drives the retry state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Wraps any displayable error.
    pub fn from_error(error: impl fmt::Display) -> Self {
        Self::new(error.to_string())
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed: {}", self.message)
    }
}

impl std::error::Error for HandlerError {}
