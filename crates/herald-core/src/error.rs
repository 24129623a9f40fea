//! Error types surfaced by transports.
//!
//! Transport failures are the only errors that cross the boundary between a
//! broker adapter and the delivery core. They propagate to the producer's
//! caller and are never retried by the core itself.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Publish, consume and connectivity failures reported by a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The broker connection is unavailable.
    #[error("transport connection failed: {message}")]
    Connection {
        /// Error message describing the connection failure
        message: String,
    },

    /// The broker refused or failed to accept a publish.
    #[error("publish to {topic} failed: {message}")]
    Publish {
        /// Topic the message was published to
        topic: String,
        /// Error message describing the publish failure
        message: String,
    },

    /// A message envelope could not be encoded or decoded.
    #[error("envelope serialization failed: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// A due-store or lock operation failed.
    #[error("due-store operation failed: {message}")]
    Store {
        /// Error message describing the store failure
        message: String,
    },
}

impl TransportError {
    /// Creates a connection error from a message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a publish error for a topic.
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish { topic: topic.into(), message: message.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a due-store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
