//! Message envelope and topic primitives.
//!
//! Defines the strongly-typed values that flow from producers through the
//! transport into the delivery engine. A [`Message`] is immutable apart from
//! its delivery counters, which only the engine mutates between attempts.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};

/// Unique, producer-assigned identifier of a message.
///
/// Retries of a message keep the same request id; consumers use it to make
/// their processing idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generates a new random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Logical message stream, identified by owning service and message code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    /// Service that owns the stream.
    pub service_id: String,
    /// Message code within the service.
    pub code: String,
}

impl Topic {
    /// Creates a topic from its service id and code.
    pub fn new(service_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self { service_id: service_id.into(), code: code.into() }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.code)
    }
}

/// Dispatch metadata distinguishing timely from delayed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dispatch {
    /// Delivered as soon as a consumer is available.
    Timely,
    /// Held in the due-store until `delay_seconds` after enqueue.
    Delayed {
        /// Seconds from enqueue to the first due time.
        delay_seconds: u64,
    },
}

/// Message envelope delivered to consumers.
///
/// Counters follow the delivery lifecycle:
///
/// - `deliver_count` starts at 1 for the first attempt and grows by one for
///   every redelivery, so after `k` attempts it equals `k`.
/// - `fail_retry_count` counts consumer failures and never exceeds the
///   configured retry maximum.
/// - `polling_count` counts how often a delayed message was observed by the
///   delay poller before it was claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id shared by the original delivery and all of its retries.
    pub request_id: RequestId,
    /// Stream the message belongs to.
    pub topic: Topic,
    /// Opaque payload, serialized by the producer's codec.
    pub body: Bytes,
    /// Number of delivery attempts made, including the current one.
    pub deliver_count: u32,
    /// Number of times the delay poller observed the message before claiming.
    pub polling_count: u32,
    /// Number of consumer failures retried so far.
    pub fail_retry_count: u32,
    /// Set on every redelivery that follows a consumer failure.
    pub is_retry: bool,
    /// Timely or delayed dispatch metadata.
    pub dispatch: Dispatch,
    /// When the producer enqueued the message.
    pub created_at: DateTime<Utc>,
    /// Handler identity a retry is addressed to, if any.
    ///
    /// Retries routed through a shared delay store carry the identity of the
    /// consumer that failed so other consumers of the topic are not
    /// redelivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handler: Option<String>,
}

impl Message {
    /// Creates a timely message with a generated request id.
    pub fn new(topic: Topic, body: impl Into<Bytes>) -> Self {
        Self {
            request_id: RequestId::new(),
            topic,
            body: body.into(),
            deliver_count: 1,
            polling_count: 0,
            fail_retry_count: 0,
            is_retry: false,
            dispatch: Dispatch::Timely,
            created_at: Utc::now(),
            target_handler: None,
        }
    }

    /// Creates a message that becomes due `delay_seconds` after enqueue.
    pub fn delayed(topic: Topic, body: impl Into<Bytes>, delay_seconds: u64) -> Self {
        Self { dispatch: Dispatch::Delayed { delay_seconds }, ..Self::new(topic, body) }
    }

    /// Replaces the generated request id with a producer-assigned one.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Overrides the enqueue timestamp.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns `true` for messages carrying delayed dispatch metadata.
    pub fn is_delayed(&self) -> bool {
        matches!(self.dispatch, Dispatch::Delayed { .. })
    }

    /// Earliest time the message may be delivered.
    pub fn due_at(&self) -> DateTime<Utc> {
        match self.dispatch {
            Dispatch::Timely => self.created_at,
            Dispatch::Delayed { delay_seconds } => {
                i64::try_from(delay_seconds)
                    .ok()
                    .and_then(ChronoDuration::try_seconds)
                    .and_then(|delay| self.created_at.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            },
        }
    }

    /// Encodes the message into the default JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if the envelope cannot be
    /// encoded.
    pub fn encode(&self) -> TransportResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a message from the default JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] for malformed input or an
    /// envelope violating `deliver_count >= 1`.
    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        let message: Self = serde_json::from_slice(bytes)?;
        if message.deliver_count == 0 {
            return Err(TransportError::serialization("deliver_count must be at least 1"));
        }
        Ok(message)
    }

    /// Stable hex digest of an encoded envelope, used for lock keys.
    pub fn digest(encoded: &[u8]) -> String {
        hex::encode(Sha256::digest(encoded))
    }
}
