//! Message builders with deterministic defaults.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use herald_core::{Dispatch, Message, RequestId, Topic};

/// Builder for test messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    topic: Topic,
    body: Bytes,
    request_id: Option<RequestId>,
    dispatch: Dispatch,
    created_at: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    /// Timely message on `orders:created` with a JSON body.
    pub fn new() -> Self {
        Self {
            topic: Topic::new("orders", "created"),
            body: Bytes::from_static(br#"{"order_id":42}"#),
            request_id: None,
            dispatch: Dispatch::Timely,
            created_at: None,
        }
    }

    /// Sets the topic.
    #[must_use]
    pub fn topic(mut self, service_id: &str, code: &str) -> Self {
        self.topic = Topic::new(service_id, code);
        self
    }

    /// Sets the request id.
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Makes the message due `delay_seconds` after enqueue.
    #[must_use]
    pub fn delayed(mut self, delay_seconds: u64) -> Self {
        self.dispatch = Dispatch::Delayed { delay_seconds };
        self
    }

    /// Sets the enqueue time.
    #[must_use]
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Builds the message.
    pub fn build(self) -> Message {
        let mut message = Message::new(self.topic, self.body);
        message.dispatch = self.dispatch;
        if let Some(request_id) = self.request_id {
            message.request_id = request_id;
        }
        if let Some(created_at) = self.created_at {
            message.created_at = created_at;
        }
        message
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
