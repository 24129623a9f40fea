//! Retry policy and the per-delivery acknowledgement state machine.
//!
//! ```text
//!  Pending ──▶ Delivering ──▶ Acked
//!                 │  ▲
//!                 ▼  │
//!               Failed ──▶ RetryScheduled
//!                 │
//!                 ▼
//!             Exhausted
//! ```
//!
//! A [`DeliveryAttempt`] lives from the first dispatch of a message to one
//! handler until it reaches `Acked` or `Exhausted`. The attempt is the only
//! place that mutates a message's delivery counters.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{AttemptContext, Message, RequestId};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Retry configuration applied to consumer failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum consumer failures before a message is exhausted. The handler
    /// is invoked at most this many times per message.
    pub max_retries: u32,

    /// Base backoff between a failure and the redelivery.
    pub base_delay: Duration,

    /// Upper bound for any computed backoff.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) applied to the backoff.
    pub jitter_factor: f64,

    /// Strategy for growing the backoff across retries.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_RETRY_MAX_COUNT,
            base_delay: Duration::from_secs(crate::DEFAULT_RETRY_BACKOFF_SECONDS),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay grows by the base amount with every retry.
    Linear,
    /// Delay doubles with every retry.
    Exponential,
}

/// Outcome of applying the policy to a failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver after the delay.
    Retry {
        /// Backoff before the redelivery
        delay: Duration,
    },
    /// Stop retrying.
    Exhaust,
}

impl RetryPolicy {
    /// Decides what follows the `fail_retry_count`-th consumer failure.
    pub fn decide(&self, fail_retry_count: u32) -> RetryDecision {
        if fail_retry_count >= self.max_retries {
            RetryDecision::Exhaust
        } else {
            RetryDecision::Retry { delay: self.backoff_for(fail_retry_count) }
        }
    }

    /// Backoff before the redelivery following the `retry_number`-th failure
    /// (1-based).
    pub fn backoff_for(&self, retry_number: u32) -> Duration {
        let retry_number = retry_number.max(1);
        let base_delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry_number),
            BackoffStrategy::Exponential => {
                let exponent = (retry_number - 1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped_delay = base_delay.min(self.max_delay);
        apply_jitter(capped_delay, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor` so retries of many messages that
/// failed together do not redeliver at the same instant.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}

/// State of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Created, not yet dispatched to the handler.
    Pending,
    /// Handler invocation in progress.
    Delivering,
    /// Handler acknowledged, or an interceptor completed handling.
    Acked,
    /// Handler failed; the policy has not been applied yet.
    Failed,
    /// Waiting for the backoff before redelivery.
    RetryScheduled,
    /// Retries used up; the fail-callback owns the message.
    Exhausted,
}

impl AttemptState {
    /// Whether the state ends the attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Exhausted)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::RetryScheduled, Self::Delivering)
                | (Self::Delivering, Self::Acked | Self::Failed)
                | (Self::Failed, Self::RetryScheduled | Self::Exhausted)
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Delivering => "delivering",
            Self::Acked => "acked",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Action the engine applies once an attempt settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Nothing further; the message is done.
    Ack,
    /// Redeliver after the backoff.
    Retry {
        /// Backoff before the redelivery
        delay: Duration,
    },
    /// Invoke the fail-callback and drop the message.
    Exhaust,
}

/// Delivery of one message to one handler, across all of its retries.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    request_id: RequestId,
    handler_id: String,
    started_at: DateTime<Utc>,
    state: AttemptState,
    next_action: Option<NextAction>,
}

impl DeliveryAttempt {
    /// Creates a pending attempt of `message` for `handler_id`.
    pub fn new(message: &Message, handler_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            request_id: message.request_id.clone(),
            handler_id: handler_id.into(),
            started_at,
            state: AttemptState::Pending,
            next_action: None,
        }
    }

    /// Moves to `Delivering`.
    ///
    /// Redeliveries (after an in-process retry, or a retry that came back
    /// through a delay store) increment `deliver_count`; the first attempt
    /// keeps the initial count of 1.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidTransition`] unless the attempt is
    /// `Pending` or `RetryScheduled`.
    pub fn begin(&mut self, message: &mut Message, now: DateTime<Utc>) -> Result<()> {
        let redelivery = self.state == AttemptState::RetryScheduled
            || (self.state == AttemptState::Pending && message.is_retry);
        self.transition(AttemptState::Delivering)?;

        if redelivery {
            message.deliver_count = message.deliver_count.saturating_add(1);
        }
        self.started_at = now;
        self.next_action = None;
        Ok(())
    }

    /// Records a successful handler outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidTransition`] unless delivering.
    pub fn acknowledge(&mut self) -> Result<NextAction> {
        self.transition(AttemptState::Acked)?;
        self.next_action = Some(NextAction::Ack);
        Ok(NextAction::Ack)
    }

    /// Records a handler failure and applies the retry policy.
    ///
    /// Increments `fail_retry_count`; a scheduled retry marks the message as
    /// a retry.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidTransition`] unless delivering.
    pub fn fail(&mut self, message: &mut Message, policy: &RetryPolicy) -> Result<NextAction> {
        self.transition(AttemptState::Failed)?;
        message.fail_retry_count = message.fail_retry_count.saturating_add(1);

        let action = match policy.decide(message.fail_retry_count) {
            RetryDecision::Retry { delay } => {
                self.transition(AttemptState::RetryScheduled)?;
                message.is_retry = true;
                NextAction::Retry { delay }
            },
            RetryDecision::Exhaust => {
                self.transition(AttemptState::Exhausted)?;
                NextAction::Exhaust
            },
        };
        self.next_action = Some(action);
        Ok(action)
    }

    /// Current state.
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Action computed by the last settle, if any.
    pub fn next_action(&self) -> Option<NextAction> {
        self.next_action
    }

    /// Handler identity the attempt targets.
    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Request id of the message.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// When the current delivery started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Event context describing the attempt for `message`.
    pub fn context(&self, message: &Message) -> AttemptContext {
        AttemptContext {
            request_id: self.request_id.clone(),
            topic: message.topic.clone(),
            handler_id: self.handler_id.clone(),
            deliver_count: message.deliver_count,
            is_retry: message.is_retry,
            started_at: self.started_at,
        }
    }

    fn transition(&mut self, to: AttemptState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(DeliveryError::InvalidTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }
}
