//! Property-based tests for retry policy and attempt state invariants.
//!
//! Drives the attempt state machine with arbitrary handler outcome sequences
//! and checks the counters a consumer observes: a handler never runs more
//! than the retry limit, and `deliver_count` always equals the number of
//! handler invocations.

use std::time::Duration;

use chrono::Utc;
use herald_core::{Message, Topic};
use herald_delivery::{
    retry::RetryDecision, AttemptState, BackoffStrategy, DeliveryAttempt, NextAction, RetryPolicy,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 128, failure_persistence: None, source_file: None, ..ProptestConfig::default() }
}

fn strategy_strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Fixed),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Exponential),
    ]
}

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..8, 0u64..120, 1u64..600, 0.0f64..1.0, strategy_strategy()).prop_map(
        |(max_retries, base_secs, max_secs, jitter_factor, backoff_strategy)| RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(max_secs),
            jitter_factor,
            backoff_strategy,
        },
    )
}

/// Runs one message through a handler whose outcomes follow `outcomes`
/// (`true` acknowledges). Returns the invocations and the final message.
fn drive(policy: &RetryPolicy, outcomes: &[bool]) -> (Vec<Message>, Message, AttemptState) {
    let mut message = Message::new(Topic::new("orders", "created"), "payload");
    let mut attempt = DeliveryAttempt::new(&message, "orders::audit", Utc::now());
    let mut seen = Vec::new();

    for &succeeds in outcomes.iter().chain(std::iter::repeat(&false)) {
        if attempt.begin(&mut message, Utc::now()).is_err() {
            break;
        }
        seen.push(message.clone());

        let action = if succeeds {
            attempt.acknowledge()
        } else {
            attempt.fail(&mut message, policy)
        };
        match action {
            Ok(NextAction::Retry { .. }) => continue,
            Ok(NextAction::Ack | NextAction::Exhaust) | Err(_) => break,
        }
    }

    (seen, message, attempt.state())
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn backoff_never_exceeds_max_delay(policy in policy_strategy(), retry_number in 0u32..64) {
        prop_assert!(policy.backoff_for(retry_number) <= policy.max_delay);
    }

    #[test]
    fn decision_exhausts_exactly_at_limit(policy in policy_strategy(), failures in 0u32..16) {
        let decision = policy.decide(failures);
        if failures >= policy.max_retries {
            prop_assert_eq!(decision, RetryDecision::Exhaust);
        } else {
            let is_retry = matches!(decision, RetryDecision::Retry { .. });
            prop_assert!(is_retry);
        }
    }

    #[test]
    fn fixed_backoff_without_jitter_is_constant(base_secs in 0u64..300, retry_number in 1u32..32) {
        let policy = RetryPolicy { base_delay: Duration::from_secs(base_secs), ..RetryPolicy::default() };
        prop_assert_eq!(policy.backoff_for(retry_number), Duration::from_secs(base_secs));
    }

    #[test]
    fn exponential_backoff_without_jitter_is_monotonic(base_secs in 1u64..30, retry_number in 1u32..16) {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(base_secs),
            backoff_strategy: BackoffStrategy::Exponential,
            ..RetryPolicy::default()
        };
        prop_assert!(policy.backoff_for(retry_number) <= policy.backoff_for(retry_number + 1));
    }

    #[test]
    fn handler_runs_at_most_max_retries(
        policy in policy_strategy(),
        outcomes in prop::collection::vec(any::<bool>(), 0..12),
    ) {
        let (seen, message, state) = drive(&policy, &outcomes);

        prop_assert!(!seen.is_empty());
        prop_assert!(seen.len() <= policy.max_retries as usize);
        prop_assert!(message.fail_retry_count <= policy.max_retries);
        prop_assert!(state.is_terminal());

        let counts: Vec<u32> = seen.iter().map(|m| m.deliver_count).collect();
        let expected: Vec<u32> = (1..=seen.len() as u32).collect();
        prop_assert_eq!(counts, expected);

        match state {
            AttemptState::Acked => prop_assert_eq!(message.fail_retry_count as usize, seen.len() - 1),
            AttemptState::Exhausted => prop_assert_eq!(message.fail_retry_count, policy.max_retries),
            other => prop_assert!(false, "unexpected terminal state {other}"),
        }
    }

    #[test]
    fn only_redeliveries_are_marked_retry(
        policy in policy_strategy(),
        outcomes in prop::collection::vec(any::<bool>(), 0..12),
    ) {
        let (seen, _, _) = drive(&policy, &outcomes);
        prop_assert!(!seen[0].is_retry);
        prop_assert!(seen.iter().skip(1).all(|m| m.is_retry));
    }
}
