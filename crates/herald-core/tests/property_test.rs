//! Property-based tests for message envelope invariants.
//!
//! Covers the rules transports rely on when persisting messages: due times
//! never precede enqueue, lock digests separate distinct envelopes, and
//! decoding arbitrary bytes never panics.

#![allow(clippy::unwrap_used)] // Strategies only build valid envelopes

use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use herald_core::{Dispatch, Message, Topic};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

/// Deterministic property test configuration for CI stability.
fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn topic_strategy() -> impl Strategy<Value = Topic> {
    ("[a-z][a-z0-9-]{0,15}", "[a-z][a-z0-9_.]{0,15}")
        .prop_map(|(service, code)| Topic::new(service, code))
}

fn message_strategy() -> impl Strategy<Value = Message> {
    (
        topic_strategy(),
        prop::collection::vec(any::<u8>(), 0..256),
        prop::option::of(0u64..86_400),
        0i64..4_000_000_000,
        "[a-zA-Z0-9-]{1,36}",
    )
        .prop_map(|(topic, body, delay, created_secs, request_id)| {
            let created = DateTime::<Utc>::from_timestamp(created_secs, 0).unwrap();
            let message = match delay {
                Some(delay_seconds) => Message::delayed(topic, body, delay_seconds),
                None => Message::new(topic, body),
            };
            message.with_created_at(created).with_request_id(request_id)
        })
}

proptest! {
    #![proptest_config(proptest_config())]

    /// A message is never due before it was enqueued, and delayed messages
    /// are due exactly `delay_seconds` later.
    #[test]
    fn due_time_never_precedes_enqueue(message in message_strategy()) {
        prop_assert!(message.due_at() >= message.created_at);

        match message.dispatch {
            Dispatch::Timely => prop_assert_eq!(message.due_at(), message.created_at),
            Dispatch::Delayed { delay_seconds } => {
                let expected = message.created_at
                    + ChronoDuration::seconds(i64::try_from(delay_seconds).unwrap());
                prop_assert_eq!(message.due_at(), expected);
            },
        }
    }

    /// Distinct request ids produce distinct lock digests.
    #[test]
    fn digests_separate_distinct_envelopes(
        messages in prop::collection::vec(message_strategy(), 1..32)
    ) {
        let mut request_ids = HashSet::new();
        let mut digests = HashSet::new();

        for message in &messages {
            if !request_ids.insert(message.request_id.clone()) {
                continue;
            }
            let encoded = message.encode().unwrap();
            prop_assert!(digests.insert(Message::digest(&encoded)));
        }
    }

    /// Decoding arbitrary bytes returns an error instead of panicking.
    #[test]
    fn decode_arbitrary_bytes_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        if let Ok(message) = Message::decode(&bytes) {
            prop_assert!(message.deliver_count >= 1);
        }
    }
}
