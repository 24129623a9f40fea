#![no_main]

//! Fuzz target for message envelope decoding.
//!
//! Envelopes arrive from the broker and the due-store as raw bytes written
//! by other processes. Decoding must reject malformed input with an error,
//! and anything accepted must survive the due-time and lock-key paths the
//! delay poller runs on it.

use herald_core::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    fuzz_message_decode(data);
});

fn fuzz_message_decode(data: &[u8]) {
    let Ok(message) = Message::decode(data) else {
        return;
    };

    assert!(message.deliver_count >= 1);
    assert!(message.due_at() >= message.created_at);
    let _ = message.topic.to_string();

    let Ok(encoded) = message.encode() else {
        return;
    };
    let _ = Message::digest(&encoded);

    match Message::decode(&encoded) {
        Ok(decoded) => assert_eq!(decoded, message),
        Err(error) => panic!("re-encoded envelope rejected: {error}"),
    }
}
