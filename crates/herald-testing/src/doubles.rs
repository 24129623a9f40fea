//! Recording test doubles for the delivery collaborator traits.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_core::{
    ConnectivityProbe, DeliveryEvent, EventHandler, ListenerContainer, Message, RequestId,
    TransportError, TransportResult,
};
use herald_delivery::{FailCallback, Handler, HandlerError, Interception, Interceptor};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handler that acknowledges every message and records it.
///
/// Tracks how many invocations overlap so tests can assert concurrency
/// bounds.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<Message>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    processing_time: Duration,
}

impl RecordingHandler {
    /// Handler that returns immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that holds each message for `processing_time`.
    pub fn with_processing_time(processing_time: Duration) -> Self {
        Self { processing_time, ..Self::default() }
    }

    /// Number of invocations.
    pub fn calls(&self) -> usize {
        lock(&self.messages).len()
    }

    /// Delivered messages in invocation order.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }

    /// Highest number of overlapping invocations observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        lock(&self.messages).push(message.clone());

        if !self.processing_time.is_zero() {
            tokio::time::sleep(self.processing_time).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that fails a configurable number of times, then acknowledges.
#[derive(Debug)]
pub struct FailingHandler {
    failures: Option<usize>,
    messages: Mutex<Vec<Message>>,
}

impl FailingHandler {
    /// Handler that never succeeds.
    pub fn always() -> Self {
        Self { failures: None, messages: Mutex::new(Vec::new()) }
    }

    /// Handler that fails the first `failures` invocations.
    pub fn failing_times(failures: usize) -> Self {
        Self { failures: Some(failures), messages: Mutex::new(Vec::new()) }
    }

    /// Number of invocations.
    pub fn calls(&self) -> usize {
        lock(&self.messages).len()
    }

    /// Messages as seen by each invocation.
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl Handler for FailingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let invocation = {
            let mut messages = lock(&self.messages);
            messages.push(message.clone());
            messages.len()
        };

        match self.failures {
            Some(failures) if invocation > failures => Ok(()),
            _ => Err(HandlerError::new(format!("simulated failure #{invocation}"))),
        }
    }
}

/// Fail-callback recording exhausted messages and their last error.
#[derive(Debug, Default)]
pub struct RecordingFailCallback {
    exhausted: Mutex<Vec<(Message, HandlerError)>>,
}

impl RecordingFailCallback {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exhausted messages with their last handler error.
    pub fn exhausted(&self) -> Vec<(Message, HandlerError)> {
        lock(&self.exhausted).clone()
    }

    /// Number of callback invocations.
    pub fn calls(&self) -> usize {
        lock(&self.exhausted).len()
    }
}

#[async_trait]
impl FailCallback for RecordingFailCallback {
    async fn on_exhausted(&self, message: &Message, error: &HandlerError) {
        lock(&self.exhausted).push((message.clone(), error.clone()));
    }
}

/// Interceptor completing handling for selected request ids.
#[derive(Debug, Default)]
pub struct ShortCircuitInterceptor {
    request_ids: Vec<RequestId>,
    before_calls: AtomicUsize,
    after_calls: AtomicUsize,
}

impl ShortCircuitInterceptor {
    /// Short-circuits the given request ids and passes everything else.
    pub fn for_requests(request_ids: impl IntoIterator<Item = RequestId>) -> Self {
        Self { request_ids: request_ids.into_iter().collect(), ..Self::default() }
    }

    /// Number of `before` calls.
    pub fn before_calls(&self) -> usize {
        self.before_calls.load(Ordering::SeqCst)
    }

    /// Number of `after` calls.
    pub fn after_calls(&self) -> usize {
        self.after_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Interceptor for ShortCircuitInterceptor {
    async fn before(&self, message: &Message) -> Interception {
        self.before_calls.fetch_add(1, Ordering::SeqCst);
        if self.request_ids.contains(&message.request_id) {
            Interception::ShortCircuit
        } else {
            Interception::Continue
        }
    }

    async fn after(&self, _message: &Message) {
        self.after_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connectivity probe switched from the test body.
#[derive(Debug)]
pub struct ToggleProbe {
    connected: AtomicBool,
    erroring: AtomicBool,
    probes: AtomicUsize,
}

impl ToggleProbe {
    /// Probe reporting `connected`.
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            erroring: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        }
    }

    /// Switches the reported connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes probes return an error instead of a result.
    pub fn set_erroring(&self, erroring: bool) {
        self.erroring.store(erroring, Ordering::SeqCst);
    }

    /// Number of probes performed.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for ToggleProbe {
    async fn test_connection(&self) -> TransportResult<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.erroring.load(Ordering::SeqCst) {
            return Err(TransportError::connection("probe timed out"));
        }
        Ok(self.connected.load(Ordering::SeqCst))
    }
}

/// Listener container counting lifecycle calls.
#[derive(Debug)]
pub struct CountingContainer {
    name: String,
    active: AtomicBool,
    registrations: AtomicUsize,
    destructions: AtomicUsize,
    fail_registration: AtomicBool,
}

impl CountingContainer {
    /// Container that starts active, as after application startup.
    pub fn active(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active: AtomicBool::new(true),
            registrations: AtomicUsize::new(0),
            destructions: AtomicUsize::new(0),
            fail_registration: AtomicBool::new(false),
        }
    }

    /// Makes `register` fail until cleared.
    pub fn set_fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Successful registrations.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Successful destructions.
    pub fn destructions(&self) -> usize {
        self.destructions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListenerContainer for CountingContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register(&self) -> TransportResult<()> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(TransportError::connection("subscription refused"));
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> TransportResult<()> {
        self.destructions.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Event handler keeping every delivery event.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events in emission order.
    pub fn events(&self) -> Vec<DeliveryEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        lock(&self.events).push(event);
    }
}
