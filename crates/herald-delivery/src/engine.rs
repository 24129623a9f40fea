//! Delivery engine binding triggers, the retry state machine and the
//! grouped executor.
//!
//! ```text
//! ┌───────────┐ deliver/dispatch ┌────────────────┐  GTask   ┌─────────────────┐
//! │ Transport │ ────────────────▶│ DeliveryEngine │ ───────▶ │ GroupedExecutor │
//! └───────────┘                  └────────────────┘          └─────────────────┘
//!       ▲                               │ retry                       │
//!       │ publish_delayed               ▼                             ▼
//!       └──────────────── RetryRoute (timer or delay store)   interceptors ─▶ handler
//! ```
//!
//! Every handler is a group of the executor, keyed by its handler identity,
//! so a slow consumer only ever delays its own messages. Handler failures
//! never escape the engine: they move the attempt through the retry state
//! machine until it acknowledges or exhausts.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_core::{
    Clock, DeliveryEvent, EventHandler, Message, NoOpEventHandler, RealClock, RequestId, Topic,
    Transport,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, HandlerError, Result},
    executor::{ExecutorConfig, GTask, GroupedExecutor},
    retry::{DeliveryAttempt, NextAction, RetryPolicy},
};

/// Lower bound on the wait before re-offering a retry the executor refused.
const MIN_RESUBMIT_WAIT: Duration = Duration::from_millis(100);

/// Consumer callback invoked for each delivered message.
#[async_trait]
pub trait Handler: Send + Sync + std::fmt::Debug + 'static {
    /// Processes the message. Returning an error schedules a retry.
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError>;
}

/// Decision of a before-interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    /// Run the next interceptor, then the handler.
    Continue,
    /// Handling is complete; acknowledge without invoking the handler.
    ShortCircuit,
}

/// Hook around handler invocation. Interceptors run in registration order.
#[async_trait]
pub trait Interceptor: Send + Sync + std::fmt::Debug + 'static {
    /// Runs before the handler.
    async fn before(&self, _message: &Message) -> Interception {
        Interception::Continue
    }

    /// Runs after an acknowledged delivery, short-circuits included.
    async fn after(&self, _message: &Message) {}
}

/// Receives messages whose retries are exhausted.
#[async_trait]
pub trait FailCallback: Send + Sync + std::fmt::Debug + 'static {
    /// Called once per exhausted message with the last handler error.
    async fn on_exhausted(&self, message: &Message, error: &HandlerError);
}

/// Binding of a handler to a topic.
#[derive(Debug, Clone)]
pub struct Trigger {
    topic: Topic,
    handler_id: String,
    concurrency: usize,
    handler: Arc<dyn Handler>,
    fail_callback: Option<Arc<dyn FailCallback>>,
}

impl Trigger {
    /// Creates a trigger with the default consumer concurrency.
    pub fn new(topic: Topic, handler_id: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            topic,
            handler_id: handler_id.into(),
            concurrency: crate::DEFAULT_CONSUMER_COUNT,
            handler,
            fail_callback: None,
        }
    }

    /// Sets how many messages the handler processes at once. Zero is
    /// treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the callback invoked for exhausted messages.
    #[must_use]
    pub fn with_fail_callback(mut self, fail_callback: Arc<dyn FailCallback>) -> Self {
        self.fail_callback = Some(fail_callback);
        self
    }

    /// Topic the trigger consumes.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Stable handler identity, also the executor group key.
    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    /// Concurrency limit of the handler.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Topic to trigger mapping built before the engine starts.
#[derive(Debug, Clone, Default)]
pub struct TriggerRegistry {
    by_topic: HashMap<Topic, Vec<Arc<Trigger>>>,
    by_handler: HashMap<String, Arc<Trigger>>,
}

impl TriggerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a trigger.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the handler identity is already
    /// registered; handler identities key executor groups and retries.
    pub fn register(&mut self, trigger: Trigger) -> Result<Arc<Trigger>> {
        if self.by_handler.contains_key(trigger.handler_id()) {
            return Err(DeliveryError::configuration(format!(
                "handler {} registered twice",
                trigger.handler_id()
            )));
        }

        let trigger = Arc::new(trigger);
        self.by_handler.insert(trigger.handler_id.clone(), trigger.clone());
        self.by_topic.entry(trigger.topic.clone()).or_default().push(trigger.clone());
        Ok(trigger)
    }

    /// Triggers consuming `topic`, in registration order.
    pub fn triggers_for(&self, topic: &Topic) -> &[Arc<Trigger>] {
        self.by_topic.get(topic).map_or(&[], Vec::as_slice)
    }

    /// Trigger with the given handler identity.
    pub fn find(&self, handler_id: &str) -> Option<Arc<Trigger>> {
        self.by_handler.get(handler_id).cloned()
    }

    /// Number of registered triggers.
    pub fn len(&self) -> usize {
        self.by_handler.len()
    }

    /// Whether no trigger is registered.
    pub fn is_empty(&self) -> bool {
        self.by_handler.is_empty()
    }
}

/// Where retries wait out their backoff.
#[derive(Debug, Clone, Default)]
pub enum RetryRoute {
    /// Timer task on the engine's runtime. Pending retries are lost if the
    /// process stops.
    #[default]
    InProcess,
    /// Re-published into the transport's due-store and redelivered by the
    /// delay scheduler, addressed to the failing handler only.
    DelayStore(Arc<dyn Transport>),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry policy applied to handler failures.
    pub retry_policy: RetryPolicy,
    /// Where retries wait.
    pub retry_route: RetryRoute,
    /// Executor pool configuration.
    pub executor: ExecutorConfig,
    /// Maximum time `shutdown` waits for the executor to drain.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            retry_route: RetryRoute::InProcess,
            executor: ExecutorConfig::default(),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Deliveries accepted by `deliver`, retries excluded.
    pub dispatched: u64,
    /// Attempts acknowledged, short-circuits included.
    pub acked: u64,
    /// Attempts completed by a before-interceptor.
    pub short_circuited: u64,
    /// Handler invocations that failed.
    pub failed_attempts: u64,
    /// Retries handed to the retry route.
    pub retries_scheduled: u64,
    /// Messages whose retries ran out.
    pub exhausted: u64,
    /// In-process retries currently waiting on their timer.
    pub pending_retries: u64,
    /// Retry resubmissions turned away by a saturated executor and re-armed.
    pub deferred_retries: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    dispatched: AtomicU64,
    acked: AtomicU64,
    short_circuited: AtomicU64,
    failed_attempts: AtomicU64,
    retries_scheduled: AtomicU64,
    exhausted: AtomicU64,
    deferred_retries: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Builder for [`DeliveryEngine`].
#[derive(Debug)]
pub struct DeliveryEngineBuilder {
    config: EngineConfig,
    registry: TriggerRegistry,
    clock: Arc<dyn Clock>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    event_handler: Arc<dyn EventHandler>,
}

impl DeliveryEngineBuilder {
    /// Replaces the wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Appends an interceptor to the chain.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Sets the receiver of delivery events.
    #[must_use]
    pub fn event_handler(mut self, event_handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = event_handler;
        self
    }

    /// Starts the executor and returns the engine.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn build(self) -> DeliveryEngine {
        let executor = GroupedExecutor::new(self.config.executor.clone());
        info!(
            triggers = self.registry.len(),
            interceptors = self.interceptors.len(),
            max_retries = self.config.retry_policy.max_retries,
            retry_route = route_name(&self.config.retry_route),
            "delivery engine started"
        );

        DeliveryEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                registry: self.registry,
                executor,
                clock: self.clock,
                interceptors: self.interceptors,
                event_handler: self.event_handler,
                stats: StatsCounters::default(),
                retry_timers: CancellationToken::new(),
                pending_retries: Mutex::new(HashMap::new()),
                next_retry_id: AtomicU64::new(0),
            }),
        }
    }
}

/// Delivers messages to triggers with bounded retry.
///
/// Cloning is cheap; clones share the executor, registry and counters.
#[derive(Debug, Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    registry: TriggerRegistry,
    executor: GroupedExecutor,
    clock: Arc<dyn Clock>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    event_handler: Arc<dyn EventHandler>,
    stats: StatsCounters,
    retry_timers: CancellationToken,
    pending_retries: Mutex<HashMap<u64, RequestId>>,
    next_retry_id: AtomicU64,
}

impl DeliveryEngine {
    /// Starts building an engine over `registry`.
    pub fn builder(config: EngineConfig, registry: TriggerRegistry) -> DeliveryEngineBuilder {
        DeliveryEngineBuilder {
            config,
            registry,
            clock: Arc::new(RealClock::new()),
            interceptors: Vec::new(),
            event_handler: Arc::new(NoOpEventHandler::new()),
        }
    }

    /// Submits one delivery of `message` to `trigger`.
    ///
    /// Returns once the delivery is queued; the handler runs on the
    /// executor.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Rejected`] after shutdown started and
    /// [`DeliveryError::QueueFull`] when the executor is saturated.
    pub fn deliver(&self, message: Message, trigger: Arc<Trigger>) -> Result<()> {
        let attempt = DeliveryAttempt::new(&message, trigger.handler_id(), self.inner.clock.now_utc());
        self.inner.submit_attempt(message, trigger, attempt)?;
        StatsCounters::bump(&self.inner.stats.dispatched);
        Ok(())
    }

    /// Delivers `message` to every trigger of its topic, or only to its
    /// target handler when one is set. Returns the number of deliveries.
    ///
    /// Triggers are fed in registration order and fan-out stops at the first
    /// trigger that cannot be queued.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::UnknownHandler`] for a target handler that
    /// is not registered. A submission failure on the first trigger is
    /// returned as is; on a later trigger it is wrapped in
    /// [`DeliveryError::PartialDispatch`] carrying the number of triggers
    /// that already received the message.
    pub fn dispatch(&self, message: Message) -> Result<usize> {
        if let Some(handler_id) = message.target_handler.as_deref() {
            let trigger = self
                .inner
                .registry
                .find(handler_id)
                .ok_or_else(|| DeliveryError::UnknownHandler { handler_id: handler_id.to_string() })?;
            self.deliver(message, trigger)?;
            return Ok(1);
        }

        let triggers = self.inner.registry.triggers_for(&message.topic);
        if triggers.is_empty() {
            warn!(
                topic = %message.topic,
                request_id = %message.request_id,
                "no trigger registered for topic, dropping message"
            );
            return Ok(0);
        }

        for (delivered, trigger) in triggers.iter().enumerate() {
            if let Err(error) = self.deliver(message.clone(), trigger.clone()) {
                if delivered == 0 {
                    return Err(error);
                }
                return Err(DeliveryError::PartialDispatch { delivered, source: Box::new(error) });
            }
        }
        Ok(triggers.len())
    }

    /// Current counters.
    pub fn stats(&self) -> EngineStats {
        let stats = &self.inner.stats;
        EngineStats {
            dispatched: stats.dispatched.load(Ordering::Relaxed),
            acked: stats.acked.load(Ordering::Relaxed),
            short_circuited: stats.short_circuited.load(Ordering::Relaxed),
            failed_attempts: stats.failed_attempts.load(Ordering::Relaxed),
            retries_scheduled: stats.retries_scheduled.load(Ordering::Relaxed),
            exhausted: stats.exhausted.load(Ordering::Relaxed),
            pending_retries: self.inner.pending_retries().len() as u64,
            deferred_retries: stats.deferred_retries.load(Ordering::Relaxed),
        }
    }

    /// Whether the engine still accepts deliveries.
    pub fn is_accepting(&self) -> bool {
        self.inner.executor.is_accepting()
    }

    /// Registered triggers.
    pub fn registry(&self) -> &TriggerRegistry {
        &self.inner.registry
    }

    /// Executor running the handlers.
    pub fn executor(&self) -> &GroupedExecutor {
        &self.inner.executor
    }

    /// Cancels waiting in-process retries, then drains the executor within
    /// the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] when the drain times out.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down delivery engine");
        self.inner.retry_timers.cancel();

        let abandoned: Vec<RequestId> =
            self.inner.pending_retries().drain().map(|(_, request_id)| request_id).collect();
        for request_id in &abandoned {
            warn!(request_id = %request_id, "abandoning pending retry at shutdown");
        }

        self.inner.executor.shutdown(self.inner.config.shutdown_timeout).await?;
        info!(abandoned_retries = abandoned.len(), "delivery engine shut down");
        Ok(())
    }
}

impl EngineInner {
    fn pending_retries(&self) -> MutexGuard<'_, HashMap<u64, RequestId>> {
        self.pending_retries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn submit_attempt(
        self: &Arc<Self>,
        message: Message,
        trigger: Arc<Trigger>,
        attempt: DeliveryAttempt,
    ) -> Result<()> {
        let engine = Arc::clone(self);
        let group = trigger.handler_id().to_string();
        let concurrency = trigger.concurrency();
        self.executor
            .submit(GTask::new(group, concurrency, engine.run_attempt(message, trigger, attempt)))
    }

    async fn run_attempt(
        self: Arc<Self>,
        mut message: Message,
        trigger: Arc<Trigger>,
        mut attempt: DeliveryAttempt,
    ) {
        if let Err(error) = attempt.begin(&mut message, self.clock.now_utc()) {
            error!(request_id = %message.request_id, error = %error, "attempt could not start");
            return;
        }
        self.emit(DeliveryEvent::AttemptStarted(attempt.context(&message))).await;

        for interceptor in &self.interceptors {
            if interceptor.before(&message).await == Interception::ShortCircuit {
                debug!(
                    request_id = %message.request_id,
                    handler_id = trigger.handler_id(),
                    "interceptor completed handling"
                );
                StatsCounters::bump(&self.stats.short_circuited);
                self.acknowledge(&message, &mut attempt, true).await;
                return;
            }
        }

        match invoke_handler(&trigger, &message).await {
            Ok(()) => self.acknowledge(&message, &mut attempt, false).await,
            Err(handler_error) => self.handle_failure(message, trigger, attempt, handler_error).await,
        }
    }

    async fn acknowledge(&self, message: &Message, attempt: &mut DeliveryAttempt, short_circuited: bool) {
        if let Err(error) = attempt.acknowledge() {
            error!(request_id = %message.request_id, error = %error, "attempt could not acknowledge");
            return;
        }
        StatsCounters::bump(&self.stats.acked);

        for interceptor in &self.interceptors {
            interceptor.after(message).await;
        }

        debug!(
            request_id = %message.request_id,
            handler_id = attempt.handler_id(),
            deliver_count = message.deliver_count,
            "message acknowledged"
        );
        self.emit(DeliveryEvent::Acked { attempt: attempt.context(message), short_circuited }).await;
    }

    async fn handle_failure(
        self: Arc<Self>,
        mut message: Message,
        trigger: Arc<Trigger>,
        mut attempt: DeliveryAttempt,
        handler_error: HandlerError,
    ) {
        StatsCounters::bump(&self.stats.failed_attempts);

        let action = match attempt.fail(&mut message, &self.config.retry_policy) {
            Ok(action) => action,
            Err(error) => {
                error!(request_id = %message.request_id, error = %error, "attempt could not fail");
                return;
            },
        };

        match action {
            NextAction::Retry { delay } => {
                warn!(
                    request_id = %message.request_id,
                    handler_id = trigger.handler_id(),
                    fail_retry_count = message.fail_retry_count,
                    retry_in_ms = duration_ms(delay),
                    error = %handler_error,
                    "handler failed, retry scheduled"
                );
                self.emit(DeliveryEvent::RetryScheduled {
                    attempt: attempt.context(&message),
                    error_message: handler_error.message().to_string(),
                    retry_in_ms: duration_ms(delay),
                })
                .await;
                self.schedule_retry(message, trigger, attempt, delay).await;
            },
            NextAction::Exhaust => {
                StatsCounters::bump(&self.stats.exhausted);
                error!(
                    request_id = %message.request_id,
                    topic = %message.topic,
                    handler_id = trigger.handler_id(),
                    deliver_count = message.deliver_count,
                    error = %handler_error,
                    "retries exhausted, dropping message"
                );
                self.emit(DeliveryEvent::Exhausted {
                    attempt: attempt.context(&message),
                    error_message: handler_error.message().to_string(),
                })
                .await;

                if let Some(fail_callback) = &trigger.fail_callback {
                    fail_callback.on_exhausted(&message, &handler_error).await;
                }
            },
            NextAction::Ack => {},
        }
    }

    async fn schedule_retry(
        self: Arc<Self>,
        mut message: Message,
        trigger: Arc<Trigger>,
        attempt: DeliveryAttempt,
        delay: Duration,
    ) {
        StatsCounters::bump(&self.stats.retries_scheduled);

        if let RetryRoute::DelayStore(transport) = &self.config.retry_route {
            let mut retry = message.clone();
            retry.target_handler = Some(trigger.handler_id().to_string());
            let delay_seconds = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);

            match transport.publish_delayed(retry, delay_seconds).await {
                Ok(()) => return,
                Err(error) => warn!(
                    request_id = %message.request_id,
                    error = %error,
                    "delay store rejected retry, falling back to in-process timer"
                ),
            }
        }

        let retry_id = self.next_retry_id.fetch_add(1, Ordering::Relaxed);
        self.pending_retries().insert(retry_id, message.request_id.clone());
        message.target_handler = None;

        let engine = Arc::clone(&self);
        let token = self.retry_timers.clone();
        tokio::spawn(async move {
            let mut wait = delay;
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = engine.clock.sleep(wait) => {},
                }

                match engine.submit_attempt(message.clone(), trigger.clone(), attempt.clone()) {
                    Ok(()) => break,
                    Err(error) if error.is_shutdown() => {
                        warn!(request_id = %message.request_id, "retry dropped, engine is shutting down");
                        break;
                    },
                    Err(error) => {
                        // Still pending, so shutdown abandons it with a log.
                        StatsCounters::bump(&engine.stats.deferred_retries);
                        wait = engine
                            .config
                            .retry_policy
                            .backoff_for(message.fail_retry_count)
                            .max(MIN_RESUBMIT_WAIT);
                        warn!(
                            request_id = %message.request_id,
                            handler_id = trigger.handler_id(),
                            retry_in_ms = duration_ms(wait),
                            error = %error,
                            "executor refused retry, re-arming timer"
                        );
                    },
                }
            }
            engine.pending_retries().remove(&retry_id);
        });
    }

    async fn emit(&self, event: DeliveryEvent) {
        self.event_handler.handle_event(event).await;
    }
}

/// Runs the handler in its own task so a panic becomes a handler error.
async fn invoke_handler(trigger: &Trigger, message: &Message) -> std::result::Result<(), HandlerError> {
    let handler = trigger.handler.clone();
    let message = message.clone();

    match tokio::spawn(async move { handler.handle(&message).await }).await {
        Ok(outcome) => outcome,
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let reason = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlerError::new(format!("handler panicked: {reason}")))
        },
        Err(join_error) => Err(HandlerError::from_error(join_error)),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn route_name(route: &RetryRoute) -> &'static str {
    match route {
        RetryRoute::InProcess => "in_process",
        RetryRoute::DelayStore(_) => "delay_store",
    }
}
