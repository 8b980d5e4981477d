//! # Event Bus
//!
//! Priority message bus with a periodic drain loop, request/response
//! correlation, broadcast channels and write-through persistence.
//!
//! Messages land in one FIFO per [`Priority`]. Each drain pass empties the
//! CRITICAL and HIGH queues and then delivers at most one message from each
//! of NORMAL, LOW and DEFERRED, so a flood of high-priority traffic cannot
//! starve the lower levels for more than one pass. A CRITICAL publish drains
//! synchronously before `publish` returns when no other drain is running.
//! Otherwise the running drain (on this thread, when the publisher is a
//! handler, or on another thread) delivers it before finishing, and the
//! publisher never waits on that drain.
//!
//! Handlers are synchronous and isolated: an error or panic in one subscriber
//! never prevents delivery to the next. Failures are reported on the bus as a
//! HIGH [`MessageType::ErrorOccurred`] message; failures of `ErrorOccurred`
//! handlers are only logged.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::error::BusError;
use super::history::{HistoryFilter, MessageHistory};
use super::message::{
    generate_message_id, persistence_key, Message, MessageType, PersistedMessageRecord, Priority,
};
use super::queue::PriorityQueues;
use super::registry::{BroadcastCallback, Handler, Registry, SubscriptionTarget};
use super::request::{PendingGuard, PendingRequests};
use crate::config::BusConfig;
use crate::error::{isolate, HandlerError, HandlerResult};
use crate::store::{SetOptions, Store};

/// Store namespace holding in-flight messages
pub const PENDING_NAMESPACE: &str = "pending_messages";

thread_local! {
    // Buses this thread is currently draining, by address
    static DRAINING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct DrainMark(usize);

impl DrainMark {
    fn enter(key: usize) -> Self {
        DRAINING.with(|d| d.borrow_mut().push(key));
        Self(key)
    }

    fn is_draining(key: usize) -> bool {
        DRAINING.with(|d| d.borrow().contains(&key))
    }
}

impl Drop for DrainMark {
    fn drop(&mut self) {
        DRAINING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|k| *k == self.0) {
                d.remove(pos);
            }
        });
    }
}

/// Options for [`EventBus::publish`]
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    /// Write the message through to the store; `None` uses the bus default
    pub persist: Option<bool>,
}

impl PublishOptions {
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            persist: None,
        }
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = Some(persist);
        self
    }
}

/// Options for [`EventBus::request`]
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Deadline for the response; `None` uses the bus default
    pub timeout: Option<Duration>,
    pub priority: Priority,
    pub persist: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            priority: Priority::High,
            persist: false,
        }
    }
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Handle for one registration made by `subscribe`, `subscribe_to_all` or
/// `subscribe_broadcast`.
///
/// Dropping the token does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    target: SubscriptionTarget,
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &SubscriptionTarget {
        &self.target
    }

    /// Remove exactly this registration. Returns false if it was already
    /// removed or the bus is gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.registry.write().remove(&self.target, self.id),
            None => false,
        }
    }
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub processed: u64,
    pub failed_deliveries: u64,
    /// Messages replayed from the store at construction
    pub recovered: usize,
    pub queued: BTreeMap<Priority, usize>,
    pub total_queued: usize,
    pub pending_requests: usize,
    pub subscriptions: usize,
    pub wildcard_subscriptions: usize,
    pub broadcast_channels: usize,
    pub history_len: usize,
    pub running: bool,
    pub durable: bool,
}

struct BusInner {
    config: BusConfig,
    store: Option<Store>,
    queues: Mutex<PriorityQueues>,
    registry: RwLock<Registry>,
    pending: PendingRequests,
    history: Mutex<MessageHistory>,
    drain_gate: Mutex<()>,
    critical_pending: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    next_subscription: AtomicU64,
    published: AtomicU64,
    processed: AtomicU64,
    failed_deliveries: AtomicU64,
    recovered: AtomicUsize,
    shut_down: AtomicBool,
}

/// Priority message bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("queued", &self.inner.queues.lock().total())
            .field("pending_requests", &self.inner.pending.len())
            .field("durable", &self.inner.store.is_some())
            .finish()
    }
}

impl EventBus {
    /// Create a bus and replay any unprocessed messages found in `store`
    pub fn new(config: BusConfig, store: Option<Store>) -> Result<Self, BusError> {
        let bus = Self {
            inner: Arc::new(BusInner::new(config, store)),
        };
        bus.inner.recover()?;
        Ok(bus)
    }

    /// Bus with no persistence at all
    pub fn in_memory(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner::new(config, None)),
        }
    }

    /// Queue a message. Returns its id.
    pub fn publish(
        &self,
        kind: impl Into<MessageType>,
        payload: impl Serialize,
        options: PublishOptions,
    ) -> Result<String, BusError> {
        let message = Message::new(kind.into(), serde_json::to_value(payload)?, options.priority);
        let persist = options
            .persist
            .unwrap_or(self.inner.config.persist_by_default);
        self.inner.submit(message, persist)
    }

    /// Register `handler` for messages of `kind`
    pub fn subscribe<F>(&self, kind: impl Into<MessageType>, name: &str, handler: F) -> Subscription
    where
        F: Fn(&Message) -> HandlerResult<Option<Value>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        let id = self.inner.next_subscription_id();
        let handler: Handler = Arc::new(handler);
        self.inner
            .registry
            .write()
            .add_typed(id, kind.clone(), name, handler);
        tracing::debug!(kind = %kind, subscriber = name, "Subscribed");
        self.token(SubscriptionTarget::Type(kind), id)
    }

    /// Register a monitor that sees every delivered message.
    ///
    /// Values returned by wildcard handlers never answer requests.
    pub fn subscribe_to_all<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&Message) -> HandlerResult<Option<Value>> + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription_id();
        self.inner
            .registry
            .write()
            .add_wildcard(id, name, Arc::new(handler));
        tracing::debug!(subscriber = name, "Subscribed to all messages");
        self.token(SubscriptionTarget::All, id)
    }

    /// Remove every subscription of `name` to `kind`. Returns how many were removed.
    pub fn unsubscribe(&self, kind: impl Into<MessageType>, name: &str) -> usize {
        let kind = kind.into();
        let removed = self.inner.registry.write().remove_named(&kind, name);
        if removed > 0 {
            tracing::debug!(kind = %kind, subscriber = name, removed, "Unsubscribed");
        }
        removed
    }

    /// Publish a request and wait for the first response.
    ///
    /// Dropping the returned future before it completes removes the pending
    /// entry; a late response is then ignored.
    pub async fn request(
        &self,
        kind: impl Into<MessageType>,
        payload: impl Serialize,
        options: RequestOptions,
    ) -> Result<Value, BusError> {
        if self.inner.is_shut_down() {
            return Err(BusError::Shutdown);
        }

        let kind = kind.into();
        let request_id = format!("req_{}", generate_message_id());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.default_request_timeout());

        let mut rx = self.inner.pending.register(&request_id, kind.clone());
        let _guard = PendingGuard::new(&self.inner.pending, &request_id);

        let message = Message::new(kind, serde_json::to_value(payload)?, options.priority)
            .with_request(&request_id);
        self.inner.submit(message, options.persist)?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BusError::Shutdown),
            Err(_) => {
                if self.inner.pending.remove(&request_id).is_some() {
                    tracing::warn!(request_id = %request_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                    Err(BusError::Timeout {
                        request_id: request_id.clone(),
                        timeout,
                    })
                } else {
                    // A responder removed the entry first; its value is in flight
                    rx.await.unwrap_or(Err(BusError::Shutdown))
                }
            }
        }
    }

    /// Complete a pending request. `Err(reason)` rejects it.
    ///
    /// Returns false when no request with this id is pending (already
    /// answered, timed out or cancelled).
    pub fn respond(&self, request_id: &str, outcome: Result<Value, String>) -> bool {
        let completed = self.inner.pending.complete(request_id, outcome);
        if !completed {
            tracing::debug!(request_id, "Response for unknown or finished request ignored");
        }
        completed
    }

    /// Register a listener on a broadcast channel
    pub fn subscribe_broadcast<F>(&self, channel: &str, name: &str, callback: F) -> Subscription
    where
        F: Fn(&str, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription_id();
        let callback: BroadcastCallback = Arc::new(callback);
        self.inner
            .registry
            .write()
            .add_broadcast(id, channel, name, callback);
        self.token(SubscriptionTarget::Broadcast(channel.to_string()), id)
    }

    /// Deliver `payload` to every listener on `channel` right now, then queue
    /// a HIGH [`MessageType::Broadcast`] audit message.
    ///
    /// Returns the number of listeners that accepted the payload.
    pub fn broadcast(&self, channel: &str, payload: impl Serialize) -> Result<usize, BusError> {
        let payload = serde_json::to_value(payload)?;
        let listeners = self.inner.registry.read().broadcast_listeners(channel);

        let mut delivered = 0;
        for (name, callback) in listeners {
            match isolate(|| callback(channel, &payload)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(channel, listener = %name, "Broadcast listener failed: {}", e)
                }
            }
        }

        let audit = Message::new(
            MessageType::Broadcast,
            json!({ "channel": channel, "payload": payload, "delivered": delivered }),
            Priority::High,
        );
        self.inner.submit(audit, false)?;
        Ok(delivered)
    }

    /// Run one drain pass on the calling thread.
    ///
    /// Returns the number of messages delivered; 0 if another drain is in
    /// progress.
    pub fn drain(&self) -> usize {
        self.inner.drain_pass(false)
    }

    /// Start the periodic drain task. Must be called inside a Tokio runtime.
    /// Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut ticker = self.inner.ticker.lock();
        if ticker.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_shut_down() {
                    break;
                }
                inner.drain_pass(false);
            }
        }));

        tracing::info!(tick_ms = period.as_millis() as u64, "Event bus started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the drain task, deliver what is still queued and reject every
    /// pending request with [`BusError::Shutdown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
        }

        let mut flushed = 0;
        while !self.inner.queues.lock().is_empty() {
            let delivered = self.inner.drain_pass(true);
            if delivered == 0 {
                break;
            }
            flushed += delivered;
        }

        let rejected = self.inner.pending.reject_all();
        tracing::info!(flushed, rejected, "Event bus shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Delivered messages matching `filter`, oldest first
    pub fn get_history(&self, filter: &HistoryFilter) -> Vec<Message> {
        self.inner.history.lock().query(filter)
    }

    pub fn get_stats(&self) -> BusStats {
        let inner = &self.inner;
        let depths = inner.queues.lock().depths();
        let queued: BTreeMap<Priority, usize> = Priority::ALL
            .iter()
            .map(|p| (*p, depths[p.index()]))
            .collect();
        let registry = inner.registry.read();

        BusStats {
            published: inner.published.load(Ordering::Relaxed),
            processed: inner.processed.load(Ordering::Relaxed),
            failed_deliveries: inner.failed_deliveries.load(Ordering::Relaxed),
            recovered: inner.recovered.load(Ordering::Relaxed),
            total_queued: depths.iter().sum(),
            queued,
            pending_requests: inner.pending.len(),
            subscriptions: registry.typed_count(),
            wildcard_subscriptions: registry.wildcard_count(),
            broadcast_channels: registry.broadcast_channel_count(),
            history_len: inner.history.lock().len(),
            running: self.is_running(),
            durable: inner.store.is_some(),
        }
    }

    pub fn subscriber_count(&self, kind: impl Into<MessageType>) -> usize {
        self.inner.registry.read().subscriber_count(&kind.into())
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn queued(&self) -> usize {
        self.inner.queues.lock().total()
    }

    fn token(&self, target: SubscriptionTarget, id: u64) -> Subscription {
        Subscription {
            bus: Arc::downgrade(&self.inner),
            target,
            id,
        }
    }
}

impl BusInner {
    fn new(config: BusConfig, store: Option<Store>) -> Self {
        Self {
            history: Mutex::new(MessageHistory::new(config.max_history)),
            config,
            store,
            queues: Mutex::new(PriorityQueues::new()),
            registry: RwLock::new(Registry::default()),
            pending: PendingRequests::default(),
            drain_gate: Mutex::new(()),
            critical_pending: AtomicBool::new(false),
            ticker: Mutex::new(None),
            next_subscription: AtomicU64::new(1),
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed_deliveries: AtomicU64::new(0),
            recovered: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn next_subscription_id(&self) -> u64 {
        self.next_subscription.fetch_add(1, Ordering::Relaxed)
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    /// Reload unprocessed messages left in the store by a previous run
    fn recover(&self) -> Result<usize, BusError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut records = Vec::new();
        for entry in store.entries(PENDING_NAMESPACE)? {
            match serde_json::from_value::<PersistedMessageRecord>(entry.value) {
                Ok(record) if !record.processed => records.push(record),
                Ok(_) => {
                    store.delete(PENDING_NAMESPACE, &entry.key)?;
                }
                Err(e) => {
                    tracing::warn!(key = %entry.key, "Skipping unreadable persisted message: {}", e)
                }
            }
        }

        records.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });

        let count = records.len();
        {
            let mut queues = self.queues.lock();
            for record in records {
                queues.push(record.into_message());
            }
        }
        self.recovered.store(count, Ordering::Relaxed);

        if count > 0 {
            tracing::info!(count, "Replaying unprocessed messages from previous run");
        }
        Ok(count)
    }

    fn submit(&self, message: Message, persist: bool) -> Result<String, BusError> {
        if self.is_shut_down() {
            return Err(BusError::Shutdown);
        }
        self.enqueue(message, persist)
    }

    fn enqueue(&self, mut message: Message, persist: bool) -> Result<String, BusError> {
        if persist {
            if let Some(store) = &self.store {
                let key = persistence_key(&message.id);
                store.set(
                    PENDING_NAMESPACE,
                    &key,
                    &PersistedMessageRecord::from_message(&message),
                    SetOptions::default(),
                )?;
                message.persistence_key = Some(key);
            }
        }

        let id = message.id.clone();
        let priority = message.priority;
        tracing::trace!(message_id = %id, kind = %message.kind, %priority, "Message queued");

        self.queues.lock().push(message);
        self.published.fetch_add(1, Ordering::Relaxed);

        if priority == Priority::Critical {
            self.critical_pending.store(true, Ordering::SeqCst);
            self.drain_pass(false);
        }
        Ok(id)
    }

    /// One drain pass. `wait` blocks on a drain running on another thread
    /// instead of skipping; only shutdown waits. A drain already running on
    /// this thread is never re-entered.
    ///
    /// A CRITICAL publish that finds the gate held raises `critical_pending`
    /// and returns. The gate holder drains the CRITICAL queue before it lets
    /// go, and checks the flag once more after releasing so a publish racing
    /// the release is not stranded until the next tick.
    fn drain_pass(&self, wait: bool) -> usize {
        let key = self.address();
        if DrainMark::is_draining(key) {
            return 0;
        }

        let mut delivered = 0;
        let mut full_pass = true;
        loop {
            let gate = if wait {
                Some(self.drain_gate.lock())
            } else {
                self.drain_gate.try_lock()
            };
            let Some(gate) = gate else {
                return delivered;
            };
            let mark = DrainMark::enter(key);

            self.critical_pending.store(false, Ordering::SeqCst);
            if full_pass {
                delivered += self.deliver_levels();
                full_pass = false;
            } else {
                delivered += self.deliver_all(Priority::Critical);
            }
            while self.critical_pending.swap(false, Ordering::SeqCst) {
                delivered += self.deliver_all(Priority::Critical);
            }

            drop(mark);
            drop(gate);
            if !self.critical_pending.load(Ordering::SeqCst) {
                return delivered;
            }
        }
    }

    /// CRITICAL and HIGH in full, then one message from each lower level
    fn deliver_levels(&self) -> usize {
        let mut delivered = 0;
        for priority in Priority::ALL {
            if priority.drains_fully() {
                delivered += self.deliver_all(priority);
            } else if let Some(message) = self.pop(priority) {
                self.dispatch(message);
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver_all(&self, priority: Priority) -> usize {
        let mut delivered = 0;
        while let Some(message) = self.pop(priority) {
            self.dispatch(message);
            delivered += 1;
        }
        delivered
    }

    fn pop(&self, priority: Priority) -> Option<Message> {
        self.queues.lock().pop(priority)
    }

    fn dispatch(&self, message: Message) {
        let deliveries = self.registry.read().deliveries(&message.kind);
        self.history.lock().record(message.clone());

        for delivery in deliveries {
            match isolate(|| (delivery.handler)(&message)) {
                Ok(Some(value)) if !value.is_null() && !delivery.wildcard => {
                    if let Some(request_id) = &message.request_id {
                        self.pending.complete(request_id, Ok(value));
                    }
                }
                Ok(_) => {}
                Err(err) => self.report_failure(&message, &delivery.subscriber, err),
            }
        }

        if let (Some(store), Some(key)) = (&self.store, &message.persistence_key) {
            if let Err(e) = store.delete(PENDING_NAMESPACE, key) {
                tracing::error!(message_id = %message.id, "Failed to clear persisted message: {}", e);
            }
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn report_failure(&self, message: &Message, subscriber: &str, err: HandlerError) {
        self.failed_deliveries.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            message_id = %message.id,
            kind = %message.kind,
            subscriber,
            "Subscriber handler failed: {}",
            err
        );

        if let Some(request_id) = &message.request_id {
            self.pending.complete(request_id, Err(err.to_string()));
        }

        if message.kind == MessageType::ErrorOccurred {
            tracing::error!(subscriber, "Error handler failed; not reporting again");
            return;
        }

        let report = Message::new(
            MessageType::ErrorOccurred,
            json!({
                "originalId": message.id,
                "originalType": message.kind,
                "subscriber": subscriber,
                "error": err.to_string(),
            }),
            Priority::High,
        );
        if let Err(e) = self.enqueue(report, self.config.persist_by_default) {
            tracing::error!("Failed to queue error report: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as TestMutex;

    fn bus() -> EventBus {
        EventBus::in_memory(BusConfig::default())
    }

    fn recorder(bus: &EventBus, kind: &str, name: &str) -> Arc<TestMutex<Vec<Value>>> {
        let seen = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(kind, name, move |m| {
            sink.lock().push(m.payload.clone());
            Ok(None)
        });
        seen
    }

    #[test]
    fn test_drain_order_by_priority() {
        let bus = bus();
        let order = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        bus.subscribe("JOB", "worker", move |m| {
            sink.lock().push(m.payload["n"].as_str().unwrap_or_default().to_string());
            Ok(None)
        });

        for (n, priority) in [
            ("deferred", Priority::Deferred),
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("normal-2", Priority::Normal),
            ("high-1", Priority::High),
            ("high-2", Priority::High),
        ] {
            bus.publish("JOB", json!({ "n": n }), PublishOptions::priority(priority))
                .unwrap();
        }

        assert_eq!(bus.drain(), 5);
        assert_eq!(
            *order.lock(),
            vec!["high-1", "high-2", "normal-1", "low", "deferred"]
        );

        assert_eq!(bus.drain(), 1);
        assert_eq!(order.lock().last().map(String::as_str), Some("normal-2"));
        assert_eq!(bus.queued(), 0);
    }

    #[test]
    fn test_critical_delivers_before_publish_returns() {
        let bus = bus();
        let seen = recorder(&bus, "ALARM", "pager");

        bus.publish("ALARM", json!("fire"), PublishOptions::priority(Priority::Critical))
            .unwrap();
        assert_eq!(*seen.lock(), vec![json!("fire")]);
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let bus = bus();
        bus.subscribe("JOB", "broken", |_| Err("cannot handle".into()));
        bus.subscribe("JOB", "panicky", |_| panic!("boom"));
        let seen = recorder(&bus, "JOB", "healthy");
        let errors = recorder(&bus, "ERROR_OCCURRED", "monitor");

        bus.publish("JOB", json!(1), PublishOptions::default()).unwrap();
        bus.drain();
        assert_eq!(*seen.lock(), vec![json!(1)]);

        // Reports were queued at HIGH after the HIGH level was already drained
        bus.drain();
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["subscriber"], json!("broken"));
        assert_eq!(errors[0]["error"], json!("cannot handle"));
        assert_eq!(errors[1]["subscriber"], json!("panicky"));
        assert_eq!(bus.get_stats().failed_deliveries, 2);
    }

    #[test]
    fn test_failing_error_handler_is_not_reported_again() {
        let bus = bus();
        bus.subscribe("JOB", "broken", |_| Err("first failure".into()));
        bus.subscribe(MessageType::ErrorOccurred, "also-broken", |_| {
            Err("second failure".into())
        });

        bus.publish("JOB", json!(null), PublishOptions::default()).unwrap();
        for _ in 0..5 {
            bus.drain();
        }

        let reports = bus.get_history(&HistoryFilter::kind(MessageType::ErrorOccurred));
        assert_eq!(reports.len(), 1);
        assert_eq!(bus.queued(), 0);
    }

    #[test]
    fn test_drain_is_not_reentrant() {
        let bus = bus();
        let nested = Arc::new(TestMutex::new(None));
        let handle = bus.clone();
        let slot = Arc::clone(&nested);
        bus.subscribe("OUTER", "reentrant", move |_| {
            handle.publish("INNER", json!(null), PublishOptions::default())?;
            *slot.lock() = Some(handle.drain());
            Ok(None)
        });
        // A CRITICAL publish from inside a handler is delivered when the
        // running pass finishes, never by a nested pass
        let handle = bus.clone();
        bus.subscribe("INNER", "escalate", move |_| {
            handle.publish("URGENT", json!(null), PublishOptions::priority(Priority::Critical))?;
            Ok(None)
        });
        let urgent = recorder(&bus, "URGENT", "pager");

        bus.publish("OUTER", json!(null), PublishOptions::default()).unwrap();
        assert_eq!(bus.drain(), 1);
        assert_eq!(*nested.lock(), Some(0));
        assert_eq!(bus.queued(), 1);

        assert_eq!(bus.drain(), 2);
        assert_eq!(urgent.lock().len(), 1);
        assert_eq!(bus.queued(), 0);
    }

    #[test]
    fn test_subscription_token_removes_only_its_registration() {
        let bus = bus();
        let first = bus.subscribe("JOB", "worker", |_| Ok(None));
        bus.subscribe("JOB", "worker", |_| Ok(None));
        assert_eq!(bus.subscriber_count("JOB"), 2);

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert_eq!(bus.subscriber_count("JOB"), 1);

        assert_eq!(bus.unsubscribe("JOB", "worker"), 1);
        assert_eq!(bus.subscriber_count("JOB"), 0);
    }

    #[test]
    fn test_unsubscribed_handler_stops_receiving() {
        let bus = bus();
        let dropped = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        let token = bus.subscribe("JOB", "leaving", move |m| {
            sink.lock().push(m.payload.clone());
            Ok(None)
        });
        let kept = recorder(&bus, "JOB", "staying");

        bus.publish("JOB", json!(1), PublishOptions::default()).unwrap();
        bus.drain();
        assert_eq!(*dropped.lock(), vec![json!(1)]);

        assert!(token.unsubscribe());
        bus.publish("JOB", json!(2), PublishOptions::default()).unwrap();
        bus.drain();
        assert_eq!(*dropped.lock(), vec![json!(1)]);
        assert_eq!(*kept.lock(), vec![json!(1), json!(2)]);

        // Removal by (type, name) pair
        let audited = recorder(&bus, "JOB", "auditor");
        assert_eq!(bus.unsubscribe("JOB", "auditor"), 1);
        bus.publish("JOB", json!(3), PublishOptions::default()).unwrap();
        bus.drain();
        assert!(audited.lock().is_empty());
        assert_eq!(*kept.lock(), vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_wildcard_sees_everything() {
        let bus = bus();
        let all = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&all);
        let monitor = bus.subscribe_to_all("audit", move |m| {
            sink.lock().push(m.kind.clone());
            Ok(None)
        });

        bus.publish(MessageType::AgentStarted, json!({}), PublishOptions::default())
            .unwrap();
        bus.publish("CUSTOM_EVENT", json!({}), PublishOptions::default())
            .unwrap();
        bus.drain();
        bus.drain();

        assert_eq!(
            *all.lock(),
            vec![MessageType::AgentStarted, MessageType::custom("CUSTOM_EVENT")]
        );
        assert!(monitor.unsubscribe());
        assert_eq!(bus.get_stats().wildcard_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_request_answered_by_handler_return() {
        let bus = bus();
        bus.subscribe("PING", "ponger", |m| Ok(Some(json!({ "echo": m.payload }))));
        bus.start();

        let reply = bus
            .request("PING", json!("hi"), RequestOptions::timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "echo": "hi" }));
        assert_eq!(bus.pending_request_count(), 0);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_request_answered_by_explicit_respond() {
        let bus = bus();
        let handle = bus.clone();
        bus.subscribe("LOOKUP", "directory", move |m| {
            let request_id = m.request_id.clone().unwrap_or_default();
            handle.respond(&request_id, Ok(json!(42)));
            Ok(None)
        });

        // CRITICAL requests are serviced inside publish
        let reply = bus
            .request(
                "LOOKUP",
                json!({}),
                RequestOptions::timeout(Duration::from_secs(1)).with_priority(Priority::Critical),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!(42));
    }

    #[tokio::test]
    async fn test_request_rejected_when_handler_fails() {
        let bus = bus();
        bus.subscribe("PING", "broken", |_| Err("no route".into()));
        bus.start();

        let err = bus
            .request("PING", json!(null), RequestOptions::timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        match err {
            BusError::Rejected { reason, .. } => assert_eq!(reason, "no route"),
            other => panic!("unexpected error: {:?}", other),
        }
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_request_times_out_and_late_response_is_ignored() {
        let bus = bus();
        let captured = Arc::new(TestMutex::new(None));
        let slot = Arc::clone(&captured);
        bus.subscribe("SLOW", "sleeper", move |m| {
            *slot.lock() = m.request_id.clone();
            Ok(None)
        });
        bus.start();

        let err = bus
            .request("SLOW", json!(null), RequestOptions::timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(bus.pending_request_count(), 0);

        let request_id = captured.lock().clone().unwrap();
        assert!(!bus.respond(&request_id, Ok(json!("too late"))));
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out_on_schedule() {
        let bus = bus();
        bus.start();

        let started = std::time::Instant::now();
        let err = bus
            .request("NOBODY", json!(null), RequestOptions::timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(100), "returned early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "returned late: {:?}", elapsed);
        assert_eq!(bus.pending_request_count(), 0);
        bus.shutdown();
    }

    #[tokio::test]
    async fn test_cancelled_request_leaves_no_pending_entry() {
        let bus = bus();
        let handle = bus.clone();
        let task = tokio::spawn(async move {
            handle
                .request("NOBODY", json!(null), RequestOptions::timeout(Duration::from_secs(30)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.pending_request_count(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(bus.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_requests() {
        let bus = bus();
        bus.start();
        let handle = bus.clone();
        let task = tokio::spawn(async move {
            handle
                .request("NOBODY", json!(null), RequestOptions::timeout(Duration::from_secs(30)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.shutdown();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, Err(BusError::Shutdown)));
        assert!(!bus.is_running());
        assert!(matches!(
            bus.publish("AFTER", json!(null), PublishOptions::default()),
            Err(BusError::Shutdown)
        ));
    }

    #[test]
    fn test_broadcast_delivers_and_audits() {
        let bus = bus();
        let heard = Arc::new(TestMutex::new(Vec::new()));
        let sink = Arc::clone(&heard);
        bus.subscribe_broadcast("status", "ui", move |channel, payload| {
            sink.lock().push((channel.to_string(), payload.clone()));
            Ok(())
        });
        bus.subscribe_broadcast("status", "flaky", |_, _| Err("offline".into()));
        bus.subscribe_broadcast("other", "elsewhere", |_, _| panic!("wrong channel"));

        let delivered = bus.broadcast("status", json!({ "phase": "build" })).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(
            *heard.lock(),
            vec![("status".to_string(), json!({ "phase": "build" }))]
        );

        bus.drain();
        let audit = bus.get_history(&HistoryFilter::kind(MessageType::Broadcast));
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].payload["channel"], json!("status"));
        assert_eq!(audit[0].payload["delivered"], json!(1));
    }

    #[test]
    fn test_persisted_message_survives_restart() {
        let store = Store::memory();

        let first = EventBus::new(BusConfig::default(), Some(store.clone())).unwrap();
        first
            .publish("TASK", json!({ "step": 1 }), PublishOptions::priority(Priority::Low))
            .unwrap();
        first
            .publish("TASK", json!({ "step": 0 }), PublishOptions::priority(Priority::High))
            .unwrap();
        first
            .publish("TASK", json!("volatile"), PublishOptions::default().persist(false))
            .unwrap();
        assert_eq!(store.count(PENDING_NAMESPACE).unwrap(), 2);
        drop(first);

        let second = EventBus::new(BusConfig::default(), Some(store.clone())).unwrap();
        assert_eq!(second.get_stats().recovered, 2);
        let seen = recorder(&second, "TASK", "worker");

        second.drain();
        assert_eq!(*seen.lock(), vec![json!({ "step": 0 }), json!({ "step": 1 })]);
        assert_eq!(store.count(PENDING_NAMESPACE).unwrap(), 0);
    }

    #[test]
    fn test_history_and_stats() {
        let bus = EventBus::in_memory(BusConfig {
            max_history: 2,
            ..BusConfig::default()
        });
        for n in 0..3 {
            bus.publish("TICK", json!(n), PublishOptions::priority(Priority::High))
                .unwrap();
        }
        bus.drain();

        let history = bus.get_history(&HistoryFilter::default());
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].payload, json!(2));

        let stats = bus.get_stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.total_queued, 0);
        assert_eq!(stats.queued[&Priority::High], 0);
        assert!(!stats.durable);
    }
}
