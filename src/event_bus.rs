/// Local change-event bus.
///
/// One bus exists per database instance. Every change event, whether it was
/// produced by a local write or received from another instance, is emitted
/// here and delivered synchronously to the registered subscribers.
///
/// Delivery rules:
///
/// - Subscribers are invoked in registration order over a snapshot of the
///   subscriber list, so subscribing or unsubscribing from inside a handler
///   never affects the event currently being delivered.
/// - An emit from inside a handler is queued and delivered after the current
///   event reached every subscriber.
/// - An emit from another thread waits for the running dispatch to drain,
///   then delivers its own event before returning.
/// - A panicking handler is logged and skipped; the remaining subscribers and
///   queued events are still served.
/// - Events whose origin token is this instance's token are handed to the
///   attached forwarder after local delivery. Forwarding never affects local
///   delivery.
///
/// # Example
///
/// ```ignore
/// use koru_reactive::event_bus::{ChangeEventBus, EventFilter};
///
/// let bus = ChangeEventBus::new("token");
/// let id = bus.subscribe(EventFilter::collection("users"), |event| {
///     println!("{} {}", event.operation(), event.document_id());
/// });
/// ```
use crate::change_event::{ChangeEvent, Operation};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;

/// Unique identifier for a bus subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Optional collection filter (None = all collections).
    pub collection: Option<String>,
    /// Optional document filter (None = all documents).
    pub document_id: Option<String>,
    /// Operation kinds to receive.
    pub operations: Vec<Operation>,
}

impl EventFilter {
    /// Match every event.
    pub fn all() -> Self {
        Self {
            collection: None,
            document_id: None,
            operations: Operation::ALL.to_vec(),
        }
    }

    /// Match events of one collection.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            ..Self::all()
        }
    }

    /// Match events of one document.
    pub fn document(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            document_id: Some(document_id.into()),
            ..Self::all()
        }
    }

    /// Restrict to specific operation kinds.
    pub fn with_operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = operations;
        self
    }

    /// Check if this filter matches an event.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.operations.contains(&event.operation()) {
            return false;
        }

        if let Some(ref collection) = self.collection {
            if event.collection_name() != Some(collection.as_str()) {
                return false;
            }
        }

        if let Some(ref document_id) = self.document_id {
            if event.document_id() != document_id {
                return false;
            }
        }

        true
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Callback invoked for every matching event.
pub type EventHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    handler: EventHandler,
}

/// Dispatch ownership. Only the owning thread may append to `pending`; every
/// other thread waits on `idle` until the owner is gone.
#[derive(Default)]
struct DispatchState {
    owner: Option<ThreadId>,
    pending: VecDeque<ChangeEvent>,
}

/// Releases dispatch ownership on every exit path and wakes waiting emitters.
struct DispatchGuard<'a> {
    state: &'a Mutex<DispatchState>,
    idle: &'a Condvar,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).owner = None;
        self.idle.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Multicast bus for change events of one database instance.
pub struct ChangeEventBus {
    local_token: String,
    subscribers: Mutex<Vec<Subscriber>>,
    dispatch: Mutex<DispatchState>,
    idle: Condvar,
    forwarder: Mutex<Option<mpsc::UnboundedSender<ChangeEvent>>>,
    next_id: AtomicU64,
    events_emitted: AtomicU64,
}

impl ChangeEventBus {
    /// Create a bus for the instance identified by `local_token`.
    pub fn new(local_token: impl Into<String>) -> Self {
        Self {
            local_token: local_token.into(),
            subscribers: Mutex::new(Vec::new()),
            dispatch: Mutex::new(DispatchState::default()),
            idle: Condvar::new(),
            forwarder: Mutex::new(None),
            next_id: AtomicU64::new(1),
            events_emitted: AtomicU64::new(0),
        }
    }

    /// Token of the owning instance.
    pub fn local_token(&self) -> &str {
        &self.local_token
    }

    /// Register a handler. Returns the id used to unsubscribe.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.subscribers).push(Subscriber {
            id,
            filter,
            handler: Arc::new(handler),
        });
        id
    }

    /// Subscribe through an unbounded channel instead of a callback.
    pub fn subscribe_channel(
        &self,
        filter: EventFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(filter, move |event| {
            // Receiver may have been dropped.
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Total number of events dispatched so far.
    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }

    /// Attach the outbound queue of a broadcast coordinator.
    pub fn set_forwarder(&self, forwarder: mpsc::UnboundedSender<ChangeEvent>) {
        *lock(&self.forwarder) = Some(forwarder);
    }

    /// Detach the outbound queue. Dropping the sender lets the coordinator
    /// drain what is already queued and stop.
    pub fn clear_forwarder(&self) {
        lock(&self.forwarder).take();
    }

    /// Whether locally produced events are forwarded to other instances.
    pub fn is_forwarding(&self) -> bool {
        lock(&self.forwarder).is_some()
    }

    /// Remove every subscriber and detach the forwarder.
    pub fn close(&self) {
        lock(&self.subscribers).clear();
        self.clear_forwarder();
    }

    /// Emit an event. `None` is ignored.
    pub fn emit(&self, event: impl Into<Option<ChangeEvent>>) {
        let Some(event) = event.into() else {
            return;
        };

        let current = thread::current().id();
        {
            let mut state = lock(&self.dispatch);
            if state.owner == Some(current) {
                state.pending.push_back(event);
                return;
            }
            while state.owner.is_some() {
                state = self
                    .idle
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            state.owner = Some(current);
            state.pending.push_back(event);
        }

        let _guard = DispatchGuard {
            state: &self.dispatch,
            idle: &self.idle,
        };
        loop {
            let next = lock(&self.dispatch).pending.pop_front();
            let Some(event) = next else {
                break;
            };
            self.deliver(&event);
            self.forward(event);
        }
    }

    fn deliver(&self, event: &ChangeEvent) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        let snapshot: Vec<Subscriber> = lock(&self.subscribers).clone();
        for subscriber in snapshot {
            if !subscriber.filter.matches(event) {
                continue;
            }
            let handler = &subscriber.handler;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                tracing::warn!(
                    subscription = %subscriber.id,
                    document_id = event.document_id(),
                    reason = panic_message(&*payload),
                    "Change event handler panicked"
                );
            }
        }
    }

    fn forward(&self, event: ChangeEvent) {
        if event.origin_token() != self.local_token {
            return;
        }
        let forwarder = lock(&self.forwarder).clone();
        if let Some(forwarder) = forwarder {
            if forwarder.send(event).is_err() {
                tracing::trace!("Broadcast forwarder closed, event stays local");
            }
        }
    }
}

impl std::fmt::Debug for ChangeEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventBus")
            .field("local_token", &self.local_token)
            .field("subscribers", &self.subscriber_count())
            .field("events_emitted", &self.events_emitted())
            .finish()
    }
}
