//! Event Bus - in-process pub/sub for run events
//!
//! Emitting delivers synchronously to every registered listener in
//! registration order. Each delivery pass iterates a snapshot of the listener
//! list, so subscribing or unsubscribing from inside a listener only affects
//! later passes. A panicking listener is contained and logged; it never
//! reaches the emitter and never stops delivery to the listeners after it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::{debug, warn};

use super::types::RunEvent;

/// Callback invoked for each delivered event
pub type Listener = Arc<dyn Fn(&RunEvent) + Send + Sync>;

/// Publish/subscribe surface shared by every bus flavour
pub trait EventBus: Send + Sync {
    /// Publish an event. Never fails and never propagates listener failures.
    fn emit(&self, event: RunEvent);

    /// Register a listener; events emitted before registration are not replayed
    fn on(&self, listener: Listener) -> Subscription;
}

/// Ordered collection of listeners with snapshot-based, failure-isolated delivery
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a listener at the end of the delivery order
    pub fn add(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().push((id, listener));
        debug!(listener_id = id, "ListenerRegistry::add");
        Subscription {
            registry: Arc::downgrade(self),
            id,
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        let removed = listeners.len() != before;
        debug!(listener_id = id, removed, "ListenerRegistry::remove");
        removed
    }

    /// Copy of the current listener list
    pub fn snapshot(&self) -> Vec<Listener> {
        self.read().iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one event to a snapshot of the listeners, returning how many failed
    pub fn deliver(&self, event: &RunEvent) -> usize {
        deliver_to(&self.snapshot(), event)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(u64, Listener)>> {
        self.listeners.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Invoke each listener with `event`, containing panics; returns the failure count
pub(crate) fn deliver_to(listeners: &[Listener], event: &RunEvent) -> usize {
    let mut failures = 0;
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            failures += 1;
            warn!(
                event_type = %event.event_type(),
                run_id = %event.run_id(),
                "listener panicked during delivery; continuing"
            );
        }
    }
    failures
}

/// Handle returned by [`EventBus::on`]
///
/// Dropping it leaves the listener registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
#[must_use = "dropping a Subscription keeps the listener registered"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the listener. Returns false if it was already gone or the bus was dropped.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.id),
            None => false,
        }
    }
}

/// Unbuffered bus: `emit` delivers before returning
#[derive(Default)]
pub struct SimpleEventBus {
    listeners: Arc<ListenerRegistry>,
}

impl SimpleEventBus {
    pub fn new() -> Self {
        debug!("SimpleEventBus::new: creating event bus");
        Self::default()
    }

    /// Get the number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl EventBus for SimpleEventBus {
    fn emit(&self, event: RunEvent) {
        debug!(event_type = %event.event_type(), run_id = %event.run_id(), "SimpleEventBus::emit");
        self.listeners.deliver(&event);
    }

    fn on(&self, listener: Listener) -> Subscription {
        self.listeners.add(listener)
    }
}

/// Create an unbuffered event bus behind a shared trait object
pub fn create_event_bus() -> Arc<dyn EventBus> {
    Arc::new(SimpleEventBus::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{Cancelled, EventKind, EventType, RunId};
    use std::sync::Mutex;

    fn cancelled(run: &str) -> RunEvent {
        RunEvent::new(RunId::from(run), EventKind::Cancelled(Cancelled { reason: None }))
    }

    fn panicking_listener(_event: &RunEvent) {
        panic!("listener bug");
    }

    fn recorder() -> (Listener, Arc<Mutex<Vec<RunEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |e: &RunEvent| sink.lock().unwrap().push(e.clone()));
        (listener, seen)
    }

    #[test]
    fn test_bus_creation() {
        let bus = SimpleEventBus::new();
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_emit_without_listeners() {
        let bus = SimpleEventBus::new();
        bus.emit(cancelled("r1"));
    }

    #[test]
    fn test_listeners_called_in_registration_order() {
        let bus = SimpleEventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut subs = Vec::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            subs.push(bus.on(Arc::new(move |_e: &RunEvent| order.lock().unwrap().push(i))));
        }

        bus.emit(cancelled("r1"));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = SimpleEventBus::new();
        let _bad = bus.on(Arc::new(panicking_listener));
        let (good, seen) = recorder();
        let _good = bus.on(good);

        bus.emit(cancelled("r1"));
        bus.emit(cancelled("r1"));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = SimpleEventBus::new();
        let (listener, seen) = recorder();
        let sub = bus.on(listener);

        bus.emit(cancelled("r1"));
        assert!(sub.unsubscribe());
        bus.emit(cancelled("r1"));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe_during_delivery_uses_snapshot() {
        let bus = SimpleEventBus::new();
        let victim_sub: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim_sub);
        let _killer = bus.on(Arc::new(move |_e: &RunEvent| {
            if let Some(sub) = slot.lock().unwrap().take() {
                sub.unsubscribe();
            }
        }));

        let (victim, seen) = recorder();
        *victim_sub.lock().unwrap() = Some(bus.on(victim));

        // Victim is removed mid-pass but still sees this event
        bus.emit(cancelled("r1"));
        assert_eq!(seen.lock().unwrap().len(), 1);

        // ...and nothing afterwards
        bus.emit(cancelled("r1"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_late_listener_sees_no_history() {
        let bus = SimpleEventBus::new();
        bus.emit(cancelled("r1"));

        let (listener, seen) = recorder();
        let _sub = bus.on(listener);
        assert!(seen.lock().unwrap().is_empty());

        bus.emit(cancelled("r2"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].run_id().as_str(), "r2");
        assert_eq!(seen[0].event_type(), EventType::Cancelled);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped() {
        let bus = SimpleEventBus::new();
        let (listener, _seen) = recorder();
        let sub = bus.on(listener);
        drop(bus);
        assert!(!sub.unsubscribe());
    }
}
