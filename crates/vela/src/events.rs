use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use strum::{Display, EnumDiscriminants, EnumIter};
use tracing::error;

use crate::buffer::BufferInfo;
use crate::error::EngineError;
use crate::quality::QualityLevel;
use crate::recovery::RecoveryAction;
use crate::state::{EngineStats, PlaybackState};

/// An event that can be routed by kind.
pub trait BusEvent: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Events published by the engine.
#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(EventKind), derive(Hash, EnumIter, Display))]
pub enum EngineEvent {
    StateChange(PlaybackState),
    QualityLevelsLoaded(Vec<QualityLevel>),
    QualityChange(QualityLevel),
    Stats(EngineStats),
    Error(EngineError),
    /// What happens next after a fatal error, published right after it.
    /// A [`RecoveryKind::Fatal`](crate::RecoveryKind::Fatal) plan is final.
    RecoveryPlanned(RecoveryAction),
    BufferUpdate(BufferInfo),
    TimeUpdate { current_time: f64, duration: f64 },
    Ended,
    /// Playback resumed after an automatic recovery.
    Recovered,
}

impl BusEvent for EngineEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        EventKind::from(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E: BusEvent> {
    next_id: u64,
    listeners: HashMap<E::Kind, Vec<(ListenerId, Handler<E>)>>,
}

impl<E: BusEvent> Registry<E> {
    fn remove(&mut self, kind: E::Kind, id: ListenerId) -> bool {
        let Some(handlers) = self.listeners.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.listeners.remove(&kind);
        }
        removed
    }
}

/// Synchronous publish/subscribe bus.
///
/// Handlers run on the emitting thread in registration order. A panicking
/// handler is logged and skipped; it never affects other handlers or the
/// emitter. Handlers registered after an emit do not see it.
pub struct EventBus<E: BusEvent> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    pub fn on<F>(&self, kind: E::Kind, handler: F) -> Subscription<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Remove one handler. Returns false when it was not registered.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        self.registry.lock().remove(kind, id)
    }

    pub fn emit(&self, event: &E) {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler<E>> = match self.registry.lock().listeners.get(&kind) {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(event = ?kind, panic = %message, "Event handler panicked");
            }
        }
    }

    /// Clear the handlers for one kind, or for every kind when `None`.
    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        let mut registry = self.registry.lock();
        match kind {
            Some(kind) => {
                registry.listeners.remove(&kind);
            }
            None => registry.listeners.clear(),
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.registry
            .lock()
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by [`EventBus::on`].
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription<E: BusEvent> {
    registry: Weak<Mutex<Registry<E>>>,
    kind: E::Kind,
    id: ListenerId,
}

impl<E: BusEvent> Subscription<E> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().remove(self.kind, self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(bus: &EventBus<EngineEvent>, kind: EventKind) -> Arc<Mutex<Vec<EngineEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(kind, move |event: &EngineEvent| sink.lock().push(event.clone()));
        seen
    }

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::<EngineEvent>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.on(EventKind::Ended, move |_| order.lock().push(n));
        }
        bus.emit(&EngineEvent::Ended);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn routes_by_kind() {
        let bus = EventBus::<EngineEvent>::new();
        let states = recorder(&bus, EventKind::StateChange);
        bus.emit(&EngineEvent::Ended);
        bus.emit(&EngineEvent::StateChange(PlaybackState::Loading));
        let seen = states.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            seen[0],
            EngineEvent::StateChange(PlaybackState::Loading)
        ));
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let bus = EventBus::<EngineEvent>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.on(EventKind::Recovered, |_| panic!("handler failure"));
        let counter = Arc::clone(&calls);
        bus.on(EventKind::Recovered, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&EngineEvent::Recovered);
        bus.emit(&EngineEvent::Recovered);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_and_off() {
        let bus = EventBus::<EngineEvent>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let first = bus.on(EventKind::Ended, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&calls);
        let second = bus.on(EventKind::Ended, move |_| {
            counter.fetch_add(10, Ordering::SeqCst);
        });

        assert!(first.unsubscribe());
        bus.emit(&EngineEvent::Ended);
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        assert!(bus.off(EventKind::Ended, second.id()));
        assert!(!bus.off(EventKind::Ended, second.id()));
        bus.emit(&EngineEvent::Ended);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn late_subscribers_miss_earlier_emits() {
        let bus = EventBus::<EngineEvent>::new();
        bus.emit(&EngineEvent::Ended);
        let seen = recorder(&bus, EventKind::Ended);
        assert!(seen.lock().is_empty());
        bus.emit(&EngineEvent::Ended);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn handlers_may_subscribe_during_emit() {
        let bus = EventBus::<EngineEvent>::new();
        let inner_bus = bus.clone();
        bus.on(EventKind::Ended, move |_| {
            inner_bus.on(EventKind::Ended, |_| {});
        });
        bus.emit(&EngineEvent::Ended);
        assert_eq!(bus.listener_count(EventKind::Ended), 2);
    }

    #[test]
    fn remove_all_listeners_by_kind_or_everything() {
        let bus = EventBus::<EngineEvent>::new();
        let ended = recorder(&bus, EventKind::Ended);
        let recovered = recorder(&bus, EventKind::Recovered);

        bus.remove_all_listeners(Some(EventKind::Ended));
        bus.emit(&EngineEvent::Ended);
        bus.emit(&EngineEvent::Recovered);
        assert!(ended.lock().is_empty());
        assert_eq!(recovered.lock().len(), 1);

        bus.remove_all_listeners(None);
        bus.emit(&EngineEvent::Recovered);
        assert_eq!(recovered.lock().len(), 1);
        assert_eq!(bus.listener_count(EventKind::Recovered), 0);
    }
}
