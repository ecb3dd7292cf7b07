//! Event sink
//!
//! Two independent channels:
//! - component listeners, keyed by ([`ListenerKind`], component type) plus a
//!   wildcard bucket that sees every emission. The registry emits once per
//!   affected component after each structural change.
//! - signals: arbitrary user values that entities subscribe to with a
//!   callback. [`EventSink::receive`] invokes every callback of one signal
//!   once per subscribed entity.
//!
//! Listeners and callbacks are always invoked with no sink lock held, so they
//! may connect, register, or emit re-entrantly.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::component::Component;
use crate::entity::Entity;

/// Structural change that triggered a component event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Add,
    Replace,
    Remove,
}

/// Which components a listener hears about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerTarget {
    /// Every component type
    Any,
    /// One component type
    Type(TypeId),
}

pub type ComponentListener = Arc<dyn Fn(Entity, &dyn Component) + Send + Sync>;

/// Handle returned by [`EventSink::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Values usable as signal channels
pub trait Signal: Any + Send + Sync + PartialEq + fmt::Debug {}

impl<T: Any + Send + Sync + PartialEq + fmt::Debug> Signal for T {}

/// Payload delivered with a signal
pub type SignalData = dyn Any + Send + Sync;

/// Shared callback invoked for each subscribed entity
///
/// Callbacks compare by identity: clones of one `SignalCallback` are equal,
/// two separately constructed callbacks never are.
#[derive(Clone)]
pub struct SignalCallback(Arc<dyn Fn(Entity, &SignalData) + Send + Sync>);

impl SignalCallback {
    pub fn new(f: impl Fn(Entity, &SignalData) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Callback that only fires for payloads of type `D`
    pub fn typed<D: Any>(f: impl Fn(Entity, &D) + Send + Sync + 'static) -> Self {
        Self::new(move |entity, data| {
            if let Some(data) = data.downcast_ref::<D>() {
                f(entity, data);
            }
        })
    }

    pub fn call(&self, entity: Entity, data: &SignalData) {
        (self.0)(entity, data)
    }
}

impl PartialEq for SignalCallback {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl Eq for SignalCallback {}

impl fmt::Debug for SignalCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalCallback({:p})", Arc::as_ptr(&self.0))
    }
}

trait SignalKey: Send + Sync + fmt::Debug {
    fn matches(&self, other: &dyn Any) -> bool;
}

impl<S: Signal> SignalKey for S {
    fn matches(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<S>() == Some(self)
    }
}

struct Subscription {
    callback: SignalCallback,
    entities: Vec<Entity>,
}

/// All subscriptions to one distinct signal value
struct SignalNode {
    signal: Box<dyn SignalKey>,
    subscriptions: Vec<Subscription>,
}

impl SignalNode {
    fn deliveries(&self) -> Vec<(SignalCallback, Entity)> {
        self.subscriptions
            .iter()
            .flat_map(|sub| sub.entities.iter().map(|entity| (sub.callback.clone(), *entity)))
            .collect()
    }
}

type ListenerTable = AHashMap<(ListenerKind, ListenerTarget), Vec<(ListenerId, ComponentListener)>>;

/// Component listeners and signal subscriptions of one registry
#[derive(Default)]
pub struct EventSink {
    listeners: RwLock<ListenerTable>,
    next_listener: AtomicU64,
    // Append-only chain, one node per distinct signal value
    signals: RwLock<Vec<SignalNode>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for `kind` events on components of type `T`
    pub fn connect<T: Component>(
        &self,
        kind: ListenerKind,
        listener: impl Fn(Entity, &T) + Send + Sync + 'static,
    ) -> ListenerId {
        let listener: ComponentListener = Arc::new(move |entity, component: &dyn Component| {
            if let Some(component) = component.as_any().downcast_ref::<T>() {
                listener(entity, component);
            }
        });
        self.insert_listener(kind, ListenerTarget::Type(TypeId::of::<T>()), listener)
    }

    /// Listen for `kind` events on every component type
    pub fn connect_any(
        &self,
        kind: ListenerKind,
        listener: impl Fn(Entity, &dyn Component) + Send + Sync + 'static,
    ) -> ListenerId {
        self.insert_listener(kind, ListenerTarget::Any, Arc::new(listener))
    }

    fn insert_listener(&self, kind: ListenerKind, target: ListenerTarget, listener: ComponentListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry((kind, target))
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener; returns whether it was connected
    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut found = false;
        for bucket in listeners.values_mut() {
            let before = bucket.len();
            bucket.retain(|(listener_id, _)| *listener_id != id);
            found |= bucket.len() != before;
        }
        listeners.retain(|_, bucket| !bucket.is_empty());
        found
    }

    /// Whether any listener would hear a `kind` event for `type_id`
    pub fn has_listeners(&self, kind: ListenerKind, type_id: TypeId) -> bool {
        let listeners = self.listeners.read();
        listeners.contains_key(&(kind, ListenerTarget::Type(type_id))) || listeners.contains_key(&(kind, ListenerTarget::Any))
    }

    /// Notify typed and wildcard listeners of one component change
    pub fn emit(&self, kind: ListenerKind, entity: Entity, component: &dyn Component) {
        let targets: Vec<ComponentListener> = {
            let listeners = self.listeners.read();
            let typed = listeners.get(&(kind, ListenerTarget::Type(component.component_type())));
            let any = listeners.get(&(kind, ListenerTarget::Any));
            typed
                .into_iter()
                .chain(any)
                .flatten()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in targets {
            listener(entity, component);
        }
    }

    /// Subscribe `entity` to `signal`; liveness is checked by the registry
    pub(crate) fn register<S: Signal>(&self, entity: Entity, signal: S, callback: &SignalCallback) {
        let mut signals = self.signals.write();
        let node = match signals.iter().position(|node| node.signal.matches(&signal)) {
            Some(index) => &mut signals[index],
            None => {
                signals.push(SignalNode {
                    signal: Box::new(signal),
                    subscriptions: Vec::new(),
                });
                let last = signals.len() - 1;
                &mut signals[last]
            }
        };

        match node.subscriptions.iter_mut().find(|sub| sub.callback == *callback) {
            Some(sub) => {
                if !sub.entities.contains(&entity) {
                    sub.entities.push(entity);
                }
            }
            None => node.subscriptions.push(Subscription {
                callback: callback.clone(),
                entities: vec![entity],
            }),
        }
    }

    /// Drop every subscription of `entity` to `signal`
    pub fn unregister<S: Signal>(&self, entity: Entity, signal: &S) {
        let mut signals = self.signals.write();
        if let Some(node) = signals.iter_mut().find(|node| node.signal.matches(signal)) {
            for sub in &mut node.subscriptions {
                sub.entities.retain(|e| *e != entity);
            }
            node.subscriptions.retain(|sub| !sub.entities.is_empty());
        }
    }

    /// Drop one callback, with all its entities, from `signal`
    pub fn unregister_callback<S: Signal>(&self, signal: &S, callback: &SignalCallback) -> bool {
        let mut signals = self.signals.write();
        let Some(node) = signals.iter_mut().find(|node| node.signal.matches(signal)) else {
            return false;
        };
        let before = node.subscriptions.len();
        node.subscriptions.retain(|sub| sub.callback != *callback);
        node.subscriptions.len() != before
    }

    /// Remove `entity` from every signal
    pub(crate) fn forget(&self, entity: Entity) {
        let mut signals = self.signals.write();
        for node in signals.iter_mut() {
            for sub in &mut node.subscriptions {
                sub.entities.retain(|e| *e != entity);
            }
            node.subscriptions.retain(|sub| !sub.entities.is_empty());
        }
    }

    /// Delete the node for `signal` entirely
    pub fn remove_signal<S: Signal>(&self, signal: &S) -> bool {
        let mut signals = self.signals.write();
        let before = signals.len();
        signals.retain(|node| !node.signal.matches(signal));
        signals.len() != before
    }

    /// Deliver `data` to every subscriber of `signal`
    ///
    /// Deliveries fan out over the current rayon pool.
    pub fn receive<S: Signal>(&self, signal: &S, data: &SignalData) {
        let deliveries = {
            let signals = self.signals.read();
            match signals.iter().find(|node| node.signal.matches(signal)) {
                Some(node) => node.deliveries(),
                None => return,
            }
        };
        deliveries
            .par_iter()
            .for_each(|(callback, entity)| callback.call(*entity, data));
    }

    /// Deliver `data` to every subscriber of every signal
    pub fn receive_all(&self, data: &SignalData) {
        let deliveries: Vec<(SignalCallback, Entity)> = {
            let signals = self.signals.read();
            signals.iter().flat_map(SignalNode::deliveries).collect()
        };
        deliveries
            .par_iter()
            .for_each(|(callback, entity)| callback.call(*entity, data));
    }

    /// Entities subscribed to `signal`, across all callbacks
    pub fn subscribers<S: Signal>(&self, signal: &S) -> Vec<Entity> {
        let signals = self.signals.read();
        let Some(node) = signals.iter().find(|node| node.signal.matches(signal)) else {
            return Vec::new();
        };
        let mut entities: Vec<Entity> = node
            .subscriptions
            .iter()
            .flat_map(|sub| sub.entities.iter().copied())
            .collect();
        entities.sort_unstable();
        entities.dedup();
        entities
    }

    /// Number of distinct signal values with a node
    pub fn signal_count(&self) -> usize {
        self.signals.read().len()
    }

    /// Drop every listener and signal node
    pub fn clear(&self) {
        self.listeners.write().clear();
        self.signals.write().clear();
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signals = self.signals.read();
        f.debug_struct("EventSink")
            .field("listener_buckets", &self.listeners.read().len())
            .field("signals", &signals.iter().map(|node| &node.signal).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, PartialEq)]
    enum GameSignal {
        Explode,
        Heal,
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&count), count)
    }

    #[test]
    fn test_typed_and_wildcard_listeners() {
        let sink = EventSink::new();
        let (typed, typed_seen) = counter();
        let (any, any_seen) = counter();

        sink.connect::<Health>(ListenerKind::Add, move |_, health| {
            assert_eq!(health.0, 10);
            typed.fetch_add(1, Ordering::SeqCst);
        });
        sink.connect_any(ListenerKind::Add, move |_, _| {
            any.fetch_add(1, Ordering::SeqCst);
        });

        let entity = Entity::new(0, 0);
        sink.emit(ListenerKind::Add, entity, &Health(10));
        sink.emit(ListenerKind::Add, entity, &5u8);
        sink.emit(ListenerKind::Remove, entity, &Health(10));

        assert_eq!(typed_seen.load(Ordering::SeqCst), 1);
        assert_eq!(any_seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disconnect() {
        let sink = EventSink::new();
        let id = sink.connect::<Health>(ListenerKind::Replace, |_, _| {});
        assert!(sink.has_listeners(ListenerKind::Replace, TypeId::of::<Health>()));
        assert!(!sink.has_listeners(ListenerKind::Add, TypeId::of::<Health>()));

        assert!(sink.disconnect(id));
        assert!(!sink.disconnect(id));
        assert!(!sink.has_listeners(ListenerKind::Replace, TypeId::of::<Health>()));
    }

    #[test]
    fn test_receive_once_per_entity() {
        let sink = EventSink::new();
        let (hits, seen) = counter();
        let callback = SignalCallback::typed::<u32>(move |_, amount| {
            hits.fetch_add(*amount as usize, Ordering::SeqCst);
        });

        for i in 0..4 {
            sink.register(Entity::new(i, 0), GameSignal::Explode, &callback);
        }
        // Duplicate registration is ignored
        sink.register(Entity::new(0, 0), GameSignal::Explode, &callback);
        sink.register(Entity::new(9, 0), GameSignal::Heal, &callback);
        assert_eq!(sink.signal_count(), 2);

        sink.receive(&GameSignal::Explode, &2u32);
        assert_eq!(seen.load(Ordering::SeqCst), 8);

        sink.receive_all(&1u32);
        assert_eq!(seen.load(Ordering::SeqCst), 13);

        // Payloads of another type are ignored by typed callbacks
        sink.receive(&GameSignal::Heal, &"text");
        assert_eq!(seen.load(Ordering::SeqCst), 13);
    }

    #[test]
    fn test_one_node_per_signal_value() {
        let sink = EventSink::new();
        let first = SignalCallback::new(|_, _| {});
        let second = SignalCallback::new(|_, _| {});
        assert_ne!(first, second);
        assert_eq!(first, first.clone());

        sink.register(Entity::new(0, 0), 7i64, &first);
        sink.register(Entity::new(1, 0), 7i64, &second);
        sink.register(Entity::new(2, 0), 8i64, &first);
        assert_eq!(sink.signal_count(), 2);
        assert_eq!(sink.subscribers(&7i64), vec![Entity::new(0, 0), Entity::new(1, 0)]);

        assert!(sink.unregister_callback(&7i64, &second));
        assert_eq!(sink.subscribers(&7i64), vec![Entity::new(0, 0)]);

        assert!(sink.remove_signal(&8i64));
        assert!(!sink.remove_signal(&8i64));
        assert_eq!(sink.signal_count(), 1);
    }

    #[test]
    fn test_unregister_and_forget() {
        let sink = EventSink::new();
        let callback = SignalCallback::new(|_, _| {});
        let a = Entity::new(0, 0);
        let b = Entity::new(1, 0);
        sink.register(a, GameSignal::Heal, &callback);
        sink.register(b, GameSignal::Heal, &callback);
        sink.register(a, GameSignal::Explode, &callback);

        sink.unregister(a, &GameSignal::Heal);
        assert_eq!(sink.subscribers(&GameSignal::Heal), vec![b]);
        assert_eq!(sink.subscribers(&GameSignal::Explode), vec![a]);

        sink.forget(a);
        assert!(sink.subscribers(&GameSignal::Explode).is_empty());

        sink.clear();
        assert_eq!(sink.signal_count(), 0);
    }

    #[test]
    fn test_reentrant_listener() {
        let sink = Arc::new(EventSink::new());
        let inner = Arc::clone(&sink);
        sink.connect::<Health>(ListenerKind::Remove, move |entity, _| {
            inner.connect::<Health>(ListenerKind::Add, |_, _| {});
            inner.emit(ListenerKind::Add, entity, &Health(1));
        });
        sink.emit(ListenerKind::Remove, Entity::new(0, 0), &Health(0));
        assert!(sink.has_listeners(ListenerKind::Add, TypeId::of::<Health>()));
    }
}
