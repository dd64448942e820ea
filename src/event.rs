//! Broadcast events: fire-and-forget, multi-listener, versioned.
//!
//! Every publish advances the event's [`Version`] and synchronously calls
//! each registered listener in registration order. Listener registration
//! has set semantics: registering the same `Arc` twice fires it once.
//!
//! Events declared through `SetupContext::broadcast_event` are shareable:
//! the sync layer installs a relay that runs after every local publish
//! and mirrors the payload to peer realms. Peers replay the payload with
//! [`BroadcastEvent::publish_local`], which never relays, so a mirrored
//! event cannot echo back.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::reactive::lock;
use crate::version::Version;

/// Number of past payloads retained for late listeners.
pub const HISTORY_LEN: usize = 5;

/// What a listener receives for one publish.
///
/// `data` is shared immutably between all listeners of the publish.
#[derive(Debug)]
pub struct EventPayload<T> {
    /// The published value.
    pub data: Arc<T>,
    /// Version assigned to this publish.
    pub version: Version,
}

impl<T> Clone for EventPayload<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            version: self.version.clone(),
        }
    }
}

/// A broadcast listener callback.
pub type Listener<T> = Arc<dyn Fn(&EventPayload<T>) + Send + Sync>;

type Relay<T> = Arc<dyn Fn(&EventPayload<T>) + Send + Sync>;

/// Removes a listener from the event it was registered on.
///
/// Dropping a `Subscription` does **not** unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(remove: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            remove: Arc::new(remove),
        }
    }

    /// Detach the listener. Calling this twice is a no-op.
    pub fn unsubscribe(&self) {
        (self.remove)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

struct Registry<T> {
    version: Version,
    listeners: Vec<(u64, Listener<T>)>,
    next_id: u64,
    history: VecDeque<EventPayload<T>>,
}

struct BroadcastInner<T> {
    name: String,
    registry: Mutex<Registry<T>>,
    relay: Mutex<Option<Relay<T>>>,
}

/// A fire-and-forget event with any number of listeners.
///
/// `Clone` shares the same event.
pub struct BroadcastEvent<T> {
    inner: Arc<BroadcastInner<T>>,
}

impl<T> Clone for BroadcastEvent<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for BroadcastEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastEvent")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl<T: Send + Sync + 'static> BroadcastEvent<T> {
    /// Create an event named `name` at version `0`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BroadcastInner {
                name: name.into(),
                registry: Mutex::new(Registry {
                    version: Version::default(),
                    listeners: Vec::new(),
                    next_id: 0,
                    history: VecDeque::with_capacity(HISTORY_LEN),
                }),
                relay: Mutex::new(None),
            }),
        }
    }

    /// The event's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register `f` for every future publish.
    pub fn listen(&self, f: impl Fn(&EventPayload<T>) + Send + Sync + 'static) -> Subscription {
        self.listen_shared(Arc::new(f))
    }

    /// Register a shared listener. Registering the same `Arc` again
    /// returns a subscription for the existing registration.
    pub fn listen_shared(&self, listener: Listener<T>) -> Subscription {
        let id = {
            let mut registry = lock(&self.inner.registry);
            let existing = registry
                .listeners
                .iter()
                .find(|(_, l)| Arc::ptr_eq(l, &listener))
                .map(|(id, _)| *id);
            match existing {
                Some(id) => id,
                None => {
                    let id = registry.next_id;
                    registry.next_id += 1;
                    registry.listeners.push((id, listener));
                    id
                }
            }
        };
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                lock(&inner.registry).listeners.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Publish `data` to every listener, then relay it to peer realms if
    /// the event is shared. Returns the version assigned to this publish.
    ///
    /// A panicking listener propagates to the caller.
    pub fn publish(&self, data: T) -> Version {
        let payload = self.notify(data);
        let relay = lock(&self.inner.relay).clone();
        if let Some(relay) = relay {
            relay(&payload);
        }
        payload.version
    }

    /// Publish to local listeners only. Used to replay peer events.
    pub fn publish_local(&self, data: T) -> Version {
        self.notify(data).version
    }

    fn notify(&self, data: T) -> EventPayload<T> {
        let (payload, listeners) = {
            let mut registry = lock(&self.inner.registry);
            let payload = EventPayload {
                data: Arc::new(data),
                version: registry.version.bump(),
            };
            if registry.history.len() == HISTORY_LEN {
                registry.history.pop_front();
            }
            registry.history.push_back(payload.clone());
            let listeners: Vec<Listener<T>> =
                registry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (payload, listeners)
        };
        for listener in listeners {
            listener(&payload);
        }
        payload
    }

    /// Version of the most recent publish (`0` before the first).
    pub fn current_version(&self) -> Version {
        lock(&self.inner.registry).version.clone()
    }

    /// Up to [`HISTORY_LEN`] most recent payloads, oldest first.
    pub fn recent(&self) -> Vec<EventPayload<T>> {
        lock(&self.inner.registry).history.iter().cloned().collect()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.registry).listeners.len()
    }

    /// Detach every listener.
    pub fn clear_listeners(&self) {
        lock(&self.inner.registry).listeners.clear();
    }

    /// The restricted view handed to callers outside the aggregate.
    pub fn listener(&self) -> BroadcastListener<T> {
        BroadcastListener {
            event: self.clone(),
        }
    }

    pub(crate) fn set_relay(&self, relay: Option<Relay<T>>) {
        *lock(&self.inner.relay) = relay;
    }
}

/// Listen-only view of a [`BroadcastEvent`].
pub struct BroadcastListener<T> {
    event: BroadcastEvent<T>,
}

impl<T> Clone for BroadcastListener<T> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
        }
    }
}

impl<T> fmt::Debug for BroadcastListener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BroadcastListener")
            .field(&self.event.inner.name)
            .finish()
    }
}

impl<T: Send + Sync + 'static> BroadcastListener<T> {
    /// See [`BroadcastEvent::listen`].
    pub fn listen(&self, f: impl Fn(&EventPayload<T>) + Send + Sync + 'static) -> Subscription {
        self.event.listen(f)
    }

    /// See [`BroadcastEvent::listen_shared`].
    pub fn listen_shared(&self, listener: Listener<T>) -> Subscription {
        self.event.listen_shared(listener)
    }

    /// See [`BroadcastEvent::current_version`].
    pub fn current_version(&self) -> Version {
        self.event.current_version()
    }

    /// See [`BroadcastEvent::recent`].
    pub fn recent(&self) -> Vec<EventPayload<T>> {
        self.event.recent()
    }
}

/// Type-erased control over a declared event, used by aggregate teardown
/// and the sync layer.
pub(crate) trait EventControl: Send + Sync {
    fn clear_listeners(&self);

    /// `Some` for events that can be mirrored to peer realms.
    fn shared(&self) -> Option<&dyn SharedEvent> {
        None
    }
}

/// The shared-broadcast extension point.
pub(crate) trait SharedEvent: Send + Sync {
    /// Install (or remove) the relay called with the JSON form of every
    /// locally published payload.
    fn set_relay(&self, relay: Option<Arc<dyn Fn(serde_json::Value) + Send + Sync>>);

    /// Publish a payload received from a peer, without relaying it.
    fn replay(&self, data: serde_json::Value) -> Result<(), serde_json::Error>;
}

/// Erased control for events that never leave the realm.
pub(crate) struct LocalControl<T>(pub(crate) BroadcastEvent<T>);

impl<T: Send + Sync + 'static> EventControl for LocalControl<T> {
    fn clear_listeners(&self) {
        self.0.clear_listeners();
    }
}

/// Erased control for shareable events.
pub(crate) struct SharedControl<T>(pub(crate) BroadcastEvent<T>);

impl<T> EventControl for SharedControl<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn clear_listeners(&self) {
        self.0.clear_listeners();
    }

    fn shared(&self) -> Option<&dyn SharedEvent> {
        Some(self)
    }
}

impl<T> SharedEvent for SharedControl<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn set_relay(&self, relay: Option<Arc<dyn Fn(serde_json::Value) + Send + Sync>>) {
        let name = self.0.name().to_owned();
        self.0.set_relay(relay.map(|relay| {
            Arc::new(move |payload: &EventPayload<T>| {
                match serde_json::to_value(&*payload.data) {
                    Ok(value) => relay(value),
                    Err(e) => tracing::warn!(
                        event = %name,
                        error = %e,
                        "event payload is not serializable; not relayed"
                    ),
                }
            }) as Relay<T>
        }));
    }

    fn replay(&self, data: serde_json::Value) -> Result<(), serde_json::Error> {
        let data: T = serde_json::from_value(data)?;
        self.0.publish_local(data);
        Ok(())
    }
}
