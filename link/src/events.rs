//! Typed, synchronous event fan-out.
//!
//! Every component that produces events (cable, channel, transport) owns an
//! [`EventBus`] over its own event enum. Listeners run synchronously in
//! registration order on the task that emitted the event, so they must not
//! block; spawn a task for anything async.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::sync::lock;

/// An event that can be routed by kind.
pub trait Event: Send + Sync + 'static {
    type Kind: Copy + PartialEq + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Payload of `connect` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    /// `false` for the first connection, `true` for every later one.
    pub reconnect: bool,
    /// The server restored the previous session instead of starting a new one.
    pub restored: bool,
}

/// Informational server message, e.g. `history_received`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfoEvent {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InfoEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: None,
        }
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E: Event> {
    id: u64,
    kind: Option<E::Kind>,
    once: bool,
    callback: Callback<E>,
}

impl<E: Event> Listener<E> {
    fn matches(&self, kind: E::Kind) -> bool {
        self.kind.is_none_or(|k| k == kind)
    }
}

struct Registry<E: Event> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> Registry<E> {
    fn remove(&self, id: u64) {
        lock(&self.listeners).retain(|l| l.id != id);
    }
}

/// Listener registry for one event type.
///
/// Cloning the bus yields another handle to the same registry.
pub struct EventBus<E: Event> {
    registry: Arc<Registry<E>>,
}

impl<E: Event> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Listen to every event of `kind`.
    pub fn on(&self, kind: E::Kind, f: impl Fn(&E) + Send + Sync + 'static) -> Unbind {
        self.register(Some(kind), false, Arc::new(f))
    }

    /// Listen to the next event of `kind` only.
    pub fn once(&self, kind: E::Kind, f: impl Fn(&E) + Send + Sync + 'static) -> Unbind {
        self.register(Some(kind), true, Arc::new(f))
    }

    /// Listen to every event regardless of kind.
    pub fn on_any(&self, f: impl Fn(&E) + Send + Sync + 'static) -> Unbind {
        self.register(None, false, Arc::new(f))
    }

    /// Dispatch `event` to the matching listeners in registration order.
    ///
    /// The listener list is snapshotted first, so listeners may register or
    /// unbind listeners (including themselves) while being called.
    pub fn emit(&self, event: &E) {
        let kind = event.kind();
        let callbacks: Vec<Callback<E>> = {
            let mut listeners = lock(&self.registry.listeners);
            let matched = listeners
                .iter()
                .filter(|l| l.matches(kind))
                .map(|l| l.callback.clone())
                .collect();
            listeners.retain(|l| !(l.once && l.matches(kind)));
            matched
        };

        for callback in callbacks {
            callback(event);
        }
    }

    /// Resolve with the first value `select` extracts from an emitted event.
    ///
    /// The listener is registered before this returns, so an event emitted
    /// right after the call is never missed. It removes itself once fired.
    pub fn wait_for<T>(
        &self,
        select: impl Fn(&E) -> Option<T> + Send + Sync + 'static,
    ) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<Registry<E>> = Arc::downgrade(&self.registry);

        let callback: Callback<E> = Arc::new(move |event: &E| {
            let Some(value) = select(event) else {
                return;
            };
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(value);
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        });

        lock(&self.registry.listeners).push(Listener {
            id,
            kind: None,
            once: false,
            callback,
        });
        rx
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry.listeners).len()
    }

    pub fn clear(&self) {
        lock(&self.registry.listeners).clear();
    }

    fn register(&self, kind: Option<E::Kind>, once: bool, callback: Callback<E>) -> Unbind {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.registry.listeners).push(Listener {
            id,
            kind,
            once,
            callback,
        });

        let registry = Arc::downgrade(&self.registry);
        Unbind::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
        })
    }
}

/// Handle returned by [`EventBus::on`] and friends.
///
/// Dropping it keeps the listener registered; call [`Unbind::unbind`] to
/// remove it.
pub struct Unbind {
    remove: Box<dyn FnOnce() + Send + Sync>,
}

impl Unbind {
    fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Box::new(remove),
        }
    }

    pub fn unbind(self) {
        (self.remove)()
    }
}

impl fmt::Debug for Unbind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unbind")
    }
}
