//! Event-typed listener registry.

use crate::error::{DbError, DbResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Event kind within one chain.
pub type EventType = u32;

/// Listener body.
pub type ListenerAction<T> = Arc<dyn Fn(&T) + Send + Sync>;

trait Deregister: Send + Sync {
    fn deregister(&self, event: EventType, id: u64);
}

struct ChainInner<T> {
    events: Mutex<HashMap<EventType, BTreeMap<u64, ListenerAction<T>>>>,
    next_listener: AtomicU64,
}

impl<T: 'static> Deregister for ChainInner<T> {
    fn deregister(&self, event: EventType, id: u64) {
        if let Some(listeners) = self.events.lock().get_mut(&event) {
            listeners.remove(&id);
        }
    }
}

/// Registration returned by [`NotificationChain::register_listener`].
///
/// Dropping it unregisters the listener. A notification already being
/// delivered may still reach the action once.
#[must_use = "dropping a Listener unregisters it"]
pub struct Listener {
    event: EventType,
    id: u64,
    chain: Weak<dyn Deregister>,
}

impl Listener {
    /// Event kind this listener is registered for.
    #[must_use]
    pub fn event(&self) -> EventType {
        self.event
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(chain) = self.chain.upgrade() {
            chain.deregister(self.event, self.id);
        }
    }
}

/// Pub/sub hub keyed by event kind.
///
/// Event kinds must be registered before listeners can attach to them.
pub struct NotificationChain<T> {
    inner: Arc<ChainInner<T>>,
}

impl<T: 'static> Default for NotificationChain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> NotificationChain<T> {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChainInner {
                events: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Adds an event kind.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySet` if the kind is registered.
    pub fn register_event(&self, event: EventType) -> DbResult<()> {
        let mut events = self.inner.events.lock();
        if events.contains_key(&event) {
            return Err(DbError::AlreadySet);
        }
        events.insert(event, BTreeMap::new());
        Ok(())
    }

    /// Removes an event kind and every listener on it.
    pub fn unregister_event(&self, event: EventType) {
        self.inner.events.lock().remove(&event);
    }

    /// Attaches a listener to a registered event kind.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the kind was never registered.
    pub fn register_listener(
        &self,
        event: EventType,
        action: ListenerAction<T>,
    ) -> DbResult<Listener> {
        let mut events = self.inner.events.lock();
        let listeners = events.get_mut(&event).ok_or(DbError::NotFound)?;
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        listeners.insert(id, action);
        let inner: Arc<dyn Deregister> = self.inner.clone();
        Ok(Listener {
            event,
            id,
            chain: Arc::downgrade(&inner),
        })
    }

    /// Calls every listener of `event` with `arg`, outside the registry lock.
    pub fn notify(&self, event: EventType, arg: &T) {
        let actions: Vec<ListenerAction<T>> = match self.inner.events.lock().get(&event) {
            Some(listeners) => listeners.values().cloned().collect(),
            None => return,
        };
        for action in actions {
            action(arg);
        }
    }

    /// Returns true if no listener is attached to `event`.
    #[must_use]
    pub fn is_empty_listener(&self, event: EventType) -> bool {
        self.inner
            .events
            .lock()
            .get(&event)
            .map_or(true, BTreeMap::is_empty)
    }
}
