//! Screen lock state fan-out.

use super::notification::{EventType, Listener, ListenerAction, NotificationChain};
use crate::error::DbResult;
use std::sync::atomic::{AtomicBool, Ordering};

const LOCK_STATUS_EVENT: EventType = 0;

/// Relays the platform's lock state to registered listeners.
#[derive(Default)]
pub struct LockStatusObserver {
    chain: NotificationChain<bool>,
    started: AtomicBool,
}

impl LockStatusObserver {
    /// Creates an observer that is not started.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the lock status event.
    ///
    /// # Errors
    ///
    /// Returns `AlreadySet` if already started.
    pub fn start(&self) -> DbResult<()> {
        self.chain.register_event(LOCK_STATUS_EVENT)?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Returns true once started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Subscribes to lock state changes; the argument is true when locked.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` before [`LockStatusObserver::start`].
    pub fn register_lock_status_changed_listener(
        &self,
        action: ListenerAction<bool>,
    ) -> DbResult<Listener> {
        self.chain.register_listener(LOCK_STATUS_EVENT, action)
    }

    /// Broadcasts a lock state change.
    pub fn on_status_change(&self, locked: bool) {
        tracing::debug!(locked, "lock status changed");
        self.chain.notify(LOCK_STATUS_EVENT, &locked);
    }
}
