//! User switch notifications.

use super::notification::{EventType, Listener, ListenerAction, NotificationChain};
use crate::error::{DbError, DbResult};
use parking_lot::RwLock;

/// User state transitions listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserChangeEvent {
    /// A user became active.
    UserActive,
    /// A user became inactive.
    UserNonActive,
    /// The active user switched away.
    UserActiveToNonActive,
}

impl UserChangeEvent {
    /// Every event kind, in registration order.
    pub const ALL: [Self; 3] = [
        Self::UserActive,
        Self::UserNonActive,
        Self::UserActiveToNonActive,
    ];

    fn event_type(self) -> EventType {
        match self {
            Self::UserActive => 0,
            Self::UserNonActive => 1,
            Self::UserActiveToNonActive => 2,
        }
    }
}

/// Hub for [`UserChangeEvent`]s.
#[derive(Default)]
pub struct UserChangeMonitor {
    chain: RwLock<Option<NotificationChain<UserChangeEvent>>>,
}

impl UserChangeMonitor {
    /// Creates a stopped monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the hub and registers all event kinds. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the registration failure after undoing partial registration.
    pub fn start(&self) -> DbResult<()> {
        let mut slot = self.chain.write();
        if slot.is_some() {
            return Ok(());
        }
        let chain = NotificationChain::new();
        for (index, event) in UserChangeEvent::ALL.iter().enumerate() {
            if let Err(err) = chain.register_event(event.event_type()) {
                tracing::error!(?event, error = %err, "user change event registration failed");
                for registered in &UserChangeEvent::ALL[..index] {
                    chain.unregister_event(registered.event_type());
                }
                return Err(err);
            }
        }
        *slot = Some(chain);
        tracing::debug!("user change monitor started");
        Ok(())
    }

    /// Unregisters all kinds and drops the hub. Safe when not started.
    pub fn stop(&self) {
        if let Some(chain) = self.chain.write().take() {
            for event in UserChangeEvent::ALL {
                chain.unregister_event(event.event_type());
            }
        }
    }

    /// Returns true between [`UserChangeMonitor::start`] and [`UserChangeMonitor::stop`].
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.chain.read().is_some()
    }

    /// Subscribes `action` to `event`.
    ///
    /// # Errors
    ///
    /// Returns `NotInit` before [`UserChangeMonitor::start`].
    pub fn register_user_changed_listener(
        &self,
        action: ListenerAction<UserChangeEvent>,
        event: UserChangeEvent,
    ) -> DbResult<Listener> {
        let slot = self.chain.read();
        let chain = slot.as_ref().ok_or(DbError::NotInit {
            component: "user change monitor",
        })?;
        chain.register_listener(event.event_type(), action)
    }

    /// Fires every event kind once. A no-op when not started.
    pub fn notify_user_changed(&self) {
        let slot = self.chain.read();
        let Some(chain) = slot.as_ref() else {
            tracing::debug!("user change monitor not started");
            return;
        };
        for event in UserChangeEvent::ALL {
            chain.notify(event.event_type(), &event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn notify_before_start_is_noop() {
        let monitor = UserChangeMonitor::new();
        monitor.notify_user_changed();
        let err = monitor
            .register_user_changed_listener(Arc::new(|_| {}), UserChangeEvent::UserActive)
            .unwrap_err();
        assert!(matches!(err, DbError::NotInit { .. }));
    }

    #[test]
    fn every_kind_fires_once_per_notify() {
        let monitor = UserChangeMonitor::new();
        monitor.start().unwrap();
        monitor.start().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listeners: Vec<_> = UserChangeEvent::ALL
            .iter()
            .map(|event| {
                let seen = Arc::clone(&seen);
                monitor
                    .register_user_changed_listener(
                        Arc::new(move |fired: &UserChangeEvent| seen.lock().push(*fired)),
                        *event,
                    )
                    .unwrap()
            })
            .collect();
        monitor.notify_user_changed();
        let mut fired = seen.lock().clone();
        fired.sort_by_key(|event| event.event_type());
        assert_eq!(fired, UserChangeEvent::ALL.to_vec());
        drop(listeners);
        monitor.stop();
        assert!(!monitor.is_started());
        monitor.stop();
    }
}
