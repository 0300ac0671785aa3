//! Idle timer of an open store.

use crate::error::{DbError, DbResult};
use crate::interfaces::LifeCycleNotifier;
use crate::runtime::{RuntimeContext, TimerAction, TimerId};
use crate::types::{short_id, DbProperties};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

struct TimerState {
    notifier: Option<LifeCycleNotifier>,
    timer: Option<TimerId>,
    life_time: Duration,
}

/// Reports a store as unused after it saw no activity for its life time.
///
/// Connections create one per store. Once a notifier is registered, a
/// runtime timer calls it with the store's auto-launch identifier and user
/// every `life_time` unless [`LifeCycleTimer::heart_beat`] restarted the
/// countdown in between. The auto-launch manager registers its notifier
/// here to close stores nobody is syncing with.
pub struct LifeCycleTimer {
    runtime: Weak<RuntimeContext>,
    identifier: String,
    user_id: String,
    state: Arc<Mutex<TimerState>>,
}

fn interval_ms(life_time: Duration) -> i64 {
    i64::try_from(life_time.as_millis()).unwrap_or(i64::MAX)
}

impl LifeCycleTimer {
    /// Creates a stopped timer for the store described by `properties`.
    pub fn new(runtime: &Arc<RuntimeContext>, properties: &DbProperties) -> Self {
        Self {
            runtime: Arc::downgrade(runtime),
            identifier: properties.auto_launch_identifier().to_owned(),
            user_id: properties.user_id().to_owned(),
            state: Arc::new(Mutex::new(TimerState {
                notifier: None,
                timer: None,
                life_time: runtime.config().life_cycle_time,
            })),
        }
    }

    fn runtime(&self) -> DbResult<Arc<RuntimeContext>> {
        self.runtime.upgrade().ok_or(DbError::NotInit {
            component: "runtime context",
        })
    }

    /// Installs `notifier` and restarts the countdown; `None` stops the timer.
    ///
    /// # Errors
    ///
    /// Returns `NotInit` if the runtime is gone, or the timer start error.
    pub fn register(&self, notifier: Option<LifeCycleNotifier>) -> DbResult<()> {
        self.stop();
        let Some(notifier) = notifier else {
            self.state.lock().notifier = None;
            tracing::debug!(identifier = short_id(&self.identifier), "life cycle notifier cleared");
            return Ok(());
        };
        self.state.lock().notifier = Some(notifier);
        self.start()
    }

    fn start(&self) -> DbResult<()> {
        let runtime = self.runtime()?;
        let mut state = self.state.lock();
        if state.timer.is_some() {
            return Ok(());
        }
        let weak_state = Arc::downgrade(&self.state);
        let identifier = self.identifier.clone();
        let user_id = self.user_id.clone();
        let action: TimerAction = Arc::new(move |_| {
            let Some(state) = weak_state.upgrade() else {
                return Err(DbError::NotFound);
            };
            let notifier = state.lock().notifier.clone();
            if let Some(notifier) = notifier {
                tracing::info!(identifier = short_id(&identifier), "store life time reached");
                notifier(&identifier, &user_id);
            }
            Ok(())
        });
        let timer = runtime.set_timer(interval_ms(state.life_time), action, None)?;
        state.timer = Some(timer);
        Ok(())
    }

    /// Restarts the countdown. A no-op while no notifier is registered.
    ///
    /// # Errors
    ///
    /// Returns `NotInit` if the runtime is gone, or the timer restart error.
    pub fn heart_beat(&self) -> DbResult<()> {
        let (timer, life_time) = {
            let state = self.state.lock();
            (state.timer, state.life_time)
        };
        let Some(timer) = timer else {
            return Ok(());
        };
        match self.runtime()?.modify_timer(timer, interval_ms(life_time)) {
            Err(DbError::NoSuchEntry) => {
                self.state.lock().timer = None;
                self.start()
            }
            other => other,
        }
    }

    /// Changes the life time, applying it to a running countdown.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` for a zero duration, or the timer restart error.
    pub fn set_life_cycle_time(&self, life_time: Duration) -> DbResult<()> {
        if life_time.is_zero() {
            return Err(DbError::invalid_args("life cycle time must be positive"));
        }
        let timer = {
            let mut state = self.state.lock();
            state.life_time = life_time;
            state.timer
        };
        match timer {
            Some(timer) => self.runtime()?.modify_timer(timer, interval_ms(life_time)),
            None => Ok(()),
        }
    }

    /// Returns true while the countdown runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    /// Stops the countdown and waits for a firing notifier to return.
    pub fn stop(&self) {
        let timer = self.state.lock().timer.take();
        if let (Some(timer), Some(runtime)) = (timer, self.runtime.upgrade()) {
            runtime.remove_timer(timer, true);
        }
    }
}

impl Drop for LifeCycleTimer {
    fn drop(&mut self) {
        let timer = self.state.lock().timer.take();
        if let (Some(timer), Some(runtime)) = (timer, self.runtime.upgrade()) {
            runtime.remove_timer(timer, false);
        }
    }
}
