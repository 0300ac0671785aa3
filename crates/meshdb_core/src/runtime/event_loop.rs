//! Single-thread timer loop.

use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Timer identifier; never 0.
pub type TimerId = u64;

/// Repeating timer body. An error removes the timer.
pub type TimerAction = Arc<dyn Fn(TimerId) -> DbResult<()> + Send + Sync>;

/// Runs once when a timer is removed.
pub type TimerFinalizer = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    interval: Duration,
    deadline: Instant,
    action: TimerAction,
    finalizer: Option<TimerFinalizer>,
    // Set when removed while firing; the loop drops it afterwards.
    detached: bool,
}

struct LoopState {
    timers: HashMap<TimerId, TimerEntry>,
    current_id: TimerId,
    firing: Option<TimerId>,
    stopped: bool,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

struct LoopInner {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    fired: Condvar,
}

/// Drives every runtime timer from one background thread.
///
/// Timers repeat every `interval` until removed. [`EventLoop::remove_timer`]
/// with `wait = true` blocks until an in-flight firing of that timer
/// returns, unless called from the loop thread itself.
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Spawns the loop thread.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the thread cannot be spawned.
    pub fn start(name: &str) -> DbResult<Self> {
        let inner = Arc::new(LoopInner {
            state: Mutex::new(LoopState {
                timers: HashMap::new(),
                current_id: 0,
                firing: None,
                stopped: false,
                thread: None,
                thread_id: None,
            }),
            wakeup: Condvar::new(),
            fired: Condvar::new(),
        });
        let runner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(&runner))
            .map_err(|err| DbError::internal(format!("spawn event loop: {err}")))?;
        {
            let mut state = inner.state.lock();
            state.thread_id = Some(handle.thread().id());
            state.thread = Some(handle);
        }
        tracing::debug!(name, "event loop started");
        Ok(Self { inner })
    }

    /// Adds a repeating timer.
    ///
    /// # Errors
    ///
    /// Returns `OutOfIds` if every id is taken, `Stopped` after stop.
    pub fn add_timer(
        &self,
        interval: Duration,
        action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> DbResult<TimerId> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(DbError::Stopped {
                component: "event loop",
            });
        }
        let id = alloc_timer_id(&mut state)?;
        state.timers.insert(
            id,
            TimerEntry {
                interval,
                deadline: Instant::now() + interval,
                action,
                finalizer,
                detached: false,
            },
        );
        drop(state);
        self.inner.wakeup.notify_one();
        Ok(id)
    }

    /// Changes a timer's interval and restarts its countdown.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchEntry` if the timer is unknown.
    pub fn modify_timer(&self, id: TimerId, interval: Duration) -> DbResult<()> {
        let mut state = self.inner.state.lock();
        match state.timers.get_mut(&id) {
            Some(entry) if !entry.detached => {
                entry.interval = interval;
                entry.deadline = Instant::now() + interval;
            }
            _ => return Err(DbError::NoSuchEntry),
        }
        drop(state);
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Removes a timer. Unknown ids are ignored.
    pub fn remove_timer(&self, id: TimerId, wait: bool) {
        let mut state = self.inner.state.lock();
        if state.firing == Some(id) {
            if let Some(entry) = state.timers.get_mut(&id) {
                entry.detached = true;
            }
            let on_loop = state.thread_id == Some(thread::current().id());
            if wait && !on_loop {
                while state.firing == Some(id) {
                    self.inner.fired.wait(&mut state);
                }
            }
            return;
        }
        let Some(entry) = state.timers.remove(&id) else {
            return;
        };
        drop(state);
        self.inner.wakeup.notify_one();
        if let Some(finalizer) = entry.finalizer {
            finalizer();
        }
    }

    /// Returns true if `id` is live.
    #[must_use]
    pub fn contains(&self, id: TimerId) -> bool {
        self.inner
            .state
            .lock()
            .timers
            .get(&id)
            .is_some_and(|entry| !entry.detached)
    }

    /// Number of live timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .timers
            .values()
            .filter(|entry| !entry.detached)
            .count()
    }

    /// Stops the loop, joins its thread and runs pending finalizers.
    pub fn stop(&self) {
        let (handle, timers) = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            let timers: Vec<_> = state.timers.drain().collect();
            (state.thread.take(), timers)
        };
        self.inner.wakeup.notify_all();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("event loop exited by panic");
            }
        }
        for (_, entry) in timers {
            if let Some(finalizer) = entry.finalizer {
                finalizer();
            }
        }
    }

    #[cfg(test)]
    fn seed_timer_id(&self, id: TimerId) {
        self.inner.state.lock().current_id = id;
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn alloc_timer_id(state: &mut LoopState) -> DbResult<TimerId> {
    let start = state.current_id;
    loop {
        state.current_id = state.current_id.wrapping_add(1);
        if state.current_id == start {
            return Err(DbError::OutOfIds);
        }
        if state.current_id != 0 && !state.timers.contains_key(&state.current_id) {
            return Ok(state.current_id);
        }
    }
}

fn run(inner: &LoopInner) {
    let mut state = inner.state.lock();
    loop {
        if state.stopped {
            break;
        }
        let next = state
            .timers
            .iter()
            .filter(|(_, entry)| !entry.detached)
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(id, entry)| (*id, entry.deadline, Arc::clone(&entry.action)));
        let Some((id, deadline, action)) = next else {
            inner.wakeup.wait(&mut state);
            continue;
        };
        if deadline > Instant::now() {
            let _ = inner.wakeup.wait_until(&mut state, deadline);
            continue;
        }

        state.firing = Some(id);
        let result = parking_lot::MutexGuard::unlocked(&mut state, || action(id));
        state.firing = None;

        let drop_entry = match state.timers.get_mut(&id) {
            Some(entry) if entry.detached => true,
            Some(entry) => match result {
                Ok(()) => {
                    entry.deadline = Instant::now() + entry.interval;
                    false
                }
                Err(err) => {
                    tracing::debug!(timer = id, error = %err, "timer action failed, removing");
                    true
                }
            },
            None => false,
        };
        let finalizer = if drop_entry {
            state.timers.remove(&id).and_then(|entry| entry.finalizer)
        } else {
            None
        };
        inner.fired.notify_all();
        if let Some(finalizer) = finalizer {
            parking_lot::MutexGuard::unlocked(&mut state, finalizer);
        }
    }
}
