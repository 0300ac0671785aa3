//! System clock jump detection.

use super::event_loop::{EventLoop, TimerId};
use super::notification::{EventType, Listener, ListenerAction, NotificationChain};
use crate::error::DbResult;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Signed wall-clock jump in milliseconds.
pub type TimeOffset = i64;

const TIME_CHANGE_EVENT: EventType = 0;

struct TickState {
    wall_ms: i64,
    mono: Instant,
}

impl TickState {
    fn now() -> Self {
        Self {
            wall_ms: wall_clock_ms(),
            mono: Instant::now(),
        }
    }
}

fn wall_clock_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_millis()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

/// Polls the wall clock against the monotonic clock and reports jumps.
pub struct TimeTickMonitor {
    chain: Arc<NotificationChain<TimeOffset>>,
    timer: Mutex<Option<(Arc<EventLoop>, TimerId)>>,
}

impl TimeTickMonitor {
    /// Starts polling on `event_loop` every `interval`; offsets whose
    /// magnitude exceeds `threshold` are broadcast.
    ///
    /// # Errors
    ///
    /// Returns the timer registration failure.
    pub fn start(
        event_loop: Arc<EventLoop>,
        interval: Duration,
        threshold: Duration,
    ) -> DbResult<Self> {
        let chain = Arc::new(NotificationChain::new());
        chain.register_event(TIME_CHANGE_EVENT)?;
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        let last = Mutex::new(TickState::now());
        let notify = Arc::clone(&chain);
        let timer = event_loop.add_timer(
            interval,
            Arc::new(move |_| {
                let now = TickState::now();
                let mut last = last.lock();
                let elapsed = i64::try_from(now.mono.duration_since(last.mono).as_millis())
                    .unwrap_or(i64::MAX);
                let offset = now.wall_ms - last.wall_ms - elapsed;
                *last = now;
                drop(last);
                if offset.abs() > threshold_ms {
                    tracing::info!(offset_ms = offset, "system time changed");
                    notify.notify(TIME_CHANGE_EVENT, &offset);
                }
                Ok(())
            }),
            None,
        )?;
        tracing::debug!(timer, "time tick monitor started");
        Ok(Self {
            chain,
            timer: Mutex::new(Some((event_loop, timer))),
        })
    }

    /// Subscribes to time changes.
    ///
    /// # Errors
    ///
    /// Never fails once started; kept fallible for the registry contract.
    pub fn register_time_changed_listener(
        &self,
        action: ListenerAction<TimeOffset>,
    ) -> DbResult<Listener> {
        self.chain.register_listener(TIME_CHANGE_EVENT, action)
    }

    /// Broadcasts an externally detected change.
    pub fn notify_time_change(&self, offset: TimeOffset) {
        self.chain.notify(TIME_CHANGE_EVENT, &offset);
    }

    /// Returns true if nobody listens.
    #[must_use]
    pub fn is_empty_listener(&self) -> bool {
        self.chain.is_empty_listener(TIME_CHANGE_EVENT)
    }

    /// Stops polling.
    pub fn stop(&self) {
        if let Some((event_loop, timer)) = self.timer.lock().take() {
            event_loop.remove_timer(timer, true);
        }
    }
}

impl Drop for TimeTickMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn manual_notify_reaches_listener() {
        let event_loop = Arc::new(EventLoop::start("tick-test").unwrap());
        let monitor = TimeTickMonitor::start(
            Arc::clone(&event_loop),
            Duration::from_millis(10),
            Duration::from_secs(3600),
        )
        .unwrap();
        assert!(monitor.is_empty_listener());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener = monitor
            .register_time_changed_listener(Arc::new(move |offset| {
                let _ = tx.lock().send(*offset);
            }))
            .unwrap();
        monitor.notify_time_change(-1500);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), -1500);
        drop(listener);
        assert!(monitor.is_empty_listener());
        monitor.stop();
        assert_eq!(event_loop.timer_count(), 0);
    }
}
