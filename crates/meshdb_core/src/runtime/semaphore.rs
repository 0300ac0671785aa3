//! Counting semaphore.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore that may start negative.
///
/// Starting at `1 - n` makes [`Semaphore::wait`] return only after `n`
/// calls to [`Semaphore::signal`].
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<i64>,
    cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the given count.
    #[must_use]
    pub fn new(count: i64) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Adds one permit.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count <= 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`Semaphore::wait`] with a timeout. Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        while *count <= 0 {
            if self.cond.wait_for(&mut count, timeout).timed_out() && *count <= 0 {
                return false;
            }
        }
        *count -= 1;
        true
    }
}
