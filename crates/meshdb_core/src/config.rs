//! Runtime and sync cursor configuration.

use std::time::Duration;

/// Configuration for a [`crate::RuntimeContext`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on task pool worker threads. Keep at least 2: the
    /// device-online batch parks one worker while its opens run.
    pub max_task_threads: usize,

    /// Worker threads started eagerly with the pool.
    pub min_task_threads: usize,

    /// Hard cap on explicitly enabled auto-launch items across all identifiers.
    pub max_auto_launch_items: usize,

    /// Idle time after which a store lifecycle timer reports "no more users".
    pub life_cycle_time: Duration,

    /// Polling interval of the time-tick monitor.
    pub time_tick_interval: Duration,

    /// Wall-clock drift that counts as a system time change.
    pub time_change_threshold: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_task_threads: 10,
            min_task_threads: 1,
            max_auto_launch_items: 8,
            life_cycle_time: Duration::from_secs(60),
            time_tick_interval: Duration::from_secs(1),
            time_change_threshold: Duration::from_secs(1),
        }
    }
}

impl RuntimeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker thread bounds.
    #[must_use]
    pub const fn task_threads(mut self, min: usize, max: usize) -> Self {
        self.min_task_threads = min;
        self.max_task_threads = max;
        self
    }

    /// Sets the auto-launch item cap.
    #[must_use]
    pub const fn max_auto_launch_items(mut self, value: usize) -> Self {
        self.max_auto_launch_items = value;
        self
    }

    /// Sets the store lifecycle idle time.
    #[must_use]
    pub const fn life_cycle_time(mut self, value: Duration) -> Self {
        self.life_cycle_time = value;
        self
    }

    /// Sets the time-tick polling interval.
    #[must_use]
    pub const fn time_tick_interval(mut self, value: Duration) -> Self {
        self.time_tick_interval = value;
        self
    }

    /// Sets the drift treated as a system time change.
    #[must_use]
    pub const fn time_change_threshold(mut self, value: Duration) -> Self {
        self.time_change_threshold = value;
        self
    }
}

/// Configuration for the sync data cursor.
#[derive(Debug, Clone)]
pub struct CursorConfig {
    /// Largest byte budget a caller may request for one page.
    pub max_sync_block_size: usize,

    /// Fraction of the byte budget live query data may fill before deleted
    /// data is no longer pulled into the same page.
    pub query_sync_threshold: f64,

    /// Extra per-item wire bytes counted on top of the source's own overhead.
    pub appended_len: usize,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            max_sync_block_size: 30 * 1024 * 1024, // 30 MB
            query_sync_threshold: 0.5,
            appended_len: 0,
        }
    }
}

impl CursorConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the largest allowed page byte budget.
    #[must_use]
    pub const fn max_sync_block_size(mut self, value: usize) -> Self {
        self.max_sync_block_size = value;
        self
    }

    /// Sets the live-data threshold before deleted data joins a page.
    #[must_use]
    pub fn query_sync_threshold(mut self, value: f64) -> Self {
        self.query_sync_threshold = value.clamp(0.0, 1.0);
        self
    }

    /// Sets the extra per-item wire bytes.
    #[must_use]
    pub const fn appended_len(mut self, value: usize) -> Self {
        self.appended_len = value;
        self
    }
}
