//! Stress helpers for MeshDB.
//!
//! These helpers drive the auto-launch manager and the cursor from
//! several threads and report what happened.

use meshdb_core::{
    AutoLaunchOption, ContinueToken, DataSizeSpec, DbError, DbProperties, DbResult,
    RuntimeContext, SyncDataReader,
};
use meshdb_storage::DataItem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations refused with `Busy`.
    pub busy_ops: usize,
    /// Other failures.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Busy: {}", self.busy_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Rounds each thread runs.
    pub rounds: usize,
    /// Number of concurrent threads.
    pub threads: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            rounds: 50,
            threads: 4,
        }
    }
}

#[derive(Default)]
struct Tally {
    ok: AtomicUsize,
    busy: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn record(&self, result: DbResult<()>) {
        let counter = match result {
            Ok(()) => &self.ok,
            Err(DbError::Busy) => &self.busy,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(self, duration: Duration) -> StressTestResult {
        let ok = self.ok.into_inner();
        let busy = self.busy.into_inner();
        let failed = self.failed.into_inner();
        StressTestResult {
            total_ops: ok + busy + failed,
            successful_ops: ok,
            busy_ops: busy,
            failed_ops: failed,
            duration,
        }
    }
}

/// Each thread enables and disables its own store `rounds` times.
///
/// Every operation must succeed: threads never share an item.
pub fn stress_enable_disable(runtime: &RuntimeContext, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();
    thread::scope(|scope| {
        for thread_id in 0..config.threads {
            let tally = &tally;
            scope.spawn(move || {
                let props = DbProperties::kv("u", "stress", &format!("store_{thread_id}"));
                for _ in 0..config.rounds {
                    tally.record(runtime.enable_auto_launch(
                        props.clone(),
                        None,
                        AutoLaunchOption::default(),
                    ));
                    tally.record(runtime.disable_auto_launch(
                        props.identifier(),
                        props.dual_tuple_identifier(),
                        props.user_id(),
                    ));
                }
            });
        }
    });
    tally.finish(start.elapsed())
}

/// All threads race to disable the same enabled store.
///
/// Exactly one disable succeeds; the rest see `Busy` or `NotFound`.
pub fn stress_concurrent_disable(
    runtime: &RuntimeContext,
    props: &DbProperties,
    threads: usize,
) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();
    thread::scope(|scope| {
        for _ in 0..threads {
            let tally = &tally;
            scope.spawn(move || {
                tally.record(runtime.disable_auto_launch(
                    props.identifier(),
                    props.dual_tuple_identifier(),
                    props.user_id(),
                ));
            });
        }
    });
    tally.finish(start.elapsed())
}

/// Follows `first` to the end, returning every page.
///
/// # Errors
///
/// The first failing page read.
pub fn drain_pages(
    reader: &SyncDataReader,
    first: DbResult<meshdb_core::SyncPage>,
    spec: DataSizeSpec,
) -> DbResult<Vec<Vec<DataItem>>> {
    let mut page = first?;
    let mut pages = Vec::new();
    loop {
        let token: Option<ContinueToken> = page.token.take();
        pages.push(std::mem::take(&mut page.items));
        match token {
            Some(token) => page = reader.get_sync_data_next(token, spec)?,
            None => return Ok(pages),
        }
    }
}
