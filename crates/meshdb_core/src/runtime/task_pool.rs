//! Bounded worker pool with serialized lanes.

use crate::error::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Lane {
    tasks: VecDeque<Task>,
    running: bool,
}

enum Job {
    Generic(Task),
    Queued(String, Task),
}

#[derive(Default)]
struct PoolState {
    generic: VecDeque<Task>,
    lanes: HashMap<String, Lane>,
    // Lanes with pending work and no running task; each tag at most once.
    ready_lanes: VecDeque<String>,
    idle: usize,
    threads: usize,
    handles: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl PoolState {
    fn pending(&self) -> usize {
        self.generic.len() + self.ready_lanes.len()
    }

    fn next_job(&mut self) -> Option<Job> {
        while let Some(tag) = self.ready_lanes.pop_front() {
            let Some(lane) = self.lanes.get_mut(&tag) else {
                continue;
            };
            if let Some(task) = lane.tasks.pop_front() {
                lane.running = true;
                return Some(Job::Queued(tag, task));
            }
        }
        self.generic.pop_front().map(Job::Generic)
    }
}

struct PoolInner {
    name: String,
    max_threads: usize,
    state: Mutex<PoolState>,
    has_task: Condvar,
}

/// Worker pool behind [`crate::RuntimeContext::schedule_task`].
///
/// Generic tasks run on any worker. Queued tasks sharing a lane tag run one
/// at a time in submission order, still asynchronously to the submitter.
/// Workers are spawned on demand up to `max_threads`; `min_threads` are
/// started eagerly by [`TaskPool::start`].
pub struct TaskPool {
    inner: Arc<PoolInner>,
    min_threads: usize,
}

impl TaskPool {
    /// Creates a pool without starting any worker.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` if `max_threads` is 0 or below `min_threads`.
    pub fn new(name: impl Into<String>, max_threads: usize, min_threads: usize) -> DbResult<Self> {
        if max_threads == 0 || min_threads > max_threads {
            return Err(DbError::invalid_args(format!(
                "task pool bounds min={min_threads} max={max_threads}"
            )));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                max_threads,
                state: Mutex::new(PoolState::default()),
                has_task: Condvar::new(),
            }),
            min_threads,
        })
    }

    /// Starts the minimum number of workers.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after [`TaskPool::stop`], or `Internal` if no
    /// worker thread could be spawned.
    pub fn start(&self) -> DbResult<()> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(DbError::Stopped {
                component: "task pool",
            });
        }
        while state.threads < self.min_threads {
            self.spawn_worker(&mut state)?;
        }
        tracing::debug!(pool = %self.inner.name, threads = state.threads, "task pool started");
        Ok(())
    }

    /// Submits a task for any worker.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` once the pool is stopped.
    pub fn schedule(&self, task: Task) -> DbResult<()> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(DbError::Stopped {
                component: "task pool",
            });
        }
        state.generic.push_back(task);
        self.wake_or_spawn(&mut state)
    }

    /// Submits a task to the lane `tag`.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` once the pool is stopped.
    pub fn schedule_queued(&self, tag: &str, task: Task) -> DbResult<()> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(DbError::Stopped {
                component: "task pool",
            });
        }
        let lane = state.lanes.entry(tag.to_owned()).or_default();
        lane.tasks.push_back(task);
        let became_ready = !lane.running && lane.tasks.len() == 1;
        if became_ready {
            state.ready_lanes.push_back(tag.to_owned());
        }
        self.wake_or_spawn(&mut state)
    }

    fn wake_or_spawn(&self, state: &mut PoolState) -> DbResult<()> {
        if state.idle < state.pending() && state.threads < self.inner.max_threads {
            if let Err(err) = self.spawn_worker(state) {
                // Work still drains if any worker is alive.
                if state.threads == 0 {
                    return Err(err);
                }
                tracing::warn!(pool = %self.inner.name, error = %err, "extra worker not spawned");
            }
        }
        self.inner.has_task.notify_one();
        Ok(())
    }

    fn spawn_worker(&self, state: &mut PoolState) -> DbResult<()> {
        let inner = Arc::clone(&self.inner);
        let index = state.threads;
        let handle = thread::Builder::new()
            .name(format!("{}-{index}", self.inner.name))
            .spawn(move || worker_loop(&inner))
            .map_err(|err| DbError::internal(format!("spawn worker: {err}")))?;
        state.threads += 1;
        state.handles.push(handle);
        Ok(())
    }

    /// Stops accepting work, lets workers drain what is queued and joins them.
    ///
    /// Safe to call from a worker thread; that worker is not joined.
    pub fn stop(&self) {
        let handles = {
            let mut state = self.inner.state.lock();
            if state.stopped && state.handles.is_empty() {
                return;
            }
            state.stopped = true;
            std::mem::take(&mut state.handles)
        };
        self.inner.has_task.notify_all();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(pool = %self.inner.name, "worker exited by panic");
            }
        }
        tracing::debug!(pool = %self.inner.name, "task pool stopped");
    }

    /// Releases memory held by drained queues.
    pub fn shrink_memory(&self, description: &str) {
        let mut state = self.inner.state.lock();
        state.generic.shrink_to_fit();
        state.lanes.retain(|_, lane| lane.running || !lane.tasks.is_empty());
        state.lanes.shrink_to_fit();
        state.ready_lanes.shrink_to_fit();
        tracing::debug!(pool = %self.inner.name, %description, lanes = state.lanes.len(), "task pool shrunk");
    }

    /// Live worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.state.lock().threads
    }

    /// Returns true after [`TaskPool::stop`].
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_task(pool: &str, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!(%pool, "task panicked");
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut state = inner.state.lock();
            loop {
                if let Some(job) = state.next_job() {
                    break Some(job);
                }
                if state.stopped {
                    break None;
                }
                state.idle += 1;
                inner.has_task.wait(&mut state);
                state.idle -= 1;
            }
        };
        match job {
            None => break,
            Some(Job::Generic(task)) => run_task(&inner.name, task),
            Some(Job::Queued(tag, task)) => {
                run_task(&inner.name, task);
                let mut state = inner.state.lock();
                let has_more = match state.lanes.get_mut(&tag) {
                    Some(lane) => {
                        lane.running = false;
                        !lane.tasks.is_empty()
                    }
                    None => false,
                };
                if has_more {
                    state.ready_lanes.push_back(tag);
                    inner.has_task.notify_one();
                } else {
                    state.lanes.remove(&tag);
                }
            }
        }
    }
    inner.state.lock().threads -= 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn rejects_bad_bounds() {
        assert!(TaskPool::new("t", 0, 0).is_err());
        assert!(TaskPool::new("t", 2, 3).is_err());
    }

    #[test]
    fn runs_generic_tasks() {
        let pool = TaskPool::new("generic", 4, 1).unwrap();
        pool.start().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }))
            .unwrap();
        }
        for _ in 0..32 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
        assert!(pool.thread_count() <= 4);
    }

    #[test]
    fn queued_lane_is_serialized_in_order() {
        let pool = TaskPool::new("lanes", 4, 2).unwrap();
        pool.start().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            let running = Arc::clone(&running);
            let tx = tx.clone();
            pool.schedule_queued(
                "lane-a",
                Box::new(move || {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(1));
                    seen.lock().push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                }),
            )
            .unwrap();
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn stop_drains_and_rejects() {
        let pool = TaskPool::new("stop", 2, 1).unwrap();
        pool.start().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert!(pool.is_stopped());
        let err = pool.schedule(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, DbError::Stopped { .. }));
    }

    #[test]
    fn panicking_task_does_not_kill_lane() {
        let pool = TaskPool::new("panic", 1, 1).unwrap();
        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        pool.schedule_queued("l", Box::new(|| panic!("boom"))).unwrap();
        pool.schedule_queued("l", Box::new(move || tx.send(7).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.shrink_memory("test");
    }
}
