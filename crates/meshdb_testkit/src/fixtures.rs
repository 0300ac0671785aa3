//! Test fixtures and runtime helpers.
//!
//! Provides a runtime wired to mock collaborators, recording notifiers
//! and seeded stores for cursor tests.

use crate::mocks::{MockCommunicatorAggregator, MockConnectionManager};
use meshdb_core::{
    AutoLaunchNotifier, AutoLaunchStatus, CommunicatorAggregator, DbProperties, RuntimeConfig,
    RuntimeContext,
};
use meshdb_storage::{MemoryStore, Timestamp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A runtime with a mock connection manager and transport installed.
pub struct TestRuntime {
    /// The runtime under test.
    pub runtime: Arc<RuntimeContext>,
    /// Connection manager the auto-launch manager opens through.
    pub manager: Arc<MockConnectionManager>,
    /// Transport the auto-launch manager listens on.
    pub aggregator: Arc<MockCommunicatorAggregator>,
}

impl TestRuntime {
    /// Creates a runtime with a small thread pool.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::new().task_threads(2, 8))
    }

    /// Creates a runtime with `config`.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let runtime = RuntimeContext::new(config);
        let manager = Arc::new(MockConnectionManager::new());
        let aggregator = Arc::new(MockCommunicatorAggregator::new("local"));
        runtime.set_connection_manager(manager.clone());
        let transport: Arc<dyn CommunicatorAggregator> = aggregator.clone();
        runtime.set_communicator_aggregator(Some(transport));
        Self {
            runtime,
            manager,
            aggregator,
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestRuntime {
    type Target = RuntimeContext;

    fn deref(&self) -> &Self::Target {
        &self.runtime
    }
}

/// Collects auto-launch notifications.
#[derive(Clone, Default)]
pub struct NotificationLog {
    events: Arc<Mutex<Vec<(String, AutoLaunchStatus)>>>,
}

impl NotificationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier appending (store id, status) to this log.
    pub fn notifier(&self) -> AutoLaunchNotifier {
        let events = Arc::clone(&self.events);
        Arc::new(move |_user: &str, _app: &str, store: &str, status: AutoLaunchStatus| {
            events.lock().push((store.to_owned(), status));
        })
    }

    /// Statuses recorded so far, in order.
    pub fn statuses(&self) -> Vec<AutoLaunchStatus> {
        self.events.lock().iter().map(|(_, status)| *status).collect()
    }

    /// Number of times `status` was recorded.
    pub fn count(&self, status: AutoLaunchStatus) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, recorded)| *recorded == status)
            .count()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Properties of a key-value store named `store_id` for user `u` of app `app`.
pub fn kv_properties(store_id: &str) -> DbProperties {
    DbProperties::kv("u", "app", store_id)
}

/// A store holding `k0..k{count-1}`, then tombstones for `deleted`.
pub fn seeded_store(count: usize, deleted: std::ops::Range<usize>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..count {
        let key = format!("k{i}");
        store
            .put(key.as_bytes(), format!("v{i}").as_bytes())
            .expect("seed put");
    }
    for i in deleted {
        let key = format!("k{i}");
        store.delete(key.as_bytes()).expect("seed delete");
    }
    store
}

/// End of a range covering every timestamp a test store hands out.
pub const ALL_TIME: Timestamp = i64::MAX as Timestamp;

/// A temporary data directory removed on drop.
pub struct TempDataDir {
    dir: TempDir,
}

impl TempDataDir {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// The directory path.
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

impl Default for TempDataDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshdb_storage::{ScanFilter, SyncSource};

    #[test]
    fn seeded_store_has_tombstones() {
        let store = seeded_store(10, 2..5);
        let deleted = store.scan(None, 0, ALL_TIME, ScanFilter::Deleted).unwrap();
        assert_eq!(deleted.len(), 3);
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(20), || false));
        assert!(wait_until(Duration::from_millis(20), || true));
    }

    #[test]
    fn runtime_installs_transport() {
        let test = TestRuntime::new();
        assert!(test.aggregator.has_callbacks());
        assert_eq!(test.local_identity().unwrap(), "local");
    }
}
