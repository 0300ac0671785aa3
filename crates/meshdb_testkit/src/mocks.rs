//! In-memory collaborators for the runtime and auto-launch manager.
//!
//! Every mock records what was done to it so tests can assert on the
//! exact sequence of registrations, opens and releases.

use meshdb_core::{
    AccessEventCallback, ChangedData, CommitObserver, CommunicatorAdapter, CommunicatorAggregator,
    ConflictEntry, ConflictNotifier, ConnectionManager, DbError, DbProperties, DbResult,
    KvConnection, LackCallback, LifeCycleNotifier, LifeCycleTimer, ObserverHandle,
    OnConnectCallback, Pragma, ProcessSystemApiAdapter, RelationalConnection, RuntimeContext,
    SecurityOption, StoreConnection, StoreType, OBSERVER_CHANGES_FOREIGN, OBSERVER_CHANGES_NATIVE,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Where a connection sends its lifecycle notifier.
enum LifeCycleSink {
    /// Kept until [`MockKvConnection::fire_life_cycle`] is called.
    Manual(Mutex<Option<LifeCycleNotifier>>),
    /// Driven by a real idle timer.
    Timer(LifeCycleTimer),
}

impl LifeCycleSink {
    fn new(runtime: Option<&Arc<RuntimeContext>>, properties: &DbProperties) -> Self {
        match runtime {
            Some(runtime) => Self::Timer(LifeCycleTimer::new(runtime, properties)),
            None => Self::Manual(Mutex::new(None)),
        }
    }

    fn register(&self, notifier: Option<LifeCycleNotifier>) -> DbResult<()> {
        match self {
            Self::Manual(slot) => {
                *slot.lock() = notifier;
                Ok(())
            }
            Self::Timer(timer) => timer.register(notifier),
        }
    }

    fn is_registered(&self) -> bool {
        match self {
            Self::Manual(slot) => slot.lock().is_some(),
            Self::Timer(timer) => timer.is_running(),
        }
    }

    fn fire(&self, identifier: &str, user_id: &str) -> bool {
        let Self::Manual(slot) = self else {
            return false;
        };
        let notifier = slot.lock().clone();
        match notifier {
            Some(notifier) => {
                notifier(identifier, user_id);
                true
            }
            None => false,
        }
    }

    fn heart_beat(&self) {
        if let Self::Timer(timer) = self {
            let _ = timer.heart_beat();
        }
    }
}

struct KvObserver {
    mask: u32,
    key: Vec<u8>,
    observer: CommitObserver,
}

/// A key-value connection that records registrations.
pub struct MockKvConnection {
    properties: DbProperties,
    life_cycle: LifeCycleSink,
    observers: Mutex<BTreeMap<u64, KvObserver>>,
    next_handle: AtomicU64,
    conflict: Mutex<Option<(u32, ConflictNotifier)>>,
    auto_sync: Mutex<Option<bool>>,
    fail_register_observer: AtomicBool,
}

impl MockKvConnection {
    /// Creates a connection. With a runtime, the lifecycle notifier is
    /// driven by a real [`LifeCycleTimer`].
    pub fn new(properties: DbProperties, runtime: Option<&Arc<RuntimeContext>>) -> Self {
        Self {
            life_cycle: LifeCycleSink::new(runtime, &properties),
            properties,
            observers: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            conflict: Mutex::new(None),
            auto_sync: Mutex::new(None),
            fail_register_observer: AtomicBool::new(false),
        }
    }

    /// Makes the next observer registrations fail.
    pub fn fail_register_observer(&self, fail: bool) {
        self.fail_register_observer.store(fail, Ordering::SeqCst);
    }

    /// Simulates a commit: calls every observer whose mask and key prefix match.
    /// A non-empty `device` marks the commit as synced in.
    pub fn commit(&self, data: &ChangedData) {
        self.life_cycle.heart_beat();
        let wanted = if data.device.is_empty() {
            OBSERVER_CHANGES_NATIVE
        } else {
            OBSERVER_CHANGES_FOREIGN
        };
        let observers: Vec<CommitObserver> = self
            .observers
            .lock()
            .values()
            .filter(|entry| entry.mask & wanted != 0)
            .filter(|entry| data.keys.iter().any(|key| key.starts_with(&entry.key)))
            .map(|entry| Arc::clone(&entry.observer))
            .collect();
        for observer in observers {
            observer(data);
        }
    }

    /// Calls the lifecycle notifier as the engine would. Returns false if
    /// none is registered or the notifier is timer driven.
    pub fn fire_life_cycle(&self) -> bool {
        self.life_cycle
            .fire(self.properties.auto_launch_identifier(), self.properties.user_id())
    }

    /// Calls the conflict notifier. Returns false if none is registered.
    pub fn fire_conflict(&self, entry: &ConflictEntry) -> bool {
        let notifier = self.conflict.lock().as_ref().map(|(_, n)| Arc::clone(n));
        match notifier {
            Some(notifier) => {
                notifier(entry);
                true
            }
            None => false,
        }
    }

    /// Returns true while a lifecycle notifier is installed.
    pub fn has_life_cycle_callback(&self) -> bool {
        self.life_cycle.is_registered()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Conflict type of the installed conflict notifier.
    pub fn conflict_type(&self) -> Option<u32> {
        self.conflict.lock().as_ref().map(|(conflict_type, _)| *conflict_type)
    }

    /// Last auto sync pragma applied.
    pub fn auto_sync(&self) -> Option<bool> {
        *self.auto_sync.lock()
    }

    /// Properties the connection was opened with.
    pub fn properties(&self) -> &DbProperties {
        &self.properties
    }
}

impl KvConnection for MockKvConnection {
    fn register_lifecycle_callback(&self, notifier: Option<LifeCycleNotifier>) -> DbResult<()> {
        self.life_cycle.register(notifier)
    }

    fn register_observer(
        &self,
        mask: u32,
        key: &[u8],
        observer: CommitObserver,
    ) -> DbResult<ObserverHandle> {
        if self.fail_register_observer.load(Ordering::SeqCst) {
            return Err(DbError::internal("observer registration rejected"));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().insert(
            handle,
            KvObserver {
                mask,
                key: key.to_vec(),
                observer,
            },
        );
        Ok(ObserverHandle(handle))
    }

    fn unregister_observer(&self, handle: ObserverHandle) -> DbResult<()> {
        self.observers
            .lock()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(DbError::NotFound)
    }

    fn set_conflict_notifier(
        &self,
        conflict_type: u32,
        notifier: Option<ConflictNotifier>,
    ) -> DbResult<()> {
        *self.conflict.lock() = notifier.map(|notifier| (conflict_type, notifier));
        Ok(())
    }

    fn pragma(&self, pragma: Pragma) -> DbResult<()> {
        match pragma {
            Pragma::AutoSync(enabled) => *self.auto_sync.lock() = Some(enabled),
        }
        Ok(())
    }
}

/// A relational connection that records registrations.
pub struct MockRelationalConnection {
    properties: DbProperties,
    life_cycle: LifeCycleSink,
    observer: Mutex<Option<CommitObserver>>,
    closed: AtomicBool,
}

impl MockRelationalConnection {
    /// Creates an open connection.
    pub fn new(properties: DbProperties, runtime: Option<&Arc<RuntimeContext>>) -> Self {
        Self {
            life_cycle: LifeCycleSink::new(runtime, &properties),
            properties,
            observer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulates a commit.
    pub fn commit(&self, data: &ChangedData) {
        self.life_cycle.heart_beat();
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(data);
        }
    }

    /// Calls the lifecycle notifier as the engine would.
    pub fn fire_life_cycle(&self) -> bool {
        self.life_cycle
            .fire(self.properties.auto_launch_identifier(), self.properties.user_id())
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true while an observer is installed.
    pub fn has_observer(&self) -> bool {
        self.observer.lock().is_some()
    }

    /// Properties the connection was opened with.
    pub fn properties(&self) -> &DbProperties {
        &self.properties
    }
}

impl RelationalConnection for MockRelationalConnection {
    fn register_lifecycle_callback(&self, notifier: Option<LifeCycleNotifier>) -> DbResult<()> {
        self.life_cycle.register(notifier)
    }

    fn register_observer(&self, observer: CommitObserver) -> DbResult<()> {
        *self.observer.lock() = Some(observer);
        Ok(())
    }

    fn unregister_observer(&self) -> DbResult<()> {
        *self.observer.lock() = None;
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DbError::NotFound);
        }
        *self.observer.lock() = None;
        Ok(())
    }
}

/// Connection manager handing out mock connections.
#[derive(Default)]
pub struct MockConnectionManager {
    runtime: Mutex<Option<Weak<RuntimeContext>>>,
    owned_elsewhere: Mutex<BTreeSet<String>>,
    fail_open: Mutex<Option<DbError>>,
    fail_release: AtomicBool,
    open_delay: Mutex<Duration>,
    kv: Mutex<BTreeMap<String, Vec<Arc<MockKvConnection>>>>,
    relational: Mutex<BTreeMap<String, Vec<Arc<MockRelationalConnection>>>>,
    opens: AtomicUsize,
    releases: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockConnectionManager {
    /// Creates a manager whose connections keep lifecycle notifiers until
    /// fired by hand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive lifecycle notifiers with real idle timers of `runtime`.
    pub fn use_life_cycle_timers(&self, runtime: &Arc<RuntimeContext>) {
        *self.runtime.lock() = Some(Arc::downgrade(runtime));
    }

    /// Pretends the store with `identifier` is held by its owner.
    pub fn set_owned_elsewhere(&self, identifier: &str, owned: bool) {
        let mut set = self.owned_elsewhere.lock();
        if owned {
            set.insert(identifier.to_owned());
        } else {
            set.remove(identifier);
        }
    }

    /// Makes every open fail with `err` until cleared.
    pub fn set_open_error(&self, err: Option<DbError>) {
        *self.fail_open.lock() = err;
    }

    /// Makes every release fail.
    pub fn set_release_fails(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Sleeps this long inside every open.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Releases so far.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Largest number of opens that ran at the same time.
    pub fn max_concurrent_opens(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Most recent key-value connection opened for `identifier`.
    pub fn last_kv(&self, identifier: &str) -> Option<Arc<MockKvConnection>> {
        self.kv.lock().get(identifier).and_then(|conns| conns.last().cloned())
    }

    /// Most recent relational connection opened for `identifier`.
    pub fn last_relational(&self, identifier: &str) -> Option<Arc<MockRelationalConnection>> {
        self.relational
            .lock()
            .get(identifier)
            .and_then(|conns| conns.last().cloned())
    }

    fn runtime(&self) -> Option<Arc<RuntimeContext>> {
        self.runtime.lock().as_ref().and_then(Weak::upgrade)
    }

    fn open(&self, properties: &DbProperties) -> DbResult<StoreConnection> {
        let identifier = properties.auto_launch_identifier().to_owned();
        let runtime = self.runtime();
        let connection = match properties.store_type() {
            StoreType::Kv => {
                let conn = Arc::new(MockKvConnection::new(properties.clone(), runtime.as_ref()));
                self.kv
                    .lock()
                    .entry(identifier)
                    .or_default()
                    .push(Arc::clone(&conn));
                StoreConnection::Kv(conn)
            }
            StoreType::Relational => {
                let conn = Arc::new(MockRelationalConnection::new(
                    properties.clone(),
                    runtime.as_ref(),
                ));
                self.relational
                    .lock()
                    .entry(identifier)
                    .or_default()
                    .push(Arc::clone(&conn));
                StoreConnection::Relational(conn)
            }
        };
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }
}

impl ConnectionManager for MockConnectionManager {
    fn get_connection(
        &self,
        properties: &DbProperties,
        allow_already_open: bool,
    ) -> DbResult<StoreConnection> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let result = if let Some(err) = self.fail_open.lock().clone() {
            Err(err)
        } else if !allow_already_open
            && self
                .owned_elsewhere
                .lock()
                .contains(properties.auto_launch_identifier())
        {
            Err(DbError::AlreadyOpened)
        } else {
            self.open(properties)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn release_connection(&self, _connection: StoreConnection) -> DbResult<()> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(DbError::Busy);
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport that lets tests bring devices online and send unknown labels.
pub struct MockCommunicatorAggregator {
    identity: String,
    on_connect: Mutex<Option<OnConnectCallback>>,
    on_lack: Mutex<Option<LackCallback>>,
}

impl MockCommunicatorAggregator {
    /// Creates a transport with the given local identity.
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_owned(),
            on_connect: Mutex::new(None),
            on_lack: Mutex::new(None),
        }
    }

    /// Reports `device` online.
    pub fn device_online(&self, device: &str) {
        let callback = self.on_connect.lock().clone();
        if let Some(callback) = callback {
            callback(device, true);
        }
    }

    /// Reports `device` gone.
    pub fn device_offline(&self, device: &str) {
        let callback = self.on_connect.lock().clone();
        if let Some(callback) = callback {
            callback(device, false);
        }
    }

    /// Delivers traffic for a label nobody listens on.
    ///
    /// # Errors
    ///
    /// `NotFound` without a registered callback, otherwise the callback's answer.
    pub fn receive_unknown(&self, label: &str, user_id: &str) -> DbResult<()> {
        let callback = self.on_lack.lock().clone();
        match callback {
            Some(callback) => callback(label, user_id),
            None => Err(DbError::NotFound),
        }
    }

    /// Returns true while both callbacks are registered.
    pub fn has_callbacks(&self) -> bool {
        self.on_connect.lock().is_some() && self.on_lack.lock().is_some()
    }
}

impl CommunicatorAggregator for MockCommunicatorAggregator {
    fn register_on_connect(&self, callback: Option<OnConnectCallback>) -> DbResult<()> {
        *self.on_connect.lock() = callback;
        Ok(())
    }

    fn register_lack_callback(&self, callback: Option<LackCallback>) -> DbResult<()> {
        *self.on_lack.lock() = callback;
        Ok(())
    }

    fn local_identity(&self) -> DbResult<String> {
        Ok(self.identity.clone())
    }
}

/// Adapter producing one shared [`MockCommunicatorAggregator`].
pub struct MockCommunicatorAdapter {
    aggregator: Arc<MockCommunicatorAggregator>,
    created: AtomicUsize,
}

impl MockCommunicatorAdapter {
    /// Creates an adapter whose aggregator reports `identity`.
    pub fn new(identity: &str) -> Self {
        Self {
            aggregator: Arc::new(MockCommunicatorAggregator::new(identity)),
            created: AtomicUsize::new(0),
        }
    }

    /// The aggregator handed out by this adapter.
    pub fn aggregator(&self) -> Arc<MockCommunicatorAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Number of aggregators created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl CommunicatorAdapter for MockCommunicatorAdapter {
    fn create_aggregator(&self) -> DbResult<Arc<dyn CommunicatorAggregator>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let aggregator: Arc<dyn CommunicatorAggregator> = self.aggregator.clone();
        Ok(aggregator)
    }
}

/// Platform layer with a switchable lock state and an in-memory label table.
#[derive(Default)]
pub struct MockSystemApiAdapter {
    locked: AtomicBool,
    reject_event: AtomicBool,
    deny_devices: Mutex<BTreeSet<String>>,
    callback: Mutex<Option<AccessEventCallback>>,
    labels: Mutex<BTreeMap<PathBuf, SecurityOption>>,
}

impl MockSystemApiAdapter {
    /// Creates an unlocked adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes the lock state and reports it.
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(locked);
        }
    }

    /// Makes event registration fail.
    pub fn reject_event_registration(&self, reject: bool) {
        self.reject_event.store(reject, Ordering::SeqCst);
    }

    /// Marks `device` as unable to hold labelled data.
    pub fn deny_device(&self, device: &str) {
        self.deny_devices.lock().insert(device.to_owned());
    }

    /// Stores a label directly, bypassing path checks.
    pub fn put_label(&self, path: &Path, option: SecurityOption) {
        self.labels.lock().insert(path.to_path_buf(), option);
    }

    /// Returns true while a lock state callback is installed.
    pub fn has_event_callback(&self) -> bool {
        self.callback.lock().is_some()
    }
}

impl ProcessSystemApiAdapter for MockSystemApiAdapter {
    fn register_access_controlled_event(&self, callback: Option<AccessEventCallback>) -> DbResult<()> {
        if self.reject_event.load(Ordering::SeqCst) {
            return Err(DbError::NotSupport);
        }
        *self.callback.lock() = callback;
        Ok(())
    }

    fn is_access_controlled(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn set_security_option(&self, path: &Path, option: SecurityOption) -> DbResult<()> {
        self.labels.lock().insert(path.to_path_buf(), option);
        Ok(())
    }

    fn get_security_option(&self, path: &Path) -> DbResult<SecurityOption> {
        Ok(self.labels.lock().get(path).copied().unwrap_or_default())
    }

    fn check_device_security_ability(&self, device: &str, _option: SecurityOption) -> bool {
        !self.deny_devices.lock().contains(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_observer_filters_by_mask_and_prefix() {
        let conn = MockKvConnection::new(DbProperties::kv("u", "a", "s"), None);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let observer: CommitObserver = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = conn
            .register_observer(OBSERVER_CHANGES_FOREIGN, b"user/", observer)
            .unwrap();

        let foreign = ChangedData {
            device: "peer".into(),
            keys: vec![b"user/1".to_vec()],
        };
        conn.commit(&foreign);
        conn.commit(&ChangedData {
            device: String::new(),
            keys: vec![b"user/1".to_vec()],
        });
        conn.commit(&ChangedData {
            device: "peer".into(),
            keys: vec![b"other".to_vec()],
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        conn.unregister_observer(handle).unwrap();
        assert_eq!(conn.unregister_observer(handle), Err(DbError::NotFound));
    }

    #[test]
    fn manager_reports_owned_stores() {
        let manager = MockConnectionManager::new();
        let props = DbProperties::kv("u", "a", "s");
        manager.set_owned_elsewhere(props.identifier(), true);
        assert!(matches!(
            manager.get_connection(&props, false),
            Err(DbError::AlreadyOpened)
        ));
        assert!(manager.get_connection(&props, true).is_ok());
        assert_eq!(manager.open_count(), 1);
        assert!(manager.last_kv(props.identifier()).is_some());
    }

    #[test]
    fn relational_close_is_single_shot() {
        let conn = MockRelationalConnection::new(DbProperties::relational("u", "a", "s"), None);
        assert!(conn.close().is_ok());
        assert!(conn.is_closed());
        assert!(conn.close().is_err());
    }
}
