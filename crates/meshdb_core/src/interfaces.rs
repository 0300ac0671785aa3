//! Collaborator seams.
//!
//! The auto-launch manager and the runtime context never open files or
//! sockets themselves. They drive a storage engine, a transport and a
//! platform layer through the traits in this module. Production code plugs
//! in the real engine; tests plug in the mocks from `meshdb_testkit`.

use crate::error::DbResult;
use crate::types::{DbProperties, SecurityOption, StoreType};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Called by a storage engine when the last user of a store went away.
/// Arguments are the store identifier and the user id.
pub type LifeCycleNotifier = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Called on every commit of an open connection.
pub type CommitObserver = Arc<dyn Fn(&ChangedData) + Send + Sync>;

/// Called for every conflict the engine resolved.
pub type ConflictNotifier = Arc<dyn Fn(&ConflictEntry) + Send + Sync>;

/// Called by the transport when a device connects (`true`) or leaves (`false`).
pub type OnConnectCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Called by the transport for traffic to an identifier (label) nobody
/// listens on. An error means "not handled", never a fatal condition.
pub type LackCallback = Arc<dyn Fn(&str, &str) -> DbResult<()> + Send + Sync>;

/// Called by the platform when the device lock state changes.
pub type AccessEventCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Application notification for auto-launched stores: user, app, store, status.
pub type AutoLaunchNotifier = Arc<dyn Fn(&str, &str, &str, AutoLaunchStatus) + Send + Sync>;

/// Asked whether an unknown identifier should be opened on demand.
///
/// The callback fills in the parameter and returns true to accept.
pub type AutoLaunchRequestCallback = Arc<dyn Fn(&str, &mut AutoLaunchParam) -> bool + Send + Sync>;

/// Observer registration mask bit for local commits.
pub const OBSERVER_CHANGES_NATIVE: u32 = 0x01;
/// Observer registration mask bit for synced-in commits.
pub const OBSERVER_CHANGES_FOREIGN: u32 = 0x02;

/// Keys touched by one commit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangedData {
    /// Device the change came from; empty for local commits.
    pub device: String,
    /// Changed keys.
    pub keys: Vec<Vec<u8>>,
}

/// One resolved conflict.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConflictEntry {
    /// Conflict kind bits.
    pub conflict_type: u32,
    /// Conflicting key.
    pub key: Vec<u8>,
    /// Value before resolution.
    pub old_value: Option<Vec<u8>>,
    /// Value after resolution.
    pub new_value: Option<Vec<u8>>,
}

impl ConflictEntry {
    /// Conflict between two foreign writes.
    pub const FOREIGN_KEY_ONLY: u32 = 0x01;
    /// Foreign write overwriting a foreign original.
    pub const FOREIGN_KEY_ORIG: u32 = 0x02;
    /// Foreign write against a native record.
    pub const NATIVE_ALL: u32 = 0x0c;
}

/// Application-level change observer attached to an auto-launched store.
pub trait StoreObserver: Send + Sync {
    /// Called synchronously on the commit thread.
    fn on_change(&self, data: &ChangedData);
}

/// Opaque handle of a registered commit observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(pub u64);

/// Connection pragmas auto-launch issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pragma {
    /// Turn background auto sync on or off.
    AutoSync(bool),
}

/// An open key-value store connection.
pub trait KvConnection: Send + Sync {
    /// Install (or clear) the "no more users" notifier.
    fn register_lifecycle_callback(&self, notifier: Option<LifeCycleNotifier>) -> DbResult<()>;

    /// Watch commits whose keys start with `key`.
    fn register_observer(
        &self,
        mask: u32,
        key: &[u8],
        observer: CommitObserver,
    ) -> DbResult<ObserverHandle>;

    /// Stop a commit observer.
    fn unregister_observer(&self, handle: ObserverHandle) -> DbResult<()>;

    /// Install (or clear) the conflict notifier for conflicts in `conflict_type`.
    fn set_conflict_notifier(
        &self,
        conflict_type: u32,
        notifier: Option<ConflictNotifier>,
    ) -> DbResult<()>;

    /// Apply a pragma.
    fn pragma(&self, pragma: Pragma) -> DbResult<()>;
}

/// An open relational store connection.
pub trait RelationalConnection: Send + Sync {
    /// Install (or clear) the "no more users" notifier.
    fn register_lifecycle_callback(&self, notifier: Option<LifeCycleNotifier>) -> DbResult<()>;

    /// Watch all commits.
    fn register_observer(&self, observer: CommitObserver) -> DbResult<()>;

    /// Stop the commit observer.
    fn unregister_observer(&self) -> DbResult<()>;

    /// Close the connection.
    fn close(&self) -> DbResult<()>;
}

/// A connection of either store kind.
#[derive(Clone)]
pub enum StoreConnection {
    /// Key-value connection.
    Kv(Arc<dyn KvConnection>),
    /// Relational connection.
    Relational(Arc<dyn RelationalConnection>),
}

impl StoreConnection {
    /// Store kind of this connection.
    #[must_use]
    pub fn store_type(&self) -> StoreType {
        match self {
            Self::Kv(_) => StoreType::Kv,
            Self::Relational(_) => StoreType::Relational,
        }
    }

    /// Install (or clear) the lifecycle notifier on either kind.
    pub fn register_lifecycle_callback(&self, notifier: Option<LifeCycleNotifier>) -> DbResult<()> {
        match self {
            Self::Kv(conn) => conn.register_lifecycle_callback(notifier),
            Self::Relational(conn) => conn.register_lifecycle_callback(notifier),
        }
    }

    /// Returns true if both values refer to the same underlying connection.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Kv(a), Self::Kv(b)) => Arc::ptr_eq(a, b),
            (Self::Relational(a), Self::Relational(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kv(_) => f.write_str("StoreConnection::Kv"),
            Self::Relational(_) => f.write_str("StoreConnection::Relational"),
        }
    }
}

/// Opens and releases store connections.
///
/// Calls for different identifiers may run concurrently; the implementation
/// serializes calls for the same identifier.
pub trait ConnectionManager: Send + Sync {
    /// Open a connection.
    ///
    /// Returns [`crate::DbError::AlreadyOpened`] when another owner holds the
    /// store and `allow_already_open` is false.
    fn get_connection(
        &self,
        properties: &DbProperties,
        allow_already_open: bool,
    ) -> DbResult<StoreConnection>;

    /// Release a key-value connection obtained from [`ConnectionManager::get_connection`].
    fn release_connection(&self, connection: StoreConnection) -> DbResult<()>;
}

/// The device transport as seen by auto-launch.
pub trait CommunicatorAggregator: Send + Sync {
    /// Install (or clear) the device online/offline callback.
    fn register_on_connect(&self, callback: Option<OnConnectCallback>) -> DbResult<()>;

    /// Install (or clear) the unknown-label callback.
    fn register_lack_callback(&self, callback: Option<LackCallback>) -> DbResult<()>;

    /// Identity of this device on the transport.
    fn local_identity(&self) -> DbResult<String>;
}

/// Builds a [`CommunicatorAggregator`] on top of a platform transport.
pub trait CommunicatorAdapter: Send + Sync {
    /// Create and initialize an aggregator.
    fn create_aggregator(&self) -> DbResult<Arc<dyn CommunicatorAggregator>>;
}

/// Platform security and lock-state services.
pub trait ProcessSystemApiAdapter: Send + Sync {
    /// Install (or clear) the lock state callback.
    fn register_access_controlled_event(&self, callback: Option<AccessEventCallback>) -> DbResult<()>;

    /// Returns true while the device is locked.
    fn is_access_controlled(&self) -> bool;

    /// Label a file.
    fn set_security_option(&self, path: &Path, option: SecurityOption) -> DbResult<()>;

    /// Read a file's label.
    fn get_security_option(&self, path: &Path) -> DbResult<SecurityOption>;

    /// Returns true if `device` may hold data labelled `option`.
    fn check_device_security_ability(&self, device: &str, option: SecurityOption) -> bool;
}

/// Write-open state changes reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoLaunchStatus {
    /// The first commit after an auto-launch open happened.
    WriteOpened,
    /// An auto-launched store that reported `WriteOpened` was closed.
    WriteClosed,
    /// The parameters returned by a request callback were unusable.
    InvalidParam,
}

/// How auto-launch should treat an opened store.
#[derive(Clone)]
pub struct AutoLaunchOption {
    /// Observer attached once the store is open.
    pub observer: Option<Arc<dyn StoreObserver>>,
    /// Conflict kinds the conflict notifier wants; 0 disables it.
    pub conflict_type: u32,
    /// Conflict notifier, key-value stores only.
    pub conflict_notifier: Option<ConflictNotifier>,
    /// Turn on background sync after open.
    pub is_auto_sync: bool,
    /// Key the store by the (app, store) tuple.
    pub sync_dual_tuple_mode: bool,
    /// Data directory of an on-demand key-value store.
    pub data_dir: PathBuf,
    /// Security option of an on-demand store.
    pub security_option: SecurityOption,
}

impl Default for AutoLaunchOption {
    fn default() -> Self {
        Self {
            observer: None,
            conflict_type: 0,
            conflict_notifier: None,
            is_auto_sync: true,
            sync_dual_tuple_mode: false,
            data_dir: PathBuf::new(),
            security_option: SecurityOption::default(),
        }
    }
}

impl fmt::Debug for AutoLaunchOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoLaunchOption")
            .field("observer", &self.observer.is_some())
            .field("conflict_type", &self.conflict_type)
            .field("is_auto_sync", &self.is_auto_sync)
            .field("sync_dual_tuple_mode", &self.sync_dual_tuple_mode)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Parameters a request callback fills in for an on-demand open.
#[derive(Clone, Default)]
pub struct AutoLaunchParam {
    /// User id.
    pub user_id: String,
    /// App id.
    pub app_id: String,
    /// Store id.
    pub store_id: String,
    /// Open options.
    pub option: AutoLaunchOption,
    /// Application notifier.
    pub notifier: Option<AutoLaunchNotifier>,
    /// Database file of a relational store.
    pub path: PathBuf,
}

impl fmt::Debug for AutoLaunchParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoLaunchParam")
            .field("user_id", &self.user_id)
            .field("app_id", &self.app_id)
            .field("store_id", &self.store_id)
            .field("option", &self.option)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Identity handed to permission check callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PermissionCheckParam {
    /// User id.
    pub user_id: String,
    /// App id.
    pub app_id: String,
    /// Store id.
    pub store_id: String,
    /// Remote device.
    pub device_id: String,
    /// Instance id.
    pub instance_id: u32,
    /// Extra conditions from the permission condition callback.
    pub extra_conditions: BTreeMap<String, String>,
}

/// Identity handed to activation check and permission condition callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreIdentity {
    /// User id.
    pub user_id: String,
    /// App id.
    pub app_id: String,
    /// Store id.
    pub store_id: String,
    /// Instance id.
    pub instance_id: u32,
}

impl From<&DbProperties> for StoreIdentity {
    fn from(properties: &DbProperties) -> Self {
        Self {
            user_id: properties.user_id().to_owned(),
            app_id: properties.app_id().to_owned(),
            store_id: properties.store_id().to_owned(),
            instance_id: properties.instance_id(),
        }
    }
}

/// Permission check: user, app, store, flag.
pub type PermissionCheckCallback = Arc<dyn Fn(&str, &str, &str, u8) -> bool + Send + Sync>;
/// Permission check: user, app, store, device, flag.
pub type PermissionCheckCallbackV2 =
    Arc<dyn Fn(&str, &str, &str, &str, u8) -> bool + Send + Sync>;
/// Permission check with the full parameter set.
pub type PermissionCheckCallbackV3 = Arc<dyn Fn(&PermissionCheckParam, u8) -> bool + Send + Sync>;
/// Sync activation check: user, app, store.
pub type SyncActivationCheckCallback = Arc<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;
/// Sync activation check with the instance id.
pub type SyncActivationCheckCallbackV2 = Arc<dyn Fn(&StoreIdentity) -> bool + Send + Sync>;
/// Extra permission conditions for a store.
pub type PermissionConditionCallback =
    Arc<dyn Fn(&StoreIdentity) -> BTreeMap<String, String> + Send + Sync>;
/// Store online status: user, app, store, device, online.
pub type StoreStatusNotifier = Arc<dyn Fn(&str, &str, &str, &str, bool) + Send + Sync>;
