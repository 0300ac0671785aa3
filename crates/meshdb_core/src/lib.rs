//! # MeshDB Core
//!
//! Process runtime, auto-launch manager and sync data cursor for MeshDB.
//!
//! This crate provides:
//! - A process-wide [`RuntimeContext`]: task pool, timer loop, user-change,
//!   time-change and lock-status listeners, adapters and callbacks
//! - The [`AutoLaunch`] manager that opens stores when peers come online
//!   and closes them once they go idle
//! - A [`LifeCycleTimer`] reporting stores that saw no activity
//! - The paging [`SyncDataReader`] with its resumable [`ContinueToken`]
//!
//! ## Architecture
//!
//! Storage engines, the transport and the platform security layer are not
//! part of this crate. They plug in through the traits in this crate's
//! root: [`ConnectionManager`], [`KvConnection`], [`RelationalConnection`],
//! [`CommunicatorAggregator`], [`CommunicatorAdapter`] and
//! [`ProcessSystemApiAdapter`]. The cursor reads through
//! [`meshdb_storage::SyncSource`].
//!
//! ## Key Invariants
//!
//! - At most one open or close is in flight per auto-launch item
//! - Application notifiers never run under an internal lock
//! - A page with data left behind always holds at least one item
//! - Records sharing a timestamp never span two pages

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auto_launch;
mod config;
mod error;
mod interfaces;
mod lifecycle;
mod runtime;
mod sync_data;
mod types;

pub use auto_launch::{AutoLaunch, AutoLaunchItemState};
pub use config::{CursorConfig, RuntimeConfig};
pub use error::{DbError, DbResult};
pub use interfaces::{
    AccessEventCallback, AutoLaunchNotifier, AutoLaunchOption, AutoLaunchParam,
    AutoLaunchRequestCallback, AutoLaunchStatus, ChangedData, CommitObserver,
    CommunicatorAdapter, CommunicatorAggregator, ConflictEntry, ConflictNotifier,
    ConnectionManager, KvConnection, LackCallback, LifeCycleNotifier, ObserverHandle,
    OnConnectCallback, PermissionCheckCallback, PermissionCheckCallbackV2,
    PermissionCheckCallbackV3, PermissionCheckParam, PermissionConditionCallback, Pragma,
    ProcessSystemApiAdapter, RelationalConnection, StoreConnection, StoreIdentity,
    StoreObserver, StoreStatusNotifier, SyncActivationCheckCallback,
    SyncActivationCheckCallbackV2, OBSERVER_CHANGES_FOREIGN, OBSERVER_CHANGES_NATIVE,
};
pub use lifecycle::LifeCycleTimer;
pub use runtime::{
    EventLoop, EventType, Listener, ListenerAction, LockStatusObserver, NotificationChain,
    RuntimeContext, Semaphore, Task, TaskPool, TimeOffset, TimeTickMonitor, TimerAction,
    TimerFinalizer, TimerId, UserChangeEvent, UserChangeMonitor,
};
pub use sync_data::{
    ContinueToken, DataSizeSpec, SyncDataReader, SyncPage, SyncQuery, SyncTimeRange, TimeRange,
};
pub use types::{
    check_store_parameter, generate_dual_tuple_identifier, generate_identifier, DbProperties,
    SecurityLabel, SecurityOption, StoreType,
};
