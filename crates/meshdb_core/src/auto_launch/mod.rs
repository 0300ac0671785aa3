//! Transparent open and close of stores driven by peer traffic.
//!
//! The manager keeps two tables of [`AutoLaunchItemState`]-tracked items:
//!
//! - the normal table, filled by [`AutoLaunch::enable_auto_launch`] and
//!   capped at `max_auto_launch_items` entries;
//! - the ext table, filled on demand when the transport reports traffic
//!   for an identifier nobody enabled and a request callback accepts it.
//!
//! Connection I/O always happens outside the table locks. The transient
//! states (`InEnable`, `InCommunicatorCallBack`, `InLifeCycleCallBack`)
//! reserve an item while its open or close runs, so concurrent callers
//! see "busy" instead of racing the same item through two opens.
//!
//! Application notifiers never run on a thread holding a table lock; they
//! are dispatched through the runtime's task pool.

mod ext;
mod item;

pub use item::AutoLaunchItemState;

use crate::error::{DbError, DbResult};
use crate::interfaces::{
    AutoLaunchNotifier, AutoLaunchOption, AutoLaunchRequestCallback, AutoLaunchStatus,
    ChangedData, CommitObserver, CommunicatorAggregator, ConflictEntry, ConflictNotifier,
    ConnectionManager, KvConnection, LackCallback, LifeCycleNotifier, ObserverHandle,
    OnConnectCallback, Pragma, StoreConnection, OBSERVER_CHANGES_FOREIGN,
};
use crate::runtime::{RuntimeContext, Semaphore};
use crate::types::{short_id, DbProperties, StoreType};
use item::{erase_item, get_item, get_item_mut, item_count, AutoLaunchItem, ItemMap};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct ItemTable {
    items: ItemMap,
    online_devices: BTreeSet<String>,
}

#[derive(Default)]
struct ExtTable {
    items: ItemMap,
    request_callbacks: BTreeMap<StoreType, AutoLaunchRequestCallback>,
}

struct Shared {
    runtime: Weak<RuntimeContext>,
    max_items: usize,
    // Normal table plus the online device set; `cv` waits on it.
    data: Mutex<ItemTable>,
    cv: Condvar,
    ext: Mutex<ExtTable>,
    // Never held while `data` or `ext` is taken.
    communicator: Mutex<Option<Arc<dyn CommunicatorAggregator>>>,
    connections: RwLock<Option<Arc<dyn ConnectionManager>>>,
}

/// Signals the batch semaphore when an open task finishes or is dropped
/// unrun by a rejecting scheduler.
struct SignalOnDrop(Arc<Semaphore>);

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.signal();
    }
}

type OpenResult = Option<(StoreConnection, Option<ObserverHandle>)>;

impl Shared {
    fn runtime(&self) -> DbResult<Arc<RuntimeContext>> {
        self.runtime.upgrade().ok_or(DbError::NotInit {
            component: "runtime context",
        })
    }

    fn schedule(&self, task: impl FnOnce() + Send + 'static) -> DbResult<()> {
        self.runtime()?.schedule_task(Box::new(task))
    }

    fn connection_manager(&self) -> DbResult<Arc<dyn ConnectionManager>> {
        self.connections.read().clone().ok_or(DbError::NotInit {
            component: "connection manager",
        })
    }

    fn is_syncer_need_active(&self, properties: &DbProperties) -> bool {
        self.runtime
            .upgrade()
            .map_or(true, |runtime| runtime.is_syncer_need_active(properties))
    }

    fn notify_async(&self, item: &AutoLaunchItem, status: AutoLaunchStatus) {
        if item.notifier.is_none() {
            return;
        }
        let item = item.clone();
        if let Err(err) = self.schedule(move || item.notify(status)) {
            tracing::error!(?status, error = %err, "notifier dispatch failed");
        }
    }

    fn enable_param_check(
        &self,
        mut item: AutoLaunchItem,
        normal_identifier: &str,
        dual_identifier: &str,
        is_dual: bool,
    ) -> DbResult<()> {
        let mut table = self.data.lock();
        let user_id = item.user_id().to_owned();
        if is_dual && get_item(&table.items, normal_identifier, &user_id).is_some() {
            tracing::warn!("store already enabled in normal tuple mode");
            return Err(DbError::AlreadySet);
        }
        if !is_dual && get_item(&table.items, dual_identifier, &user_id).is_some() {
            tracing::warn!("store already enabled in dual tuple mode");
            return Err(DbError::AlreadySet);
        }
        let identifier = if is_dual {
            dual_identifier
        } else {
            normal_identifier
        };
        if identifier.is_empty() {
            return Err(DbError::invalid_args("auto launch identifier is empty"));
        }
        if get_item(&table.items, identifier, &user_id).is_some() {
            return Err(DbError::AlreadySet);
        }
        if item_count(&table.items) >= self.max_items {
            tracing::warn!(limit = self.max_items, "auto launch table is full");
            return Err(DbError::MaxLimitExceeded {
                limit: self.max_items,
            });
        }
        item.state = AutoLaunchItemState::InEnable;
        table
            .items
            .entry(identifier.to_owned())
            .or_default()
            .insert(user_id, item);
        tracing::info!(identifier = short_id(identifier), is_dual, "auto launch item admitted");
        Ok(())
    }

    fn set_idle(&self, identifier: &str, user_id: &str) {
        let mut table = self.data.lock();
        if let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) {
            entry.state = AutoLaunchItemState::Idle;
        }
        self.cv.notify_all();
    }

    fn erase(&self, identifier: &str, user_id: &str) {
        let mut table = self.data.lock();
        erase_item(&mut table.items, identifier, user_id);
        self.cv.notify_all();
    }

    fn get_connection_in_enable(
        self: &Arc<Self>,
        mut item: AutoLaunchItem,
        identifier: &str,
    ) -> DbResult<()> {
        let user_id = item.user_id().to_owned();
        let manager = match self.connection_manager() {
            Ok(manager) => manager,
            Err(err) => {
                self.erase(identifier, &user_id);
                return Err(err);
            }
        };
        let conn = match manager.get_connection(&item.properties, false) {
            Ok(conn) => conn,
            Err(DbError::AlreadyOpened) => {
                tracing::info!(
                    identifier = short_id(identifier),
                    "store already opened by its owner"
                );
                self.set_idle(identifier, &user_id);
                return Ok(());
            }
            Err(err) => {
                self.erase(identifier, &user_id);
                return Err(err);
            }
        };

        let no_peer = self.data.lock().online_devices.is_empty();
        if no_peer {
            tracing::info!(identifier = short_id(identifier), "no online device, releasing");
            item.conn = Some(conn);
            if let Err(err) = self.close_connection_strict(&mut item) {
                tracing::error!(error = %err, "release after enable failed");
                self.erase(identifier, &user_id);
                return Err(err);
            }
            self.set_idle(identifier, &user_id);
            return Ok(());
        }

        item.conn = Some(conn);
        if let Err(err) = self.register_observer_and_lifecycle(&mut item, identifier, false) {
            tracing::error!(error = %err, "register after enable failed, closing");
            self.try_close_connection(&mut item);
            self.erase(identifier, &user_id);
            return Err(err);
        }
        let mut table = self.data.lock();
        if let Some(entry) = get_item_mut(&mut table.items, identifier, &user_id) {
            entry.state = AutoLaunchItemState::Idle;
            entry.conn = item.conn;
            entry.observer_handle = item.observer_handle;
        }
        self.cv.notify_all();
        Ok(())
    }

    fn open_one_connection(&self, item: &mut AutoLaunchItem) -> DbResult<()> {
        let manager = self.connection_manager()?;
        match manager.get_connection(&item.properties, false) {
            Ok(conn) => {
                item.conn = Some(conn);
                Ok(())
            }
            Err(err) => {
                item.conn = None;
                if err == DbError::AlreadyOpened {
                    tracing::info!("store already opened by its owner");
                } else {
                    tracing::warn!(error = %err, "auto launch open failed");
                }
                Err(err)
            }
        }
    }

    fn register_observer_and_lifecycle(
        self: &Arc<Self>,
        item: &mut AutoLaunchItem,
        identifier: &str,
        is_ext: bool,
    ) -> DbResult<()> {
        let conn = item
            .conn
            .clone()
            .ok_or_else(|| DbError::internal("register on an item without connection"))?;
        let user_id = item.user_id().to_owned();

        let weak = Arc::downgrade(self);
        let (id, user) = (identifier.to_owned(), user_id.clone());
        let observer: CommitObserver = Arc::new(move |data: &ChangedData| {
            if let Some(shared) = weak.upgrade() {
                if is_ext {
                    shared.ext_observer_func(data, &id, &user);
                } else {
                    shared.observer_func(data, &id, &user);
                }
            }
        });
        match &conn {
            StoreConnection::Kv(kv) => {
                item.observer_handle =
                    Some(kv.register_observer(OBSERVER_CHANGES_FOREIGN, &[], observer)?);
            }
            StoreConnection::Relational(rdb) => rdb.register_observer(observer)?,
        }

        let weak = Arc::downgrade(self);
        let (id, user) = (identifier.to_owned(), user_id);
        let notifier: LifeCycleNotifier = Arc::new(move |reported: &str, _: &str| {
            tracing::debug!(reported = short_id(reported), "store has no more users");
            if let Some(shared) = weak.upgrade() {
                shared.life_cycle_callback(&id, &user, is_ext);
            }
        });
        conn.register_lifecycle_callback(Some(notifier))?;

        if let StoreConnection::Kv(kv) = &conn {
            set_conflict_notifier(kv.as_ref(), item)?;
            kv.pragma(Pragma::AutoSync(item.is_auto_sync))?;
        }
        Ok(())
    }

    /// Closes and reports the first failure.
    fn close_connection_strict(&self, item: &mut AutoLaunchItem) -> DbResult<()> {
        let Some(conn) = item.conn.clone() else {
            return Ok(());
        };
        conn.register_lifecycle_callback(None)?;
        match &conn {
            StoreConnection::Kv(kv) => {
                if let Some(handle) = item.observer_handle {
                    kv.unregister_observer(handle)?;
                    item.observer_handle = None;
                }
                self.connection_manager()?.release_connection(conn)?;
            }
            StoreConnection::Relational(rdb) => rdb.close()?,
        }
        item.conn = None;
        Ok(())
    }

    /// Closes as far as possible, logging failures.
    fn try_close_connection(&self, item: &mut AutoLaunchItem) {
        let Some(conn) = item.conn.take() else {
            return;
        };
        if let Err(err) = conn.register_lifecycle_callback(None) {
            tracing::warn!(error = %err, "clearing lifecycle callback failed");
        }
        match conn {
            StoreConnection::Kv(kv) => {
                if let Some(handle) = item.observer_handle.take() {
                    if let Err(err) = kv.unregister_observer(handle) {
                        tracing::warn!(error = %err, "unregistering observer failed");
                    }
                }
                let released = self
                    .connection_manager()
                    .and_then(|manager| manager.release_connection(StoreConnection::Kv(kv)));
                if let Err(err) = released {
                    tracing::warn!(error = %err, "releasing connection failed");
                }
            }
            StoreConnection::Relational(rdb) => {
                if let Err(err) = rdb.close() {
                    tracing::warn!(error = %err, "closing relational connection failed");
                }
            }
        }
    }

    fn disable(&self, normal_identifier: &str, dual_identifier: &str, user_id: &str) -> DbResult<()> {
        let mut table = self.data.lock();
        let identifier = if table.items.contains_key(normal_identifier) {
            normal_identifier
        } else {
            dual_identifier
        };
        tracing::info!(identifier = short_id(identifier), "disable auto launch");
        let entry = get_item_mut(&mut table.items, identifier, user_id).ok_or(DbError::NotFound)?;
        if entry.is_disable {
            tracing::info!("disable already running on another thread");
            return Err(DbError::Busy);
        }
        if entry.state == AutoLaunchItemState::InEnable {
            tracing::warn!("enable has not returned, refusing to disable");
            return Err(DbError::Busy);
        }
        entry.is_disable = true;
        if entry.state != AutoLaunchItemState::Idle || entry.in_observer {
            // The entry may be erased while we sleep; re-check membership.
            loop {
                let ready = get_item(&table.items, identifier, user_id)
                    .map(|item| item.state == AutoLaunchItemState::Idle && !item.in_observer)
                    .ok_or(DbError::NotFound)?;
                if ready {
                    break;
                }
                self.cv.wait(&mut table);
            }
        }
        let mut item = get_item(&table.items, identifier, user_id)
            .cloned()
            .ok_or(DbError::NotFound)?;
        drop(table);

        if let Err(err) = self.close_connection_strict(&mut item) {
            tracing::error!(error = %err, "disable close failed, rolling back");
            let mut table = self.data.lock();
            if let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) {
                entry.is_disable = false;
                entry.observer_handle = item.observer_handle;
            }
            self.cv.notify_all();
            return Err(err);
        }

        self.erase(identifier, user_id);
        if item.is_write_open_notified {
            self.notify_async(&item, AutoLaunchStatus::WriteClosed);
        }
        tracing::info!("disable auto launch ok");
        Ok(())
    }

    fn observer_func(&self, data: &ChangedData, identifier: &str, user_id: &str) {
        let snapshot = {
            let mut table = self.data.lock();
            let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) else {
                tracing::warn!(identifier = short_id(identifier), "observer fired for unknown item");
                return;
            };
            if entry.is_disable {
                return;
            }
            entry.in_observer = true;
            entry.clone()
        };

        if let Some(observer) = &snapshot.observer {
            observer.on_change(data);
        }
        if !snapshot.is_write_open_notified && snapshot.notifier.is_some() {
            {
                let mut table = self.data.lock();
                if let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) {
                    entry.is_write_open_notified = true;
                }
            }
            self.notify_async(&snapshot, AutoLaunchStatus::WriteOpened);
        }

        let mut table = self.data.lock();
        if let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) {
            entry.in_observer = false;
        }
        self.cv.notify_all();
    }

    fn life_cycle_callback(self: &Arc<Self>, identifier: &str, user_id: &str, is_ext: bool) {
        let shared = Arc::clone(self);
        let (identifier, user_id) = (identifier.to_owned(), user_id.to_owned());
        let scheduled = self.schedule(move || {
            if is_ext {
                shared.ext_life_cycle_task(&identifier, &user_id);
            } else {
                shared.life_cycle_task(&identifier, &user_id);
            }
        });
        if let Err(err) = scheduled {
            tracing::error!(error = %err, "lifecycle task not scheduled");
        }
    }

    fn life_cycle_task(&self, identifier: &str, user_id: &str) {
        let mut item = {
            let mut table = self.data.lock();
            let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) else {
                return;
            };
            if entry.is_disable || entry.state != AutoLaunchItemState::Idle {
                tracing::debug!(state = ?entry.state, "lifecycle close skipped");
                return;
            }
            entry.state = AutoLaunchItemState::InLifeCycleCallBack;
            entry.clone()
        };
        tracing::info!(identifier = short_id(identifier), "closing idle auto launched store");
        self.try_close_connection(&mut item);
        {
            let mut table = self.data.lock();
            if let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) {
                entry.state = AutoLaunchItemState::Idle;
                entry.conn = None;
                entry.observer_handle = None;
                entry.is_write_open_notified = false;
            }
            self.cv.notify_all();
        }
        if item.is_write_open_notified {
            item.notify(AutoLaunchStatus::WriteClosed);
        }
    }

    fn online_callback(self: &Arc<Self>, device: &str, is_connect: bool) {
        tracing::info!(is_connect, "device online state changed");
        let mut table = self.data.lock();
        if !is_connect {
            table.online_devices.remove(device);
            return;
        }
        table.online_devices.insert(device.to_owned());
        drop(table);
        let shared = Arc::clone(self);
        if let Err(err) = self.schedule(move || shared.online_callback_task()) {
            tracing::error!(error = %err, "online task not scheduled");
        }
    }

    fn online_callback_task(self: &Arc<Self>) {
        let do_open = self.get_do_open_map();
        let results = self.get_conn_in_do_open_map(&do_open);
        self.update_global_map(&do_open, results);
    }

    fn get_do_open_map(&self) -> Vec<(String, AutoLaunchItem)> {
        let mut table = self.data.lock();
        let mut do_open = Vec::new();
        for (identifier, users) in &mut table.items {
            for entry in users.values_mut() {
                if entry.is_disable
                    || entry.state != AutoLaunchItemState::Idle
                    || entry.conn.is_some()
                {
                    continue;
                }
                if entry.is_dual_tuple_mode() && !self.is_syncer_need_active(&entry.properties) {
                    tracing::debug!(identifier = short_id(identifier), "no need to open");
                    continue;
                }
                entry.state = AutoLaunchItemState::InCommunicatorCallBack;
                do_open.push((identifier.clone(), entry.clone()));
            }
        }
        do_open
    }

    fn get_conn_in_do_open_map(
        self: &Arc<Self>,
        do_open: &[(String, AutoLaunchItem)],
    ) -> Vec<OpenResult> {
        if do_open.is_empty() {
            return Vec::new();
        }
        let total = i64::try_from(do_open.len()).unwrap_or(i64::MAX);
        let sema = Arc::new(Semaphore::new(1 - total));
        let results: Arc<Mutex<Vec<OpenResult>>> = Arc::new(Mutex::new(vec![None; do_open.len()]));
        for (index, (identifier, item)) in do_open.iter().enumerate() {
            let guard = SignalOnDrop(Arc::clone(&sema));
            let shared = Arc::clone(self);
            let results = Arc::clone(&results);
            let identifier = identifier.clone();
            let mut item = item.clone();
            let scheduled = self.schedule(move || {
                let _guard = guard;
                if shared.open_one_connection(&mut item).is_err() {
                    return;
                }
                if let Err(err) = shared.register_observer_and_lifecycle(&mut item, &identifier, false) {
                    tracing::error!(error = %err, "register after online open failed, closing");
                    shared.try_close_connection(&mut item);
                    return;
                }
                if let Some(conn) = item.conn.take() {
                    results.lock()[index] = Some((conn, item.observer_handle));
                }
            });
            if let Err(err) = scheduled {
                // The rejected task was dropped, which already signalled.
                tracing::error!(error = %err, "online open not scheduled");
            }
        }
        sema.wait();
        let mut results = results.lock();
        std::mem::take(&mut *results)
    }

    fn update_global_map(&self, do_open: &[(String, AutoLaunchItem)], results: Vec<OpenResult>) {
        let mut table = self.data.lock();
        let mut results = results.into_iter();
        for (identifier, item) in do_open {
            let result = results.next().flatten();
            let Some(entry) = get_item_mut(&mut table.items, identifier, item.user_id()) else {
                continue;
            };
            if let Some((conn, handle)) = result {
                entry.conn = Some(conn);
                entry.observer_handle = handle;
                entry.is_write_open_notified = false;
            }
            entry.state = AutoLaunchItemState::Idle;
        }
        self.cv.notify_all();
    }

    fn receive_unknown_identifier(self: &Arc<Self>, label: &str, original_user_id: &str) -> DbResult<()> {
        let identifier = label.to_owned();
        let mut user_id = original_user_id.to_owned();
        {
            let mut table = self.data.lock();
            if original_user_id.is_empty() {
                let users = table
                    .items
                    .get(&identifier)
                    .map(|users| (users.len(), users.keys().next().cloned()));
                match users {
                    Some((count, _)) if count > 1 => {
                        tracing::warn!("several users share the identifier, trying ext path");
                        drop(table);
                        return self.auto_launch_ext(&identifier, &user_id);
                    }
                    Some((_, Some(only))) => user_id = only,
                    _ => {}
                }
            }
            tracing::info!(identifier = short_id(&identifier), "unknown identifier received");
            let Some(entry) = get_item_mut(&mut table.items, &identifier, &user_id) else {
                drop(table);
                return self.auto_launch_ext(&identifier, &user_id);
            };
            if entry.is_disable {
                return Err(DbError::NotFound);
            }
            if entry.conn.is_some() || entry.state != AutoLaunchItemState::Idle {
                return Ok(());
            }
            entry.state = AutoLaunchItemState::InCommunicatorCallBack;
        }

        let shared = Arc::clone(self);
        let (task_id, task_user) = (identifier.clone(), user_id.clone());
        let scheduled =
            self.schedule(move || shared.receive_unknown_identifier_task(&task_id, &task_user));
        if let Err(err) = scheduled {
            tracing::error!(error = %err, "open task not scheduled");
            self.set_idle(&identifier, &user_id);
            return Err(err);
        }
        Ok(())
    }

    fn receive_unknown_identifier_task(self: &Arc<Self>, identifier: &str, user_id: &str) {
        let Some(mut item) = get_item(&self.data.lock().items, identifier, user_id).cloned() else {
            return;
        };
        if self.open_one_connection(&mut item).is_err() {
            self.set_idle(identifier, user_id);
            return;
        }
        if let Err(err) = self.register_observer_and_lifecycle(&mut item, identifier, false) {
            tracing::error!(error = %err, "register after on-demand open failed, closing");
            self.try_close_connection(&mut item);
            self.set_idle(identifier, user_id);
            return;
        }
        let mut table = self.data.lock();
        if let Some(entry) = get_item_mut(&mut table.items, identifier, user_id) {
            entry.conn = item.conn;
            entry.observer_handle = item.observer_handle;
            entry.is_write_open_notified = false;
            entry.state = AutoLaunchItemState::Idle;
        }
        self.cv.notify_all();
    }

    fn set_communicator_aggregator(self: &Arc<Self>, aggregator: Option<Arc<dyn CommunicatorAggregator>>) {
        let mut slot = self.communicator.lock();
        if let Some(old) = slot.take() {
            unregister_aggregator(old.as_ref());
        }
        *slot = aggregator.clone();
        let Some(aggregator) = aggregator else {
            tracing::info!("communicator aggregator cleared");
            return;
        };
        let weak = Arc::downgrade(self);
        let on_connect: OnConnectCallback = Arc::new(move |device: &str, is_connect: bool| {
            if let Some(shared) = weak.upgrade() {
                shared.online_callback(device, is_connect);
            }
        });
        if let Err(err) = aggregator.register_on_connect(Some(on_connect)) {
            tracing::warn!(error = %err, "registering online callback failed");
        }
        let weak = Arc::downgrade(self);
        let on_lack: LackCallback = Arc::new(move |label: &str, user_id: &str| match weak.upgrade() {
            Some(shared) => shared.receive_unknown_identifier(label, user_id),
            None => Err(DbError::NotFound),
        });
        if let Err(err) = aggregator.register_lack_callback(Some(on_lack)) {
            tracing::warn!(error = %err, "registering unknown identifier callback failed");
        }
    }

    fn shutdown(&self) {
        if let Some(aggregator) = self.communicator.lock().take() {
            unregister_aggregator(aggregator.as_ref());
        }

        let mut in_disable = Vec::new();
        let mut wait_idle = Vec::new();
        let mut close_now = Vec::new();
        {
            let mut table = self.data.lock();
            for (identifier, users) in &mut table.items {
                for (user_id, entry) in users.iter_mut() {
                    if entry.is_disable {
                        in_disable.push((identifier.clone(), user_id.clone()));
                    } else if entry.state == AutoLaunchItemState::Idle && !entry.in_observer {
                        entry.is_disable = true;
                        close_now.push(entry.clone());
                        entry.conn = None;
                        entry.observer_handle = None;
                    } else {
                        entry.is_disable = true;
                        wait_idle.push((identifier.clone(), user_id.clone()));
                    }
                }
            }
        }
        for mut item in close_now {
            self.try_close_connection(&mut item);
        }
        for (identifier, user_id) in in_disable {
            let item = {
                let mut table = self.data.lock();
                while get_item(&table.items, &identifier, &user_id).is_some_and(|item| item.is_disable) {
                    self.cv.wait(&mut table);
                }
                take_for_close(&mut table.items, &identifier, &user_id)
            };
            if let Some(mut item) = item {
                self.try_close_connection(&mut item);
            }
        }
        for (identifier, user_id) in wait_idle {
            let item = {
                let mut table = self.data.lock();
                while get_item(&table.items, &identifier, &user_id).is_some_and(|item| {
                    item.state != AutoLaunchItemState::Idle || item.in_observer
                }) {
                    self.cv.wait(&mut table);
                }
                take_for_close(&mut table.items, &identifier, &user_id)
            };
            if let Some(mut item) = item {
                self.try_close_connection(&mut item);
            }
        }

        let ext_items = std::mem::take(&mut self.ext.lock().items);
        for mut item in ext_items.into_values().flat_map(BTreeMap::into_values) {
            self.try_close_connection(&mut item);
        }
        tracing::debug!("auto launch shut down");
    }
}

fn take_for_close(map: &mut ItemMap, identifier: &str, user_id: &str) -> Option<AutoLaunchItem> {
    let entry = get_item_mut(map, identifier, user_id)?;
    let item = entry.clone();
    entry.conn = None;
    entry.observer_handle = None;
    Some(item)
}

fn unregister_aggregator(aggregator: &dyn CommunicatorAggregator) {
    if let Err(err) = aggregator.register_on_connect(None) {
        tracing::warn!(error = %err, "clearing online callback failed");
    }
    if let Err(err) = aggregator.register_lack_callback(None) {
        tracing::warn!(error = %err, "clearing unknown identifier callback failed");
    }
}

fn set_conflict_notifier(kv: &dyn KvConnection, item: &AutoLaunchItem) -> DbResult<()> {
    let conflict_type = item.conflict_type;
    if conflict_type == 0 {
        return Ok(());
    }
    let notifier = item.conflict_notifier.clone().map(|notifier| {
        Arc::new(move |entry: &ConflictEntry| {
            if entry.conflict_type & conflict_type != 0 {
                notifier(entry);
            }
        }) as ConflictNotifier
    });
    kv.set_conflict_notifier(conflict_type, notifier)
        .inspect_err(|err| tracing::error!(error = %err, "conflict notifier registration failed"))
}

/// The auto-launch manager owned by a [`RuntimeContext`].
pub struct AutoLaunch {
    shared: Arc<Shared>,
}

impl AutoLaunch {
    pub(crate) fn new(runtime: Weak<RuntimeContext>, max_items: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                max_items,
                data: Mutex::new(ItemTable::default()),
                cv: Condvar::new(),
                ext: Mutex::new(ExtTable::default()),
                communicator: Mutex::new(None),
                connections: RwLock::new(None),
            }),
        }
    }

    /// Installs the connection manager used to open and release stores.
    pub fn set_connection_manager(&self, manager: Arc<dyn ConnectionManager>) {
        *self.shared.connections.write() = Some(manager);
    }

    /// Swaps the transport, moving the online and unknown-identifier
    /// callbacks from the old aggregator to the new one.
    pub fn set_communicator_aggregator(&self, aggregator: Option<Arc<dyn CommunicatorAggregator>>) {
        self.shared.set_communicator_aggregator(aggregator);
    }

    /// Starts tracking a store.
    ///
    /// The item is admitted as `InEnable`, then opened outside the lock. A
    /// dual-tuple store whose activation check says "not needed" stays
    /// closed until a later trigger. With no device online the connection
    /// is released right away.
    ///
    /// # Errors
    ///
    /// - `AlreadySet` if the (identifier, user) pair is enabled in either mode
    /// - `InvalidArgs` if the identifier is empty
    /// - `MaxLimitExceeded` when the table is full
    /// - the open or registration failure, after the item is erased
    pub fn enable_auto_launch(
        &self,
        properties: DbProperties,
        notifier: Option<AutoLaunchNotifier>,
        option: AutoLaunchOption,
    ) -> DbResult<()> {
        let properties = if option.sync_dual_tuple_mode {
            properties.with_sync_dual_tuple_mode(true)
        } else {
            properties
        };
        let is_dual = properties.sync_dual_tuple_mode();
        let normal_identifier = properties.identifier().to_owned();
        let dual_identifier = properties.dual_tuple_identifier().to_owned();
        let user_id = properties.user_id().to_owned();
        let item = AutoLaunchItem::new(properties, notifier, &option);

        self.shared
            .enable_param_check(item.clone(), &normal_identifier, &dual_identifier, is_dual)?;
        let identifier = if is_dual {
            dual_identifier
        } else {
            normal_identifier
        };
        if is_dual && !self.shared.is_syncer_need_active(&item.properties) {
            tracing::info!(identifier = short_id(&identifier), "no need to open yet");
            self.shared.set_idle(&identifier, &user_id);
            return Ok(());
        }
        self.shared
            .get_connection_in_enable(item, &identifier)
            .inspect(|()| tracing::info!("enable auto launch ok"))
    }

    /// Stops tracking a store and closes it.
    ///
    /// Blocks while the item is busy or inside an observer callback.
    ///
    /// # Errors
    ///
    /// - `NotFound` if neither identifier is enabled for `user_id`
    /// - `Busy` if another disable runs or the enable has not returned
    /// - the close failure; the item then stays enabled
    pub fn disable_auto_launch(
        &self,
        normal_identifier: &str,
        dual_identifier: &str,
        user_id: &str,
    ) -> DbResult<()> {
        self.shared.disable(normal_identifier, dual_identifier, user_id)
    }

    /// Online devices, or nothing if `identifier` is not enabled.
    #[must_use]
    pub fn get_auto_launch_sync_devices(&self, identifier: &str) -> Vec<String> {
        let table = self.shared.data.lock();
        if !table.items.contains_key(identifier) {
            return Vec::new();
        }
        table.online_devices.iter().cloned().collect()
    }

    /// Installs or (with `None`) removes the on-demand request handler for a store kind.
    pub fn set_auto_launch_request_callback(
        &self,
        callback: Option<AutoLaunchRequestCallback>,
        store_type: StoreType,
    ) {
        tracing::info!(?store_type, installed = callback.is_some(), "auto launch request callback");
        let mut ext = self.shared.ext.lock();
        match callback {
            Some(callback) => {
                ext.request_callbacks.insert(store_type, callback);
            }
            None => {
                ext.request_callbacks.remove(&store_type);
            }
        }
    }

    /// Closes an on-demand relational store opened under `properties`'
    /// auto-launch session. Other kinds and stale sessions are ignored.
    pub fn close_connection(&self, store_type: StoreType, properties: &DbProperties) {
        self.shared.close_connection(store_type, properties);
    }

    /// State of an enabled item.
    #[must_use]
    pub fn item_state(&self, identifier: &str, user_id: &str) -> Option<AutoLaunchItemState> {
        get_item(&self.shared.data.lock().items, identifier, user_id).map(|item| item.state)
    }

    /// Returns true if an enabled item currently holds a connection.
    #[must_use]
    pub fn is_item_open(&self, identifier: &str, user_id: &str) -> bool {
        get_item(&self.shared.data.lock().items, identifier, user_id)
            .is_some_and(|item| item.conn.is_some())
    }

    /// Number of enabled items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        item_count(&self.shared.data.lock().items)
    }

    /// Number of on-demand items.
    #[must_use]
    pub fn ext_item_count(&self) -> usize {
        item_count(&self.shared.ext.lock().items)
    }

    /// Writes the enabled table. Write errors are ignored.
    pub fn dump(&self, out: &mut dyn io::Write) {
        let table = self.shared.data.lock();
        let _ = writeln!(out, "\tenableAutoLaunch info [");
        for (identifier, users) in &table.items {
            let _ = writeln!(out, "\t\tlabel = {}, userId = [", hex::encode(identifier));
            for user_id in users.keys() {
                let _ = writeln!(out, "\t\t\t{user_id}");
            }
            let _ = writeln!(out, "\t\t]");
        }
        let _ = writeln!(out, "\t]");
    }

    pub(crate) fn shutdown(&self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    struct OwnedElsewhere;

    impl ConnectionManager for OwnedElsewhere {
        fn get_connection(&self, _: &DbProperties, _: bool) -> DbResult<StoreConnection> {
            Err(DbError::AlreadyOpened)
        }

        fn release_connection(&self, _: StoreConnection) -> DbResult<()> {
            Ok(())
        }
    }

    fn runtime(max_items: usize) -> Arc<RuntimeContext> {
        let runtime = RuntimeContext::new(RuntimeConfig::new().max_auto_launch_items(max_items));
        runtime.set_connection_manager(Arc::new(OwnedElsewhere));
        runtime
    }

    #[test]
    fn enable_twice_in_either_mode_is_already_set() {
        let runtime = runtime(8);
        let auto_launch = runtime.auto_launch();
        let props = DbProperties::kv("user", "app", "store");
        auto_launch
            .enable_auto_launch(props.clone(), None, AutoLaunchOption::default())
            .unwrap();
        assert_eq!(
            auto_launch.item_state(props.identifier(), "user"),
            Some(AutoLaunchItemState::Idle)
        );
        assert_eq!(
            auto_launch.enable_auto_launch(props.clone(), None, AutoLaunchOption::default()),
            Err(DbError::AlreadySet)
        );
        let dual = AutoLaunchOption {
            sync_dual_tuple_mode: true,
            ..AutoLaunchOption::default()
        };
        assert_eq!(
            auto_launch.enable_auto_launch(props, None, dual),
            Err(DbError::AlreadySet)
        );
        assert_eq!(auto_launch.item_count(), 1);
    }

    #[test]
    fn table_cap_is_enforced() {
        let runtime = runtime(2);
        let auto_launch = runtime.auto_launch();
        for store in ["s0", "s1"] {
            auto_launch
                .enable_auto_launch(DbProperties::kv("u", "a", store), None, AutoLaunchOption::default())
                .unwrap();
        }
        let err = auto_launch
            .enable_auto_launch(DbProperties::kv("u", "a", "s2"), None, AutoLaunchOption::default())
            .unwrap_err();
        assert_eq!(err, DbError::MaxLimitExceeded { limit: 2 });
        assert_eq!(auto_launch.item_count(), 2);
    }

    #[test]
    fn empty_identifier_is_invalid() {
        let runtime = runtime(8);
        let props = DbProperties::kv("u", "a", "s").with_identifier("");
        let err = runtime
            .auto_launch()
            .enable_auto_launch(props, None, AutoLaunchOption::default())
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgs { .. }));
    }

    #[test]
    fn disable_unknown_is_not_found_and_disable_known_erases() {
        let runtime = runtime(8);
        let auto_launch = runtime.auto_launch();
        assert_eq!(
            auto_launch.disable_auto_launch("x", "y", "u"),
            Err(DbError::NotFound)
        );
        let props = DbProperties::kv("u", "a", "s");
        auto_launch
            .enable_auto_launch(props.clone(), None, AutoLaunchOption::default())
            .unwrap();
        auto_launch
            .disable_auto_launch(props.identifier(), props.dual_tuple_identifier(), "u")
            .unwrap();
        assert_eq!(auto_launch.item_count(), 0);
    }

    #[test]
    fn dump_lists_users() {
        let runtime = runtime(8);
        let auto_launch = runtime.auto_launch();
        let props = DbProperties::kv("alice", "a", "s");
        auto_launch
            .enable_auto_launch(props.clone(), None, AutoLaunchOption::default())
            .unwrap();
        let mut out = Vec::new();
        auto_launch.dump(&mut out);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("label = {},", hex::encode(props.identifier()))));
        assert!(text.contains("alice"));
    }
}
