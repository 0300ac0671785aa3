//! Process-wide runtime facade.

use super::event_loop::{EventLoop, TimerAction, TimerFinalizer, TimerId};
use super::lock_status::LockStatusObserver;
use super::notification::{Listener, ListenerAction};
use super::task_pool::{Task, TaskPool};
use super::time_tick::{TimeOffset, TimeTickMonitor};
use super::user_change::{UserChangeEvent, UserChangeMonitor};
use crate::auto_launch::AutoLaunch;
use crate::config::RuntimeConfig;
use crate::error::{DbError, DbResult};
use crate::interfaces::{
    AccessEventCallback, AutoLaunchNotifier, AutoLaunchOption, AutoLaunchRequestCallback,
    CommunicatorAdapter, CommunicatorAggregator, ConnectionManager, PermissionCheckCallback,
    PermissionCheckCallbackV2, PermissionCheckCallbackV3, PermissionCheckParam,
    PermissionConditionCallback, ProcessSystemApiAdapter, StoreIdentity, StoreStatusNotifier,
    SyncActivationCheckCallback, SyncActivationCheckCallbackV2,
};
use crate::types::{DbProperties, SecurityLabel, SecurityOption, StoreType};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

static GLOBAL: OnceCell<Arc<RuntimeContext>> = OnceCell::new();

#[derive(Default)]
struct CommunicatorSlot {
    adapter: Option<Arc<dyn CommunicatorAdapter>>,
    aggregator: Option<Arc<dyn CommunicatorAggregator>>,
}

#[derive(Default)]
struct Callbacks {
    permission_check: Option<PermissionCheckCallback>,
    permission_check_v2: Option<PermissionCheckCallbackV2>,
    permission_check_v3: Option<PermissionCheckCallbackV3>,
    sync_activation_check: Option<SyncActivationCheckCallback>,
    sync_activation_check_v2: Option<SyncActivationCheckCallbackV2>,
    permission_condition: Option<PermissionConditionCallback>,
    store_status_notifier: Option<StoreStatusNotifier>,
}

/// Shared services for every store in the process: task scheduling,
/// timers, platform listeners, adapters and the auto-launch manager.
///
/// Tests build isolated contexts with [`RuntimeContext::new`]; application
/// code usually goes through [`RuntimeContext::global`].
///
/// Background resources (task pool, timer loop, monitors) start on first
/// use. Dropping the context shuts auto-launch down, then stops the pool
/// and the timer loop.
pub struct RuntimeContext {
    config: RuntimeConfig,
    task_pool: Mutex<Option<Arc<TaskPool>>>,
    event_loop: Mutex<Option<Arc<EventLoop>>>,
    time_tick: Mutex<Option<Arc<TimeTickMonitor>>>,
    user_change: Mutex<Option<Arc<UserChangeMonitor>>>,
    // Lock order: `lock_status` before `system_api`.
    lock_status: Mutex<Option<Arc<LockStatusObserver>>>,
    system_api: RwLock<Option<Arc<dyn ProcessSystemApiAdapter>>>,
    communicator: Mutex<CommunicatorSlot>,
    callbacks: RwLock<Callbacks>,
    process_label: RwLock<String>,
    session_id: AtomicU32,
    auto_launch: AutoLaunch,
}

fn interval_from_ms(interval_ms: i64) -> DbResult<Duration> {
    u64::try_from(interval_ms)
        .map(Duration::from_millis)
        .map_err(|_| DbError::invalid_args(format!("timer interval {interval_ms}ms")))
}

fn map_adapter_error(err: DbError) -> DbError {
    match err {
        DbError::NotSupport => DbError::NotSupport,
        other => DbError::system_api(other.to_string()),
    }
}

impl RuntimeContext {
    /// Creates an isolated context.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            auto_launch: AutoLaunch::new(weak.clone(), config.max_auto_launch_items),
            config,
            task_pool: Mutex::new(None),
            event_loop: Mutex::new(None),
            time_tick: Mutex::new(None),
            user_change: Mutex::new(None),
            lock_status: Mutex::new(None),
            system_api: RwLock::new(None),
            communicator: Mutex::new(CommunicatorSlot::default()),
            callbacks: RwLock::new(Callbacks::default()),
            process_label: RwLock::new(String::new()),
            session_id: AtomicU32::new(0),
        })
    }

    /// The process-wide context, created with `config` on the first call.
    /// Later calls return the existing context and ignore `config`.
    pub fn init_global(config: RuntimeConfig) -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Self::new(config)))
    }

    /// The process-wide context, created with default configuration if needed.
    pub fn global() -> Arc<Self> {
        Self::init_global(RuntimeConfig::default())
    }

    /// Configuration this context was built with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The auto-launch manager.
    #[must_use]
    pub fn auto_launch(&self) -> &AutoLaunch {
        &self.auto_launch
    }

    // ---- tasks ----

    fn task_pool(&self) -> DbResult<Arc<TaskPool>> {
        let mut slot = self.task_pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(TaskPool::new(
            "meshdb-task",
            self.config.max_task_threads,
            self.config.min_task_threads,
        )?);
        pool.start()?;
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Runs `task` once on a pool worker, starting the pool if needed.
    ///
    /// # Errors
    ///
    /// Returns the pool creation failure or `Stopped`.
    pub fn schedule_task(&self, task: Task) -> DbResult<()> {
        self.task_pool()?.schedule(task)
    }

    /// Runs `task` after every earlier task queued under `tag`.
    ///
    /// # Errors
    ///
    /// Returns the pool creation failure or `Stopped`.
    pub fn schedule_queued_task(&self, tag: &str, task: Task) -> DbResult<()> {
        self.task_pool()?.schedule_queued(tag, task)
    }

    /// Asks the pool to release idle resources.
    pub fn shrink_memory(&self, description: &str) {
        if let Some(pool) = self.task_pool.lock().clone() {
            pool.shrink_memory(description);
        }
    }

    /// Stops and discards the pool. The next schedule call starts a new one.
    pub fn stop_task_pool(&self) {
        let pool = self.task_pool.lock().take();
        if let Some(pool) = pool {
            pool.stop();
        }
    }

    /// Returns true if the pool has been started.
    #[must_use]
    pub fn is_task_pool_started(&self) -> bool {
        self.task_pool.lock().is_some()
    }

    // ---- timers ----

    fn event_loop(&self) -> DbResult<Arc<EventLoop>> {
        let mut slot = self.event_loop.lock();
        if let Some(event_loop) = slot.as_ref() {
            return Ok(Arc::clone(event_loop));
        }
        let event_loop = Arc::new(EventLoop::start("meshdb-timer")?);
        *slot = Some(Arc::clone(&event_loop));
        Ok(event_loop)
    }

    /// Adds a repeating timer firing every `interval_ms`.
    ///
    /// An action returning an error removes its timer; the finalizer runs
    /// when the timer is removed for any reason.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` for a negative interval, `OutOfIds` if no id
    /// is free.
    pub fn set_timer(
        &self,
        interval_ms: i64,
        action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> DbResult<TimerId> {
        let interval = interval_from_ms(interval_ms)?;
        self.event_loop()?.add_timer(interval, action, finalizer)
    }

    /// Changes a timer's interval and restarts its countdown.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgs` for a negative interval, `NoSuchEntry` for an unknown timer.
    pub fn modify_timer(&self, timer: TimerId, interval_ms: i64) -> DbResult<()> {
        let interval = interval_from_ms(interval_ms)?;
        let event_loop = self.event_loop.lock().clone().ok_or(DbError::NoSuchEntry)?;
        event_loop.modify_timer(timer, interval)
    }

    /// Removes a timer; with `wait`, also waits for a running firing.
    /// Unknown ids are ignored.
    pub fn remove_timer(&self, timer: TimerId, wait: bool) {
        let event_loop = self.event_loop.lock().clone();
        if let Some(event_loop) = event_loop {
            event_loop.remove_timer(timer, wait);
        }
    }

    /// Returns true if the timer loop has been started.
    #[must_use]
    pub fn is_event_loop_started(&self) -> bool {
        self.event_loop.lock().is_some()
    }

    // ---- time change ----

    /// Subscribes to system clock jumps, starting the monitor if needed.
    ///
    /// # Errors
    ///
    /// Returns the monitor start failure.
    pub fn register_time_changed_listener(
        &self,
        action: ListenerAction<TimeOffset>,
    ) -> DbResult<Listener> {
        let mut slot = self.time_tick.lock();
        if let Some(monitor) = slot.as_ref() {
            return monitor.register_time_changed_listener(action);
        }
        let monitor = Arc::new(TimeTickMonitor::start(
            self.event_loop()?,
            self.config.time_tick_interval,
            self.config.time_change_threshold,
        )?);
        let listener = monitor.register_time_changed_listener(action)?;
        *slot = Some(monitor);
        Ok(listener)
    }

    /// Broadcasts a clock change detected elsewhere. A no-op without a monitor.
    pub fn notify_timestamp_changed(&self, offset: TimeOffset) {
        let monitor = self.time_tick.lock().clone();
        match monitor {
            Some(monitor) => monitor.notify_time_change(offset),
            None => tracing::debug!("time tick monitor not started"),
        }
    }

    /// Drops the time-tick monitor if nobody listens any more.
    pub fn stop_time_tick_monitor_if_need(&self) {
        let mut slot = self.time_tick.lock();
        if slot.as_ref().is_some_and(|monitor| monitor.is_empty_listener()) {
            if let Some(monitor) = slot.take() {
                drop(slot);
                monitor.stop();
                tracing::debug!("time tick monitor stopped");
            }
        }
    }

    /// Returns true if the time-tick monitor is running.
    #[must_use]
    pub fn is_time_tick_monitor_valid(&self) -> bool {
        self.time_tick.lock().is_some()
    }

    // ---- user change ----

    /// Subscribes to a user change kind, starting the monitor if needed.
    ///
    /// # Errors
    ///
    /// Returns the monitor start failure.
    pub fn register_user_changed_listener(
        &self,
        action: ListenerAction<UserChangeEvent>,
        event: UserChangeEvent,
    ) -> DbResult<Listener> {
        let monitor = {
            let mut slot = self.user_change.lock();
            match slot.as_ref() {
                Some(monitor) => Arc::clone(monitor),
                None => {
                    let monitor = Arc::new(UserChangeMonitor::new());
                    monitor.start()?;
                    *slot = Some(Arc::clone(&monitor));
                    monitor
                }
            }
        };
        monitor.register_user_changed_listener(action, event)
    }

    /// Fires every user change kind. A no-op without a monitor.
    pub fn notify_user_changed(&self) {
        let monitor = self.user_change.lock().clone();
        match monitor {
            Some(monitor) => monitor.notify_user_changed(),
            None => tracing::debug!("user change monitor not started"),
        }
    }

    // ---- lock status and system API adapter ----

    fn register_access_event(
        adapter: &dyn ProcessSystemApiAdapter,
        observer: &Arc<LockStatusObserver>,
    ) -> DbResult<()> {
        let weak = Arc::downgrade(observer);
        let callback: AccessEventCallback = Arc::new(move |locked| {
            if let Some(observer) = weak.upgrade() {
                observer.on_status_change(locked);
            }
        });
        adapter.register_access_controlled_event(Some(callback))
    }

    /// Subscribes to screen lock changes; the argument is true when locked.
    ///
    /// # Errors
    ///
    /// Returns `SystemApiAdapterCall` if the adapter rejects the event
    /// registration; the observer is discarded in that case.
    pub fn register_lock_status_lister(&self, action: ListenerAction<bool>) -> DbResult<Listener> {
        let mut slot = self.lock_status.lock();
        if let Some(observer) = slot.as_ref() {
            return observer.register_lock_status_changed_listener(action);
        }
        let observer = Arc::new(LockStatusObserver::new());
        observer.start()?;
        let adapter = self.system_api.read().clone();
        if let Some(adapter) = adapter {
            Self::register_access_event(adapter.as_ref(), &observer).map_err(|err| {
                tracing::error!(error = %err, "access event registration failed");
                DbError::system_api(err.to_string())
            })?;
        }
        let listener = observer.register_lock_status_changed_listener(action)?;
        *slot = Some(observer);
        Ok(listener)
    }

    /// Installs (or clears) the platform adapter, moving the lock status
    /// event registration over if the observer is running.
    ///
    /// # Errors
    ///
    /// Returns `SystemApiAdapterCall` if the new adapter rejects the event
    /// registration; the observer is discarded in that case.
    pub fn set_process_system_api_adapter(
        &self,
        adapter: Option<Arc<dyn ProcessSystemApiAdapter>>,
    ) -> DbResult<()> {
        let mut slot = self.lock_status.lock();
        *self.system_api.write() = adapter.clone();
        let (Some(adapter), Some(observer)) = (adapter, slot.as_ref()) else {
            return Ok(());
        };
        if let Err(err) = Self::register_access_event(adapter.as_ref(), observer) {
            tracing::error!(error = %err, "access event re-registration failed");
            *slot = None;
            return Err(DbError::system_api(err.to_string()));
        }
        Ok(())
    }

    /// Returns true if a system API adapter is installed.
    #[must_use]
    pub fn is_process_system_api_adapter_valid(&self) -> bool {
        self.system_api.read().is_some()
    }

    /// Returns true while the device is locked. False without an adapter.
    #[must_use]
    pub fn is_access_controlled(&self) -> bool {
        self.system_api
            .read()
            .as_ref()
            .is_some_and(|adapter| adapter.is_access_controlled())
    }

    /// Labels the file at `path`. A not-set label is accepted and ignored.
    ///
    /// # Errors
    ///
    /// - `NotSupport` without an adapter, if `path` does not exist, or if the
    ///   adapter does not support labels
    /// - `SystemApiAdapterCall` for any other adapter failure
    pub fn set_security_option(&self, path: &Path, option: SecurityOption) -> DbResult<()> {
        let adapter = self.system_api.read().clone().ok_or(DbError::NotSupport)?;
        if !path.exists() {
            tracing::warn!(path = %path.display(), "security option target missing");
            return Err(DbError::NotSupport);
        }
        if option.label == SecurityLabel::NotSet {
            return Ok(());
        }
        let real_path = std::fs::canonicalize(path)
            .map_err(|err| DbError::system_api(format!("canonicalize {}: {err}", path.display())))?;
        adapter
            .set_security_option(&real_path, option)
            .map_err(map_adapter_error)
    }

    /// Reads the label of the file at `path`.
    ///
    /// An unreadable protection flag is reported as [`SecurityOption::ECE`],
    /// except for S3 files where it is an error.
    ///
    /// # Errors
    ///
    /// `NotSupport` without an adapter; otherwise as for
    /// [`RuntimeContext::set_security_option`].
    pub fn get_security_option(&self, path: &Path) -> DbResult<SecurityOption> {
        let adapter = self.system_api.read().clone().ok_or(DbError::NotSupport)?;
        let mut option = adapter.get_security_option(path).map_err(map_adapter_error)?;
        if option.flag == SecurityOption::INVALID_FLAG {
            if option.label == SecurityLabel::S3 {
                return Err(DbError::system_api("S3 file without a readable flag"));
            }
            option.flag = SecurityOption::ECE;
        }
        Ok(option)
    }

    /// Returns true if `device` may hold data labelled `option`. True without an adapter.
    #[must_use]
    pub fn check_device_security_ability(&self, device: &str, option: SecurityOption) -> bool {
        self.system_api
            .read()
            .as_ref()
            .map_or(true, |adapter| adapter.check_device_security_ability(device, option))
    }

    // ---- communicator ----

    /// Installs the transport adapter and hands its aggregator to auto-launch.
    ///
    /// # Errors
    ///
    /// - `NotSupport` if an adapter already produced an aggregator
    /// - the aggregator creation failure
    pub fn set_communicator_adapter(&self, adapter: Arc<dyn CommunicatorAdapter>) -> DbResult<()> {
        {
            let mut slot = self.communicator.lock();
            if slot.adapter.is_some() && slot.aggregator.is_some() {
                tracing::warn!("communicator adapter already in use");
                return Err(DbError::NotSupport);
            }
            slot.adapter = Some(adapter);
        }
        let aggregator = self.communicator_aggregator()?;
        self.auto_launch.set_communicator_aggregator(Some(aggregator));
        Ok(())
    }

    /// The transport aggregator, created through the adapter on first use.
    ///
    /// # Errors
    ///
    /// `NotInit` if neither an aggregator nor an adapter was installed.
    pub fn communicator_aggregator(&self) -> DbResult<Arc<dyn CommunicatorAggregator>> {
        let mut slot = self.communicator.lock();
        if let Some(aggregator) = slot.aggregator.as_ref() {
            return Ok(Arc::clone(aggregator));
        }
        let adapter = slot.adapter.clone().ok_or(DbError::NotInit {
            component: "communicator adapter",
        })?;
        let aggregator = adapter.create_aggregator()?;
        slot.aggregator = Some(Arc::clone(&aggregator));
        tracing::info!("communicator aggregator created");
        Ok(aggregator)
    }

    /// Replaces the aggregator directly; auto-launch follows.
    pub fn set_communicator_aggregator(&self, aggregator: Option<Arc<dyn CommunicatorAggregator>>) {
        self.communicator.lock().aggregator = aggregator.clone();
        self.auto_launch.set_communicator_aggregator(aggregator);
    }

    /// Returns true if an aggregator exists or can be created.
    #[must_use]
    pub fn is_communicator_aggregator_valid(&self) -> bool {
        let slot = self.communicator.lock();
        slot.aggregator.is_some() || slot.adapter.is_some()
    }

    /// This device's transport identity.
    ///
    /// # Errors
    ///
    /// `NotInit` without an aggregator.
    pub fn local_identity(&self) -> DbResult<String> {
        let aggregator = self.communicator.lock().aggregator.clone().ok_or(DbError::NotInit {
            component: "communicator aggregator",
        })?;
        aggregator.local_identity()
    }

    // ---- callbacks ----

    /// Installs (or clears) the user/app/store permission check.
    pub fn set_permission_check_callback(&self, callback: Option<PermissionCheckCallback>) {
        self.callbacks.write().permission_check = callback;
    }

    /// Installs (or clears) the permission check that also sees the device.
    pub fn set_permission_check_callback_v2(&self, callback: Option<PermissionCheckCallbackV2>) {
        self.callbacks.write().permission_check_v2 = callback;
    }

    /// Installs (or clears) the permission check taking a [`PermissionCheckParam`].
    pub fn set_permission_check_callback_v3(&self, callback: Option<PermissionCheckCallbackV3>) {
        self.callbacks.write().permission_check_v3 = callback;
    }

    /// Installs (or clears) the user/app/store sync activation check.
    pub fn set_sync_activation_check_callback(&self, callback: Option<SyncActivationCheckCallback>) {
        self.callbacks.write().sync_activation_check = callback;
    }

    /// Installs (or clears) the sync activation check taking a [`StoreIdentity`].
    pub fn set_sync_activation_check_callback_v2(
        &self,
        callback: Option<SyncActivationCheckCallbackV2>,
    ) {
        self.callbacks.write().sync_activation_check_v2 = callback;
    }

    /// Installs (or clears) the source of extra permission conditions.
    pub fn set_permission_condition_callback(&self, callback: Option<PermissionConditionCallback>) {
        self.callbacks.write().permission_condition = callback;
    }

    /// Installs (or clears) the store online status notifier.
    pub fn set_store_status_notifier(&self, notifier: Option<StoreStatusNotifier>) {
        self.callbacks.write().store_status_notifier = notifier;
    }

    /// Runs the newest installed permission check.
    ///
    /// # Errors
    ///
    /// `NotPermit` if the check refuses. No check installed means allowed.
    pub fn run_permission_check(&self, param: &PermissionCheckParam, flag: u8) -> DbResult<()> {
        let (v3, v2, v1) = {
            let callbacks = self.callbacks.read();
            (
                callbacks.permission_check_v3.clone(),
                callbacks.permission_check_v2.clone(),
                callbacks.permission_check.clone(),
            )
        };
        let allowed = if let Some(check) = v3 {
            check(param, flag)
        } else if let Some(check) = v2 {
            check(&param.user_id, &param.app_id, &param.store_id, &param.device_id, flag)
        } else if let Some(check) = v1 {
            check(&param.user_id, &param.app_id, &param.store_id, flag)
        } else {
            return Ok(());
        };
        if allowed {
            Ok(())
        } else {
            tracing::info!(flag, "permission check refused");
            Err(DbError::NotPermit)
        }
    }

    /// Whether the syncer of a dual-tuple store should run now. True unless
    /// an activation check says otherwise.
    #[must_use]
    pub fn is_syncer_need_active(&self, properties: &DbProperties) -> bool {
        let (v2, v1) = {
            let callbacks = self.callbacks.read();
            (
                callbacks.sync_activation_check_v2.clone(),
                callbacks.sync_activation_check.clone(),
            )
        };
        if let Some(check) = v2 {
            return check(&StoreIdentity::from(properties));
        }
        if let Some(check) = v1 {
            return check(properties.user_id(), properties.app_id(), properties.store_id());
        }
        true
    }

    /// Extra permission conditions for a store; empty without a callback.
    #[must_use]
    pub fn permission_check_param(&self, properties: &DbProperties) -> BTreeMap<String, String> {
        let callback = self.callbacks.read().permission_condition.clone();
        callback.map_or_else(BTreeMap::new, |callback| {
            callback(&StoreIdentity::from(properties))
        })
    }

    /// Reports a store's online state change through the task pool.
    pub fn notify_database_status_change(
        &self,
        user_id: &str,
        app_id: &str,
        store_id: &str,
        device: &str,
        online: bool,
    ) {
        let Some(notifier) = self.callbacks.read().store_status_notifier.clone() else {
            return;
        };
        let args = (
            user_id.to_owned(),
            app_id.to_owned(),
            store_id.to_owned(),
            device.to_owned(),
        );
        let scheduled = self.schedule_task(Box::new(move || {
            let (user_id, app_id, store_id, device) = args;
            notifier(&user_id, &app_id, &store_id, &device, online);
        }));
        if let Err(err) = scheduled {
            tracing::error!(error = %err, "store status notification not scheduled");
        }
    }

    // ---- process identity ----

    /// Sets the process label.
    pub fn set_process_label(&self, label: &str) {
        *self.process_label.write() = label.to_owned();
    }

    /// The process label.
    #[must_use]
    pub fn process_label(&self) -> String {
        self.process_label.read().clone()
    }

    /// Next session id. Never 0.
    pub fn generate_session_id(&self) -> u32 {
        loop {
            let id = self.session_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    // ---- auto-launch pass-through ----

    /// Installs the connection manager auto-launch opens stores with.
    pub fn set_connection_manager(&self, manager: Arc<dyn ConnectionManager>) {
        self.auto_launch.set_connection_manager(manager);
    }

    /// See [`AutoLaunch::enable_auto_launch`].
    ///
    /// # Errors
    ///
    /// As for [`AutoLaunch::enable_auto_launch`].
    pub fn enable_auto_launch(
        &self,
        properties: DbProperties,
        notifier: Option<AutoLaunchNotifier>,
        option: AutoLaunchOption,
    ) -> DbResult<()> {
        self.auto_launch.enable_auto_launch(properties, notifier, option)
    }

    /// See [`AutoLaunch::disable_auto_launch`].
    ///
    /// # Errors
    ///
    /// As for [`AutoLaunch::disable_auto_launch`].
    pub fn disable_auto_launch(
        &self,
        normal_identifier: &str,
        dual_identifier: &str,
        user_id: &str,
    ) -> DbResult<()> {
        self.auto_launch
            .disable_auto_launch(normal_identifier, dual_identifier, user_id)
    }

    /// See [`AutoLaunch::get_auto_launch_sync_devices`].
    #[must_use]
    pub fn get_auto_launch_sync_devices(&self, identifier: &str) -> Vec<String> {
        self.auto_launch.get_auto_launch_sync_devices(identifier)
    }

    /// See [`AutoLaunch::set_auto_launch_request_callback`].
    pub fn set_auto_launch_request_callback(
        &self,
        callback: Option<AutoLaunchRequestCallback>,
        store_type: StoreType,
    ) {
        self.auto_launch
            .set_auto_launch_request_callback(callback, store_type);
    }

    /// See [`AutoLaunch::close_connection`].
    pub fn close_auto_launch_connection(&self, store_type: StoreType, properties: &DbProperties) {
        self.auto_launch.close_connection(store_type, properties);
    }

    /// Writes diagnostics. Write errors are ignored.
    pub fn dump_common_info(&self, out: &mut dyn io::Write) {
        self.auto_launch.dump(out);
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.auto_launch.shutdown();
        if let Some(monitor) = self.time_tick.get_mut().take() {
            monitor.stop();
        }
        if let Some(monitor) = self.user_change.get_mut().take() {
            monitor.stop();
        }
        if let Some(pool) = self.task_pool.get_mut().take() {
            pool.stop();
        }
        if let Some(event_loop) = self.event_loop.get_mut().take() {
            event_loop.stop();
        }
        tracing::debug!("runtime context dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Semaphore;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn negative_interval_is_rejected_without_side_effects() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        let err = runtime
            .set_timer(-1, Arc::new(|_| Ok(())), None)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgs { .. }));
        assert!(!runtime.is_event_loop_started());
        assert!(matches!(
            runtime.modify_timer(1, -5),
            Err(DbError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn remove_unknown_timer_is_noop() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        runtime.remove_timer(42, true);
        let timer = runtime.set_timer(1000, Arc::new(|_| Ok(())), None).unwrap();
        runtime.remove_timer(timer + 1, false);
        assert_eq!(runtime.modify_timer(timer + 1, 10), Err(DbError::NoSuchEntry));
        runtime.remove_timer(timer, true);
    }

    #[test]
    fn tasks_run_and_pool_starts_lazily() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        assert!(!runtime.is_task_pool_started());
        let done = Arc::new(Semaphore::new(0));
        let signal = Arc::clone(&done);
        runtime
            .schedule_task(Box::new(move || signal.signal()))
            .unwrap();
        assert!(done.wait_timeout(Duration::from_secs(5)));
        assert!(runtime.is_task_pool_started());
        runtime.stop_task_pool();
        assert!(!runtime.is_task_pool_started());
    }

    #[test]
    fn session_ids_skip_zero() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        runtime.session_id.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(runtime.generate_session_id(), u32::MAX);
        assert_eq!(runtime.generate_session_id(), 1);
    }

    #[test]
    fn permission_check_prefers_newest_callback() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        let param = PermissionCheckParam::default();
        assert_eq!(runtime.run_permission_check(&param, 1), Ok(()));
        runtime.set_permission_check_callback(Some(Arc::new(|_, _, _, _| true)));
        runtime.set_permission_check_callback_v3(Some(Arc::new(|_, _| false)));
        assert_eq!(runtime.run_permission_check(&param, 1), Err(DbError::NotPermit));
        runtime.set_permission_check_callback_v3(None);
        assert_eq!(runtime.run_permission_check(&param, 1), Ok(()));
    }

    #[test]
    fn activation_check_defaults_to_true() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        let props = DbProperties::kv("u", "a", "s").with_instance_id(2);
        assert!(runtime.is_syncer_need_active(&props));
        runtime.set_sync_activation_check_callback(Some(Arc::new(|_, _, _| false)));
        assert!(!runtime.is_syncer_need_active(&props));
        runtime.set_sync_activation_check_callback_v2(Some(Arc::new(|identity| {
            identity.instance_id == 2
        })));
        assert!(runtime.is_syncer_need_active(&props));
    }

    #[test]
    fn adapters_absent() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        assert!(!runtime.is_access_controlled());
        assert!(runtime.check_device_security_ability("dev", SecurityOption::default()));
        assert_eq!(
            runtime.set_security_option(Path::new("."), SecurityOption::default()),
            Err(DbError::NotSupport)
        );
        assert!(matches!(
            runtime.local_identity(),
            Err(DbError::NotInit { .. })
        ));
        assert!(matches!(
            runtime.communicator_aggregator(),
            Err(DbError::NotInit { .. })
        ));
        assert!(!runtime.is_communicator_aggregator_valid());
    }

    #[test]
    fn user_change_listener_starts_monitor() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        runtime.notify_user_changed();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _listener = runtime
            .register_user_changed_listener(
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                UserChangeEvent::UserNonActive,
            )
            .unwrap();
        runtime.notify_user_changed();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn time_tick_monitor_stops_without_listeners() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        runtime.notify_timestamp_changed(10);
        let listener = runtime
            .register_time_changed_listener(Arc::new(|_| {}))
            .unwrap();
        runtime.stop_time_tick_monitor_if_need();
        assert!(runtime.is_time_tick_monitor_valid());
        drop(listener);
        runtime.stop_time_tick_monitor_if_need();
        assert!(!runtime.is_time_tick_monitor_valid());
    }

    #[test]
    fn process_label_round_trips() {
        let runtime = RuntimeContext::new(RuntimeConfig::default());
        runtime.set_process_label("com.example");
        assert_eq!(runtime.process_label(), "com.example");
    }
}
