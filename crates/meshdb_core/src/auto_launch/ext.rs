//! On-demand opens for identifiers nobody enabled.

use super::item::{erase_item, get_item, get_item_mut, AutoLaunchItem};
use super::{AutoLaunchItemState, Shared};
use crate::error::{DbError, DbResult};
use crate::interfaces::{AutoLaunchParam, AutoLaunchStatus, ChangedData};
use crate::types::{check_store_parameter, short_id, DbProperties, StoreType};
use std::sync::Arc;

impl Shared {
    /// Asks the request callbacks for `identifier` and schedules the open.
    pub(super) fn auto_launch_ext(self: &Arc<Self>, identifier: &str, user_id: &str) -> DbResult<()> {
        let mut param = AutoLaunchParam {
            user_id: user_id.to_owned(),
            ..AutoLaunchParam::default()
        };
        let store_type = self.ext_auto_launch_request_callback(identifier, &mut param)?;
        let properties = match self.get_auto_launch_properties(&param, store_type) {
            Ok(properties) => properties,
            Err(err) => {
                tracing::error!(error = %err, "request callback returned bad parameters");
                if let Some(notifier) = param.notifier.clone() {
                    let (user, app, store) = (param.user_id, param.app_id, param.store_id);
                    let scheduled = self.schedule(move || {
                        notifier(&user, &app, &store, AutoLaunchStatus::InvalidParam);
                    });
                    if let Err(err) = scheduled {
                        tracing::error!(error = %err, "invalid param notification not scheduled");
                    }
                }
                return Err(err);
            }
        };

        let item = AutoLaunchItem::new(properties, param.notifier.clone(), &param.option);
        let shared = Arc::clone(self);
        let identifier = identifier.to_owned();
        let user_id = param.user_id;
        self.schedule(move || shared.auto_launch_ext_task(&identifier, &user_id, item))
    }

    fn ext_auto_launch_request_callback(
        &self,
        identifier: &str,
        param: &mut AutoLaunchParam,
    ) -> DbResult<StoreType> {
        let callbacks: Vec<_> = self
            .ext
            .lock()
            .request_callbacks
            .iter()
            .map(|(store_type, callback)| (*store_type, Arc::clone(callback)))
            .collect();
        if callbacks.is_empty() {
            tracing::info!("no auto launch request callback installed");
            return Err(DbError::NotFound);
        }
        for (store_type, callback) in callbacks {
            if callback(identifier, param) {
                tracing::info!(?store_type, identifier = short_id(identifier), "request accepted");
                return Ok(store_type);
            }
        }
        tracing::info!(identifier = short_id(identifier), "request declined");
        Err(DbError::NotFound)
    }

    fn get_auto_launch_properties(
        &self,
        param: &AutoLaunchParam,
        store_type: StoreType,
    ) -> DbResult<DbProperties> {
        let option = &param.option;
        match store_type {
            StoreType::Kv => {
                if !check_store_parameter(
                    &param.store_id,
                    &param.app_id,
                    &param.user_id,
                    option.sync_dual_tuple_mode,
                ) {
                    return Err(DbError::invalid_args("kv store parameters"));
                }
                let mut properties =
                    DbProperties::kv(&param.user_id, &param.app_id, &param.store_id)
                        .with_data_dir(option.data_dir.clone())
                        .with_sync_dual_tuple_mode(option.sync_dual_tuple_mode);
                let adapter_valid = self
                    .runtime
                    .upgrade()
                    .is_some_and(|runtime| runtime.is_process_system_api_adapter_valid());
                if adapter_valid {
                    properties = properties.with_security_option(option.security_option);
                }
                Ok(properties)
            }
            StoreType::Relational => {
                if !check_store_parameter(&param.store_id, &param.app_id, &param.user_id, false) {
                    return Err(DbError::invalid_args("relational store parameters"));
                }
                let session = self.runtime()?.generate_session_id();
                Ok(
                    DbProperties::relational(&param.user_id, &param.app_id, &param.store_id)
                        .with_data_dir(param.path.clone())
                        .with_sync_dual_tuple_mode(option.sync_dual_tuple_mode)
                        .with_auto_launch_session(session),
                )
            }
        }
    }

    fn auto_launch_ext_task(self: &Arc<Self>, identifier: &str, user_id: &str, mut item: AutoLaunchItem) {
        {
            let mut ext = self.ext.lock();
            if get_item(&ext.items, identifier, user_id).is_some() {
                tracing::warn!(identifier = short_id(identifier), "already opened on demand");
                return;
            }
            ext.items
                .entry(identifier.to_owned())
                .or_default()
                .insert(user_id.to_owned(), item.clone());
        }

        let opened = self
            .check_auto_launch_real_path(&mut item)
            .and_then(|()| self.open_one_connection(&mut item))
            .and_then(|()| {
                self.register_observer_and_lifecycle(&mut item, identifier, true)
                    .inspect_err(|err| {
                        tracing::error!(error = %err, "register after ext open failed, closing");
                        self.try_close_connection(&mut item);
                    })
            });

        let mut ext = self.ext.lock();
        match opened {
            Err(err) => {
                tracing::info!(error = %err, identifier = short_id(identifier), "ext open abandoned");
                erase_item(&mut ext.items, identifier, user_id);
            }
            Ok(()) => {
                if let Some(entry) = get_item_mut(&mut ext.items, identifier, user_id) {
                    entry.properties = Arc::clone(&item.properties);
                    entry.conn = item.conn;
                    entry.observer_handle = item.observer_handle;
                    entry.is_write_open_notified = false;
                    entry.state = AutoLaunchItemState::Idle;
                }
                tracing::info!(identifier = short_id(identifier), "ext open ok");
            }
        }
    }

    fn check_auto_launch_real_path(&self, item: &mut AutoLaunchItem) -> DbResult<()> {
        let data_dir = item.properties.data_dir();
        let canonical = if data_dir.as_os_str().is_empty() {
            None
        } else {
            std::fs::canonicalize(data_dir).ok()
        };
        let Some(canonical) = canonical else {
            tracing::error!(store_type = ?item.store_type, "data dir does not resolve");
            self.notify_async(item, AutoLaunchStatus::InvalidParam);
            return Err(DbError::invalid_args("auto launch data dir"));
        };
        Arc::make_mut(&mut item.properties).set_data_dir(canonical);
        Ok(())
    }

    pub(super) fn ext_observer_func(&self, data: &ChangedData, identifier: &str, user_id: &str) {
        let Some(item) = get_item(&self.ext.lock().items, identifier, user_id).cloned() else {
            tracing::warn!(identifier = short_id(identifier), "ext observer fired for unknown item");
            return;
        };
        if let Some(observer) = &item.observer {
            observer.on_change(data);
        }
        let first_write = {
            let mut ext = self.ext.lock();
            match get_item_mut(&mut ext.items, identifier, user_id) {
                Some(entry) if !entry.is_write_open_notified && entry.notifier.is_some() => {
                    entry.is_write_open_notified = true;
                    true
                }
                _ => false,
            }
        };
        if first_write {
            self.notify_async(&item, AutoLaunchStatus::WriteOpened);
        }
    }

    pub(super) fn ext_life_cycle_task(&self, identifier: &str, user_id: &str) {
        let Some(mut item) = erase_item(&mut self.ext.lock().items, identifier, user_id) else {
            return;
        };
        tracing::info!(identifier = short_id(identifier), "closing idle ext store");
        self.try_close_connection(&mut item);
        if item.is_write_open_notified {
            item.notify(AutoLaunchStatus::WriteClosed);
        }
    }

    pub(super) fn close_connection(&self, store_type: StoreType, properties: &DbProperties) {
        if store_type != StoreType::Relational {
            return;
        }
        let user_id = properties.user_id();
        let item = {
            let mut ext = self.ext.lock();
            let key = [properties.identifier(), properties.dual_tuple_identifier()]
                .into_iter()
                .find(|key| get_item(&ext.items, key, user_id).is_some())
                .map(str::to_owned);
            let Some(key) = key else {
                tracing::debug!("no ext item to close");
                return;
            };
            let session = get_item(&ext.items, &key, user_id)
                .map(|item| item.properties.auto_launch_session());
            if session != Some(properties.auto_launch_session()) {
                tracing::debug!("ext item belongs to another session");
                return;
            }
            erase_item(&mut ext.items, &key, user_id)
        };
        if let Some(mut item) = item {
            self.try_close_connection(&mut item);
        }
    }
}
