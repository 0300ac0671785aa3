//! Auto-launch table entries.

use crate::interfaces::{
    AutoLaunchNotifier, AutoLaunchOption, AutoLaunchStatus, ConflictNotifier, ObserverHandle,
    StoreConnection, StoreObserver,
};
use crate::types::{DbProperties, StoreType};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-item state. Transitions happen only under the table lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AutoLaunchItemState {
    /// Constructed, not yet admitted.
    #[default]
    UnInitial,
    /// Admitted; the first open is in flight. Disable is refused.
    InEnable,
    /// A device-online or unknown-identifier open is in flight.
    InCommunicatorCallBack,
    /// The "no more users" close is in flight.
    InLifeCycleCallBack,
    /// Open or cleanly closed; safe to disable, observe or reopen.
    Idle,
}

/// One tracked store.
#[derive(Clone)]
pub(crate) struct AutoLaunchItem {
    pub(crate) properties: Arc<DbProperties>,
    pub(crate) notifier: Option<AutoLaunchNotifier>,
    pub(crate) observer: Option<Arc<dyn StoreObserver>>,
    pub(crate) conflict_type: u32,
    pub(crate) conflict_notifier: Option<ConflictNotifier>,
    pub(crate) conn: Option<StoreConnection>,
    pub(crate) observer_handle: Option<ObserverHandle>,
    pub(crate) is_write_open_notified: bool,
    pub(crate) state: AutoLaunchItemState,
    pub(crate) is_disable: bool,
    pub(crate) in_observer: bool,
    pub(crate) is_auto_sync: bool,
    pub(crate) store_type: StoreType,
}

impl AutoLaunchItem {
    pub(crate) fn new(
        properties: DbProperties,
        notifier: Option<AutoLaunchNotifier>,
        option: &AutoLaunchOption,
    ) -> Self {
        Self {
            store_type: properties.store_type(),
            properties: Arc::new(properties),
            notifier,
            observer: option.observer.clone(),
            conflict_type: option.conflict_type,
            conflict_notifier: option.conflict_notifier.clone(),
            conn: None,
            observer_handle: None,
            is_write_open_notified: false,
            state: AutoLaunchItemState::UnInitial,
            is_disable: false,
            in_observer: false,
            is_auto_sync: option.is_auto_sync,
        }
    }

    pub(crate) fn user_id(&self) -> &str {
        self.properties.user_id()
    }

    pub(crate) fn is_dual_tuple_mode(&self) -> bool {
        self.properties.sync_dual_tuple_mode()
    }

    /// Calls the notifier with `status` on the current thread.
    pub(crate) fn notify(&self, status: AutoLaunchStatus) {
        if let Some(notifier) = &self.notifier {
            let props = &self.properties;
            notifier(props.user_id(), props.app_id(), props.store_id(), status);
        }
    }
}

/// identifier -> user id -> item.
pub(crate) type ItemMap = BTreeMap<String, BTreeMap<String, AutoLaunchItem>>;

pub(crate) fn get_item<'a>(
    map: &'a ItemMap,
    identifier: &str,
    user_id: &str,
) -> Option<&'a AutoLaunchItem> {
    map.get(identifier).and_then(|users| users.get(user_id))
}

pub(crate) fn get_item_mut<'a>(
    map: &'a mut ItemMap,
    identifier: &str,
    user_id: &str,
) -> Option<&'a mut AutoLaunchItem> {
    map.get_mut(identifier).and_then(|users| users.get_mut(user_id))
}

pub(crate) fn erase_item(map: &mut ItemMap, identifier: &str, user_id: &str) -> Option<AutoLaunchItem> {
    let users = map.get_mut(identifier)?;
    let item = users.remove(user_id);
    if users.is_empty() {
        map.remove(identifier);
    }
    item
}

pub(crate) fn item_count(map: &ItemMap) -> usize {
    map.values().map(BTreeMap::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_drops_empty_identifier() {
        let mut map = ItemMap::new();
        let item = AutoLaunchItem::new(
            DbProperties::kv("u", "a", "s"),
            None,
            &AutoLaunchOption::default(),
        );
        map.entry("id".into())
            .or_default()
            .insert("u".into(), item.clone());
        map.entry("id".into()).or_default().insert("v".into(), item);
        assert_eq!(item_count(&map), 2);

        assert!(erase_item(&mut map, "id", "u").is_some());
        assert!(map.contains_key("id"));
        assert!(erase_item(&mut map, "id", "v").is_some());
        assert!(map.is_empty());
        assert!(erase_item(&mut map, "id", "v").is_none());
    }

    #[test]
    fn new_item_copies_option() {
        let option = AutoLaunchOption {
            conflict_type: 3,
            is_auto_sync: false,
            ..AutoLaunchOption::default()
        };
        let item = AutoLaunchItem::new(DbProperties::relational("u", "a", "s"), None, &option);
        assert_eq!(item.conflict_type, 3);
        assert!(!item.is_auto_sync);
        assert_eq!(item.store_type, StoreType::Relational);
        assert_eq!(item.state, AutoLaunchItemState::UnInitial);
    }
}
