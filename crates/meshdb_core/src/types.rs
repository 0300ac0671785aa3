//! Store identity and open properties.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const MAX_STORE_PARAM_LEN: usize = 128;

/// Kind of store an auto-launch item opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum StoreType {
    /// Key-value store.
    #[default]
    Kv,
    /// Relational store.
    Relational,
}

/// Sensitivity label of a store's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityLabel {
    /// No label configured.
    #[default]
    NotSet,
    /// S0.
    S0,
    /// S1.
    S1,
    /// S2.
    S2,
    /// S3.
    S3,
    /// S4.
    S4,
}

/// Security label plus protection flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SecurityOption {
    /// Sensitivity label.
    pub label: SecurityLabel,
    /// Protection flag; see [`SecurityOption::ECE`] and [`SecurityOption::SECE`].
    pub flag: i32,
}

impl SecurityOption {
    /// Encrypted with the device-class key.
    pub const ECE: i32 = 0;
    /// Encrypted with the screen-lock-class key.
    pub const SECE: i32 = 1;
    /// Flag the adapter reports when it could not read the real flag.
    pub const INVALID_FLAG: i32 = -1;

    /// Creates an option.
    #[must_use]
    pub const fn new(label: SecurityLabel, flag: i32) -> Self {
        Self { label, flag }
    }

    /// Returns true if no label is configured.
    #[must_use]
    pub fn is_not_set(&self) -> bool {
        *self == Self::default()
    }
}

fn hash_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Identifier of a store for the (user, app, store) tuple.
#[must_use]
pub fn generate_identifier(user_id: &str, app_id: &str, store_id: &str) -> String {
    hash_hex(&format!("{user_id}-{app_id}-{store_id}"))
}

/// Identifier shared across users: the (app, store) tuple only.
#[must_use]
pub fn generate_dual_tuple_identifier(app_id: &str, store_id: &str) -> String {
    hash_hex(&format!("{app_id}-{store_id}"))
}

fn is_valid_store_param(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_STORE_PARAM_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns true if every id is non-empty, at most 128 chars and made of
/// ASCII alphanumerics or `_`. The user id is skipped when `ignore_user_id`
/// is set (dual-tuple stores).
#[must_use]
pub fn check_store_parameter(
    store_id: &str,
    app_id: &str,
    user_id: &str,
    ignore_user_id: bool,
) -> bool {
    is_valid_store_param(store_id)
        && is_valid_store_param(app_id)
        && (ignore_user_id || is_valid_store_param(user_id))
}

/// Shortened identifier for log lines.
pub(crate) fn short_id(identifier: &str) -> &str {
    identifier.get(..6).unwrap_or(identifier)
}

/// How to open one store.
///
/// Shared behind an `Arc` between an auto-launch item and the connection
/// opened from it; treat it as immutable once handed over.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DbProperties {
    store_type: StoreType,
    user_id: String,
    app_id: String,
    store_id: String,
    instance_id: u32,
    data_dir: PathBuf,
    identifier: String,
    dual_tuple_identifier: String,
    sync_dual_tuple_mode: bool,
    security_option: SecurityOption,
    auto_launch_session: u32,
}

impl DbProperties {
    /// Properties for a store, with both identifiers derived from the ids.
    pub fn new(
        store_type: StoreType,
        user_id: impl Into<String>,
        app_id: impl Into<String>,
        store_id: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        let app_id = app_id.into();
        let store_id = store_id.into();
        Self {
            store_type,
            identifier: generate_identifier(&user_id, &app_id, &store_id),
            dual_tuple_identifier: generate_dual_tuple_identifier(&app_id, &store_id),
            user_id,
            app_id,
            store_id,
            ..Self::default()
        }
    }

    /// Key-value store properties.
    pub fn kv(
        user_id: impl Into<String>,
        app_id: impl Into<String>,
        store_id: impl Into<String>,
    ) -> Self {
        Self::new(StoreType::Kv, user_id, app_id, store_id)
    }

    /// Relational store properties.
    pub fn relational(
        user_id: impl Into<String>,
        app_id: impl Into<String>,
        store_id: impl Into<String>,
    ) -> Self {
        Self::new(StoreType::Relational, user_id, app_id, store_id)
    }

    /// Sets the instance id of a multi-instance store.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Enables dual-tuple sync mode.
    #[must_use]
    pub fn with_sync_dual_tuple_mode(mut self, value: bool) -> Self {
        self.sync_dual_tuple_mode = value;
        self
    }

    /// Sets the security option.
    #[must_use]
    pub fn with_security_option(mut self, option: SecurityOption) -> Self {
        self.security_option = option;
        self
    }

    /// Overrides the normal identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Overrides the dual-tuple identifier.
    #[must_use]
    pub fn with_dual_tuple_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.dual_tuple_identifier = identifier.into();
        self
    }

    /// Tags the properties with the auto-launch session that opened them.
    #[must_use]
    pub fn with_auto_launch_session(mut self, session: u32) -> Self {
        self.auto_launch_session = session;
        self
    }

    /// Store kind.
    #[must_use]
    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    /// User id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// App id.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Store id.
    #[must_use]
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Instance id, 0 for single-instance stores.
    #[must_use]
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Normal (user, app, store) identifier.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Dual-tuple (app, store) identifier.
    #[must_use]
    pub fn dual_tuple_identifier(&self) -> &str {
        &self.dual_tuple_identifier
    }

    /// Whether dual-tuple sync mode is on.
    #[must_use]
    pub fn sync_dual_tuple_mode(&self) -> bool {
        self.sync_dual_tuple_mode
    }

    /// Security option.
    #[must_use]
    pub fn security_option(&self) -> SecurityOption {
        self.security_option
    }

    /// Auto-launch session tag, 0 if the store was not auto-launched.
    #[must_use]
    pub fn auto_launch_session(&self) -> u32 {
        self.auto_launch_session
    }

    /// The identifier auto-launch keys this store by.
    #[must_use]
    pub fn auto_launch_identifier(&self) -> &str {
        if self.sync_dual_tuple_mode {
            &self.dual_tuple_identifier
        } else {
            &self.identifier
        }
    }

    pub(crate) fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_hex_sha256() {
        let props = DbProperties::kv("user0", "app0", "store0");
        assert_eq!(props.identifier().len(), 64);
        assert_eq!(props.identifier(), generate_identifier("user0", "app0", "store0"));
        assert_ne!(props.identifier(), props.dual_tuple_identifier());

        let other_user = DbProperties::kv("user1", "app0", "store0");
        assert_ne!(props.identifier(), other_user.identifier());
        assert_eq!(props.dual_tuple_identifier(), other_user.dual_tuple_identifier());
    }

    #[test]
    fn auto_launch_identifier_follows_mode() {
        let props = DbProperties::kv("u", "a", "s");
        assert_eq!(props.auto_launch_identifier(), props.identifier());
        let dual = props.with_sync_dual_tuple_mode(true);
        assert_eq!(dual.auto_launch_identifier(), dual.dual_tuple_identifier());
    }

    #[test]
    fn store_parameter_check() {
        assert!(check_store_parameter("store_1", "app", "user", false));
        assert!(!check_store_parameter("", "app", "user", false));
        assert!(!check_store_parameter("store-1", "app", "user", false));
        assert!(!check_store_parameter(&"s".repeat(129), "app", "user", false));
        assert!(!check_store_parameter("store", "app", "", false));
        assert!(check_store_parameter("store", "app", "", true));
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("abcdef0123"), "abcdef");
        assert_eq!(short_id("abc"), "abc");
    }
}
