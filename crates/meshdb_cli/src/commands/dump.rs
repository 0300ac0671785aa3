//! Dump command implementation.

use meshdb_core::{
    check_store_parameter, AutoLaunchOption, ConnectionManager, DbError, DbProperties, DbResult,
    RuntimeConfig, RuntimeContext, StoreConnection,
};
use std::io::Write;
use std::sync::Arc;

/// Connection manager for stores owned by their apps; every open reports
/// `AlreadyOpened` so enabled items stay idle.
struct OwnedByApp;

impl ConnectionManager for OwnedByApp {
    fn get_connection(&self, properties: &DbProperties, _: bool) -> DbResult<StoreConnection> {
        tracing::debug!(store = properties.store_id(), "store is owned by its app");
        Err(DbError::AlreadyOpened)
    }

    fn release_connection(&self, _: StoreConnection) -> DbResult<()> {
        Ok(())
    }
}

/// Runs the dump command.
pub fn run(user: &str, app: &str, stores: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = RuntimeContext::new(RuntimeConfig::default());
    runtime.set_connection_manager(Arc::new(OwnedByApp));

    for store in stores {
        if !check_store_parameter(store, app, user, false) {
            return Err(format!("invalid store parameters for {store:?}").into());
        }
        runtime.enable_auto_launch(
            DbProperties::kv(user, app, store.as_str()),
            None,
            AutoLaunchOption::default(),
        )?;
    }

    let mut out = std::io::stdout().lock();
    writeln!(out, "Runtime")?;
    writeln!(out, "=======")?;
    runtime.dump_common_info(&mut out);
    Ok(())
}
