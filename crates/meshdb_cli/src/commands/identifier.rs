//! Identifier command implementation.

use meshdb_core::{check_store_parameter, generate_dual_tuple_identifier, generate_identifier};

/// Runs the identifier command.
pub fn run(user: &str, app: &str, store: &str, dual: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !check_store_parameter(store, app, user, dual) {
        return Err(format!(
            "invalid store parameters: ids must be 1-128 chars of [A-Za-z0-9_] (user={user:?}, app={app:?}, store={store:?})"
        )
        .into());
    }

    println!("Identifier:  {}", generate_identifier(user, app, store));
    println!("Dual tuple:  {}", generate_dual_tuple_identifier(app, store));
    if dual {
        println!("Auto-launch keys this store by its dual tuple identifier.");
    }
    Ok(())
}
