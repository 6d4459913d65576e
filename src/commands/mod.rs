//! JSON command surface for UI clients.
//!
//! Every handler takes the shared engine (or just the database) plus an
//! optional JSON argument and returns a JSON value or a user-facing error
//! string.

pub mod settings;
pub mod sync;

use serde_json::Value;

use crate::db::DbState;
use crate::sync::SyncEngine;

/// Commands that only need the database and keyring. They are served before
/// the terminal is onboarded as well. `None` when `command` is not one of
/// them.
pub fn dispatch_settings(db: &DbState, command: &str, arg0: Option<Value>) -> Option<Result<Value, String>> {
    let result = match command {
        "settings_is_configured" => settings::settings_is_configured(),
        "settings_update_terminal_credentials" => settings::settings_update_terminal_credentials(arg0),
        "settings_factory_reset" => settings::settings_factory_reset(db),
        "settings_get_sync_config" => settings::settings_get_sync_config(db),
        "settings_update_sync_config" => settings::settings_update_sync_config(db, arg0),
        _ => return None,
    };
    Some(result)
}

/// Route a command by name.
pub async fn dispatch(engine: &SyncEngine, command: &str, arg0: Option<Value>) -> Result<Value, String> {
    match command {
        "sync_enqueue" => sync::sync_enqueue(engine, arg0),
        "sync_get_status" => sync::sync_get_status(engine),
        "sync_force" => sync::sync_force(engine).await,
        "sync_retry_failed" => sync::sync_retry_failed(engine).await,
        "sync_retry_item" => sync::sync_retry_item(engine, arg0).await,
        "sync_discard_failed" => sync::sync_discard_failed(engine, arg0),
        "sync_list_failed" => sync::sync_list_failed(engine, arg0),
        "sync_force_full_resync" => sync::sync_force_full_resync(engine).await,
        "sync_read_entities" => sync::sync_read_entities(engine, arg0),
        other => dispatch_settings(engine.db(), other, arg0)
            .unwrap_or_else(|| Err(format!("Unknown command: {other}"))),
    }
}
