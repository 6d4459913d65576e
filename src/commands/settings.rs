use serde_json::{json, Value};
use tracing::info;

use crate::config::{SyncConfig, SETTINGS_CATEGORY};
use crate::db::{self, DbState};
use crate::storage;

fn lock_conn(db: &DbState) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, String> {
    db.conn.lock().map_err(|e| e.to_string())
}

/// Overlay the keys of `patch` onto `current`. Unknown keys are rejected so
/// a typo does not silently keep the old value.
fn apply_config_patch(current: &SyncConfig, patch: Value) -> Result<SyncConfig, String> {
    let Value::Object(patch) = patch else {
        return Err("Sync config payload must be an object".into());
    };
    let mut merged = serde_json::to_value(current).map_err(|e| e.to_string())?;
    let Value::Object(fields) = &mut merged else {
        return Err("Sync config did not serialize to an object".into());
    };
    for (key, value) in patch {
        if !fields.contains_key(&key) {
            return Err(format!("Unknown sync setting: {key}"));
        }
        fields.insert(key, value);
    }
    serde_json::from_value(merged).map_err(|e| format!("Invalid sync config: {e}"))
}

pub fn settings_is_configured() -> Result<Value, String> {
    let configured = storage::is_configured();
    let reason = if configured {
        "all_credentials_present"
    } else {
        "missing_credentials"
    };
    Ok(json!({ "configured": configured, "reason": reason }))
}

/// Onboarding: store the admin URL, API key and terminal id in the keyring.
/// A running daemon picks them up on its next start.
pub fn settings_update_terminal_credentials(arg0: Option<Value>) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing credentials payload")?;
    storage::update_credentials(&payload)
}

/// Delete stored credentials and sync settings. Queued mutations are kept.
pub fn settings_factory_reset(db: &DbState) -> Result<Value, String> {
    {
        let conn = lock_conn(db)?;
        db::delete_all_settings(&conn, SETTINGS_CATEGORY)?;
    }
    let result = storage::factory_reset()?;
    info!("factory reset complete");
    Ok(result)
}

pub fn settings_get_sync_config(db: &DbState) -> Result<Value, String> {
    let conn = lock_conn(db)?;
    serde_json::to_value(SyncConfig::load(&conn)).map_err(|e| e.to_string())
}

/// Persist a partial sync config. Takes effect on the next start.
pub fn settings_update_sync_config(db: &DbState, arg0: Option<Value>) -> Result<Value, String> {
    let patch = arg0.ok_or("Missing sync config payload")?;
    let conn = lock_conn(db)?;
    let updated = apply_config_patch(&SyncConfig::load(&conn), patch)?;
    updated.save(&conn)?;
    let saved = SyncConfig::load(&conn);
    info!(?saved, "sync config updated");
    Ok(json!({
        "config": serde_json::to_value(&saved).map_err(|e| e.to_string())?,
        "appliesOnRestart": true,
    }))
}
