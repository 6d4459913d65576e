//! Terminal credential storage using the OS credential store.
//!
//! The admin dashboard URL, API key and terminal id never touch SQLite; they
//! live in the platform keyring (Keychain, DPAPI, kernel keyutils). Process
//! environment variables take precedence so headless deployments and CI can
//! run without a keyring.

use keyring::Entry;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::remote;

const SERVICE_NAME: &str = "barpos-sync";

// Credential keys
pub const KEY_ADMIN_URL: &str = "admin_dashboard_url";
pub const KEY_API_KEY: &str = "pos_api_key";
pub const KEY_TERMINAL_ID: &str = "terminal_id";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_API_KEY, KEY_TERMINAL_ID];

pub const ENV_ADMIN_URL: &str = "BARPOS_ADMIN_URL";
pub const ENV_API_KEY: &str = "BARPOS_API_KEY";
pub const ENV_TERMINAL_ID: &str = "BARPOS_TERMINAL_ID";

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Credentials needed to talk to the remote system of record.
#[derive(Debug, Clone)]
pub struct TerminalCredentials {
    pub admin_url: String,
    pub api_key: Zeroizing<String>,
    pub terminal_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsPayload {
    #[serde(alias = "pos_api_key", alias = "api_key")]
    api_key: String,
    #[serde(default, alias = "terminal_id")]
    terminal_id: Option<String>,
    #[serde(
        default,
        alias = "adminDashboardUrl",
        alias = "admin_dashboard_url",
        alias = "admin_url"
    )]
    admin_url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse an onboarding payload. `apiKey` may be a raw key or a connection
/// string; values decoded from a connection string override the explicit
/// fields.
pub fn parse_credentials(payload: &Value) -> Result<TerminalCredentials, String> {
    let parsed: CredentialsPayload = serde_json::from_value(payload.clone())
        .map_err(|e| format!("Invalid credentials payload: {e}"))?;

    let raw_key = Zeroizing::new(parsed.api_key);
    let mut api_key = raw_key.trim().to_string();
    let mut terminal_id = non_empty(parsed.terminal_id);
    let mut admin_url = non_empty(parsed.admin_url);

    if let Some(decoded_key) = remote::extract_api_key_from_connection_string(&raw_key) {
        api_key = decoded_key;
        if let Some(tid) = remote::extract_terminal_id_from_connection_string(&raw_key) {
            terminal_id = Some(tid);
        }
        if let Some(url) = remote::extract_admin_url_from_connection_string(&raw_key) {
            admin_url = Some(url);
        }
    }

    if api_key.is_empty() {
        return Err("Missing required field: apiKey".into());
    }
    let admin_url = admin_url
        .map(|u| remote::normalize_admin_url(&u))
        .ok_or("Missing required field: adminUrl")?;

    Ok(TerminalCredentials {
        admin_url,
        api_key: Zeroizing::new(api_key),
        terminal_id,
    })
}

/// Store terminal credentials received during onboarding.
pub fn update_credentials(payload: &Value) -> Result<Value, String> {
    let creds = parse_credentials(payload)?;
    set_credential(KEY_ADMIN_URL, &creds.admin_url)?;
    set_credential(KEY_API_KEY, &creds.api_key)?;
    match creds.terminal_id.as_deref() {
        Some(tid) => set_credential(KEY_TERMINAL_ID, tid)?,
        None => delete_credential(KEY_TERMINAL_ID)?,
    }
    info!(admin_url = %creds.admin_url, terminal_id = ?creds.terminal_id, "terminal credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// The terminal is configured when the admin URL and API key are present.
pub fn is_configured() -> bool {
    load_credentials().is_some()
}

/// Credentials from the environment when set, otherwise from the keyring.
pub fn load_credentials() -> Option<TerminalCredentials> {
    let env = |name: &str| non_empty(std::env::var(name).ok());

    let admin_url = env(ENV_ADMIN_URL).or_else(|| get_credential(KEY_ADMIN_URL))?;
    let api_key = Zeroizing::new(env(ENV_API_KEY).or_else(|| get_credential(KEY_API_KEY))?);
    let terminal_id = env(ENV_TERMINAL_ID).or_else(|| get_credential(KEY_TERMINAL_ID));

    Some(TerminalCredentials {
        admin_url: remote::normalize_admin_url(&admin_url),
        api_key,
        terminal_id,
    })
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}
