//! Sync engine configuration persisted in `local_settings` (category `sync`).

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::db;

pub const SETTINGS_CATEGORY: &str = "sync";

const DEFAULT_BATCH_SIZE: usize = 25;
const DEFAULT_MAX_RETRIES: i64 = 5;
const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 300_000;
const DEFAULT_INTERVAL_SECS: u64 = 15;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_retries: i64,
    /// First backoff delay. Zero disables backoff entirely.
    pub base_retry_delay_ms: i64,
    pub max_retry_delay_ms: i64,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
    pub resync_entity_types: Vec<String>,
    /// Relationship-tier natural key field per entity type.
    pub natural_keys: HashMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            base_retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: MAX_RETRY_DELAY_MS,
            interval_secs: DEFAULT_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            resync_entity_types: vec!["session".into(), "order".into()],
            natural_keys: HashMap::from([
                ("session".to_string(), "table_id".to_string()),
                ("order".to_string(), "session_id".to_string()),
            ]),
        }
    }
}

fn parse_setting<T: std::str::FromStr>(conn: &Connection, key: &str, fallback: T) -> T {
    match db::get_setting(conn, SETTINGS_CATEGORY, key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring malformed sync setting");
                fallback
            }
        },
        None => fallback,
    }
}

fn parse_json_setting<T: serde::de::DeserializeOwned>(conn: &Connection, key: &str, fallback: T) -> T {
    match db::get_setting(conn, SETTINGS_CATEGORY, key) {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(key, error = %e, "ignoring malformed sync setting");
            fallback
        }),
        None => fallback,
    }
}

impl SyncConfig {
    /// Read the configuration, falling back to defaults per key.
    pub fn load(conn: &Connection) -> Self {
        let d = Self::default();
        let config = Self {
            batch_size: parse_setting(conn, "batch_size", d.batch_size),
            max_retries: parse_setting(conn, "max_retries", d.max_retries),
            base_retry_delay_ms: parse_setting(conn, "base_retry_delay_ms", d.base_retry_delay_ms),
            max_retry_delay_ms: parse_setting(conn, "max_retry_delay_ms", d.max_retry_delay_ms),
            interval_secs: parse_setting(conn, "interval_secs", d.interval_secs),
            request_timeout_secs: parse_setting(conn, "request_timeout_secs", d.request_timeout_secs),
            resync_entity_types: parse_json_setting(conn, "resync_entity_types", d.resync_entity_types),
            natural_keys: parse_json_setting(conn, "natural_keys", d.natural_keys),
        };
        config.sanitized()
    }

    pub fn save(&self, conn: &Connection) -> Result<(), String> {
        let c = self.clone().sanitized();
        let set = |key: &str, value: String| db::set_setting(conn, SETTINGS_CATEGORY, key, &value);
        set("batch_size", c.batch_size.to_string())?;
        set("max_retries", c.max_retries.to_string())?;
        set("base_retry_delay_ms", c.base_retry_delay_ms.to_string())?;
        set("max_retry_delay_ms", c.max_retry_delay_ms.to_string())?;
        set("interval_secs", c.interval_secs.to_string())?;
        set("request_timeout_secs", c.request_timeout_secs.to_string())?;
        set(
            "resync_entity_types",
            serde_json::to_string(&c.resync_entity_types).map_err(|e| e.to_string())?,
        )?;
        set(
            "natural_keys",
            serde_json::to_string(&c.natural_keys).map_err(|e| e.to_string())?,
        )?;
        Ok(())
    }

    /// Clamp values into usable ranges.
    fn sanitized(mut self) -> Self {
        self.batch_size = self.batch_size.clamp(1, 500);
        self.max_retries = self.max_retries.max(1);
        self.base_retry_delay_ms = self.base_retry_delay_ms.max(0);
        self.max_retry_delay_ms = self.max_retry_delay_ms.max(self.base_retry_delay_ms);
        self.interval_secs = self.interval_secs.max(1);
        self.request_timeout_secs = self.request_timeout_secs.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn natural_key_field(&self, entity_type: &str) -> Option<&str> {
        self.natural_keys.get(entity_type).map(String::as_str)
    }

    /// Delay before the next automatic attempt after a transient failure,
    /// given the delay used last time (0 for the first failure). Doubles up
    /// to the ceiling; zero when backoff is disabled.
    pub fn next_retry_delay_ms(&self, previous_delay_ms: i64) -> i64 {
        if self.base_retry_delay_ms <= 0 {
            return 0;
        }
        if previous_delay_ms <= 0 {
            return self.base_retry_delay_ms.min(self.max_retry_delay_ms);
        }
        previous_delay_ms
            .saturating_mul(2)
            .clamp(self.base_retry_delay_ms, self.max_retry_delay_ms)
    }
}
