//! Local entity cache backed by the `entity_cache` table.
//!
//! Each row mirrors the last known state of one server entity, keyed by the
//! identifier the client currently knows it by (temporary until its create
//! mutation syncs, real afterwards). Reads never touch the network. Every
//! write replaces the whole `data` document in one statement so readers see
//! either the optimistic or the confirmed record, never a mix.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

use crate::queue::now_ts;
use crate::temp_id;

/// Status values that hide a record from open-only list views.
pub const CLOSED_STATUSES: &[&str] = &["closed", "cancelled", "completed"];

const RECORD_COLUMNS: &str =
    "entity_type, id, origin_id, natural_key, data, pending_sync, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub entity_type: String,
    pub id: String,
    /// Temporary id the record was first created under, if any.
    pub origin_id: Option<String>,
    pub natural_key: Option<String>,
    pub fields: Value,
    pub pending_sync: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl CacheRecord {
    pub fn is_temporary(&self) -> bool {
        temp_id::is_temporary(&self.id)
    }

    pub fn status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.status()
            .map(|s| CLOSED_STATUSES.contains(&s))
            .unwrap_or(false)
    }

    /// Flattened view handed to read paths: entity fields plus `id` and the
    /// `_pending_sync` flag.
    pub fn to_view(&self) -> Value {
        let mut view = match &self.fields {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        view.insert("id".into(), Value::String(self.id.clone()));
        view.insert("_pending_sync".into(), Value::Bool(self.pending_sync));
        Value::Object(view)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CacheRecord> {
    let entity_type: String = row.get(0)?;
    let id: String = row.get(1)?;
    let data: String = row.get(4)?;
    let pending: i64 = row.get(5)?;
    let fields = match serde_json::from_str(&data) {
        Ok(fields) => fields,
        Err(e) => {
            warn!(%entity_type, %id, error = %e, "corrupt cached document; reading as empty");
            Value::Object(Map::new())
        }
    };
    Ok(CacheRecord {
        entity_type,
        id,
        origin_id: row.get(2)?,
        natural_key: row.get(3)?,
        fields,
        pending_sync: pending != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Shallow merge: keys in `overlay` replace keys in `base`.
fn merge_fields(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut merged = b.clone();
            for (k, v) in o {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Object(_)) => overlay.clone(),
        _ => base.clone(),
    }
}

/// Natural key value of `fields` under `field` (strings and numbers).
pub fn natural_key_from(fields: &Value, field: &str) -> Option<String> {
    match fields.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Exact lookup by current identifier.
pub fn get(conn: &Connection, entity_type: &str, id: &str) -> Result<Option<CacheRecord>, String> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM entity_cache WHERE entity_type = ?1 AND id = ?2"),
        params![entity_type, id],
        row_to_record,
    )
    .optional()
    .map_err(|e| format!("cache get: {e}"))
}

/// Lookup by current identifier or by the temporary id the record was
/// created under. A current-id match wins.
pub fn find(conn: &Connection, entity_type: &str, id: &str) -> Result<Option<CacheRecord>, String> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM entity_cache
             WHERE entity_type = ?1 AND (id = ?2 OR origin_id = ?2)
             ORDER BY (id = ?2) DESC
             LIMIT 1"
        ),
        params![entity_type, id],
        row_to_record,
    )
    .optional()
    .map_err(|e| format!("cache find: {e}"))
}

/// All records of `entity_type`, most recently updated first. Closed
/// records are filtered out unless `include_closed` is set.
pub fn list(
    conn: &Connection,
    entity_type: &str,
    include_closed: bool,
) -> Result<Vec<CacheRecord>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM entity_cache
             WHERE entity_type = ?1
             ORDER BY updated_at DESC, rowid DESC"
        ))
        .map_err(|e| format!("cache list prepare: {e}"))?;
    let rows = stmt
        .query_map(params![entity_type], row_to_record)
        .map_err(|e| format!("cache list: {e}"))?;
    let records = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("cache list row: {e}"))?;
    Ok(records
        .into_iter()
        .filter(|r| include_closed || !r.is_closed())
        .collect())
}

/// Records of `entity_type` whose natural key equals `natural_key`, most
/// recently updated first.
pub fn find_by_natural_key(
    conn: &Connection,
    entity_type: &str,
    natural_key: &str,
) -> Result<Vec<CacheRecord>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM entity_cache
             WHERE entity_type = ?1 AND natural_key = ?2
             ORDER BY updated_at DESC, rowid DESC"
        ))
        .map_err(|e| format!("cache natural key prepare: {e}"))?;
    let rows = stmt
        .query_map(params![entity_type, natural_key], row_to_record)
        .map_err(|e| format!("cache natural key query: {e}"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("cache natural key row: {e}"))
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Record the optimistic (pre-sync) state of an entity at enqueue time.
///
/// Creates the record if it does not exist, otherwise merges `fields` into
/// the existing document and flags it `_pending_sync`.
pub fn apply_optimistic(
    conn: &Connection,
    entity_type: &str,
    id: &str,
    fields: &Value,
    natural_key: Option<&str>,
) -> Result<(), String> {
    let now = now_ts();
    match find(conn, entity_type, id)? {
        Some(existing) => {
            let merged = merge_fields(&existing.fields, fields);
            conn.execute(
                "UPDATE entity_cache
                 SET data = ?1,
                     pending_sync = 1,
                     natural_key = COALESCE(?2, natural_key),
                     updated_at = ?3
                 WHERE entity_type = ?4 AND id = ?5",
                params![merged.to_string(), natural_key, now, entity_type, existing.id],
            )
            .map_err(|e| format!("cache optimistic update: {e}"))?;
        }
        None => {
            let origin = temp_id::is_temporary(id).then_some(id);
            conn.execute(
                "INSERT INTO entity_cache (
                     entity_type, id, origin_id, natural_key, data, pending_sync,
                     created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                params![entity_type, id, origin, natural_key, fields.to_string(), now],
            )
            .map_err(|e| format!("cache optimistic insert: {e}"))?;
        }
    }
    Ok(())
}

/// Upgrade a record to its confirmed (post-sync) state.
///
/// The record previously known as `current_id` (its temporary id, or the
/// real id for updates) is re-keyed to `real_id` and its document replaced
/// by the merge of the local fields and the server response, in a single
/// transaction. A stale row already stored under `real_id` (e.g. from a
/// full resync) is superseded.
pub fn apply_synced(
    conn: &Connection,
    entity_type: &str,
    current_id: &str,
    real_id: &str,
    fields: &Value,
    natural_key: Option<&str>,
    still_pending: bool,
) -> Result<(), String> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("cache synced begin: {e}"))?;
    let now = now_ts();

    let existing = match find(&tx, entity_type, current_id)? {
        Some(r) => Some(r),
        None => get(&tx, entity_type, real_id)?,
    };

    // While later local changes are still queued, they stay on top of the
    // server copy.
    let mut merged = match (&existing, still_pending) {
        (Some(r), true) => merge_fields(fields, &r.fields),
        (Some(r), false) => merge_fields(&r.fields, fields),
        (None, _) => merge_fields(&Value::Object(Map::new()), fields),
    };
    if let Value::Object(map) = &mut merged {
        map.insert("id".into(), Value::String(real_id.to_string()));
    }

    let origin = existing
        .as_ref()
        .and_then(|r| r.origin_id.clone())
        .or_else(|| temp_id::is_temporary(current_id).then(|| current_id.to_string()));
    let natural_key = natural_key
        .map(str::to_string)
        .or_else(|| existing.as_ref().and_then(|r| r.natural_key.clone()));

    match existing {
        Some(record) => {
            if record.id != real_id {
                tx.execute(
                    "DELETE FROM entity_cache WHERE entity_type = ?1 AND id = ?2",
                    params![entity_type, real_id],
                )
                .map_err(|e| format!("cache synced supersede: {e}"))?;
            }
            tx.execute(
                "UPDATE entity_cache
                 SET id = ?1,
                     origin_id = ?2,
                     natural_key = ?3,
                     data = ?4,
                     pending_sync = ?5,
                     updated_at = ?6
                 WHERE entity_type = ?7 AND id = ?8",
                params![
                    real_id,
                    origin,
                    natural_key,
                    merged.to_string(),
                    still_pending as i64,
                    now,
                    entity_type,
                    record.id
                ],
            )
            .map_err(|e| format!("cache synced update: {e}"))?;
        }
        None => {
            tx.execute(
                "INSERT INTO entity_cache (
                     entity_type, id, origin_id, natural_key, data, pending_sync,
                     created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    entity_type,
                    real_id,
                    origin,
                    natural_key,
                    merged.to_string(),
                    still_pending as i64,
                    now
                ],
            )
            .map_err(|e| format!("cache synced insert: {e}"))?;
        }
    }

    tx.commit().map_err(|e| format!("cache synced commit: {e}"))
}

/// Client-only status shortcut (e.g. mark a session closed as soon as the
/// close is queued). The record stays flagged `_pending_sync` until the
/// transition is confirmed. Returns `false` when no record exists for `id`.
pub fn apply_derived_status(
    conn: &Connection,
    entity_type: &str,
    id: &str,
    status_fields: &Value,
) -> Result<bool, String> {
    let Some(existing) = find(conn, entity_type, id)? else {
        return Ok(false);
    };
    let merged = merge_fields(&existing.fields, status_fields);
    conn.execute(
        "UPDATE entity_cache
         SET data = ?1, pending_sync = 1, updated_at = ?2
         WHERE entity_type = ?3 AND id = ?4",
        params![merged.to_string(), now_ts(), entity_type, existing.id],
    )
    .map_err(|e| format!("cache derived status: {e}"))?;
    Ok(true)
}

/// Replace the confirmed records of `entity_type` with authoritative server
/// state. Rows still flagged `_pending_sync` are kept so queued mutations can
/// still resolve against them. A reloaded record keeps the `origin_id` (and
/// the natural key, when the server copy has none) of the row it replaces,
/// so temporary ids stay resolvable by id. Returns the number of records
/// loaded.
pub fn replace_authoritative(
    conn: &Connection,
    entity_type: &str,
    records: &[Value],
    natural_key_field: Option<&str>,
) -> Result<usize, String> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| format!("cache resync begin: {e}"))?;

    let carried: HashMap<String, (Option<String>, Option<String>)> = {
        let mut stmt = tx
            .prepare(
                "SELECT id, origin_id, natural_key FROM entity_cache
                 WHERE entity_type = ?1 AND pending_sync = 0
                   AND (origin_id IS NOT NULL OR natural_key IS NOT NULL)",
            )
            .map_err(|e| format!("cache resync carry prepare: {e}"))?;
        let rows = stmt
            .query_map(params![entity_type], |row| {
                Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?)))
            })
            .map_err(|e| format!("cache resync carry: {e}"))?;
        rows.collect::<Result<_, _>>()
            .map_err(|e| format!("cache resync carry row: {e}"))?
    };

    tx.execute(
        "DELETE FROM entity_cache WHERE entity_type = ?1 AND pending_sync = 0",
        params![entity_type],
    )
    .map_err(|e| format!("cache resync clear: {e}"))?;

    let now = now_ts();
    let mut loaded = 0;
    for record in records {
        let id = match record.get("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        let (origin_id, previous_key) = carried.get(&id).cloned().unwrap_or_default();
        let natural_key = natural_key_field
            .and_then(|f| natural_key_from(record, f))
            .or(previous_key);
        loaded += tx
            .execute(
                "INSERT INTO entity_cache (
                     entity_type, id, origin_id, natural_key, data, pending_sync,
                     created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
                 ON CONFLICT(entity_type, id) DO NOTHING",
                params![entity_type, id, origin_id, natural_key, record.to_string(), now],
            )
            .map_err(|e| format!("cache resync insert: {e}"))?;
    }

    tx.commit().map_err(|e| format!("cache resync commit: {e}"))?;
    Ok(loaded)
}

// ===========================================================================
// Tests
// ===========================================================================
