//! Durable mutation store backed by the `sync_queue` table.
//!
//! Pure storage: every function takes a connection and commits a single
//! mutation independently. Row ids are assigned by SQLite AUTOINCREMENT, so
//! ascending id order is insertion (causal) order.

use chrono::{SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::error::SyncError;

const MUTATION_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, status, \
     retry_count, last_error, created_at, updated_at, synced_at, next_retry_at, \
     retry_delay_ms, remote_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl MutationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Syncing => "syncing",
            MutationStatus::Synced => "synced",
            MutationStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(MutationStatus::Pending),
            "syncing" => Some(MutationStatus::Syncing),
            "synced" => Some(MutationStatus::Synced),
            "failed" => Some(MutationStatus::Failed),
            _ => None,
        }
    }

    /// Forward-only lifecycle. `syncing -> pending` covers both the
    /// dependency-not-ready loop back and transient failures; `failed ->
    /// pending` is reserved for operator retries. `synced` is terminal.
    pub fn can_transition_to(self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Synced)
                | (Syncing, Failed)
                | (Syncing, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Transition,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Transition => "transition",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" | "insert" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "transition" => Some(Operation::Transition),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued write against one entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: i64,
    pub entity_type: String,
    /// Target entity id: the temporary id for creates, the (possibly
    /// temporary) id of the existing entity otherwise.
    pub entity_id: String,
    pub operation: Operation,
    pub body: Value,
    pub status: MutationStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub synced_at: Option<String>,
    pub next_retry_at: Option<String>,
    pub retry_delay_ms: i64,
    pub remote_id: Option<String>,
}

/// Input for [`enqueue`].
#[derive(Debug, Clone)]
pub struct NewMutation<'a> {
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub operation: Operation,
    pub body: &'a Value,
}

/// Optional columns written alongside a status transition. `None` leaves
/// the column untouched; `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub retry_count: Option<i64>,
    pub last_error: Option<Option<String>>,
    pub next_retry_at: Option<Option<String>>,
    pub retry_delay_ms: Option<i64>,
    pub remote_id: Option<String>,
}

impl StatusFields {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(Some(message.into())),
            ..Self::default()
        }
    }
}

pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

#[derive(Debug)]
struct UnknownEnum(String);

impl fmt::Display for UnknownEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value '{}'", self.0)
    }
}

impl std::error::Error for UnknownEnum {}

fn row_to_mutation(row: &Row<'_>) -> rusqlite::Result<Mutation> {
    let operation_raw: String = row.get(3)?;
    let payload_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;

    let operation =
        Operation::parse(&operation_raw).ok_or_else(|| conversion_error(3, UnknownEnum(operation_raw)))?;
    let body = serde_json::from_str(&payload_raw).map_err(|e| conversion_error(4, e))?;
    let status =
        MutationStatus::parse(&status_raw).ok_or_else(|| conversion_error(5, UnknownEnum(status_raw)))?;

    Ok(Mutation {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        operation,
        body,
        status,
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        synced_at: row.get(10)?,
        next_retry_at: row.get(11)?,
        retry_delay_ms: row.get(12)?,
        remote_id: row.get(13)?,
    })
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Persist a new mutation with status `pending` and return its sequence id.
pub fn enqueue(conn: &Connection, mutation: &NewMutation<'_>) -> Result<i64, SyncError> {
    let payload = serde_json::to_string(mutation.body)
        .map_err(|e| SyncError::InvalidRequest(format!("serialize mutation body: {e}")))?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO sync_queue (
             entity_type, entity_id, operation, payload, status,
             retry_count, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
        params![
            mutation.entity_type,
            mutation.entity_id,
            mutation.operation.as_str(),
            payload,
            now
        ],
    )
    .map_err(|e| SyncError::Storage(format!("enqueue mutation: {e}")))?;
    Ok(conn.last_insert_rowid())
}

/// Atomically move a mutation to `to`, writing `fields` in the same
/// statement. Invalid transitions are rejected, never coerced.
pub fn update_status(
    conn: &Connection,
    id: i64,
    to: MutationStatus,
    fields: &StatusFields,
) -> Result<(), SyncError> {
    let from_raw: String = conn
        .query_row(
            "SELECT status FROM sync_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("read mutation status: {e}")))?
        .ok_or(SyncError::NotFound(id))?;
    let from = MutationStatus::parse(&from_raw)
        .ok_or_else(|| SyncError::Storage(format!("unknown status '{from_raw}' on mutation {id}")))?;

    if !from.can_transition_to(to) {
        return Err(SyncError::InvalidTransition { id, from, to });
    }

    let now = now_ts();
    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    let mut push = |column: &str, value: SqlValue| {
        values.push(value);
        sets.push(format!("{column} = ?{}", values.len()));
    };

    push("status", SqlValue::Text(to.as_str().to_string()));
    push("updated_at", SqlValue::Text(now.clone()));
    if to == MutationStatus::Synced {
        push("synced_at", SqlValue::Text(now));
    }
    if let Some(count) = fields.retry_count {
        push("retry_count", SqlValue::Integer(count));
    }
    if let Some(err) = &fields.last_error {
        push("last_error", opt_text(err));
    }
    if let Some(at) = &fields.next_retry_at {
        push("next_retry_at", opt_text(at));
    }
    if let Some(delay) = fields.retry_delay_ms {
        push("retry_delay_ms", SqlValue::Integer(delay));
    }
    if let Some(remote_id) = &fields.remote_id {
        push("remote_id", SqlValue::Text(remote_id.clone()));
    }

    values.push(SqlValue::Integer(id));
    let id_idx = values.len();
    values.push(SqlValue::Text(from.as_str().to_string()));
    let from_idx = values.len();

    let sql = format!(
        "UPDATE sync_queue SET {} WHERE id = ?{id_idx} AND status = ?{from_idx}",
        sets.join(", ")
    );
    let changed = conn
        .execute(&sql, params_from_iter(values))
        .map_err(|e| SyncError::Storage(format!("update mutation status: {e}")))?;

    if changed == 0 {
        return Err(SyncError::InvalidTransition { id, from, to });
    }
    Ok(())
}

fn opt_text(value: &Option<String>) -> SqlValue {
    match value {
        Some(s) => SqlValue::Text(s.clone()),
        None => SqlValue::Null,
    }
}

/// Move every mutation left in `syncing` back to `pending`.
///
/// Only one drain runs at a time, so anything still `syncing` when a drain
/// starts was abandoned by a crash or restart.
pub fn reset_stuck_syncing(conn: &Connection) -> Result<usize, SyncError> {
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = ?1 WHERE status = 'syncing'",
        params![now_ts()],
    )
    .map_err(|e| SyncError::Storage(format!("reset stuck syncing: {e}")))
}

/// Operator retry: bulk `failed -> pending` with a fresh retry budget.
pub fn requeue_failed(conn: &Connection) -> Result<usize, SyncError> {
    conn.execute(
        "UPDATE sync_queue
         SET status = 'pending',
             retry_count = 0,
             retry_delay_ms = 0,
             next_retry_at = NULL,
             last_error = NULL,
             updated_at = ?1
         WHERE status = 'failed'",
        params![now_ts()],
    )
    .map_err(|e| SyncError::Storage(format!("requeue failed mutations: {e}")))
}

/// Operator retry for a single failed mutation.
pub fn requeue_one(conn: &Connection, id: i64) -> Result<(), SyncError> {
    update_status(
        conn,
        id,
        MutationStatus::Pending,
        &StatusFields {
            retry_count: Some(0),
            retry_delay_ms: Some(0),
            next_retry_at: Some(None),
            last_error: Some(None),
            ..StatusFields::default()
        },
    )
}

/// Operator discard. Only `failed` mutations can be removed.
pub fn discard_failed(conn: &Connection, id: i64) -> Result<(), SyncError> {
    let current = get(conn, id)?.ok_or(SyncError::NotFound(id))?;
    if current.status != MutationStatus::Failed {
        return Err(SyncError::InvalidRequest(format!(
            "mutation {id} is {}; only failed mutations can be discarded",
            current.status
        )));
    }
    conn.execute(
        "DELETE FROM sync_queue WHERE id = ?1 AND status = 'failed'",
        params![id],
    )
    .map_err(|e| SyncError::Storage(format!("discard mutation: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub fn get(conn: &Connection, id: i64) -> Result<Option<Mutation>, SyncError> {
    conn.query_row(
        &format!("SELECT {MUTATION_COLUMNS} FROM sync_queue WHERE id = ?1"),
        params![id],
        row_to_mutation,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("get mutation: {e}")))
}

/// Mutations with `status`, ascending id (FIFO), at most `limit`.
pub fn list_by_status(
    conn: &Connection,
    status: MutationStatus,
    limit: usize,
) -> Result<Vec<Mutation>, SyncError> {
    list_by_status_after(conn, status, 0, limit)
}

/// Page through mutations with `status` whose id is greater than `after_id`.
pub fn list_by_status_after(
    conn: &Connection,
    status: MutationStatus,
    after_id: i64,
    limit: usize,
) -> Result<Vec<Mutation>, SyncError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {MUTATION_COLUMNS} FROM sync_queue
             WHERE status = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3"
        ))
        .map_err(|e| SyncError::Storage(format!("prepare list mutations: {e}")))?;
    let rows = stmt
        .query_map(
            params![status.as_str(), after_id, limit as i64],
            row_to_mutation,
        )
        .map_err(|e| SyncError::Storage(format!("list mutations: {e}")))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Storage(format!("read mutation row: {e}")))
}

pub fn count_by_status(conn: &Connection, status: MutationStatus) -> Result<i64, SyncError> {
    conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )
    .map_err(|e| SyncError::Storage(format!("count {status} mutations: {e}")))
}

pub fn oldest_next_retry_at(conn: &Connection) -> Result<Option<String>, SyncError> {
    conn.query_row(
        "SELECT MIN(next_retry_at) FROM sync_queue
         WHERE status = 'pending' AND next_retry_at IS NOT NULL",
        [],
        |row| row.get(0),
    )
    .map_err(|e| SyncError::Storage(format!("oldest retry time: {e}")))
}

/// Whether the create mutation that introduced `entity_id` is still waiting
/// to sync (pending, in flight, or failed awaiting operator retry).
pub fn has_unsynced_creator(conn: &Connection, entity_id: &str) -> Result<bool, SyncError> {
    conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM sync_queue
             WHERE operation = 'create'
               AND entity_id = ?1
               AND status IN ('pending', 'syncing', 'failed')
         )",
        params![entity_id],
        |row| row.get(0),
    )
    .map_err(|e| SyncError::Storage(format!("lookup creator mutation: {e}")))
}

/// Whether a mutation other than `exclude_id` still has local changes in
/// flight for the entity known by any of `entity_ids`.
pub fn has_open_mutations_for(
    conn: &Connection,
    entity_type: &str,
    entity_ids: &[&str],
    exclude_id: i64,
) -> Result<bool, SyncError> {
    if entity_ids.is_empty() {
        return Ok(false);
    }
    let placeholders: Vec<String> = (0..entity_ids.len()).map(|i| format!("?{}", i + 3)).collect();
    let sql = format!(
        "SELECT EXISTS(
             SELECT 1 FROM sync_queue
             WHERE entity_type = ?1
               AND id != ?2
               AND status IN ('pending', 'syncing', 'failed')
               AND entity_id IN ({})
         )",
        placeholders.join(", ")
    );
    let mut values: Vec<SqlValue> = vec![
        SqlValue::Text(entity_type.to_string()),
        SqlValue::Integer(exclude_id),
    ];
    values.extend(entity_ids.iter().map(|id| SqlValue::Text(id.to_string())));
    conn.query_row(&sql, params_from_iter(values), |row| row.get(0))
        .map_err(|e| SyncError::Storage(format!("lookup open mutations: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================
