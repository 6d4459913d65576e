use serde::Deserialize;
use serde_json::Value;

use crate::queue::Operation;
use crate::sync::SyncEngine;
use crate::value_i64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncEnqueuePayload {
    #[serde(alias = "entity_type", alias = "entity")]
    entity_type: String,
    #[serde(alias = "op", alias = "action_type")]
    operation: String,
    #[serde(default, alias = "payload", alias = "data")]
    body: Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SyncListFailedPayload {
    #[serde(default, alias = "max", alias = "count")]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncMutationIdPayload {
    #[serde(alias = "mutation_id", alias = "syncId", alias = "sync_id", alias = "id")]
    mutation_id: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncReadEntityPayload {
    #[serde(alias = "entity_type", alias = "entity")]
    entity_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, alias = "include_closed")]
    include_closed: bool,
}

fn parse_enqueue_payload(arg0: Option<Value>) -> Result<(String, Operation, Value), String> {
    let payload = arg0.ok_or("Missing enqueue payload")?;
    let parsed: SyncEnqueuePayload = serde_json::from_value(payload)
        .map_err(|e| format!("Invalid enqueue payload: {e}"))?;

    let entity_type = parsed.entity_type.trim().to_string();
    if entity_type.is_empty() {
        return Err("Missing entityType".into());
    }
    let operation = Operation::parse(&parsed.operation)
        .ok_or_else(|| format!("Unknown operation: {}", parsed.operation))?;
    let body = match parsed.body {
        Value::Null => serde_json::json!({}),
        other => other,
    };
    Ok((entity_type, operation, body))
}

fn parse_list_failed_limit(arg0: Option<Value>) -> usize {
    const DEFAULT_LIMIT: i64 = 50;
    const MAX_LIMIT: i64 = 500;

    let limit = match arg0 {
        Some(Value::Number(num)) => num.as_i64(),
        Some(Value::Object(obj)) => {
            let payload = Value::Object(obj);
            serde_json::from_value::<SyncListFailedPayload>(payload.clone())
                .ok()
                .and_then(|parsed| parsed.limit.or_else(|| value_i64(&payload, &["limit"])))
        }
        _ => None,
    };

    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT) as usize
}

fn parse_mutation_id(arg0: Option<Value>) -> Result<i64, String> {
    let raw = match arg0 {
        Some(Value::Object(obj)) => {
            let parsed: SyncMutationIdPayload = serde_json::from_value(Value::Object(obj))
                .map_err(|e| format!("Invalid mutation id payload: {e}"))?;
            parsed.mutation_id
        }
        Some(v) => v,
        None => return Err("Missing mutation id".into()),
    };
    match raw {
        Value::Number(n) => n.as_i64().ok_or_else(|| format!("Invalid mutation id: {n}")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("Invalid mutation id: {s}")),
        other => Err(format!("Invalid mutation id: {other}")),
    }
}

fn parse_read_entity_payload(arg0: Option<Value>) -> Result<SyncReadEntityPayload, String> {
    let payload = match arg0 {
        Some(Value::String(entity_type)) => serde_json::json!({ "entityType": entity_type }),
        Some(v) => v,
        None => return Err("Missing entityType".into()),
    };
    let mut parsed: SyncReadEntityPayload = serde_json::from_value(payload)
        .map_err(|e| format!("Invalid entity read payload: {e}"))?;
    parsed.entity_type = parsed.entity_type.trim().to_string();
    if parsed.entity_type.is_empty() {
        return Err("Missing entityType".into());
    }
    parsed.id = parsed
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Ok(parsed)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

pub fn sync_enqueue(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let (entity_type, operation, body) = parse_enqueue_payload(arg0)?;
    let receipt = engine
        .enqueue(&entity_type, operation, body)
        .map_err(|e| e.to_string())?;
    to_json(&receipt)
}

pub fn sync_get_status(engine: &SyncEngine) -> Result<Value, String> {
    let status = engine.get_sync_status().map_err(|e| e.to_string())?;
    to_json(&status)
}

pub async fn sync_force(engine: &SyncEngine) -> Result<Value, String> {
    let report = engine.drain().await;
    to_json(&report)
}

pub async fn sync_retry_failed(engine: &SyncEngine) -> Result<Value, String> {
    let outcome = engine.retry_failed().await.map_err(|e| e.to_string())?;
    to_json(&outcome)
}

pub async fn sync_retry_item(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let id = parse_mutation_id(arg0)?;
    let outcome = engine.retry_mutation(id).await.map_err(|e| e.to_string())?;
    to_json(&outcome)
}

pub fn sync_discard_failed(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let id = parse_mutation_id(arg0)?;
    engine.discard_failed(id).map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "success": true, "id": id }))
}

pub fn sync_list_failed(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let limit = parse_list_failed_limit(arg0);
    let failed = engine.list_failed(limit).map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "items": to_json(&failed)?, "limit": limit }))
}

pub async fn sync_force_full_resync(engine: &SyncEngine) -> Result<Value, String> {
    let report = engine.force_full_resync().await.map_err(|e| e.to_string())?;
    to_json(&report)
}

/// Cache reads: a single entity when `id` is given, otherwise the list.
pub fn sync_read_entities(engine: &SyncEngine, arg0: Option<Value>) -> Result<Value, String> {
    let payload = parse_read_entity_payload(arg0)?;
    match payload.id.as_deref() {
        Some(id) => {
            let record = engine
                .read_entity(&payload.entity_type, id)
                .map_err(|e| e.to_string())?;
            Ok(record.map(|r| r.to_view()).unwrap_or(Value::Null))
        }
        None => {
            let records = engine
                .list_entities(&payload.entity_type, payload.include_closed)
                .map_err(|e| e.to_string())?;
            Ok(Value::Array(records.iter().map(|r| r.to_view()).collect()))
        }
    }
}
