//! Remote system-of-record client.
//!
//! [`RemoteApi`] is the seam the sync engine talks through; [`HttpRemoteApi`]
//! is the production implementation that speaks to the admin dashboard over
//! authenticated HTTP. Failures are mapped into [`RemoteError`] so the engine
//! can classify them without inspecting message text.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::storage;

/// Timeout used specifically for the lightweight connectivity check.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Payload rejected as structurally invalid. Never retried automatically.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Timeout, 5xx, 429 or a dropped connection. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The logical entity already exists; `existing` is the server's copy.
    #[error("entity already exists")]
    Conflict { existing: Value },

    /// Credentials rejected. Retried like a transient failure so a fixed
    /// API key lets the queue drain without operator action.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Unauthorized(_))
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Per-entity endpoints of the remote system. Implementations must make
/// `create` idempotent per logical entity: a repeated create returns the
/// existing entity (or a [`RemoteError::Conflict`] carrying it).
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create(&self, entity_type: &str, body: &Value) -> Result<Value, RemoteError>;

    async fn update(&self, entity_type: &str, id: &str, body: &Value) -> Result<Value, RemoteError>;

    async fn transition(
        &self,
        entity_type: &str,
        id: &str,
        action: &str,
        body: &Value,
    ) -> Result<Value, RemoteError>;

    /// Authoritative list of every entity of `entity_type`.
    async fn fetch_all(&self, entity_type: &str) -> Result<Vec<Value>, RemoteError>;
}

/// Answers "can we reach the remote right now".
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

// ---------------------------------------------------------------------------
// URL normalisation / connection strings
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// API key embedded in a terminal connection string (`{"key", "url", "tid"}`,
/// raw JSON or URL-safe base64).
pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key"])
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"]).map(|u| normalize_admin_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

/// REST collection path for an entity type: `session` -> `/api/pos/sessions`.
pub fn collection_path(entity_type: &str) -> String {
    let segment = entity_type.trim().replace('_', "-");
    if segment.ends_with('s') {
        format!("/api/pos/{segment}")
    } else {
        format!("/api/pos/{segment}s")
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach admin dashboard at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid admin dashboard URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        409 => "Entity already exists".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

/// Build a diagnostic message from a failed response body, keeping server
/// validation details visible in `last_error`.
fn error_detail(status: StatusCode, body_text: &str, json: Option<&Value>) -> String {
    let trimmed = body_text.trim();
    match json {
        Some(json) => {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| status_error(status));
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => format!("{message} (HTTP {}): {}", status.as_u16(), details),
                None => format!("{message} (HTTP {})", status.as_u16()),
            }
        }
        None if !trimmed.is_empty() => format!(
            "{} (HTTP {}): {}",
            status_error(status),
            status.as_u16(),
            trimmed
        ),
        None => format!("{} (HTTP {})", status_error(status), status.as_u16()),
    }
}

/// Map a non-success HTTP response into the error taxonomy.
pub fn classify_status(status: StatusCode, body_text: &str) -> RemoteError {
    let json = serde_json::from_str::<Value>(body_text).ok();
    let detail = error_detail(status, body_text, json.as_ref());
    match status.as_u16() {
        409 => {
            let existing = json
                .as_ref()
                .and_then(|j| j.get("existing").or_else(|| j.get("data")))
                .cloned()
                .or(json)
                .unwrap_or(Value::Null);
            RemoteError::Conflict { existing }
        }
        401 => RemoteError::Unauthorized(detail),
        408 | 425 | 429 => RemoteError::Transient(detail),
        s if s >= 500 => RemoteError::Transient(detail),
        _ => RemoteError::Validation(detail),
    }
}

/// Responses are either the entity itself or wrapped in `{ "data": ... }`.
fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if !map.contains_key("id") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Result of a connectivity check.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
    terminal_id: Option<String>,
}

impl HttpRemoteApi {
    /// `api_key` may be a raw key or a terminal connection string; values
    /// decoded from a connection string win over `terminal_id`.
    pub fn new(
        admin_url: &str,
        api_key: &str,
        terminal_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        let resolved_key =
            extract_api_key_from_connection_string(api_key).unwrap_or_else(|| api_key.trim().to_string());
        if resolved_key.is_empty() {
            return Err("Missing API key".into());
        }
        let terminal_id = extract_terminal_id_from_connection_string(api_key)
            .or(terminal_id)
            .filter(|t| !t.trim().is_empty());

        Ok(Self {
            client,
            base_url: normalize_admin_url(admin_url),
            api_key: Zeroizing::new(resolved_key),
            terminal_id,
        })
    }

    /// Build a client from the environment or the OS keyring.
    pub fn from_stored_credentials(timeout: Duration) -> Result<Self, String> {
        let creds = storage::load_credentials()
            .ok_or("Terminal not configured: missing admin URL or API key")?;
        Self::new(&creds.admin_url, &creds.api_key, creds.terminal_id, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, RemoteError> {
        let full_url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method.clone(), &full_url)
            .header("X-POS-API-Key", self.api_key.as_str())
            .header("Content-Type", "application/json");
        if let Some(tid) = &self.terminal_id {
            req = req.header("x-terminal-id", tid);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        debug!(%method, path, "remote request");
        let resp = req
            .send()
            .await
            .map_err(|e| RemoteError::Transient(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_status(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map(unwrap_data)
            .map_err(|e| RemoteError::Transient(format!("Invalid JSON from admin dashboard: {e}")))
    }

    /// Lightweight health check against `/api/health`.
    pub async fn check_health(&self) -> ConnectivityResult {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        let resp = self
            .client
            .head(&health_url)
            .timeout(CONNECTIVITY_TIMEOUT)
            .header("X-POS-API-Key", self.api_key.as_str())
            .send()
            .await;

        match resp {
            Ok(r) => {
                let latency = start.elapsed().as_millis() as u64;
                if r.status().is_success() {
                    debug!(latency_ms = latency, "connectivity check passed");
                    ConnectivityResult {
                        success: true,
                        latency_ms: Some(latency),
                        error: None,
                    }
                } else {
                    ConnectivityResult {
                        success: false,
                        latency_ms: Some(latency),
                        error: Some(status_error(r.status())),
                    }
                }
            }
            Err(e) => ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&self.base_url, &e)),
            },
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create(&self, entity_type: &str, body: &Value) -> Result<Value, RemoteError> {
        self.send(Method::POST, &collection_path(entity_type), Some(body))
            .await
    }

    async fn update(&self, entity_type: &str, id: &str, body: &Value) -> Result<Value, RemoteError> {
        let path = format!("{}/{}", collection_path(entity_type), percent_encode(id));
        self.send(Method::PATCH, &path, Some(body)).await
    }

    async fn transition(
        &self,
        entity_type: &str,
        id: &str,
        action: &str,
        body: &Value,
    ) -> Result<Value, RemoteError> {
        let path = format!(
            "{}/{}/{}",
            collection_path(entity_type),
            percent_encode(id),
            percent_encode(action)
        );
        self.send(Method::POST, &path, Some(body)).await
    }

    async fn fetch_all(&self, entity_type: &str) -> Result<Vec<Value>, RemoteError> {
        match self.send(Method::GET, &collection_path(entity_type), None).await? {
            Value::Array(items) => {
                info!(entity_type, count = items.len(), "fetched authoritative records");
                Ok(items)
            }
            Value::Null => Ok(Vec::new()),
            other => Err(RemoteError::Validation(format!(
                "expected a list of {entity_type} records, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpRemoteApi {
    async fn is_online(&self) -> bool {
        self.check_health().await.success
    }
}
