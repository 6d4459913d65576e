//! Client-generated temporary identifiers.
//!
//! Format: `tmp-{entity_type}-{created_ms}-{suffix}` where `suffix` is eight
//! lowercase hex characters. The entity type may itself contain hyphens
//! (`order-confirmation`), so parsing works from the right.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

const TEMP_PREFIX: &str = "tmp-";
const SUFFIX_LEN: usize = 8;

/// Decoded parts of a temporary identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempId<'a> {
    pub entity_type: &'a str,
    pub created_ms: i64,
    pub suffix: &'a str,
}

impl TempId<'_> {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_ms).single()
    }
}

/// Generate a fresh temporary identifier for `entity_type`.
pub fn generate(entity_type: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{TEMP_PREFIX}{entity_type}-{}-{}",
        Utc::now().timestamp_millis(),
        &suffix[..SUFFIX_LEN]
    )
}

/// Parse a temporary identifier. Returns `None` for anything else,
/// including server-assigned ids.
pub fn parse(raw: &str) -> Option<TempId<'_>> {
    let rest = raw.strip_prefix(TEMP_PREFIX)?;
    let mut parts = rest.rsplitn(3, '-');
    let suffix = parts.next()?;
    let millis = parts.next()?;
    let entity_type = parts.next()?;

    if entity_type.is_empty()
        || suffix.len() != SUFFIX_LEN
        || !suffix.chars().all(|c| c.is_ascii_hexdigit())
        || millis.is_empty()
        || !millis.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    Some(TempId {
        entity_type,
        created_ms: millis.parse().ok()?,
        suffix,
    })
}

pub fn is_temporary(raw: &str) -> bool {
    parse(raw).is_some()
}

/// Entity type embedded in a temporary identifier.
pub fn entity_type_of(raw: &str) -> Option<&str> {
    parse(raw).map(|t| t.entity_type)
}

/// Collect every temporary identifier referenced by string values in
/// `body`, in first-seen order without duplicates.
pub fn collect_references(body: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_into(body, &mut out);
    out
}

fn collect_into(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if is_temporary(s) && !out.iter().any(|seen| seen == s) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_into(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_into(v, out);
            }
        }
        _ => {}
    }
}

/// Replace every string value found in `resolved` with its mapped id.
/// Returns the number of substitutions made.
pub fn substitute(body: &mut Value, resolved: &HashMap<String, String>) -> usize {
    match body {
        Value::String(s) => match resolved.get(s.as_str()) {
            Some(real) => {
                *s = real.clone();
                1
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(|v| substitute(v, resolved)).sum(),
        Value::Object(map) => map.values_mut().map(|v| substitute(v, resolved)).sum(),
        _ => 0,
    }
}
