//! Temporary-to-real identifier resolution.
//!
//! Resolution walks three tiers and stops at the first hit:
//!
//! 1. the in-memory map owned by the sync engine (populated as creates sync),
//! 2. the local entity cache looked up by the temporary id (either the row is
//!    still keyed by it, meaning the creator has not synced yet, or the row
//!    was re-keyed and remembers the temporary id as its origin),
//! 3. the local entity cache searched by natural key, using hints taken from
//!    the dependent mutation's body.
//!
//! Tiers 2 and 3 repopulate tier 1 on a hit, so the map can always be rebuilt
//! from durable state after a restart.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use crate::cache;
use crate::queue::{Mutation, Operation};
use crate::temp_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverTier {
    Memory,
    CacheById,
    Relationship,
}

impl fmt::Display for ResolverTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolverTier::Memory => "memory",
            ResolverTier::CacheById => "cache_by_id",
            ResolverTier::Relationship => "relationship",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { real_id: String, tier: ResolverTier },
    /// The owning create mutation has not synced yet.
    NotYetReady,
    /// Every tier missed.
    NotFound,
}

/// Temporary-to-real id map, partitioned by entity type. Entries are
/// immutable once written.
#[derive(Debug, Default)]
pub struct IdMappings {
    by_type: HashMap<String, HashMap<String, String>>,
}

impl IdMappings {
    pub fn get(&self, entity_type: &str, temp_id: &str) -> Option<&str> {
        self.by_type
            .get(entity_type)
            .and_then(|m| m.get(temp_id))
            .map(String::as_str)
    }

    /// Record `temp_id -> real_id`. Returns `Ok(false)` when the identical
    /// mapping already exists and an error when it would change an existing
    /// mapping.
    pub fn register(&mut self, entity_type: &str, temp_id: &str, real_id: &str) -> Result<bool, String> {
        let map = self.by_type.entry(entity_type.to_string()).or_default();
        match map.get(temp_id) {
            Some(existing) if existing == real_id => Ok(false),
            Some(existing) => Err(format!(
                "mapping for {temp_id} already points to {existing}, refusing {real_id}"
            )),
            None => {
                map.insert(temp_id.to_string(), real_id.to_string());
                Ok(true)
            }
        }
    }

    pub fn clear(&mut self) {
        self.by_type.clear();
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hints supplied by the caller for relationship-tier lookups: the fields of
/// the mutation that holds the reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveContext<'a> {
    hints: Option<&'a Map<String, Value>>,
}

impl<'a> ResolveContext<'a> {
    pub fn empty() -> Self {
        Self { hints: None }
    }

    pub fn from_body(body: &'a Value) -> Self {
        Self {
            hints: body.as_object(),
        }
    }

    fn hint(&self, field: &str) -> Option<String> {
        match self.hints?.get(field)? {
            // A temporary hint cannot identify a confirmed record.
            Value::String(s) if temp_id::is_temporary(s) => None,
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Outcome of resolving every reference held by one mutation.
#[derive(Debug, Clone)]
pub enum ReferenceResolution {
    Ready {
        map: HashMap<String, String>,
        tiers: Vec<(String, ResolverTier)>,
    },
    Blocked {
        temp_id: String,
        resolution: Resolution,
    },
}

pub struct Resolver<'a> {
    conn: &'a Connection,
    mappings: &'a mut IdMappings,
    natural_keys: &'a HashMap<String, String>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        conn: &'a Connection,
        mappings: &'a mut IdMappings,
        natural_keys: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            conn,
            mappings,
            natural_keys,
        }
    }

    pub fn resolve(
        &mut self,
        temp_id: &str,
        entity_type: &str,
        context: &ResolveContext<'_>,
    ) -> Result<Resolution, String> {
        if let Some(real) = self.mappings.get(entity_type, temp_id) {
            return Ok(Resolution::Resolved {
                real_id: real.to_string(),
                tier: ResolverTier::Memory,
            });
        }

        if let Some(record) = cache::find(self.conn, entity_type, temp_id)? {
            if record.is_temporary() {
                return Ok(Resolution::NotYetReady);
            }
            self.remember(entity_type, temp_id, &record.id);
            debug!(temp_id, real_id = %record.id, "resolved via cache origin id");
            return Ok(Resolution::Resolved {
                real_id: record.id,
                tier: ResolverTier::CacheById,
            });
        }

        let Some(field) = self.natural_keys.get(entity_type) else {
            return Ok(Resolution::NotFound);
        };
        let Some(key) = context.hint(field) else {
            return Ok(Resolution::NotFound);
        };

        // Closed records never adopt a new reference.
        let chosen = cache::find_by_natural_key(self.conn, entity_type, &key)?
            .into_iter()
            .find(|r| !r.is_temporary() && !r.is_closed());

        match chosen {
            Some(record) => {
                self.remember(entity_type, temp_id, &record.id);
                debug!(
                    temp_id,
                    real_id = %record.id,
                    natural_key = %key,
                    "resolved via relationship"
                );
                Ok(Resolution::Resolved {
                    real_id: record.id,
                    tier: ResolverTier::Relationship,
                })
            }
            None => Ok(Resolution::NotFound),
        }
    }

    /// Resolve every temporary id a mutation refers to: its target entity
    /// (for updates and transitions) and every reference inside its body.
    pub fn resolve_mutation(&mut self, mutation: &Mutation) -> Result<ReferenceResolution, String> {
        let context = ResolveContext::from_body(&mutation.body);
        let mut map = HashMap::new();
        let mut tiers = Vec::new();

        for temp in references_of(mutation) {
            let entity_type = temp_id::entity_type_of(&temp)
                .unwrap_or(mutation.entity_type.as_str())
                .to_string();
            match self.resolve(&temp, &entity_type, &context)? {
                Resolution::Resolved { real_id, tier } => {
                    tiers.push((temp.clone(), tier));
                    map.insert(temp, real_id);
                }
                other => {
                    return Ok(ReferenceResolution::Blocked {
                        temp_id: temp,
                        resolution: other,
                    })
                }
            }
        }

        Ok(ReferenceResolution::Ready { map, tiers })
    }

    /// Pre-warm tier 1 from durable state for the given mutations. Returns
    /// the number of mappings added.
    pub fn warm(&mut self, mutations: &[Mutation]) -> Result<usize, String> {
        let before = self.mappings.len();
        for mutation in mutations {
            let context = ResolveContext::from_body(&mutation.body);
            for temp in references_of(mutation) {
                let Some(entity_type) = temp_id::entity_type_of(&temp) else {
                    continue;
                };
                let entity_type = entity_type.to_string();
                self.resolve(&temp, &entity_type, &context)?;
            }
        }
        Ok(self.mappings.len() - before)
    }

    fn remember(&mut self, entity_type: &str, temp_id: &str, real_id: &str) {
        if let Err(e) = self.mappings.register(entity_type, temp_id, real_id) {
            warn!(temp_id, real_id, error = %e, "mapping conflict ignored");
        }
    }
}

/// Temporary ids a mutation depends on. A create's own temporary id is not a
/// dependency.
pub fn references_of(mutation: &Mutation) -> Vec<String> {
    let mut refs = Vec::new();
    if mutation.operation != Operation::Create && temp_id::is_temporary(&mutation.entity_id) {
        refs.push(mutation.entity_id.clone());
    }
    for r in temp_id::collect_references(&mutation.body) {
        if !refs.contains(&r) && !(mutation.operation == Operation::Create && r == mutation.entity_id) {
            refs.push(r);
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::queue::MutationStatus;
    use serde_json::json;

    const T1: &str = "tmp-session-1700000000000-aaaaaaaa";

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn
    }

    fn natural_keys() -> HashMap<String, String> {
        HashMap::from([("session".to_string(), "table_id".to_string())])
    }

    fn order_mutation(body: Value) -> Mutation {
        Mutation {
            id: 2,
            entity_type: "order".into(),
            entity_id: "tmp-order-1700000000001-bbbbbbbb".into(),
            operation: Operation::Create,
            body,
            status: MutationStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: String::new(),
            updated_at: String::new(),
            synced_at: None,
            next_retry_at: None,
            retry_delay_ms: 0,
            remote_id: None,
        }
    }

    #[test]
    fn test_register_is_immutable() {
        let mut maps = IdMappings::default();
        assert!(maps.register("session", T1, "S1").unwrap());
        assert!(!maps.register("session", T1, "S1").unwrap());
        assert!(maps.register("session", T1, "S2").is_err());
        assert_eq!(maps.get("session", T1), Some("S1"));
        assert_eq!(maps.len(), 1);
    }

    #[test]
    fn test_memory_tier_first() {
        let conn = test_conn();
        let mut maps = IdMappings::default();
        maps.register("session", T1, "S1").unwrap();
        let keys = natural_keys();
        let mut resolver = Resolver::new(&conn, &mut maps, &keys);

        let res = resolver.resolve(T1, "session", &ResolveContext::empty()).unwrap();
        assert_eq!(
            res,
            Resolution::Resolved {
                real_id: "S1".into(),
                tier: ResolverTier::Memory
            }
        );
    }

    #[test]
    fn test_unsynced_parent_is_not_ready() {
        let conn = test_conn();
        cache::apply_optimistic(&conn, "session", T1, &json!({ "table_id": "table-4" }), Some("table-4"))
            .unwrap();
        let mut maps = IdMappings::default();
        let keys = natural_keys();
        let mut resolver = Resolver::new(&conn, &mut maps, &keys);

        let res = resolver.resolve(T1, "session", &ResolveContext::empty()).unwrap();
        assert_eq!(res, Resolution::NotYetReady);
    }

    #[test]
    fn test_cache_origin_tier_after_reload() {
        let conn = test_conn();
        cache::apply_optimistic(&conn, "session", T1, &json!({ "table_id": "table-4" }), Some("table-4"))
            .unwrap();
        cache::apply_synced(&conn, "session", T1, "S1", &json!({ "id": "S1" }), None, false).unwrap();

        let mut maps = IdMappings::default();
        let keys = natural_keys();
        {
            let mut resolver = Resolver::new(&conn, &mut maps, &keys);
            let res = resolver.resolve(T1, "session", &ResolveContext::empty()).unwrap();
            assert_eq!(
                res,
                Resolution::Resolved {
                    real_id: "S1".into(),
                    tier: ResolverTier::CacheById
                }
            );
        }
        assert_eq!(maps.get("session", T1), Some("S1"));
    }

    #[test]
    fn test_relationship_tier_after_resync() {
        let conn = test_conn();
        cache::replace_authoritative(
            &conn,
            "session",
            &[
                json!({ "id": "S0", "table_id": "table-4", "status": "closed" }),
                json!({ "id": "S1", "table_id": "table-4", "status": "open" }),
            ],
            Some("table_id"),
        )
        .unwrap();

        let body = json!({ "session_id": T1, "table_id": "table-4" });
        let mut maps = IdMappings::default();
        let keys = natural_keys();
        let mut resolver = Resolver::new(&conn, &mut maps, &keys);

        let res = resolver
            .resolve(T1, "session", &ResolveContext::from_body(&body))
            .unwrap();
        assert_eq!(
            res,
            Resolution::Resolved {
                real_id: "S1".into(),
                tier: ResolverTier::Relationship
            }
        );
    }

    #[test]
    fn test_relationship_tier_skips_closed_records() {
        let conn = test_conn();
        cache::replace_authoritative(
            &conn,
            "session",
            &[json!({ "id": "S0", "table_id": "table-4", "status": "closed" })],
            Some("table_id"),
        )
        .unwrap();

        let body = json!({ "session_id": T1, "table_id": "table-4" });
        let mut maps = IdMappings::default();
        let keys = natural_keys();
        let mut resolver = Resolver::new(&conn, &mut maps, &keys);

        let res = resolver
            .resolve(T1, "session", &ResolveContext::from_body(&body))
            .unwrap();
        assert_eq!(res, Resolution::NotFound);
        assert_eq!(maps.get("session", T1), None);
    }

    #[test]
    fn test_all_tiers_miss() {
        let conn = test_conn();
        let body = json!({ "session_id": T1, "table_id": "table-99" });
        let mut maps = IdMappings::default();
        let keys = natural_keys();
        let mut resolver = Resolver::new(&conn, &mut maps, &keys);

        let res = resolver
            .resolve(T1, "session", &ResolveContext::from_body(&body))
            .unwrap();
        assert_eq!(res, Resolution::NotFound);
    }

    #[test]
    fn test_resolve_mutation_blocks_on_first_unready_reference() {
        let conn = test_conn();
        cache::apply_optimistic(&conn, "session", T1, &json!({}), None).unwrap();
        let mut maps = IdMappings::default();
        let keys = natural_keys();
        let mut resolver = Resolver::new(&conn, &mut maps, &keys);

        let mutation = order_mutation(json!({ "session_id": T1, "qty": 1 }));
        match resolver.resolve_mutation(&mutation).unwrap() {
            ReferenceResolution::Blocked {
                temp_id,
                resolution,
            } => {
                assert_eq!(temp_id, T1);
                assert_eq!(resolution, Resolution::NotYetReady);
            }
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[test]
    fn test_warm_populates_memory_tier() {
        let conn = test_conn();
        cache::apply_optimistic(&conn, "session", T1, &json!({}), None).unwrap();
        cache::apply_synced(&conn, "session", T1, "S1", &json!({}), None, false).unwrap();

        let mut maps = IdMappings::default();
        let keys = natural_keys();
        let added = Resolver::new(&conn, &mut maps, &keys)
            .warm(&[order_mutation(json!({ "session_id": T1 }))])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(maps.get("session", T1), Some("S1"));
    }

    #[test]
    fn test_references_skip_own_create_id() {
        let mut m = order_mutation(json!({ "session_id": T1 }));
        m.body["self"] = Value::String(m.entity_id.clone());
        assert_eq!(references_of(&m), vec![T1.to_string()]);

        m.operation = Operation::Update;
        let refs = references_of(&m);
        assert_eq!(refs[0], m.entity_id);
        assert!(refs.contains(&T1.to_string()));
    }
}
