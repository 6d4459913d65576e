//! Sync orchestrator: drains the mutation queue against the remote system of
//! record.
//!
//! Writes enter through [`SyncEngine::enqueue`], which records the mutation
//! and the optimistic cache state in one SQLite transaction. [`SyncEngine::drain`]
//! then replays pending mutations in ascending id order, resolving temporary
//! identifiers through the [`Resolver`], and repeats passes until a pass makes
//! no progress so that dependency chains enqueued together settle in a single
//! drain. Only one drain runs at a time; a trigger that arrives while one is
//! active is folded into it.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CacheRecord};
use crate::config::SyncConfig;
use crate::db::DbState;
use crate::error::SyncError;
use crate::events::{SyncEvent, SyncObserver, TracingObserver};
use crate::queue::{self, Mutation, MutationStatus, NewMutation, Operation, StatusFields};
use crate::remote::{ConnectivityProbe, RemoteApi, RemoteError};
use crate::resolver::{self, IdMappings, ReferenceResolution, Resolution, Resolver};
use crate::temp_id;

/// Client-side status a transition implies before the server confirms it.
fn derived_status(action: &str) -> Option<&'static str> {
    match action {
        "close" => Some("closed"),
        "confirm" => Some("confirmed"),
        "cancel" => Some("cancelled"),
        "complete" => Some("completed"),
        "reopen" => Some("open"),
        _ => None,
    }
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(delay_ms + jitter))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_backing_off(next_retry_at: Option<&str>) -> bool {
    next_retry_at
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc) > Utc::now())
        .unwrap_or(false)
}

fn dependency_key(entity_type: &str, id: &str) -> String {
    format!("{entity_type}:{id}")
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainSkip {
    Offline,
    /// Another drain was active; it will run one more pass instead.
    Coalesced,
}

/// Outcome of one [`SyncEngine::drain`] call. Drains never fail; per-mutation
/// errors are recorded on the mutation itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub skipped: Option<DrainSkip>,
    pub passes: usize,
    pub synced: usize,
    pub failed: usize,
    /// Transient failures left pending for a later drain.
    pub retried: usize,
    /// Mutations left pending in the final pass (dependency not ready,
    /// backing off, or queued behind one of those).
    pub deferred: usize,
}

impl DrainReport {
    fn skipped(reason: DrainSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: i64,
    pub failed_count: i64,
    pub syncing: bool,
    pub is_online: bool,
    pub last_sync: Option<String>,
    pub oldest_next_retry_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub mutation_id: i64,
    /// Id the entity is known by locally: a fresh temporary id for creates.
    pub entity_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub requeued: usize,
    pub drain: DrainReport,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    pub loaded: BTreeMap<String, usize>,
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Synced,
    Failed,
    /// Transient failure, left pending.
    RetryLater,
    /// Left pending without a remote call.
    Deferred,
    /// No longer pending when its turn came.
    Skipped,
}

/// Target, action and wire body of a mutation after id substitution.
struct Prepared {
    target_id: Option<String>,
    action: Option<String>,
    body: Value,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    observer: Arc<dyn SyncObserver>,
    mappings: Mutex<IdMappings>,
    online: AtomicBool,
    drain_lock: tokio::sync::Mutex<()>,
    draining: AtomicBool,
    rerun_requested: AtomicBool,
    last_sync: Mutex<Option<String>>,
}

impl SyncEngine {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteApi>, config: SyncConfig) -> Self {
        Self {
            db,
            remote,
            config,
            observer: Arc::new(TracingObserver),
            mappings: Mutex::new(IdMappings::default()),
            online: AtomicBool::new(true),
            drain_lock: tokio::sync::Mutex::new(()),
            draining: AtomicBool::new(false),
            rerun_requested: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    fn emit(&self, event: SyncEvent) {
        self.observer.on_event(&event);
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("db lock poisoned: {e}")))?;
        f(&conn)
    }

    fn with_resolver<T>(
        &self,
        f: impl FnOnce(&mut Resolver<'_>, &Connection) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("db lock poisoned: {e}")))?;
        let mut mappings = self
            .mappings
            .lock()
            .map_err(|e| SyncError::Storage(format!("mapping lock poisoned: {e}")))?;
        let mut resolver = Resolver::new(&conn, &mut mappings, &self.config.natural_keys);
        f(&mut resolver, &conn)
    }

    // -- Connectivity -------------------------------------------------------

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!(online, "connectivity changed");
        }
    }

    /// Connectivity monitor hook: mark online and drain.
    pub async fn on_connectivity_restored(&self) -> DrainReport {
        self.set_online(true);
        self.drain().await
    }

    /// Forget every in-memory id mapping, as a process restart would.
    pub fn clear_mappings(&self) {
        if let Ok(mut mappings) = self.mappings.lock() {
            mappings.clear();
        }
    }

    // -- Enqueue ------------------------------------------------------------

    /// The single write entry point.
    ///
    /// - `create`: the body's `id` may carry a caller-generated temporary id;
    ///   otherwise one is generated. The id is kept out of the stored body.
    /// - `update`: `id` names the target entity (temporary or real).
    /// - `transition`: `id` names the target and `action` the state change.
    pub fn enqueue(
        &self,
        entity_type: &str,
        operation: Operation,
        body: Value,
    ) -> Result<EnqueueReceipt, SyncError> {
        let entity_type = entity_type.trim();
        if entity_type.is_empty() {
            return Err(SyncError::InvalidRequest("entity type is required".into()));
        }
        let Value::Object(mut fields) = body else {
            return Err(SyncError::InvalidRequest(
                "mutation body must be a JSON object".into(),
            ));
        };

        let entity_id = match operation {
            Operation::Create => match fields.remove("id") {
                None | Some(Value::Null) => temp_id::generate(entity_type),
                Some(Value::String(id)) if temp_id::is_temporary(&id) => id,
                Some(other) => {
                    return Err(SyncError::InvalidRequest(format!(
                        "create may only carry a temporary id, got {other}"
                    )))
                }
            },
            Operation::Update | Operation::Transition => match fields.remove("id") {
                Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(SyncError::InvalidRequest(format!(
                        "{operation} requires the target id"
                    )))
                }
            },
        };
        let action = if operation == Operation::Transition {
            match fields.get("action").and_then(Value::as_str).map(str::trim) {
                Some(a) if !a.is_empty() => Some(a.to_string()),
                _ => {
                    return Err(SyncError::InvalidRequest(
                        "transition requires an action".into(),
                    ))
                }
            }
        } else {
            None
        };

        let body = Value::Object(fields);
        let natural_key = self
            .config
            .natural_key_field(entity_type)
            .and_then(|field| cache::natural_key_from(&body, field))
            .filter(|key| !temp_id::is_temporary(key));

        let mutation_id = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let id = queue::enqueue(
                &tx,
                &NewMutation {
                    entity_type,
                    entity_id: &entity_id,
                    operation,
                    body: &body,
                },
            )?;
            match action.as_deref() {
                Some(action) => {
                    if let Some(status) = derived_status(action) {
                        cache::apply_derived_status(
                            &tx,
                            entity_type,
                            &entity_id,
                            &serde_json::json!({ "status": status }),
                        )?;
                    }
                }
                None => cache::apply_optimistic(
                    &tx,
                    entity_type,
                    &entity_id,
                    &body,
                    natural_key.as_deref(),
                )?,
            }
            tx.commit()?;
            Ok(id)
        })?;

        self.emit(SyncEvent::MutationEnqueued {
            mutation_id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.clone(),
            operation,
        });
        Ok(EnqueueReceipt {
            mutation_id,
            entity_id,
        })
    }

    // -- Drain --------------------------------------------------------------

    /// Replay pending mutations until a pass makes no progress.
    ///
    /// A trigger that finds another drain active raises `rerun_requested`
    /// before giving up the lock race; the active drain checks the flag again
    /// after releasing the lock, so no trigger is lost.
    pub async fn drain(&self) -> DrainReport {
        if !self.is_online() {
            debug!("drain skipped: offline");
            return DrainReport::skipped(DrainSkip::Offline);
        }
        self.rerun_requested.store(true, Ordering::SeqCst);

        let mut report = DrainReport::default();
        let mut ran = false;
        loop {
            let Ok(guard) = self.drain_lock.try_lock() else {
                if ran {
                    // Another trigger took over the lock and will run the passes.
                    break;
                }
                debug!("drain already running; coalescing trigger");
                return DrainReport::skipped(DrainSkip::Coalesced);
            };
            ran = true;
            self.draining.store(true, Ordering::SeqCst);
            while self.is_online() && self.rerun_requested.swap(false, Ordering::SeqCst) {
                self.drain_passes(&mut report).await;
            }
            self.draining.store(false, Ordering::SeqCst);
            drop(guard);

            if !self.is_online() || !self.rerun_requested.load(Ordering::SeqCst) {
                break;
            }
            debug!("trigger arrived while releasing; draining again");
        }

        if let Ok(mut last) = self.last_sync.lock() {
            *last = Some(queue::now_ts());
        }
        self.emit(SyncEvent::DrainCompleted {
            synced: report.synced,
            failed: report.failed,
            deferred: report.deferred,
            passes: report.passes,
        });
        report
    }

    async fn drain_passes(&self, report: &mut DrainReport) {
        match self.with_conn(queue::reset_stuck_syncing) {
            Ok(0) => {}
            Ok(n) => info!(count = n, "recovered mutations left syncing by a previous run"),
            Err(e) => {
                error!(error = %e, "cannot reset stuck mutations; skipping drain");
                return;
            }
        }

        let batch_size = self.config.batch_size;
        match self.with_resolver(|resolver, conn| {
            let pending = queue::list_by_status(conn, MutationStatus::Pending, batch_size)?;
            Ok(resolver.warm(&pending)?)
        }) {
            Ok(0) => {}
            Ok(n) => debug!(mappings = n, "pre-warmed id mappings"),
            Err(e) => warn!(error = %e, "mapping rebuild failed; resolving lazily"),
        }

        // Mutations that already hit a transient failure in this drain.
        let mut attempted: HashSet<i64> = HashSet::new();

        loop {
            report.passes += 1;
            let mut progress = false;
            let mut deferred = 0;
            // Entities with a mutation left pending earlier in this pass.
            let mut blocked: HashSet<String> = HashSet::new();
            let mut after_id = 0;

            'pages: loop {
                let page = match self.with_conn(|conn| {
                    queue::list_by_status_after(conn, MutationStatus::Pending, after_id, batch_size)
                }) {
                    Ok(page) => page,
                    Err(e) => {
                        error!(error = %e, "cannot list pending mutations");
                        break 'pages;
                    }
                };
                let Some(last) = page.last() else {
                    break;
                };
                after_id = last.id;

                for mutation in &page {
                    if !self.is_online() {
                        info!("went offline mid-drain; stopping");
                        report.deferred = deferred;
                        return;
                    }

                    let outcome = if attempted.contains(&mutation.id)
                        || self.is_blocked(mutation, &blocked)
                    {
                        Outcome::Deferred
                    } else {
                        match self.process_mutation(mutation).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                error!(mutation_id = mutation.id, error = %e, "mutation processing failed");
                                Outcome::Deferred
                            }
                        }
                    };

                    match outcome {
                        Outcome::Synced => {
                            progress = true;
                            report.synced += 1;
                        }
                        Outcome::Failed => {
                            progress = true;
                            report.failed += 1;
                        }
                        Outcome::RetryLater => {
                            attempted.insert(mutation.id);
                            report.retried += 1;
                            deferred += 1;
                            blocked.insert(dependency_key(&mutation.entity_type, &mutation.entity_id));
                        }
                        Outcome::Deferred => {
                            deferred += 1;
                            blocked.insert(dependency_key(&mutation.entity_type, &mutation.entity_id));
                        }
                        Outcome::Skipped => {}
                    }
                }
            }

            report.deferred = deferred;
            if !progress {
                break;
            }
        }
    }

    /// A mutation waits while an earlier mutation on the same entity, or on
    /// an entity it references, is still pending in this pass.
    fn is_blocked(&self, mutation: &Mutation, blocked: &HashSet<String>) -> bool {
        if blocked.is_empty() {
            return false;
        }
        if blocked.contains(&dependency_key(&mutation.entity_type, &mutation.entity_id)) {
            return true;
        }
        resolver::references_of(mutation).iter().any(|temp| {
            let entity_type = temp_id::entity_type_of(temp).unwrap_or(mutation.entity_type.as_str());
            blocked.contains(&dependency_key(entity_type, temp))
        })
    }

    /// Advance one pending mutation through `syncing` to its next state.
    async fn process_mutation(&self, mutation: &Mutation) -> Result<Outcome, SyncError> {
        if mutation.status != MutationStatus::Pending {
            return Ok(Outcome::Skipped);
        }
        if is_backing_off(mutation.next_retry_at.as_deref()) {
            return Ok(Outcome::Deferred);
        }

        let claimed = self.with_conn(|conn| {
            queue::update_status(conn, mutation.id, MutationStatus::Syncing, &StatusFields::default())
        });
        match claimed {
            Ok(()) => {}
            Err(SyncError::InvalidTransition { from, .. }) => {
                debug!(mutation_id = mutation.id, %from, "mutation no longer pending");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        let resolution = self.with_resolver(|resolver, conn| {
            let resolution = resolver.resolve_mutation(mutation)?;
            let orphaned = match &resolution {
                ReferenceResolution::Blocked { temp_id, .. } => {
                    !queue::has_unsynced_creator(conn, temp_id)?
                }
                ReferenceResolution::Ready { .. } => false,
            };
            Ok((resolution, orphaned))
        });
        let (resolution, orphaned) = match resolution {
            Ok(r) => r,
            Err(e) => {
                self.release(mutation.id)?;
                return Err(e);
            }
        };

        let resolved = match resolution {
            ReferenceResolution::Ready { map, tiers } => {
                for (temp, tier) in tiers {
                    self.emit(SyncEvent::ResolverTierUsed {
                        mutation_id: mutation.id,
                        temp_id: temp,
                        tier,
                    });
                }
                map
            }
            ReferenceResolution::Blocked {
                temp_id,
                resolution,
            } => {
                if orphaned {
                    let reason = match resolution {
                        Resolution::NotFound => "no mapping or cached record",
                        _ => "its create mutation is gone",
                    };
                    let message = format!("unresolvable temporary identifier {temp_id}: {reason}");
                    return self.fail(mutation, message, mutation.retry_count);
                }
                self.release(mutation.id)?;
                self.emit(SyncEvent::DependencyNotReady {
                    mutation_id: mutation.id,
                    temp_id,
                });
                return Ok(Outcome::Deferred);
            }
        };

        let prepared = match prepare(mutation, &resolved) {
            Ok(p) => p,
            Err(message) => return self.fail(mutation, message, mutation.retry_count),
        };

        self.emit(SyncEvent::SyncAttempted {
            mutation_id: mutation.id,
            entity_type: mutation.entity_type.clone(),
            operation: mutation.operation,
            attempt: mutation.retry_count + 1,
        });

        let response = self.send(mutation, &prepared).await;
        match response {
            Ok(value) => self.complete(mutation, &prepared, value),
            Err(RemoteError::Conflict { existing }) => {
                info!(
                    mutation_id = mutation.id,
                    entity_type = %mutation.entity_type,
                    "remote reports entity already exists; adopting it"
                );
                self.complete(mutation, &prepared, existing)
            }
            Err(err) if err.is_retryable() => self.retry_later(mutation, err.to_string()),
            Err(err) => self.fail(mutation, err.to_string(), mutation.retry_count + 1),
        }
    }

    async fn send(&self, mutation: &Mutation, prepared: &Prepared) -> Result<Value, RemoteError> {
        let entity_type = mutation.entity_type.as_str();
        match (mutation.operation, prepared.target_id.as_deref()) {
            (Operation::Create, _) => self.remote.create(entity_type, &prepared.body).await,
            (Operation::Update, Some(id)) => self.remote.update(entity_type, id, &prepared.body).await,
            (Operation::Transition, Some(id)) => {
                let action = prepared.action.as_deref().unwrap_or_default();
                self.remote
                    .transition(entity_type, id, action, &prepared.body)
                    .await
            }
            (operation, None) => Err(RemoteError::Validation(format!(
                "{operation} mutation has no target id"
            ))),
        }
    }

    /// `syncing -> pending` without touching retry bookkeeping.
    fn release(&self, id: i64) -> Result<(), SyncError> {
        self.with_conn(|conn| {
            queue::update_status(conn, id, MutationStatus::Pending, &StatusFields::default())
        })
    }

    fn complete(&self, mutation: &Mutation, prepared: &Prepared, response: Value) -> Result<Outcome, SyncError> {
        let real_id = match mutation.operation {
            Operation::Create => match cache::natural_key_from(&response, "id") {
                Some(id) => id,
                None => {
                    return self.fail(
                        mutation,
                        "remote create response carried no id".to_string(),
                        mutation.retry_count + 1,
                    )
                }
            },
            _ => prepared.target_id.clone().unwrap_or_else(|| mutation.entity_id.clone()),
        };
        if temp_id::is_temporary(&real_id) {
            return self.fail(
                mutation,
                format!("remote returned a temporary id {real_id}"),
                mutation.retry_count + 1,
            );
        }

        if mutation.operation == Operation::Create {
            if let Ok(mut mappings) = self.mappings.lock() {
                if let Err(e) = mappings.register(&mutation.entity_type, &mutation.entity_id, &real_id) {
                    warn!(mutation_id = mutation.id, error = %e, "keeping first mapping");
                }
            }
        }

        // Confirmed fields: the server's copy, or what was sent when the
        // response carries no entity.
        let mut confirmed = match (&response, mutation.operation) {
            (Value::Object(_), _) => response.clone(),
            (_, Operation::Transition) => Value::Object(Map::new()),
            _ => prepared.body.clone(),
        };
        if let Value::Object(map) = &mut confirmed {
            map.remove("action");
        }
        let natural_key = self
            .config
            .natural_key_field(&mutation.entity_type)
            .and_then(|field| {
                cache::natural_key_from(&confirmed, field)
                    .or_else(|| cache::natural_key_from(&prepared.body, field))
            });

        self.with_conn(|conn| {
            let still_pending = queue::has_open_mutations_for(
                conn,
                &mutation.entity_type,
                &[mutation.entity_id.as_str(), real_id.as_str()],
                mutation.id,
            )?;
            cache::apply_synced(
                conn,
                &mutation.entity_type,
                &mutation.entity_id,
                &real_id,
                &confirmed,
                natural_key.as_deref(),
                still_pending,
            )?;
            queue::update_status(
                conn,
                mutation.id,
                MutationStatus::Synced,
                &StatusFields {
                    remote_id: Some(real_id.clone()),
                    last_error: Some(None),
                    next_retry_at: Some(None),
                    ..StatusFields::default()
                },
            )
        })?;

        self.emit(SyncEvent::SyncSucceeded {
            mutation_id: mutation.id,
            entity_type: mutation.entity_type.clone(),
            remote_id: real_id,
        });
        Ok(Outcome::Synced)
    }

    fn retry_later(&self, mutation: &Mutation, message: String) -> Result<Outcome, SyncError> {
        let retry_count = mutation.retry_count + 1;
        if retry_count >= self.config.max_retries {
            let message = format!("{message} (gave up after {retry_count} attempts)");
            return self.fail(mutation, message, retry_count);
        }

        let delay_ms = self.config.next_retry_delay_ms(mutation.retry_delay_ms);
        let next_retry_at = (delay_ms > 0).then(|| schedule_next_retry(delay_ms, mutation.id));
        self.with_conn(|conn| {
            queue::update_status(
                conn,
                mutation.id,
                MutationStatus::Pending,
                &StatusFields {
                    retry_count: Some(retry_count),
                    last_error: Some(Some(message.clone())),
                    next_retry_at: Some(next_retry_at.clone()),
                    retry_delay_ms: Some(delay_ms),
                    ..StatusFields::default()
                },
            )
        })?;

        self.emit(SyncEvent::SyncFailed {
            mutation_id: mutation.id,
            entity_type: mutation.entity_type.clone(),
            error: message,
            retryable: true,
        });
        Ok(Outcome::RetryLater)
    }

    fn fail(&self, mutation: &Mutation, message: String, retry_count: i64) -> Result<Outcome, SyncError> {
        self.with_conn(|conn| {
            queue::update_status(
                conn,
                mutation.id,
                MutationStatus::Failed,
                &StatusFields {
                    retry_count: Some(retry_count),
                    next_retry_at: Some(None),
                    ..StatusFields::error(message.clone())
                },
            )
        })?;

        self.emit(SyncEvent::SyncFailed {
            mutation_id: mutation.id,
            entity_type: mutation.entity_type.clone(),
            error: message,
            retryable: false,
        });
        Ok(Outcome::Failed)
    }

    // -- Status & operator actions -------------------------------------------

    pub fn get_sync_status(&self) -> Result<SyncStatus, SyncError> {
        let (pending_count, failed_count, in_flight, oldest_next_retry_at) = self.with_conn(|conn| {
            Ok((
                queue::count_by_status(conn, MutationStatus::Pending)?,
                queue::count_by_status(conn, MutationStatus::Failed)?,
                queue::count_by_status(conn, MutationStatus::Syncing)?,
                queue::oldest_next_retry_at(conn)?,
            ))
        })?;
        let last_sync = self.last_sync.lock().ok().and_then(|g| g.clone());

        Ok(SyncStatus {
            pending_count,
            failed_count,
            syncing: in_flight > 0 || self.draining.load(Ordering::SeqCst),
            is_online: self.is_online(),
            last_sync,
            oldest_next_retry_at,
        })
    }

    /// Operator action: every failed mutation back to pending, then drain.
    pub async fn retry_failed(&self) -> Result<RetryOutcome, SyncError> {
        let requeued = self.with_conn(queue::requeue_failed)?;
        info!(requeued, "operator retry of failed mutations");
        let drain = self.drain().await;
        Ok(RetryOutcome { requeued, drain })
    }

    pub async fn retry_mutation(&self, id: i64) -> Result<RetryOutcome, SyncError> {
        self.with_conn(|conn| queue::requeue_one(conn, id))?;
        info!(mutation_id = id, "operator retry of mutation");
        let drain = self.drain().await;
        Ok(RetryOutcome { requeued: 1, drain })
    }

    pub fn discard_failed(&self, id: i64) -> Result<(), SyncError> {
        self.with_conn(|conn| queue::discard_failed(conn, id))?;
        info!(mutation_id = id, "operator discarded failed mutation");
        Ok(())
    }

    pub fn list_failed(&self, limit: usize) -> Result<Vec<Mutation>, SyncError> {
        self.with_conn(|conn| queue::list_by_status(conn, MutationStatus::Failed, limit))
    }

    pub fn get_mutation(&self, id: i64) -> Result<Option<Mutation>, SyncError> {
        self.with_conn(|conn| queue::get(conn, id))
    }

    /// Cached entity by current or original temporary id.
    pub fn read_entity(&self, entity_type: &str, id: &str) -> Result<Option<CacheRecord>, SyncError> {
        self.with_conn(|conn| Ok(cache::find(conn, entity_type, id)?))
    }

    pub fn list_entities(&self, entity_type: &str, include_closed: bool) -> Result<Vec<CacheRecord>, SyncError> {
        self.with_conn(|conn| Ok(cache::list(conn, entity_type, include_closed)?))
    }

    /// Operator action: replace confirmed cache rows with authoritative
    /// remote state. Rows with local changes still queued are kept. An entity
    /// type whose fetch fails keeps its current rows.
    pub async fn force_full_resync(&self) -> Result<ResyncReport, SyncError> {
        if !self.is_online() {
            return Err(RemoteError::Transient("offline".into()).into());
        }

        let mut report = ResyncReport::default();
        for entity_type in &self.config.resync_entity_types {
            match self.remote.fetch_all(entity_type).await {
                Ok(records) => {
                    let field = self.config.natural_key_field(entity_type);
                    let loaded = self.with_conn(|conn| {
                        Ok(cache::replace_authoritative(conn, entity_type, &records, field)?)
                    })?;
                    info!(%entity_type, loaded, "cache refreshed from remote");
                    report.loaded.insert(entity_type.clone(), loaded);
                }
                Err(e) => {
                    warn!(%entity_type, error = %e, "resync fetch failed");
                    report.errors.insert(entity_type.clone(), e.to_string());
                }
            }
        }
        Ok(report)
    }
}

/// Substitute resolved ids and split out the target and action.
fn prepare(mutation: &Mutation, resolved: &HashMap<String, String>) -> Result<Prepared, String> {
    let mut body = mutation.body.clone();
    temp_id::substitute(&mut body, resolved);

    let action = match &mut body {
        Value::Object(map) if mutation.operation == Operation::Transition => map
            .remove("action")
            .and_then(|v| v.as_str().map(str::to_string)),
        _ => None,
    };
    let target_id = match mutation.operation {
        Operation::Create => None,
        _ => Some(
            resolved
                .get(&mutation.entity_id)
                .cloned()
                .unwrap_or_else(|| mutation.entity_id.clone()),
        ),
    };

    let leftover = temp_id::collect_references(&body);
    if let Some(temp) = leftover.first() {
        return Err(format!("payload still references temporary identifier {temp}"));
    }
    if let Some(target) = target_id.as_deref() {
        if temp_id::is_temporary(target) {
            return Err(format!("target {target} is still temporary"));
        }
    }
    if mutation.operation == Operation::Transition && action.is_none() {
        return Err("transition mutation has no action".into());
    }

    Ok(Prepared {
        target_id,
        action,
        body,
    })
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

/// Spawn the background loop: probe connectivity, drain while online, and
/// sleep `interval` between ticks until `cancel` fires.
pub fn start_sync_loop(
    engine: Arc<SyncEngine>,
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "sync loop started");
        let mut previous_online: Option<bool> = None;

        loop {
            let online = tokio::select! {
                _ = cancel.cancelled() => break,
                online = probe.is_online() => online,
            };

            if online {
                let report = if previous_online == Some(false) {
                    info!("network restored; resuming queued sync");
                    engine.on_connectivity_restored().await
                } else {
                    engine.set_online(true);
                    engine.drain().await
                };
                if report.synced > 0 || report.failed > 0 {
                    info!(
                        synced = report.synced,
                        failed = report.failed,
                        "sync cycle complete"
                    );
                }
            } else {
                if previous_online != Some(false) {
                    info!("network offline; keeping queue pending");
                }
                engine.set_online(false);
            }
            previous_online = Some(online);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("sync loop stopped");
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::resolver::ResolverTier;
    use async_trait::async_trait;
    use serde_json::json;
    use crate::resolver::ResolveContext;
    use std::sync::atomic::AtomicUsize;

    /// In-process remote with idempotent create keyed on the request body.
    #[derive(Default)]
    struct MockRemote {
        entities: Mutex<HashMap<String, Vec<Value>>>,
        by_body: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<(String, String, Value)>>,
        transient: Mutex<HashMap<String, usize>>,
        lost_responses: Mutex<HashMap<String, usize>>,
        rejected: Mutex<HashSet<String>>,
        temp_ids_seen: AtomicUsize,
    }

    impl MockRemote {
        fn fail_transiently(&self, entity_type: &str, times: usize) {
            self.transient.lock().unwrap().insert(entity_type.into(), times);
        }

        fn lose_responses(&self, entity_type: &str, times: usize) {
            self.lost_responses.lock().unwrap().insert(entity_type.into(), times);
        }

        fn reject(&self, entity_type: &str) {
            self.rejected.lock().unwrap().insert(entity_type.into());
        }

        fn accept(&self, entity_type: &str) {
            self.rejected.lock().unwrap().remove(entity_type);
        }

        fn entity_count(&self, entity_type: &str) -> usize {
            self.entities.lock().unwrap().get(entity_type).map_or(0, Vec::len)
        }

        fn calls(&self) -> Vec<(String, String, Value)> {
            self.calls.lock().unwrap().clone()
        }

        fn take(map: &Mutex<HashMap<String, usize>>, entity_type: &str) -> bool {
            let mut map = map.lock().unwrap();
            match map.get_mut(entity_type) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        }

        fn record(&self, op: &str, entity_type: &str, id: Option<&str>, body: &Value) -> Result<(), RemoteError> {
            if !temp_id::collect_references(body).is_empty() || id.is_some_and(temp_id::is_temporary) {
                self.temp_ids_seen.fetch_add(1, Ordering::SeqCst);
                return Err(RemoteError::Validation("invalid input syntax for type uuid".into()));
            }
            self.calls
                .lock()
                .unwrap()
                .push((op.to_string(), entity_type.to_string(), body.clone()));
            if self.rejected.lock().unwrap().contains(entity_type) {
                return Err(RemoteError::Validation(format!("{entity_type} payload rejected")));
            }
            if Self::take(&self.transient, entity_type) {
                return Err(RemoteError::Transient("HTTP 503".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemote {
        async fn create(&self, entity_type: &str, body: &Value) -> Result<Value, RemoteError> {
            self.record("create", entity_type, None, body)?;
            let key = format!("{entity_type}:{body}");
            let existing = self.by_body.lock().unwrap().get(&key).cloned();
            let id = match existing {
                Some(id) => id,
                None => {
                    let mut entities = self.entities.lock().unwrap();
                    let list = entities.entry(entity_type.to_string()).or_default();
                    let prefix = entity_type[..1].to_ascii_uppercase();
                    let id = format!("{prefix}{}", list.len() + 1);
                    let mut record = body.clone();
                    record["id"] = json!(id);
                    record["status"] = json!("open");
                    list.push(record);
                    self.by_body.lock().unwrap().insert(key, id.clone());
                    id
                }
            };
            if Self::take(&self.lost_responses, entity_type) {
                return Err(RemoteError::Transient("connection reset".into()));
            }
            let entities = self.entities.lock().unwrap();
            Ok(entities[entity_type]
                .iter()
                .find(|e| e["id"] == json!(id))
                .cloned()
                .unwrap_or(Value::Null))
        }

        async fn update(&self, entity_type: &str, id: &str, body: &Value) -> Result<Value, RemoteError> {
            self.record("update", entity_type, Some(id), body)?;
            let mut merged = body.clone();
            merged["id"] = json!(id);
            Ok(merged)
        }

        async fn transition(
            &self,
            entity_type: &str,
            id: &str,
            action: &str,
            body: &Value,
        ) -> Result<Value, RemoteError> {
            self.record(&format!("transition:{action}"), entity_type, Some(id), body)?;
            let status = derived_status(action).unwrap_or("open");
            Ok(json!({ "id": id, "status": status }))
        }

        async fn fetch_all(&self, entity_type: &str) -> Result<Vec<Value>, RemoteError> {
            Ok(self
                .entities
                .lock()
                .unwrap()
                .get(entity_type)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SyncEvent>>);

    impl SyncObserver for Recorder {
        fn on_event(&self, event: &SyncEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            base_retry_delay_ms: 0,
            ..SyncConfig::default()
        }
    }

    fn test_engine(remote: Arc<MockRemote>) -> (SyncEngine, Arc<Recorder>) {
        let db = Arc::new(db::open_in_memory().unwrap());
        let recorder = Arc::new(Recorder::default());
        let engine = SyncEngine::new(db, remote, test_config()).with_observer(recorder.clone());
        (engine, recorder)
    }

    fn enqueue_session_and_order(engine: &SyncEngine) -> (EnqueueReceipt, EnqueueReceipt) {
        let session = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-4", "guests": 2 }))
            .unwrap();
        let order = engine
            .enqueue(
                "order",
                Operation::Create,
                json!({ "session_id": session.entity_id, "items": [{ "sku": "IPA", "qty": 2 }] }),
            )
            .unwrap();
        (session, order)
    }

    fn status_of(engine: &SyncEngine, id: i64) -> Mutation {
        engine.get_mutation(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn happy_path_rewrites_dependency_before_sending() {
        let remote = Arc::new(MockRemote::default());
        let (engine, recorder) = test_engine(remote.clone());
        let (session, order) = enqueue_session_and_order(&engine);
        assert!(temp_id::is_temporary(&session.entity_id));

        let report = engine.drain().await;
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 0);

        let s = status_of(&engine, session.mutation_id);
        assert_eq!(s.status, MutationStatus::Synced);
        assert_eq!(s.remote_id.as_deref(), Some("S1"));
        let o = status_of(&engine, order.mutation_id);
        assert_eq!(o.status, MutationStatus::Synced);
        assert_eq!(o.remote_id.as_deref(), Some("O1"));

        let calls = remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "session");
        assert_eq!(calls[1].2["session_id"], "S1");
        assert_eq!(remote.temp_ids_seen.load(Ordering::SeqCst), 0);

        // Cache upgraded in place, still findable by the temporary id.
        let cached = engine.read_entity("session", &session.entity_id).unwrap().unwrap();
        assert_eq!(cached.id, "S1");
        assert!(!cached.pending_sync);
        let cached_order = engine.read_entity("order", &order.entity_id).unwrap().unwrap();
        assert_eq!(cached_order.fields["session_id"], "S1");

        let events = recorder.0.lock().unwrap().clone();
        let enqueued = events
            .iter()
            .filter(|e| matches!(e, SyncEvent::MutationEnqueued { .. }))
            .count();
        assert_eq!(enqueued, 2);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::ResolverTierUsed {
                tier: ResolverTier::Memory,
                ..
            }
        )));
        assert!(matches!(
            events.last(),
            Some(SyncEvent::DrainCompleted { synced: 2, .. })
        ));
    }

    #[tokio::test]
    async fn transient_failure_leaves_pending_with_retry_count() {
        let remote = Arc::new(MockRemote::default());
        remote.fail_transiently("order", 1);
        let (engine, _) = test_engine(remote.clone());
        let (session, order) = enqueue_session_and_order(&engine);

        let first = engine.drain().await;
        assert_eq!(first.synced, 1);
        assert_eq!(first.retried, 1);
        assert_eq!(status_of(&engine, session.mutation_id).status, MutationStatus::Synced);
        let o = status_of(&engine, order.mutation_id);
        assert_eq!(o.status, MutationStatus::Pending);
        assert_eq!(o.retry_count, 1);
        assert!(o.last_error.as_deref().unwrap_or_default().contains("503"));

        let second = engine.drain().await;
        assert_eq!(second.synced, 1);
        assert_eq!(status_of(&engine, order.mutation_id).status, MutationStatus::Synced);
        assert_eq!(engine.get_sync_status().unwrap().pending_count, 0);
    }

    fn resolve_after_reload(engine: &SyncEngine, temp: &str, hints: &Value) -> Resolution {
        engine
            .with_resolver(|resolver, _| {
                Ok(resolver.resolve(temp, "session", &ResolveContext::from_body(hints))?)
            })
            .unwrap()
    }

    #[tokio::test]
    async fn reload_resolves_from_cache_origin() {
        let remote = Arc::new(MockRemote::default());
        remote.fail_transiently("order", 1);
        let (engine, _) = test_engine(remote.clone());
        let (session, order) = enqueue_session_and_order(&engine);

        engine.drain().await;
        assert_eq!(status_of(&engine, order.mutation_id).status, MutationStatus::Pending);
        engine.clear_mappings();

        assert_eq!(
            resolve_after_reload(&engine, &session.entity_id, &json!({})),
            Resolution::Resolved {
                real_id: "S1".into(),
                tier: ResolverTier::CacheById
            }
        );
        engine.clear_mappings();

        engine.drain().await;
        assert_eq!(status_of(&engine, order.mutation_id).status, MutationStatus::Synced);
        assert_eq!(remote.calls().last().unwrap().2["session_id"], "S1");
        assert_eq!(remote.entity_count("session"), 1);
    }

    #[tokio::test]
    async fn reload_after_resync_still_resolves_by_origin() {
        let remote = Arc::new(MockRemote::default());
        remote.fail_transiently("order", 1);
        let (engine, _) = test_engine(remote.clone());
        let session = engine
            .enqueue("session", Operation::Create, json!({ "guests": 3 }))
            .unwrap();
        let order = engine
            .enqueue("order", Operation::Create, json!({ "session_id": session.entity_id }))
            .unwrap();

        engine.drain().await;
        let resync = engine.force_full_resync().await.unwrap();
        assert_eq!(resync.loaded.get("session"), Some(&1));
        assert!(resync.errors.is_empty());
        engine.clear_mappings();

        assert_eq!(
            resolve_after_reload(&engine, &session.entity_id, &json!({})),
            Resolution::Resolved {
                real_id: "S1".into(),
                tier: ResolverTier::CacheById
            }
        );
        engine.clear_mappings();

        engine.drain().await;
        let o = status_of(&engine, order.mutation_id);
        assert_eq!(o.status, MutationStatus::Synced, "last_error: {:?}", o.last_error);
        assert_eq!(remote.calls().last().unwrap().2["session_id"], "S1");
    }

    #[tokio::test]
    async fn reload_without_origin_falls_back_to_relationship() {
        let remote = Arc::new(MockRemote::default());
        remote.fail_transiently("order", 1);
        let (engine, _) = test_engine(remote.clone());
        let session = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-4" }))
            .unwrap();
        let order_body = json!({ "session_id": session.entity_id, "table_id": "table-4" });
        let order = engine
            .enqueue("order", Operation::Create, order_body.clone())
            .unwrap();

        engine.drain().await;
        // Cache rebuilt elsewhere: the record no longer knows its temporary id.
        engine
            .with_conn(|conn| {
                conn.execute("UPDATE entity_cache SET origin_id = NULL WHERE entity_type = 'session'", [])?;
                Ok(())
            })
            .unwrap();
        engine.clear_mappings();

        assert_eq!(
            resolve_after_reload(&engine, &session.entity_id, &order_body),
            Resolution::Resolved {
                real_id: "S1".into(),
                tier: ResolverTier::Relationship
            }
        );
        engine.clear_mappings();

        engine.drain().await;
        assert_eq!(status_of(&engine, order.mutation_id).status, MutationStatus::Synced);
        assert_eq!(remote.calls().last().unwrap().2["session_id"], "S1");
    }

    #[tokio::test]
    async fn permanent_failure_needs_operator_retry() {
        let remote = Arc::new(MockRemote::default());
        remote.reject("session");
        let (engine, _) = test_engine(remote.clone());
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-1" }))
            .unwrap();

        engine.drain().await;
        engine.drain().await;
        let m = status_of(&engine, receipt.mutation_id);
        assert_eq!(m.status, MutationStatus::Failed);
        assert!(m.last_error.as_deref().unwrap_or_default().contains("rejected"));
        assert_eq!(remote.calls().len(), 1, "failed mutations are not retried automatically");

        let failed = engine.list_failed(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].body["table_id"], "table-1");

        remote.accept("session");
        let outcome = engine.retry_failed().await.unwrap();
        assert_eq!(outcome.requeued, 1);
        assert_eq!(outcome.drain.synced, 1);
        assert_eq!(status_of(&engine, receipt.mutation_id).status, MutationStatus::Synced);
    }

    #[tokio::test]
    async fn dependent_waits_while_parent_failed() {
        let remote = Arc::new(MockRemote::default());
        remote.reject("session");
        let (engine, _) = test_engine(remote.clone());
        let (session, order) = enqueue_session_and_order(&engine);

        let report = engine.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&engine, order.mutation_id).status, MutationStatus::Pending);
        assert_eq!(remote.temp_ids_seen.load(Ordering::SeqCst), 0);

        // Discarding the parent orphans the dependent, which then fails.
        engine.discard_failed(session.mutation_id).unwrap();
        engine.drain().await;
        let o = status_of(&engine, order.mutation_id);
        assert_eq!(o.status, MutationStatus::Failed);
        assert!(o.last_error.unwrap().contains("unresolvable temporary identifier"));
    }

    #[tokio::test]
    async fn retries_exhausted_become_failed() {
        let remote = Arc::new(MockRemote::default());
        remote.fail_transiently("session", 10);
        let db = Arc::new(db::open_in_memory().unwrap());
        let config = SyncConfig {
            max_retries: 2,
            ..test_config()
        };
        let engine = SyncEngine::new(db, remote.clone(), config);
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-2" }))
            .unwrap();

        engine.drain().await;
        assert_eq!(status_of(&engine, receipt.mutation_id).status, MutationStatus::Pending);
        engine.drain().await;
        let m = status_of(&engine, receipt.mutation_id);
        assert_eq!(m.status, MutationStatus::Failed);
        assert_eq!(m.retry_count, 2);
    }

    #[tokio::test]
    async fn lost_response_replay_creates_no_duplicate() {
        let remote = Arc::new(MockRemote::default());
        remote.lose_responses("session", 1);
        let (engine, _) = test_engine(remote.clone());
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-7" }))
            .unwrap();

        engine.drain().await;
        engine.drain().await;
        assert_eq!(status_of(&engine, receipt.mutation_id).status, MutationStatus::Synced);
        assert_eq!(remote.entity_count("session"), 1);
        assert_eq!(remote.calls().len(), 2);
    }

    #[tokio::test]
    async fn stuck_syncing_is_recovered() {
        let remote = Arc::new(MockRemote::default());
        let (engine, _) = test_engine(remote.clone());
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-3" }))
            .unwrap();
        engine
            .with_conn(|conn| {
                queue::update_status(conn, receipt.mutation_id, MutationStatus::Syncing, &StatusFields::default())
            })
            .unwrap();

        engine.drain().await;
        assert_eq!(status_of(&engine, receipt.mutation_id).status, MutationStatus::Synced);
        assert_eq!(remote.entity_count("session"), 1);
    }

    #[tokio::test]
    async fn synced_mutations_are_never_resent() {
        let remote = Arc::new(MockRemote::default());
        let (engine, _) = test_engine(remote.clone());
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-5" }))
            .unwrap();
        engine.drain().await;
        let mut stale = status_of(&engine, receipt.mutation_id);

        // A stale copy still claiming to be pending must be ignored.
        stale.status = MutationStatus::Pending;
        assert_eq!(engine.process_mutation(&stale).await.unwrap(), Outcome::Skipped);
        engine.drain().await;
        assert_eq!(remote.calls().len(), 1);
        assert_eq!(status_of(&engine, receipt.mutation_id).status, MutationStatus::Synced);
    }

    #[tokio::test]
    async fn update_and_close_follow_their_create() {
        let remote = Arc::new(MockRemote::default());
        let (engine, _) = test_engine(remote.clone());
        let session = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-8" }))
            .unwrap();
        engine
            .enqueue("session", Operation::Update, json!({ "id": session.entity_id, "guests": 5 }))
            .unwrap();
        engine
            .enqueue(
                "session",
                Operation::Transition,
                json!({ "id": session.entity_id, "action": "close" }),
            )
            .unwrap();

        // Optimistic close hides the session from open lists right away.
        assert!(engine.list_entities("session", false).unwrap().is_empty());

        let report = engine.drain().await;
        assert_eq!(report.synced, 3);
        let calls = remote.calls();
        assert_eq!(calls[1].0, "update");
        assert_eq!(calls[2].0, "transition:close");
        assert!(calls[2].2.get("action").is_none());

        let cached = engine.read_entity("session", "S1").unwrap().unwrap();
        assert_eq!(cached.fields["status"], "closed");
        assert_eq!(cached.fields["guests"], 5);
        assert!(!cached.pending_sync);
    }

    #[tokio::test]
    async fn conflict_adopts_existing_entity() {
        struct ConflictRemote;

        #[async_trait]
        impl RemoteApi for ConflictRemote {
            async fn create(&self, _: &str, _: &Value) -> Result<Value, RemoteError> {
                Err(RemoteError::Conflict {
                    existing: json!({ "id": "S42", "table_id": "table-1", "status": "open" }),
                })
            }
            async fn update(&self, _: &str, _: &str, _: &Value) -> Result<Value, RemoteError> {
                unreachable!()
            }
            async fn transition(&self, _: &str, _: &str, _: &str, _: &Value) -> Result<Value, RemoteError> {
                unreachable!()
            }
            async fn fetch_all(&self, _: &str) -> Result<Vec<Value>, RemoteError> {
                Ok(Vec::new())
            }
        }

        let db = Arc::new(db::open_in_memory().unwrap());
        let engine = SyncEngine::new(db, Arc::new(ConflictRemote), test_config());
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-1" }))
            .unwrap();

        engine.drain().await;
        let m = status_of(&engine, receipt.mutation_id);
        assert_eq!(m.status, MutationStatus::Synced);
        assert_eq!(m.remote_id.as_deref(), Some("S42"));
    }

    #[tokio::test]
    async fn offline_drain_is_skipped_and_enqueue_still_works() {
        let remote = Arc::new(MockRemote::default());
        let (engine, _) = test_engine(remote.clone());
        engine.set_online(false);
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-9" }))
            .unwrap();

        assert_eq!(engine.drain().await.skipped, Some(DrainSkip::Offline));
        assert!(remote.calls().is_empty());
        let status = engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 1);
        assert!(!status.is_online);

        let report = engine.on_connectivity_restored().await;
        assert_eq!(report.synced, 1);
        assert_eq!(status_of(&engine, receipt.mutation_id).status, MutationStatus::Synced);
        assert!(engine.get_sync_status().unwrap().last_sync.is_some());
    }

    #[tokio::test]
    async fn backoff_defers_until_due() {
        let remote = Arc::new(MockRemote::default());
        remote.fail_transiently("session", 1);
        let db = Arc::new(db::open_in_memory().unwrap());
        let engine = SyncEngine::new(db, remote.clone(), SyncConfig::default());
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-6" }))
            .unwrap();

        engine.drain().await;
        let m = status_of(&engine, receipt.mutation_id);
        assert_eq!(m.retry_delay_ms, 5_000);
        assert!(m.next_retry_at.is_some());
        assert!(engine.get_sync_status().unwrap().oldest_next_retry_at.is_some());

        let report = engine.drain().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(remote.calls().len(), 1);

        // Operator retry clears the schedule.
        engine
            .with_conn(|conn| {
                queue::update_status(conn, receipt.mutation_id, MutationStatus::Syncing, &StatusFields::default())?;
                queue::update_status(conn, receipt.mutation_id, MutationStatus::Failed, &StatusFields::default())
            })
            .unwrap();
        let outcome = engine.retry_mutation(receipt.mutation_id).await.unwrap();
        assert_eq!(outcome.drain.synced, 1);
    }

    #[test]
    fn enqueue_validates_input() {
        let remote = Arc::new(MockRemote::default());
        let (engine, _) = test_engine(remote);
        assert!(matches!(
            engine.enqueue("session", Operation::Create, json!([1, 2])),
            Err(SyncError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.enqueue("session", Operation::Create, json!({ "id": "S1" })),
            Err(SyncError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.enqueue("session", Operation::Update, json!({ "guests": 1 })),
            Err(SyncError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.enqueue("session", Operation::Transition, json!({ "id": "S1" })),
            Err(SyncError::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.enqueue(" ", Operation::Create, json!({})),
            Err(SyncError::InvalidRequest(_))
        ));

        let temp = temp_id::generate("session");
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "id": temp, "table_id": "t" }))
            .unwrap();
        assert_eq!(receipt.entity_id, temp);
        let m = status_of(&engine, receipt.mutation_id);
        assert!(m.body.get("id").is_none());
    }

    #[tokio::test]
    async fn concurrent_trigger_is_coalesced() {
        let remote = Arc::new(MockRemote::default());
        let (engine, _) = test_engine(remote.clone());
        engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-1" }))
            .unwrap();

        let guard = engine.drain_lock.lock().await;
        assert_eq!(engine.drain().await.skipped, Some(DrainSkip::Coalesced));
        assert!(engine.rerun_requested.load(Ordering::SeqCst));
        drop(guard);

        assert_eq!(engine.drain().await.synced, 1);
        assert_eq!(remote.calls().len(), 1);
    }

    /// Holds the first create open until released.
    struct GatedRemote {
        inner: Arc<MockRemote>,
        armed: AtomicBool,
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl RemoteApi for GatedRemote {
        async fn create(&self, entity_type: &str, body: &Value) -> Result<Value, RemoteError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.inner.create(entity_type, body).await
        }

        async fn update(&self, entity_type: &str, id: &str, body: &Value) -> Result<Value, RemoteError> {
            self.inner.update(entity_type, id, body).await
        }

        async fn transition(
            &self,
            entity_type: &str,
            id: &str,
            action: &str,
            body: &Value,
        ) -> Result<Value, RemoteError> {
            self.inner.transition(entity_type, id, action, body).await
        }

        async fn fetch_all(&self, entity_type: &str) -> Result<Vec<Value>, RemoteError> {
            self.inner.fetch_all(entity_type).await
        }
    }

    #[tokio::test]
    async fn status_poll_during_drain_does_not_swallow_triggers() {
        let inner = Arc::new(MockRemote::default());
        let gated = Arc::new(GatedRemote {
            inner: inner.clone(),
            armed: AtomicBool::new(true),
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let db = Arc::new(db::open_in_memory().unwrap());
        let engine = Arc::new(SyncEngine::new(db, gated.clone(), test_config()));
        assert!(!engine.get_sync_status().unwrap().syncing);

        engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-1" }))
            .unwrap();
        let active = tokio::spawn({
            let engine = engine.clone();
            async move { engine.drain().await }
        });
        gated.started.notified().await;

        // Polling status must not hold the drain lock.
        assert!(engine.get_sync_status().unwrap().syncing);
        assert!(engine.drain_lock.try_lock().is_err());

        engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-2" }))
            .unwrap();
        assert_eq!(engine.drain().await.skipped, Some(DrainSkip::Coalesced));

        gated.release.notify_one();
        let report = active.await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(!engine.rerun_requested.load(Ordering::SeqCst));
        let status = engine.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 0);
        assert!(!status.syncing);

        // Nothing is draining now, so the next trigger runs immediately.
        engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-3" }))
            .unwrap();
        assert!(engine.get_sync_status().unwrap().pending_count == 1);
        assert_eq!(engine.drain().await.synced, 1);
        assert_eq!(inner.entity_count("session"), 3);
    }

    /// Replays a fixed connectivity script, then reports online.
    struct ScriptedProbe {
        script: Mutex<std::collections::VecDeque<bool>>,
        remote: Arc<MockRemote>,
        seen: Mutex<Vec<(bool, usize)>>,
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn is_online(&self) -> bool {
            let online = self.script.lock().unwrap().pop_front().unwrap_or(true);
            self.seen
                .lock()
                .unwrap()
                .push((online, self.remote.calls().len()));
            online
        }
    }

    #[tokio::test]
    async fn sync_loop_drains_after_connectivity_returns() {
        let remote = Arc::new(MockRemote::default());
        let (engine, recorder) = test_engine(remote.clone());
        let engine = Arc::new(engine);
        let receipt = engine
            .enqueue("session", Operation::Create, json!({ "table_id": "table-6" }))
            .unwrap();

        let probe = Arc::new(ScriptedProbe {
            script: Mutex::new([false, false, true].into_iter().collect()),
            remote: remote.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let handle = start_sync_loop(
            engine.clone(),
            probe.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        let synced = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if status_of(&engine, receipt.mutation_id).status == MutationStatus::Synced {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(synced.is_ok(), "mutation never synced after reconnect");
        assert!(engine.is_online());

        let seen = probe.seen.lock().unwrap().clone();
        assert!(seen.len() >= 3);
        assert_eq!(&seen[..2], &[(false, 0), (false, 0)]);
        assert_eq!(remote.calls().len(), 1);
        assert!(recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SyncEvent::DrainCompleted { synced: 1, .. })));

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(stopped, Ok(Ok(()))), "sync loop did not stop on cancel");
    }

    #[test]
    fn jitter_is_bounded() {
        for seed in [-5, 0, 1, 699, 700, 123_456] {
            let jitter = deterministic_jitter_ms(seed);
            assert!((50..750).contains(&jitter));
        }
        assert!(is_backing_off(Some(&schedule_next_retry(60_000, 1))));
        assert!(!is_backing_off(Some("2001-01-01T00:00:00.000Z")));
        assert!(!is_backing_off(None));
    }
}
