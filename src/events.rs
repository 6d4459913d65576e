//! Structured sync events and the observers that consume them.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::queue::Operation;
use crate::resolver::ResolverTier;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    MutationEnqueued {
        mutation_id: i64,
        entity_type: String,
        entity_id: String,
        operation: Operation,
    },
    SyncAttempted {
        mutation_id: i64,
        entity_type: String,
        operation: Operation,
        attempt: i64,
    },
    SyncSucceeded {
        mutation_id: i64,
        entity_type: String,
        remote_id: String,
    },
    SyncFailed {
        mutation_id: i64,
        entity_type: String,
        error: String,
        /// `true` when the mutation stays pending for another attempt.
        retryable: bool,
    },
    DependencyNotReady {
        mutation_id: i64,
        temp_id: String,
    },
    ResolverTierUsed {
        mutation_id: i64,
        temp_id: String,
        tier: ResolverTier,
    },
    DrainCompleted {
        synced: usize,
        failed: usize,
        deferred: usize,
        passes: usize,
    },
}

pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

/// Writes every event to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::MutationEnqueued {
                mutation_id,
                entity_type,
                entity_id,
                operation,
            } => debug!(mutation_id, %entity_type, %entity_id, %operation, "mutation enqueued"),
            SyncEvent::SyncAttempted {
                mutation_id,
                entity_type,
                operation,
                attempt,
            } => debug!(mutation_id, %entity_type, %operation, attempt, "sync attempted"),
            SyncEvent::SyncSucceeded {
                mutation_id,
                entity_type,
                remote_id,
            } => info!(mutation_id, %entity_type, %remote_id, "sync succeeded"),
            SyncEvent::SyncFailed {
                mutation_id,
                entity_type,
                error,
                retryable,
            } => warn!(mutation_id, %entity_type, %error, retryable, "sync failed"),
            SyncEvent::DependencyNotReady { mutation_id, temp_id } => {
                debug!(mutation_id, %temp_id, "dependency not yet synced")
            }
            SyncEvent::ResolverTierUsed {
                mutation_id,
                temp_id,
                tier,
            } => debug!(mutation_id, %temp_id, %tier, "temporary id resolved"),
            SyncEvent::DrainCompleted {
                synced,
                failed,
                deferred,
                passes,
            } => info!(synced, failed, deferred, passes, "drain completed"),
        }
    }
}

/// Publishes events on a broadcast channel for UI subscribers. Events are
/// dropped when nobody is listening.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl SyncObserver for BroadcastObserver {
    fn on_event(&self, event: &SyncEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Default)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn SyncObserver>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl SyncObserver for FanoutObserver {
    fn on_event(&self, event: &SyncEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}
