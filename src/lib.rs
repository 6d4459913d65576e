//! Bar POS offline-first sync engine.
//!
//! Staff keep taking orders and closing tabs while disconnected: every write
//! is queued locally with an optimistic cache update, then replayed against
//! the remote system of record once connectivity returns. Temporary ids
//! assigned offline are swapped for server ids as their creates sync.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod storage;
pub mod sync;
pub mod temp_id;

pub use config::SyncConfig;
pub use error::SyncError;
pub use events::{BroadcastObserver, FanoutObserver, SyncEvent, SyncObserver, TracingObserver};
pub use queue::{Mutation, MutationStatus, Operation};
pub use remote::{ConnectivityProbe, HttpRemoteApi, RemoteApi, RemoteError};
pub use sync::{start_sync_loop, DrainReport, EnqueueReceipt, SyncEngine, SyncStatus};

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

/// Install structured logging: console plus a daily-rolling file in
/// `log_dir`. Keep the returned guard alive; dropping it flushes the file
/// writer.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard, String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,barpos_sync=debug"));

    diagnostics::prune_old_logs(log_dir, diagnostics::MAX_LOG_FILES);
    std::fs::create_dir_all(log_dir).map_err(|e| format!("create log dir: {e}"))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "sync");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("install tracing subscriber: {e}"))?;

    Ok(guard)
}
