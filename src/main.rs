//! `barpos-sync` daemon.
//!
//! Opens the local database, drains the mutation queue in the background
//! while the admin dashboard is reachable, and serves UI commands as
//! line-delimited JSON on stdin/stdout until Ctrl-C:
//!
//! ```text
//! {"command":"sync_enqueue","args":{"entityType":"session","operation":"create","body":{"table_id":"t4"}}}
//! {"ok":true,"result":{"mutationId":1,"entityId":"tmp-session-..."}}
//! ```
//!
//! Without stored credentials only the `settings_*` commands are served until
//! `settings_update_terminal_credentials` succeeds.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use barpos_sync::{
    commands, db, diagnostics, start_sync_loop, storage, BroadcastObserver, FanoutObserver,
    HttpRemoteApi, SyncConfig, SyncEngine, TracingObserver,
};

type CommandLines = Lines<BufReader<Stdin>>;

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default, alias = "arg0", alias = "payload")]
    args: Option<Value>,
}

fn response_of(result: Result<Value, String>) -> Value {
    match result {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(error) => json!({ "ok": false, "error": error }),
    }
}

async fn write_response(stdout: &mut Stdout, response: &Value) -> Result<()> {
    stdout.write_all(format!("{response}\n").as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Serve settings commands until the terminal has credentials.
async fn await_onboarding(
    db_state: &db::DbState,
    lines: &mut CommandLines,
    stdout: &mut Stdout,
) -> Result<()> {
    warn!("terminal not configured; send settings_update_terminal_credentials on stdin");
    while !storage::is_configured() {
        let Some(line) = lines.next_line().await.context("read command")? else {
            bail!("stdin closed before the terminal was configured");
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(req) => response_of(
                commands::dispatch_settings(db_state, &req.command, req.args)
                    .unwrap_or_else(|| Err("Terminal not configured".into())),
            ),
            Err(e) => response_of(Err(format!("Invalid command: {e}"))),
        };
        write_response(stdout, &response).await?;
    }
    info!("terminal configured");
    Ok(())
}

async fn serve_commands(
    engine: Arc<SyncEngine>,
    mut lines: CommandLines,
    mut stdout: Stdout,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("read command")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(req) => response_of(commands::dispatch(&engine, &req.command, req.args).await),
            Err(e) => response_of(Err(format!("Invalid command: {e}"))),
        };
        write_response(&mut stdout, &response).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = diagnostics::get_data_dir();
    let _log_guard = barpos_sync::init_logging(&diagnostics::get_log_dir()).map_err(|e| anyhow!(e))?;
    info!(
        "Starting barpos-sync v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_GIT_SHA")
    );

    let db_state = Arc::new(
        db::init(&data_dir)
            .map_err(|e| anyhow!(e))
            .context("initialize database")?,
    );
    let config = {
        let conn = db_state
            .conn
            .lock()
            .map_err(|e| anyhow!("db lock poisoned: {e}"))?;
        SyncConfig::load(&conn)
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    if !storage::is_configured() {
        await_onboarding(&db_state, &mut lines, &mut stdout).await?;
    }

    let remote = Arc::new(
        HttpRemoteApi::from_stored_credentials(config.request_timeout())
            .map_err(|e| anyhow!(e))
            .context("load terminal credentials")?,
    );
    info!(admin_url = remote.base_url(), "remote configured");

    let broadcast = Arc::new(BroadcastObserver::new(256));
    let observer = FanoutObserver::new()
        .with(Arc::new(TracingObserver))
        .with(broadcast.clone());
    let interval = config.interval();
    let engine = Arc::new(
        SyncEngine::new(db_state, remote.clone(), config).with_observer(Arc::new(observer)),
    );

    let cancel = CancellationToken::new();
    let sync_loop = start_sync_loop(engine.clone(), remote, interval, cancel.clone());

    // Echo engine events to stdout for the UI bridge.
    let mut events = broadcast.subscribe();
    let events_cancel = cancel.clone();
    let event_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "failed to serialize event"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                    }
                    Err(_) => break,
                },
            }
        }
    });

    let command_task = tokio::spawn(serve_commands(engine.clone(), lines, stdout, cancel.clone()));

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutdown requested");

    cancel.cancel();
    let _ = sync_loop.await;
    let _ = event_task.await;
    match command_task.await {
        Ok(Err(e)) => warn!(error = %e, "command channel failed"),
        Err(e) => warn!(error = %e, "command task panicked"),
        Ok(Ok(())) => {}
    }
    info!("barpos-sync stopped");
    Ok(())
}
