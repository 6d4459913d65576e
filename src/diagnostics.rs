//! Filesystem locations and log housekeeping for the sync daemon.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Number of rolled log files kept by default.
pub const MAX_LOG_FILES: usize = 10;

const APP_DIR: &str = "barpos-sync";
const LOG_PREFIX: &str = "sync";

fn platform_data_base() -> PathBuf {
    std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        })
}

/// Data directory holding `sync.db`. `BARPOS_DATA_DIR` overrides the
/// platform default.
pub fn get_data_dir() -> PathBuf {
    match std::env::var("BARPOS_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => platform_data_base().join(APP_DIR),
    }
}

pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Prune rolled `sync.*` log files in `log_dir`, keeping the newest `keep`.
/// Returns the number of files removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; ties broken by name so daily suffixes order correctly.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "failed to prune log file"),
        }
    }
    if removed > 0 {
        info!(removed, "pruned old log files");
    }
    removed
}
