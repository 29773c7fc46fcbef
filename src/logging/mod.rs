// Logging setup, dated log files and 7-day retention
use chrono::NaiveDate;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "STEMDECK_LOG";
const LOG_RETENTION_DAYS: u64 = 7;

/// Install the global subscriber. `log` records are forwarded to it.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        warn!("Logging was already initialized");
    }
}

/// `logs/backend.log` -> `logs/backend-2026-10-16.log`. A new file per day
/// lets retention expire old output.
pub fn dated_log_path(base: &Path, date: NaiveDate) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "log".to_string());
    let name = match base.extension() {
        Some(ext) => format!("{}-{}.{}", stem, date.format("%Y-%m-%d"), ext.to_string_lossy()),
        None => format!("{}-{}", stem, date.format("%Y-%m-%d")),
    };
    base.with_file_name(name)
}

/// Delete `*.log` files in `logs_dir` older than the retention period.
/// Returns how many were removed.
pub fn cleanup_old_logs(logs_dir: &Path) -> usize {
    cleanup_logs_older_than(logs_dir, Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60))
}

fn cleanup_logs_older_than(logs_dir: &Path, retention: Duration) -> usize {
    if !logs_dir.exists() {
        return 0;
    }

    let now = SystemTime::now();
    let mut removed = 0;

    if let Ok(entries) = fs::read_dir(logs_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "log") {
                let expired = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .map_or(false, |age| age > retention);
                if expired && fs::remove_file(&path).is_ok() {
                    info!("Cleaned up old log: {:?}", path.file_name());
                    removed += 1;
                }
            }
        }
    }
    removed
}
