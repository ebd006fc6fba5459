//! Logging setup.
//!
//! This module provides:
//! - Console output with local timezone timestamps
//! - Optional daily-rolling log files in a configured directory
//! - Log file retention cleanup (deletes logs older than 7 days)

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "tcpconnect_agent=info,process_utils=info,tower_http=warn";

/// Prefix of rolled log files (`tcpconnect-agent.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "tcpconnect-agent.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Keeps the file writer alive. Drop it only when the process exits.
pub struct LoggingHandle {
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Start the log retention cleanup task.
    ///
    /// Runs once immediately, then daily. No-op without a log directory.
    pub fn start_retention_cleanup(
        &self,
        cancel_token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let log_dir = self.log_dir.clone()?;

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                            warn!(error = %e, "Failed to cleanup old logs");
                        }
                    }
                }
            }
        }))
    }
}

/// Delete log files older than the specified number of days.
///
/// Returns the number of files removed.
pub(crate) async fn cleanup_old_logs(
    log_dir: &Path,
    retention_days: i64,
) -> std::io::Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    let cutoff_ts = cutoff.timestamp();
    let prefix = format!("{LOG_FILE_PREFIX}.");

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| name.strip_prefix(prefix.as_str()))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        let file_ts = file_date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);

        if file_ts < cutoff_ts {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete old log file");
            } else {
                deleted_count += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Initialize the global subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
/// When `log_dir` is set, a second non-blocking layer writes daily files
/// there.
pub fn init_logging(log_dir: Option<&Path>) -> crate::Result<LoggingHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;

            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(LoggingHandle {
        log_dir: log_dir.map(Path::to_path_buf),
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"log line\n").unwrap();
        path
    }

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("tcpconnect_agent=info"));
        assert!(DEFAULT_LOG_FILTER.contains("tower_http=warn"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        let today = Local::now().format("%Y-%m-%d").to_string();

        let old = touch(dir.path(), "tcpconnect-agent.log.2020-01-01");
        let recent = touch(dir.path(), &format!("tcpconnect-agent.log.{today}"));
        let unrelated = touch(dir.path(), "other.log.2020-01-01");
        let malformed = touch(dir.path(), "tcpconnect-agent.log.not-a-date");

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(unrelated.exists());
        assert!(malformed.exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(
            cleanup_old_logs(&missing, LOG_RETENTION_DAYS)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_retention_cleanup_without_dir() {
        let handle = LoggingHandle {
            log_dir: None,
            _guard: None,
        };
        assert!(handle.start_retention_cleanup(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_retention_cleanup_task_stops() {
        let dir = tempfile::tempdir().unwrap();
        let old = touch(dir.path(), "tcpconnect-agent.log.2020-01-01");

        let handle = LoggingHandle {
            log_dir: Some(dir.path().to_path_buf()),
            _guard: None,
        };
        let token = CancellationToken::new();
        let task = handle.start_retention_cleanup(token.clone()).unwrap();

        // First tick runs the cleanup right away.
        for _ in 0..50 {
            if !old.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!old.exists());

        token.cancel();
        task.await.unwrap();
    }
}
