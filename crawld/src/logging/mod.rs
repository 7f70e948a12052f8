//! Logging setup with a reloadable filter and daily rolling files.
//!
//! - Runtime filter changes via `tracing_subscriber::reload`
//! - Daemon log at `<log_dir>/crawld.log.YYYY-MM-DD`, pruned after 7 days
//! - Local timezone timestamps
//!
//! Job output is not written through tracing; each crawl process writes its
//! own file below the same directory.

use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Subscriber, debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::utils::fs;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "crawld=info,process_utils=info,sqlx=warn,tower_http=info";

const LOG_FILE_PREFIX: &str = "crawld.log";

const LOG_RETENTION_DAYS: i64 = 7;

/// Formats timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle on the live logging configuration.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
    /// Keeps the filter layer alive when it is not installed globally.
    _detached: Option<Box<dyn Subscriber + Send + Sync>>,
}

impl LoggingConfig {
    /// A configuration whose filter is not attached to the global
    /// subscriber. Filter changes are validated and remembered but do not
    /// affect any output; used when logging is owned by an embedding
    /// application, and in tests.
    pub fn detached(log_dir: impl Into<PathBuf>, directive: &str) -> Result<Arc<Self>> {
        let filter = parse_filter(directive)?;
        let (layer, handle) = reload::Layer::new(filter);
        let subscriber = tracing_subscriber::registry().with(layer);
        Ok(Arc::new(Self {
            handle,
            log_dir: log_dir.into(),
            _detached: Some(Box::new(subscriber)),
        }))
    }

    /// Current filter directive.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter, e.g. `crawld=debug,sqlx=warn`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = parse_filter(directive)?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Delete daemon log files older than the retention period, once a day.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);

            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                    warn!(error = %e, "Failed to clean up old logs");
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {}
                }
            }
        });
    }
}

fn parse_filter(directive: &str) -> Result<EnvFilter> {
    if directive.trim().is_empty() {
        return Err(Error::validation("filter directive must not be empty"));
    }
    EnvFilter::try_new(directive)
        .map_err(|e| Error::validation(format!("Invalid filter directive: {}", e)))
}

/// Delete `crawld.log.YYYY-MM-DD` files older than `retention_days`.
///
/// Returns the number of files deleted. Job logs are never touched.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();
    let prefix = format!("{}.", LOG_FILE_PREFIX);

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete old log file")
                }
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Install the global subscriber: console plus daily rolling file.
///
/// `RUST_LOG` overrides the default filter. Keep the returned guard alive
/// for the lifetime of the process or buffered file output is lost.
pub fn init_logging(log_dir: &Path) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    fs::ensure_dir_all_sync_with_op("creating log directory", log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    let config = Arc::new(LoggingConfig {
        handle: filter_handle,
        log_dir: log_dir.to_path_buf(),
        _detached: None,
    });

    Ok((config, guard))
}

/// Log targets worth knowing about when adjusting the filter.
pub fn available_modules() -> Vec<(&'static str, &'static str)> {
    vec![
        ("crawld", "Daemon"),
        ("crawld::scheduler", "Queueing, process launching and status tracking"),
        ("crawld::api", "HTTP API"),
        ("process_utils", "Child process helpers"),
        ("sqlx", "Database queries"),
        ("tower_http", "HTTP middleware"),
    ]
}
