//! Health checks for the daemon's components.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::database::DbPool;
use crate::scheduler::Scheduler;

const DATABASE_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Degraded but functional.
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Check duration in milliseconds.
    pub check_duration_ms: Option<u64>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            check_duration_ms: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            check_duration_ms: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            check_duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.check_duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Overall daemon health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub version: String,
    pub uptime_secs: u64,
    /// Memory usage percentage (0-100).
    pub memory_usage: f32,
}

impl SystemHealth {
    pub fn is_ready(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Worst status wins; Degraded only downgrades Healthy.
fn combine(overall: HealthStatus, component: HealthStatus) -> HealthStatus {
    match (overall, component) {
        (_, HealthStatus::Unhealthy) | (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
        (HealthStatus::Healthy, HealthStatus::Degraded) => HealthStatus::Degraded,
        (overall, _) => overall,
    }
}

/// Runs the database, scheduler and disk checks.
pub struct HealthChecker {
    pool: DbPool,
    scheduler: Arc<Scheduler>,
    log_dir: PathBuf,
    start_time: Instant,
    version: String,
    /// Disk usage ratio reported as degraded.
    disk_warning_threshold: f64,
    /// Disk usage ratio reported as unhealthy.
    disk_critical_threshold: f64,
    system: Mutex<System>,
}

impl HealthChecker {
    pub fn new(pool: DbPool, scheduler: Arc<Scheduler>) -> Self {
        let log_dir = scheduler.config().log_dir.clone();
        Self {
            pool,
            scheduler,
            log_dir,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            disk_warning_threshold: 0.80,
            disk_critical_threshold: 0.95,
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub async fn check_all(&self) -> SystemHealth {
        let memory_usage = {
            let mut system = self.system.lock().await;
            system.refresh_memory();
            let total = system.total_memory();
            if total > 0 {
                (system.used_memory() as f64 / total as f64 * 100.0) as f32
            } else {
                0.0
            }
        };

        let checks = [
            self.check_database().await,
            self.check_scheduler().await,
            self.check_log_disk(),
        ];

        let mut status = HealthStatus::Healthy;
        let mut components = HashMap::new();
        for health in checks {
            status = combine(status, health.status);
            components.insert(health.name.clone(), health);
        }

        SystemHealth {
            status,
            components,
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            memory_usage,
        }
    }

    pub async fn check_ready(&self) -> bool {
        self.check_all().await.is_ready()
    }

    pub async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();
        let probe = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.pool);
        let health = match tokio::time::timeout(DATABASE_CHECK_TIMEOUT, probe).await {
            Ok(Ok(_)) => ComponentHealth::healthy("database"),
            Ok(Err(e)) => ComponentHealth::unhealthy("database", e.to_string()),
            Err(_) => ComponentHealth::unhealthy("database", "query timed out"),
        };
        health.with_duration(start.elapsed())
    }

    /// Unhealthy when the loop is not running, degraded when the queue is
    /// close to its ceiling.
    pub async fn check_scheduler(&self) -> ComponentHealth {
        let start = Instant::now();
        if !self.scheduler.is_running() {
            return ComponentHealth::unhealthy("scheduler", "scheduling loop is not running");
        }

        let ceiling = self.scheduler.config().queue_ceiling;
        let health = match self.scheduler.repository().count_active().await {
            Ok(active) if active >= ceiling => ComponentHealth::degraded(
                "scheduler",
                format!("queue full: {} active jobs (ceiling {})", active, ceiling),
            ),
            Ok(active) if active as f64 >= ceiling as f64 * 0.9 => ComponentHealth::degraded(
                "scheduler",
                format!("queue nearly full: {} active jobs (ceiling {})", active, ceiling),
            ),
            Ok(_) => ComponentHealth::healthy("scheduler"),
            Err(e) => ComponentHealth::unhealthy("scheduler", e.to_string()),
        };
        health.with_duration(start.elapsed())
    }

    /// Free space on the file system holding the job logs.
    pub fn check_log_disk(&self) -> ComponentHealth {
        let start = Instant::now();
        let disks = Disks::new_with_refreshed_list();
        let target = std::fs::canonicalize(&self.log_dir).unwrap_or_else(|_| self.log_dir.clone());

        let disk = disks
            .list()
            .iter()
            .filter(|d| target.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        let health = match disk {
            Some(disk) => {
                self.check_disk_space(&target, disk.available_space(), disk.total_space())
            }
            None => {
                debug!(path = %target.display(), "No disk found for log directory");
                ComponentHealth::degraded("disk", "unable to determine disk for log directory")
            }
        };
        health.with_duration(start.elapsed())
    }

    /// Classify disk usage against the warning and critical thresholds.
    pub fn check_disk_space(&self, path: &Path, available: u64, total: u64) -> ComponentHealth {
        if total == 0 {
            return ComponentHealth::unhealthy("disk", "unable to determine disk space");
        }

        let used_ratio = 1.0 - (available as f64 / total as f64);
        let used_pct = used_ratio * 100.0;

        if used_ratio >= self.disk_critical_threshold {
            warn!(path = %path.display(), used_pct, "Disk space critical");
            ComponentHealth::unhealthy(
                "disk",
                format!(
                    "disk space critical: {:.1}% used ({} available)",
                    used_pct,
                    format_bytes(available)
                ),
            )
        } else if used_ratio >= self.disk_warning_threshold {
            warn!(path = %path.display(), used_pct, "Disk space low");
            ComponentHealth::degraded(
                "disk",
                format!(
                    "disk space low: {:.1}% used ({} available)",
                    used_pct,
                    format_bytes(available)
                ),
            )
        } else {
            ComponentHealth::healthy("disk")
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_default() {
        assert_eq!(HealthStatus::default(), HealthStatus::Unknown);
    }

    #[test]
    fn component_with_duration() {
        let health = ComponentHealth::healthy("db").with_duration(Duration::from_millis(100));
        assert_eq!(health.check_duration_ms, Some(100));
        assert!(health.message.is_none());
    }

    #[test]
    fn worst_status_wins() {
        use HealthStatus::*;
        assert_eq!(combine(Healthy, Healthy), Healthy);
        assert_eq!(combine(Healthy, Degraded), Degraded);
        assert_eq!(combine(Degraded, Healthy), Degraded);
        assert_eq!(combine(Degraded, Unhealthy), Unhealthy);
        assert_eq!(combine(Unhealthy, Degraded), Unhealthy);
    }

    #[test]
    fn bytes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
    }
}
