//! Daemon configuration.
//!
//! Everything is read from the environment (after `.env` is loaded by `main`),
//! falling back to defaults that suit a single-node deployment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `CRAWLD_BIND_ADDRESS` | `0.0.0.0` |
//! | `CRAWLD_PORT` | `6800` |
//! | `DATABASE_URL` | `sqlite:crawld.db?mode=rwc` |
//! | `CRAWLD_LOG_DIR` | `logs` |
//! | `CRAWLD_MAX_JOBS` | 4 per CPU core |
//! | `CRAWLD_MAX_JOBS_PER_PROJECT` | `4` |
//! | `CRAWLD_PROJECT_SLOTS` | empty, e.g. `news=1,shops=8` |
//! | `CRAWLD_QUEUE_CEILING` | `1000` |
//! | `CRAWLD_GRACE_PERIOD_SECS` | `30` |
//! | `CRAWLD_JOB_TIMEOUT_SECS` | `7200` (`0` disables) |
//! | `CRAWLD_POLL_INTERVAL_MS` | `1000` |
//! | `CRAWLD_RUNNER` | `scrapy` |
//! | `CRAWLD_RUNNER_ARGS` | empty, whitespace separated |
//! | `CRAWLD_PROJECTS_DIR` | unset |
//! | `CRAWLD_NODE_NAME` | host name |

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::server::ApiServerConfig;
use crate::{Error, Result};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 6800;

const DEFAULT_DATABASE_URL: &str = "sqlite:crawld.db?mode=rwc";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_JOBS_PER_CPU: usize = 4;
const DEFAULT_MAX_JOBS_PER_PROJECT: usize = 4;
const DEFAULT_QUEUE_CEILING: u64 = 1000;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 7200;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_RUNNER: &str = "scrapy";

/// How crawl processes are started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Executable to run, e.g. `scrapy`.
    pub program: String,
    /// Arguments placed before `crawl <spider>`.
    pub args: Vec<String>,
    /// Root directory holding one sub-directory per project.
    /// Used as the working directory when present.
    pub projects_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_RUNNER.to_string(),
            args: Vec::new(),
            projects_dir: None,
        }
    }
}

/// Admission and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum jobs running at once across all projects.
    pub max_jobs: usize,
    /// Default maximum jobs running at once within one project.
    pub max_jobs_per_project: usize,
    /// Per-project overrides of `max_jobs_per_project`.
    pub project_slots: HashMap<String, usize>,
    /// Pending + running jobs allowed before `submit` answers `QueueFull`.
    pub queue_ceiling: u64,
    /// Time a cancelled job gets to exit after SIGTERM.
    pub grace_period: Duration,
    /// Maximum runtime of a single job.
    pub job_timeout: Option<Duration>,
    /// Scheduling tick.
    pub poll_interval: Duration,
    /// Directory receiving one log file per job.
    pub log_dir: PathBuf,
    pub runner: RunnerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            max_jobs_per_project: DEFAULT_MAX_JOBS_PER_PROJECT,
            project_slots: HashMap::new(),
            queue_ceiling: DEFAULT_QUEUE_CEILING,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            job_timeout: Some(Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS)),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            runner: RunnerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Slot maximum for a project.
    pub fn slots_for(&self, project: &str) -> usize {
        self.project_slots
            .get(project)
            .copied()
            .unwrap_or(self.max_jobs_per_project)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_jobs == 0 {
            return Err(Error::config("max_jobs must be at least 1"));
        }
        if self.max_jobs_per_project == 0 {
            return Err(Error::config("max_jobs_per_project must be at least 1"));
        }
        if let Some((project, _)) = self.project_slots.iter().find(|(_, slots)| **slots == 0) {
            return Err(Error::config(format!(
                "project '{}' must have at least 1 slot",
                project
            )));
        }
        if self.queue_ceiling == 0 {
            return Err(Error::config("queue_ceiling must be at least 1"));
        }
        if self.runner.program.trim().is_empty() {
            return Err(Error::config("runner program must not be empty"));
        }
        Ok(())
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub api: ApiServerConfig,
    pub scheduler: SchedulerConfig,
    pub database_url: String,
    /// Name reported by `/daemonstatus`.
    pub node_name: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api: ApiServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            node_name: default_node_name(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from process environment variables.
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Blank values are treated as unset. Values that are set but unparsable
    /// are reported instead of silently replaced by defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(bind_address) = get("CRAWLD_BIND_ADDRESS") {
            config.api.bind_address = bind_address.trim().to_string();
        }
        if let Some(port) = get("CRAWLD_PORT") {
            config.api.port = parse_value("CRAWLD_PORT", &port)?;
        }
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(name) = get("CRAWLD_NODE_NAME") {
            config.node_name = name;
        }

        let scheduler = &mut config.scheduler;
        if let Some(dir) = get("CRAWLD_LOG_DIR") {
            scheduler.log_dir = PathBuf::from(dir);
        }
        if let Some(v) = get("CRAWLD_MAX_JOBS") {
            scheduler.max_jobs = parse_value("CRAWLD_MAX_JOBS", &v)?;
        }
        if let Some(v) = get("CRAWLD_MAX_JOBS_PER_PROJECT") {
            scheduler.max_jobs_per_project = parse_value("CRAWLD_MAX_JOBS_PER_PROJECT", &v)?;
        }
        if let Some(v) = get("CRAWLD_PROJECT_SLOTS") {
            scheduler.project_slots = parse_project_slots(&v)?;
        }
        if let Some(v) = get("CRAWLD_QUEUE_CEILING") {
            scheduler.queue_ceiling = parse_value("CRAWLD_QUEUE_CEILING", &v)?;
        }
        if let Some(v) = get("CRAWLD_GRACE_PERIOD_SECS") {
            scheduler.grace_period =
                Duration::from_secs(parse_value("CRAWLD_GRACE_PERIOD_SECS", &v)?);
        }
        if let Some(v) = get("CRAWLD_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_value("CRAWLD_JOB_TIMEOUT_SECS", &v)?;
            scheduler.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(v) = get("CRAWLD_POLL_INTERVAL_MS") {
            let ms: u64 = parse_value("CRAWLD_POLL_INTERVAL_MS", &v)?;
            scheduler.poll_interval = Duration::from_millis(ms.max(10));
        }
        if let Some(program) = get("CRAWLD_RUNNER") {
            scheduler.runner.program = program.trim().to_string();
        }
        if let Some(args) = get("CRAWLD_RUNNER_ARGS") {
            scheduler.runner.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(dir) = get("CRAWLD_PROJECTS_DIR") {
            scheduler.runner.projects_dir = Some(PathBuf::from(dir));
        }

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| Error::config(format!("{}: invalid value '{}': {}", key, raw, e)))
}

/// Parse `name=slots` pairs separated by commas.
pub fn parse_project_slots(raw: &str) -> Result<HashMap<String, usize>> {
    let mut slots = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(Error::config(format!(
                "CRAWLD_PROJECT_SLOTS: expected name=slots, got '{}'",
                pair
            )));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::config("CRAWLD_PROJECT_SLOTS: empty project name"));
        }
        slots.insert(
            name.to_string(),
            parse_value("CRAWLD_PROJECT_SLOTS", value)?,
        );
    }
    Ok(slots)
}

fn default_max_jobs() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores * DEFAULT_JOBS_PER_CPU
}

fn default_node_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "crawld".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_listen_on_6800() {
        let config = DaemonConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.api.port, DEFAULT_PORT);
        assert_eq!(config.api.bind_address, "0.0.0.0");
        assert!(config.scheduler.max_jobs >= DEFAULT_JOBS_PER_CPU);
        assert_eq!(config.scheduler.queue_ceiling, 1000);
        assert_eq!(config.scheduler.grace_period, Duration::from_secs(30));
        assert_eq!(config.scheduler.job_timeout, Some(Duration::from_secs(7200)));
    }

    #[test]
    fn env_overrides_are_applied() {
        let pairs = [
            ("CRAWLD_PORT", "7000"),
            ("CRAWLD_MAX_JOBS", "3"),
            ("CRAWLD_MAX_JOBS_PER_PROJECT", "2"),
            ("CRAWLD_PROJECT_SLOTS", "news=1, shops=5"),
            ("CRAWLD_QUEUE_CEILING", "10"),
            ("CRAWLD_JOB_TIMEOUT_SECS", "0"),
            ("CRAWLD_RUNNER_ARGS", "-m scrapy"),
            ("CRAWLD_LOG_DIR", "  "),
        ];
        let config = DaemonConfig::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.api.port, 7000);
        assert_eq!(config.scheduler.max_jobs, 3);
        assert_eq!(config.scheduler.slots_for("news"), 1);
        assert_eq!(config.scheduler.slots_for("shops"), 5);
        assert_eq!(config.scheduler.slots_for("other"), 2);
        assert_eq!(config.scheduler.queue_ceiling, 10);
        assert_eq!(config.scheduler.job_timeout, None);
        assert_eq!(config.scheduler.runner.args, vec!["-m", "scrapy"]);
        assert_eq!(config.scheduler.log_dir, PathBuf::from("logs"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let pairs = [("CRAWLD_PORT", "not-a-port")];
        let err = DaemonConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("CRAWLD_PORT"));

        let pairs = [("CRAWLD_MAX_JOBS", "0")];
        assert!(DaemonConfig::from_lookup(lookup_from(&pairs)).is_err());

        let pairs = [("CRAWLD_PROJECT_SLOTS", "news")];
        assert!(DaemonConfig::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn project_slots_parse_ignores_empty_pairs() {
        let slots = parse_project_slots("a=1,,b=2,").unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots["b"], 2);
    }
}
