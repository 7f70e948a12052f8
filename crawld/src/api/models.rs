//! API request and response models.
//!
//! Field names follow the scrapyd-style wire format clients already speak
//! (`jobid`, `node_name`, `listjobs`), so some differ from the domain names.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::StateCounts;
use crate::domain::{Job, JobState, NewJob};

// ============================================================================
// Jobs
// ============================================================================

/// Body of `POST /schedule`.
///
/// `project` and `spider` default to empty so that a missing field is
/// reported by validation with the field's name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub spider: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    /// Caller-chosen job id; generated when absent.
    pub jobid: Option<String>,
}

impl From<ScheduleRequest> for NewJob {
    fn from(req: ScheduleRequest) -> Self {
        NewJob {
            id: req.jobid,
            project: req.project,
            spider: req.spider,
            args: req.args,
            priority: req.priority,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub status: String,
    pub jobid: String,
    pub node_name: String,
}

/// Body of `POST /cancel`. `job` is accepted as an alias of `id`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(alias = "job")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: String,
    pub jobid: String,
    /// State the job was in when the request arrived.
    pub prevstate: JobState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    pub id: Option<String>,
    /// Long-poll up to this many seconds for the job to finish.
    pub wait_secs: Option<u64>,
}

/// Full view of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub project: String,
    pub spider: String,
    pub args: BTreeMap<String, String>,
    pub priority: i32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub log_path: Option<String>,
    pub pid: Option<u32>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            project: job.project,
            spider: job.spider,
            args: job.args,
            priority: job.priority,
            state: job.state,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            exit_code: job.exit_code,
            failure_reason: job.failure_reason,
            log_path: job.log_path,
            pid: job.pid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub job: JobResponse,
}

/// Query of `GET /listjobs`.
///
/// `after` is the opaque cursor returned as `next_cursor` by the previous
/// page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListJobsQuery {
    pub project: Option<String>,
    pub state: Option<String>,
    pub after: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub status: String,
    pub jobs: Vec<JobResponse>,
    pub next_cursor: Option<i64>,
}

/// Query of `GET /log`.
#[derive(Debug, Clone, Deserialize)]
pub struct LogQuery {
    pub id: Option<String>,
    /// Number of trailing lines.
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogResponse {
    pub status: String,
    pub jobid: String,
    pub log_path: Option<String>,
    pub lines: Vec<String>,
}

/// Body of `POST /purge`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PurgeRequest {
    pub project: Option<String>,
    /// Only purge jobs that finished more than this many days ago.
    pub older_than_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub status: String,
    pub purged: usize,
    pub jobids: Vec<String>,
}

// ============================================================================
// Projects and daemon
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub name: String,
    pub slots: usize,
    /// Jobs currently holding a slot.
    pub running: usize,
    /// Jobs waiting in the in-memory queue.
    pub queued: usize,
    pub counts: StateCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListProjectsResponse {
    pub status: String,
    pub projects: Vec<ProjectSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatusResponse {
    pub status: String,
    pub node_name: String,
    pub pending: u64,
    pub running: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub max_jobs: usize,
    pub queue_ceiling: u64,
    pub uptime_secs: u64,
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfigResponse {
    pub filter: String,
    pub available_modules: Vec<ModuleInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}

/// Sort projects by name for stable listings.
pub fn sorted_projects(
    counts: HashMap<String, StateCounts>,
    mut describe: impl FnMut(&str, StateCounts) -> ProjectSummary,
) -> Vec<ProjectSummary> {
    let mut projects: Vec<ProjectSummary> = counts
        .into_iter()
        .map(|(name, counts)| describe(&name, counts))
        .collect();
    projects.sort_by(|a, b| a.name.cmp(&b.name));
    projects
}
