//! Crawl job database models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use strum::IntoEnumIterator;

use crate::database::time::now_ms;
use crate::domain::{JobState, NewJob};
use crate::Result;

/// One row of `crawl_job`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub seq: i64,
    pub id: String,
    pub project: String,
    pub spider: String,
    /// JSON object of spider arguments.
    pub args: String,
    pub priority: i64,
    /// PENDING, RUNNING, FINISHED, FAILED, CANCELLED
    pub status: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub exit_code: Option<i64>,
    pub failure_reason: Option<String>,
    pub log_path: Option<String>,
    pub pid: Option<i64>,
    pub updated_at: i64,
}

impl JobDbModel {
    /// Build a Pending row from a validated submission.
    ///
    /// `seq` is assigned by the database on insert.
    pub fn pending(job: &NewJob) -> Result<Self> {
        let now = now_ms();
        Ok(Self {
            seq: 0,
            id: job
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            project: job.project.clone(),
            spider: job.spider.clone(),
            args: serde_json::to_string(&job.args)?,
            priority: i64::from(job.priority),
            status: JobState::Pending.as_str().to_string(),
            created_at: now,
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_reason: None,
            log_path: None,
            pid: None,
            updated_at: now,
        })
    }

    pub fn state(&self) -> Option<JobState> {
        JobState::parse(&self.status)
    }
}

/// A compare-and-set state change.
///
/// Applied only while the stored state still equals `from`. `None` fields
/// leave the stored column untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    pub from: JobState,
    pub to: JobState,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub log_path: Option<String>,
    pub pid: Option<u32>,
}

impl JobPatch {
    pub fn transition(from: JobState, to: JobState) -> Self {
        Self {
            from,
            to,
            started_at: None,
            finished_at: None,
            exit_code: None,
            failure_reason: None,
            log_path: None,
            pid: None,
        }
    }

    /// Pending -> Running, stamped now.
    pub fn started(pid: Option<u32>, log_path: impl Into<String>) -> Self {
        Self {
            started_at: Some(now_ms()),
            pid,
            log_path: Some(log_path.into()),
            ..Self::transition(JobState::Pending, JobState::Running)
        }
    }

    /// `from` -> terminal `to`, stamped now.
    pub fn finished(from: JobState, to: JobState) -> Self {
        Self {
            finished_at: Some(now_ms()),
            ..Self::transition(from, to)
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

/// Filter for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub project: Option<String>,
    pub state: Option<JobState>,
}

impl JobFilter {
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: Some(project.into()),
            state: None,
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }
}

/// One page of a keyset-paginated listing.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<JobDbModel>,
    /// `seq` to pass as `after` for the next page; `None` on the last page.
    pub next_cursor: Option<i64>,
}

/// Which terminal jobs a purge removes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeFilter {
    pub project: Option<String>,
    /// Only jobs that finished strictly before this instant (epoch ms).
    pub finished_before: Option<i64>,
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: u64,
    pub running: u64,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Running => self.running,
            JobState::Finished => self.finished,
            JobState::Failed => self.failed,
            JobState::Cancelled => self.cancelled,
        }
    }

    pub fn add(&mut self, state: JobState, n: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Finished => &mut self.finished,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn active(&self) -> u64 {
        self.pending + self.running
    }

    pub fn total(&self) -> u64 {
        JobState::iter().map(|s| self.get(s)).sum()
    }
}

/// Per-project job counts, keyed by project name.
pub type ProjectCounts = HashMap<String, StateCounts>;
