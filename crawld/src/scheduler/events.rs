//! Messages flowing from the launcher to the tracker, and from the tracker
//! to observers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use process_utils::ExitKind;
use serde::Serialize;

use crate::Error;
use crate::database::models::JobPatch;
use crate::database::time::now_ms;
use crate::domain::JobState;

/// How a job execution ended, as observed by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The process exited on its own.
    Exited(ExitKind),
    /// Killed after exceeding the configured maximum runtime.
    TimedOut,
    /// Exited within the grace period after SIGTERM.
    Cancelled(ExitKind),
    /// Ignored SIGTERM for the whole grace period and was killed.
    CancelTimeout { grace: Duration },
    /// Cancelled after admission but before a process existed.
    CancelledBeforeLaunch,
    /// No process could be started.
    LaunchFailed(String),
    /// The process was started but could not be reaped.
    WaitFailed(String),
}

/// A finished execution, ready to be written to the store.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub job_id: String,
    pub project: String,
    pub outcome: ExecutionOutcome,
    /// Tail of the job log, attached to non-zero exits.
    pub log_tail: Option<String>,
    pub finished_at: i64,
}

impl CompletionEvent {
    pub fn new(job_id: impl Into<String>, project: impl Into<String>, outcome: ExecutionOutcome) -> Self {
        Self {
            job_id: job_id.into(),
            project: project.into(),
            outcome,
            log_tail: None,
            finished_at: now_ms(),
        }
    }

    pub fn with_log_tail(mut self, tail: impl Into<String>) -> Self {
        let tail = tail.into();
        self.log_tail = (!tail.trim().is_empty()).then_some(tail);
        self
    }

    /// State the job is in while the outcome is being recorded.
    pub fn from_state(&self) -> JobState {
        match self.outcome {
            ExecutionOutcome::CancelledBeforeLaunch | ExecutionOutcome::LaunchFailed(_) => {
                JobState::Pending
            }
            _ => JobState::Running,
        }
    }

    /// Terminal state this outcome maps to.
    pub fn to_state(&self) -> JobState {
        match &self.outcome {
            ExecutionOutcome::Exited(kind) if kind.is_success() => JobState::Finished,
            ExecutionOutcome::Cancelled(_) | ExecutionOutcome::CancelledBeforeLaunch => {
                JobState::Cancelled
            }
            _ => JobState::Failed,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.outcome {
            ExecutionOutcome::Exited(kind) | ExecutionOutcome::Cancelled(kind) => kind.exit_code(),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        let reason = match &self.outcome {
            ExecutionOutcome::Exited(kind) if kind.is_success() => return None,
            ExecutionOutcome::Cancelled(_) | ExecutionOutcome::CancelledBeforeLaunch => {
                return None;
            }
            ExecutionOutcome::Exited(kind @ ExitKind::Code(_)) => match &self.log_tail {
                Some(tail) => format!("{}: {}", kind, tail),
                None => kind.to_string(),
            },
            ExecutionOutcome::Exited(kind) => kind.to_string(),
            ExecutionOutcome::TimedOut => "timeout".to_string(),
            ExecutionOutcome::CancelTimeout { grace } => Error::CancellationTimeout {
                job_id: self.job_id.clone(),
                grace_ms: u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            }
            .to_string(),
            ExecutionOutcome::LaunchFailed(reason) => {
                Error::launch_failure(&self.job_id, reason).to_string()
            }
            ExecutionOutcome::WaitFailed(reason) => Error::ExecutionFailure {
                job_id: self.job_id.clone(),
                reason: reason.clone(),
            }
            .to_string(),
        };
        Some(reason)
    }

    /// The conditional store update recording this outcome.
    pub fn patch(&self) -> JobPatch {
        let mut patch = JobPatch::transition(self.from_state(), self.to_state())
            .with_exit_code(self.exit_code());
        patch.finished_at = Some(self.finished_at);
        patch.failure_reason = self.failure_reason();
        patch
    }
}

/// Launcher -> tracker channel payload.
#[derive(Debug, Clone)]
pub enum LauncherEvent {
    /// The job's process is running and the store says Running.
    Started {
        job_id: String,
        project: String,
        pid: Option<u32>,
    },
    Completed(CompletionEvent),
    /// The launcher gave up on an admitted job without changing its state,
    /// e.g. because it was cancelled while still Pending.
    Abandoned { job_id: String, project: String },
}

impl LauncherEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Started { job_id, .. } | Self::Abandoned { job_id, .. } => job_id,
            Self::Completed(event) => &event.job_id,
        }
    }
}

/// Broadcast to observers whenever a job changes state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub project: String,
    pub state: JobState,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, project: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            project: project.into(),
            state,
            at: Utc::now(),
        }
    }
}
