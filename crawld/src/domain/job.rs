//! Crawl job entity and its lifecycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::JobDbModel;
use crate::database::time::ms_to_datetime;
use crate::{Error, Result};

/// Longest accepted project, spider or job id.
const MAX_NAME_LEN: usize = 128;

/// Lifecycle state of a crawl job.
///
/// Stored upper-case (`PENDING`), rendered lower-case (`pending`) over HTTP.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse a stored or user-supplied state name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Finished)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// A submitted crawl job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project: String,
    pub spider: String,
    pub args: BTreeMap<String, String>,
    pub priority: i32,
    pub state: JobState,
    /// Submission sequence; strictly increasing in submission order.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
    pub log_path: Option<String>,
    pub pid: Option<u32>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl TryFrom<JobDbModel> for Job {
    type Error = Error;

    fn try_from(model: JobDbModel) -> Result<Self> {
        let state = JobState::parse(&model.status).ok_or_else(|| {
            Error::Database(format!(
                "job {} has unknown status '{}'",
                model.id, model.status
            ))
        })?;
        let args: BTreeMap<String, String> = serde_json::from_str(&model.args)?;

        Ok(Self {
            id: model.id,
            project: model.project,
            spider: model.spider,
            args,
            priority: model.priority as i32,
            state,
            seq: model.seq,
            created_at: ms_to_datetime(model.created_at),
            started_at: model.started_at.map(ms_to_datetime),
            finished_at: model.finished_at.map(ms_to_datetime),
            exit_code: model.exit_code.map(|c| c as i32),
            failure_reason: model.failure_reason,
            log_path: model.log_path,
            pid: model.pid.and_then(|p| u32::try_from(p).ok()),
        })
    }
}

/// A job submission before it is stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewJob {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    pub project: String,
    pub spider: String,
    pub args: BTreeMap<String, String>,
    pub priority: i32,
}

impl NewJob {
    pub fn new(project: impl Into<String>, spider: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            spider: spider.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Check the submission and trim its names.
    ///
    /// Project, spider and job id end up in file system paths, so they are
    /// limited to ASCII letters, digits, `-`, `_` and `.`, and may not start
    /// with a dot.
    pub fn validate(mut self) -> Result<Self> {
        self.project = validate_name("project", &self.project)?;
        self.spider = validate_name("spider", &self.spider)?;
        if let Some(id) = self.id.take() {
            self.id = Some(validate_name("jobid", &id)?);
        }
        for key in self.args.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(Error::validation(format!(
                    "invalid argument name '{}'",
                    key
                )));
            }
        }
        Ok(self)
    }
}

fn validate_name(field: &str, raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(Error::validation(format!("'{}' is required", field)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "'{}' is longer than {} characters",
            field, MAX_NAME_LEN
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if name.starts_with('.') || !name.chars().all(allowed) {
        return Err(Error::validation(format!(
            "'{}' contains invalid characters: '{}'",
            field, name
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    #[rstest]
    #[case(JobState::Pending, JobState::Running, true)]
    #[case(JobState::Pending, JobState::Cancelled, true)]
    #[case(JobState::Pending, JobState::Failed, true)]
    #[case(JobState::Running, JobState::Finished, true)]
    #[case(JobState::Running, JobState::Failed, true)]
    #[case(JobState::Running, JobState::Cancelled, true)]
    #[case(JobState::Pending, JobState::Finished, false)]
    #[case(JobState::Running, JobState::Pending, false)]
    #[case(JobState::Finished, JobState::Running, false)]
    #[case(JobState::Cancelled, JobState::Pending, false)]
    fn transitions(#[case] from: JobState, #[case] to: JobState, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for from in JobState::iter().filter(JobState::is_terminal) {
            for to in JobState::iter() {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn state_names() {
        for state in JobState::iter() {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
            assert_eq!(state.to_string(), state.as_str());
        }
        assert_eq!(JobState::parse("running"), Some(JobState::Running));
        assert_eq!(JobState::parse("bogus"), None);
        assert_eq!(
            serde_json::to_string(&JobState::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn validation_rejects_blank_and_unsafe_names() {
        assert!(NewJob::new("", "s").validate().is_err());
        assert!(NewJob::new("p", "   ").validate().is_err());
        assert!(NewJob::new("../etc", "s").validate().is_err());
        assert!(NewJob::new("p", "s").with_id("a/b").validate().is_err());
        assert!(NewJob::new("p", "s").with_arg("a=b", "c").validate().is_err());

        let ok = NewJob::new(" news ", "front_page").validate().unwrap();
        assert_eq!(ok.project, "news");
    }
}
