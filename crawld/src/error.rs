//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Job id already exists: {0}")]
    DuplicateId(String),

    #[error("Queue is full: {active} active jobs (ceiling {ceiling})")]
    QueueFull { active: u64, ceiling: u64 },

    #[error("Failed to launch job {job_id}: {reason}")]
    LaunchFailure { job_id: String, reason: String },

    #[error("Job {job_id} failed: {reason}")]
    ExecutionFailure { job_id: String, reason: String },

    #[error("Job {job_id} did not exit within {grace_ms}ms of cancellation")]
    CancellationTimeout { job_id: String, grace_ms: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} '{}': {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn launch_failure(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LaunchFailure {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind, used in API error bodies and job failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::ApiError(_) => "BAD_REQUEST",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DuplicateId(_) => "DUPLICATE_ID",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::LaunchFailure { .. } => "LAUNCH_FAILURE",
            Self::ExecutionFailure { .. } => "EXECUTION_FAILURE",
            Self::CancellationTimeout { .. } => "CANCELLATION_TIMEOUT",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            _ => "INTERNAL_ERROR",
        }
    }
}
