//! Job routes: submission, status, cancellation, listing, logs and purge.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    routing::{get, post},
};
use chrono::Utc;
use tracing::debug;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    CancelRequest, CancelResponse, JobResponse, ListJobsQuery, ListJobsResponse, LogQuery,
    LogResponse, PurgeRequest, PurgeResponse, ScheduleRequest, ScheduleResponse, StatusQuery,
    StatusResponse,
};
use crate::api::server::AppState;
use crate::database::models::{JobFilter, PurgeFilter};
use crate::database::time::datetime_to_ms;
use crate::domain::{Job, JobState, NewJob};
use crate::utils::fs::read_tail;

/// Longest `wait_secs` honoured by `/status`.
const MAX_WAIT_SECS: u64 = 300;
const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;
const DEFAULT_TAIL_LINES: usize = 100;
const MAX_TAIL_LINES: usize = 10_000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/schedule", post(schedule))
        .route("/status", get(status))
        .route("/cancel", post(cancel))
        .route("/listjobs", get(list_jobs))
        .route("/log", get(job_log))
        .route("/purge", post(purge))
}

fn ok() -> String {
    "ok".to_string()
}

fn required(value: Option<String>, field: &str) -> ApiResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("'{}' is required", field)))
}

async fn schedule(
    State(state): State<AppState>,
    payload: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ApiResult<Json<ScheduleResponse>> {
    let Json(request) = payload?;
    let job = state.scheduler.submit(NewJob::from(request)).await?;

    Ok(Json(ScheduleResponse {
        status: ok(),
        jobid: job.id,
        node_name: state.node_name.clone(),
    }))
}

async fn status(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> ApiResult<Json<StatusResponse>> {
    let Query(query) = query?;
    let id = required(query.id, "id")?;

    let job = match query.wait_secs.filter(|secs| *secs > 0) {
        Some(secs) => {
            let wait = Duration::from_secs(secs.min(MAX_WAIT_SECS));
            debug!(job_id = %id, wait_secs = wait.as_secs(), "Waiting for job completion");
            state.scheduler.await_completion(&id, wait).await?
        }
        None => state.scheduler.status(&id).await?,
    };

    Ok(Json(StatusResponse {
        status: ok(),
        job: JobResponse::from(job),
    }))
}

async fn cancel(
    State(state): State<AppState>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> ApiResult<Json<CancelResponse>> {
    let Json(request) = payload?;
    let id = required(request.id, "id")?;
    let prevstate = state.scheduler.cancel(&id).await?;

    Ok(Json(CancelResponse {
        status: ok(),
        jobid: id,
        prevstate,
    }))
}

async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> ApiResult<Json<ListJobsResponse>> {
    let Query(query) = query?;

    let mut filter = JobFilter::default();
    if let Some(project) = query.project.filter(|p| !p.trim().is_empty()) {
        filter.project = Some(project.trim().to_string());
    }
    if let Some(raw) = query.state.filter(|s| !s.trim().is_empty()) {
        let parsed = JobState::parse(raw.trim())
            .ok_or_else(|| ApiError::bad_request(format!("unknown state '{}'", raw)))?;
        filter.state = Some(parsed);
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let page = state
        .scheduler
        .repository()
        .list_jobs(&filter, query.after, limit)
        .await?;

    let jobs = page
        .jobs
        .into_iter()
        .map(|model| Job::try_from(model).map(JobResponse::from))
        .collect::<crate::Result<Vec<_>>>()?;

    Ok(Json(ListJobsResponse {
        status: ok(),
        jobs,
        next_cursor: page.next_cursor,
    }))
}

async fn job_log(
    State(state): State<AppState>,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> ApiResult<Json<LogResponse>> {
    let Query(query) = query?;
    let id = required(query.id, "id")?;
    let tail = query
        .tail
        .unwrap_or(DEFAULT_TAIL_LINES)
        .clamp(1, MAX_TAIL_LINES);

    let job = state.scheduler.status(&id).await?;
    let lines = match &job.log_path {
        // A job that never started has no log yet.
        None => Vec::new(),
        Some(path) => match read_tail(std::path::Path::new(path), tail).await {
            Ok(text) => text.lines().map(str::to_string).collect(),
            Err(crate::Error::IoPath { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        },
    };

    Ok(Json(LogResponse {
        status: ok(),
        jobid: job.id,
        log_path: job.log_path,
        lines,
    }))
}

async fn purge(
    State(state): State<AppState>,
    payload: Result<Json<PurgeRequest>, JsonRejection>,
) -> ApiResult<Json<PurgeResponse>> {
    let Json(request) = payload?;

    let finished_before = request
        .older_than_days
        .map(|days| datetime_to_ms(Utc::now() - chrono::Duration::days(i64::from(days))));
    let filter = PurgeFilter {
        project: request.project.filter(|p| !p.trim().is_empty()),
        finished_before,
    };

    let purged = state.scheduler.purge(&filter).await?;
    let jobids: Vec<String> = purged.into_iter().map(|job| job.id).collect();

    Ok(Json(PurgeResponse {
        status: ok(),
        purged: jobids.len(),
        jobids,
    }))
}
