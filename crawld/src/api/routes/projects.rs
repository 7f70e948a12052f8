//! Project and daemon overview routes.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::ApiResult;
use crate::api::models::{
    DaemonStatusResponse, ListProjectsResponse, ProjectSummary, sorted_projects,
};
use crate::api::server::AppState;
use crate::database::models::StateCounts;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/listprojects", get(list_projects))
        .route("/daemonstatus", get(daemon_status))
}

/// Projects that have jobs in the store, plus projects with a configured
/// slot override that have not run anything yet.
async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<ListProjectsResponse>> {
    let scheduler = &state.scheduler;
    let config = scheduler.config();

    let mut counts = scheduler.repository().list_projects().await?;
    for project in config.project_slots.keys() {
        counts.entry(project.clone()).or_insert_with(StateCounts::default);
    }

    let projects = sorted_projects(counts, |name, counts| ProjectSummary {
        name: name.to_string(),
        slots: config.slots_for(name),
        running: scheduler.launcher().running_in(name),
        queued: scheduler.queue().len_for(name),
        counts,
    });

    Ok(Json(ListProjectsResponse {
        status: "ok".to_string(),
        projects,
    }))
}

async fn daemon_status(State(state): State<AppState>) -> ApiResult<Json<DaemonStatusResponse>> {
    let scheduler = &state.scheduler;
    let counts = scheduler.repository().count_by_state(None).await?;

    Ok(Json(DaemonStatusResponse {
        status: "ok".to_string(),
        node_name: state.node_name.clone(),
        pending: counts.pending,
        running: counts.running,
        finished: counts.finished,
        failed: counts.failed,
        cancelled: counts.cancelled,
        max_jobs: scheduler.config().max_jobs,
        queue_ceiling: scheduler.config().queue_ceiling,
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}
