//! API route modules, organized by resource.

pub mod health;
pub mod jobs;
pub mod logging;
pub mod projects;

use axum::Router;

use crate::api::server::AppState;

/// Create the API router with all routes.
///
/// Job and project endpoints sit at the root so existing scheduling clients
/// can talk to the daemon unchanged.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(jobs::router())
        .merge(projects::router())
        .nest("/logging", logging::router())
        .nest("/health", health::router())
        .with_state(state)
}
