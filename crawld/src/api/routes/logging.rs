//! Runtime log filter routes.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::get,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{LoggingConfigResponse, ModuleInfo, UpdateLogFilterRequest};
use crate::api::server::AppState;
use crate::logging::{LoggingConfig, available_modules};

pub fn router() -> Router<AppState> {
    Router::new().route("/filter", get(get_filter).put(update_filter))
}

fn logging_config(state: &AppState) -> ApiResult<&LoggingConfig> {
    state
        .logging_config
        .as_deref()
        .ok_or_else(|| ApiError::service_unavailable("SERVICE_UNAVAILABLE", "logging is not configured"))
}

fn response(config: &LoggingConfig) -> LoggingConfigResponse {
    LoggingConfigResponse {
        filter: config.get_filter(),
        available_modules: available_modules()
            .into_iter()
            .map(|(name, description)| ModuleInfo {
                name: name.to_string(),
                description: description.to_string(),
            })
            .collect(),
    }
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LoggingConfigResponse>> {
    let config = logging_config(&state)?;
    Ok(Json(response(config)))
}

async fn update_filter(
    State(state): State<AppState>,
    payload: Result<Json<UpdateLogFilterRequest>, JsonRejection>,
) -> ApiResult<Json<LoggingConfigResponse>> {
    let Json(request) = payload?;
    let config = logging_config(&state)?;
    config.set_filter(request.filter.trim())?;
    Ok(Json(response(config)))
}
