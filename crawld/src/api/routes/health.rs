//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::error::ApiResult;
use crate::api::models::{ComponentHealth, HealthResponse};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let uptime = state.start_time.elapsed().as_secs();

    let Some(health_checker) = &state.health_checker else {
        // Only the scheduler is wired up; report on it alone.
        let status = if state.scheduler.is_running() {
            "healthy"
        } else {
            "unhealthy"
        };
        return Ok(Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: uptime,
            components: vec![],
        }));
    };

    let system_health = health_checker.check_all().await;
    let mut components: Vec<ComponentHealth> = system_health
        .components
        .into_iter()
        .map(|(name, health)| ComponentHealth {
            name,
            status: health.status.to_string(),
            message: health.message,
        })
        .collect();
    components.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(HealthResponse {
        status: system_health.status.to_string(),
        version: system_health.version,
        uptime_secs: uptime,
        components,
    }))
}

/// 200 when healthy or degraded, 503 otherwise.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let ready = match &state.health_checker {
        Some(health_checker) => health_checker.check_ready().await,
        None => state.scheduler.is_running(),
    };
    if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            uptime_secs: 3600,
            components: vec![ComponentHealth {
                name: "database".to_string(),
                status: "healthy".to_string(),
                message: None,
            }],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("database"));
    }
}
