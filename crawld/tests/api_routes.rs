//! HTTP API tests against the real router.

#![cfg(unix)]

mod common;

use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use crawld::api::{ApiServer, ApiServerConfig, AppState};
use crawld::logging::LoggingConfig;

use common::{TestDaemon, start_daemon};

async fn app(configure: impl FnOnce(&mut crawld::config::SchedulerConfig)) -> (TestDaemon, Router) {
    let daemon = start_daemon(configure).await;
    let logging = LoggingConfig::detached(daemon.dir.path(), "crawld=info").unwrap();
    let state = AppState::new(daemon.scheduler.clone(), "test-node").with_logging_config(logging);
    let router = ApiServer::new(ApiServerConfig::default(), state).build_router();
    (daemon, router)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn schedule(router: &Router, project: &str, spider: &str) -> String {
    let (status, body) = send(
        router,
        Method::POST,
        "/schedule",
        Some(json!({ "project": project, "spider": spider })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["jobid"].as_str().unwrap().to_string()
}

async fn wait_finished(router: &Router, id: &str) -> Value {
    let (status, body) = send(router, Method::GET, &format!("/status?id={id}&wait_secs=10"), None).await;
    assert_eq!(status, StatusCode::OK);
    body["job"].clone()
}

#[tokio::test]
async fn schedule_then_status() {
    let (daemon, router) = app(|_| {}).await;

    let (status, body) = send(
        &router,
        Method::POST,
        "/schedule",
        Some(json!({
            "project": "news",
            "spider": "ok",
            "args": { "depth": "2" },
            "priority": 5,
            "jobid": "front-page-1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["jobid"], "front-page-1");
    assert_eq!(body["node_name"], "test-node");

    let job = wait_finished(&router, "front-page-1").await;
    assert_eq!(job["state"], "finished");
    assert_eq!(job["project"], "news");
    assert_eq!(job["args"]["depth"], "2");
    assert_eq!(job["priority"], 5);
    assert_eq!(job["exit_code"], 0);
    assert!(job["started_at"].is_string());
    assert!(job["finished_at"].is_string());

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn schedule_validation_errors() {
    let (daemon, router) = app(|_| {}).await;

    let (status, body) = send(&router, Method::POST, "/schedule", Some(json!({ "spider": "ok" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(body["message"].as_str().unwrap().contains("project"));

    let (status, _) = send(
        &router,
        Method::POST,
        "/schedule",
        Some(json!({ "project": "  ", "spider": "ok" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &router,
        Method::POST,
        "/schedule",
        Some(json!({ "project": "../etc", "spider": "ok" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    // Malformed JSON is a bad request too, with the same error shape.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/schedule")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn duplicate_job_id_conflicts() {
    let (daemon, router) = app(|_| {}).await;
    let body = json!({ "project": "p", "spider": "ok", "jobid": "same" });

    let (status, _) = send(&router, Method::POST, "/schedule", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&router, Method::POST, "/schedule", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DUPLICATE_ID");

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn queue_full_is_503() {
    let (daemon, router) = app(|c| {
        c.queue_ceiling = 1;
    })
    .await;

    schedule(&router, "p", "slow").await;
    let (status, body) = send(
        &router,
        Method::POST,
        "/schedule",
        Some(json!({ "project": "p", "spider": "slow" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "QUEUE_FULL");

    let (_, listing) = send(&router, Method::GET, "/listjobs?project=p", None).await;
    assert_eq!(listing["jobs"].as_array().unwrap().len(), 1);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn status_of_unknown_job_is_404() {
    let (daemon, router) = app(|_| {}).await;

    let (status, body) = send(&router, Method::GET, "/status?id=missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(&router, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn cancel_running_and_terminal_jobs() {
    let (daemon, router) = app(|_| {}).await;

    let id = schedule(&router, "p", "slow").await;
    common::wait_for_state(
        &daemon.scheduler,
        &id,
        crawld::domain::JobState::Running,
        Duration::from_secs(5),
    )
    .await;

    let (status, body) = send(&router, Method::POST, "/cancel", Some(json!({ "job": id }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["prevstate"], "running");

    let job = wait_finished(&router, &id).await;
    assert_eq!(job["state"], "cancelled");

    let (status, body) = send(&router, Method::POST, "/cancel", Some(json!({ "id": id }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE_TRANSITION");

    let (status, _) = send(&router, Method::POST, "/cancel", Some(json!({ "id": "nope" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, Method::POST, "/cancel", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn listjobs_pages_and_filters() {
    let (daemon, router) = app(|_| {}).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(schedule(&router, "p", "ok").await);
    }
    schedule(&router, "other", "ok").await;
    for id in &ids {
        wait_finished(&router, id).await;
    }

    let (status, first) = send(&router, Method::GET, "/listjobs?project=p&limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    let page: Vec<&str> = first["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["id"].as_str().unwrap())
        .collect();
    assert_eq!(page, [ids[0].as_str(), ids[1].as_str()]);

    let cursor = first["next_cursor"].as_i64().unwrap();
    let (_, second) = send(
        &router,
        Method::GET,
        &format!("/listjobs?project=p&limit=2&after={cursor}"),
        None,
    )
    .await;
    let rest = second["jobs"].as_array().unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0]["id"], ids[2].as_str());
    assert!(second["next_cursor"].is_null());

    let (_, finished) = send(&router, Method::GET, "/listjobs?project=p&state=FINISHED", None).await;
    assert_eq!(finished["jobs"].as_array().unwrap().len(), 3);

    let (status, _) = send(&router, Method::GET, "/listjobs?state=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn projects_and_daemon_status() {
    let (daemon, router) = app(|c| {
        c.project_slots.insert("reserved".to_string(), 3);
    })
    .await;

    let id = schedule(&router, "news", "fail").await;
    wait_finished(&router, &id).await;

    let (status, body) = send(&router, Method::GET, "/listprojects", None).await;
    assert_eq!(status, StatusCode::OK);
    let projects = body["projects"].as_array().unwrap();
    let names: Vec<&str> = projects.iter().map(|p| p["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["news", "reserved"]);
    assert_eq!(projects[0]["counts"]["failed"], 1);
    assert_eq!(projects[1]["slots"], 3);

    let (status, body) = send(&router, Method::GET, "/daemonstatus", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node_name"], "test-node");
    assert_eq!(body["failed"], 1);
    assert_eq!(body["pending"], 0);
    assert_eq!(body["max_jobs"], 8);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn log_tail_and_purge() {
    let (daemon, router) = app(|_| {}).await;

    let id = schedule(&router, "news", "ok").await;
    let job = wait_finished(&router, &id).await;
    let log_path = job["log_path"].as_str().unwrap().to_string();

    let (status, body) = send(&router, Method::GET, &format!("/log?id={id}&tail=5"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lines"][0], "crawled news/ok");

    let (status, body) = send(&router, Method::POST, "/purge", Some(json!({ "project": "news" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["purged"], 1);
    assert_eq!(body["jobids"][0], id.as_str());
    assert!(!std::path::Path::new(&log_path).exists());

    let (status, _) = send(&router, Method::GET, &format!("/status?id={id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn log_filter_can_be_changed() {
    let (daemon, router) = app(|_| {}).await;

    let (status, body) = send(&router, Method::GET, "/logging/filter", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filter"], "crawld=info");
    assert!(!body["available_modules"].as_array().unwrap().is_empty());

    let (status, body) = send(
        &router,
        Method::PUT,
        "/logging/filter",
        Some(json!({ "filter": "crawld=debug" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filter"], "crawld=debug");

    let (status, _) = send(
        &router,
        Method::PUT,
        "/logging/filter",
        Some(json!({ "filter": "crawld=[" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    daemon.scheduler.shutdown().await;
}

#[tokio::test]
async fn health_endpoints() {
    let (daemon, router) = app(|_| {}).await;

    let (status, body) = send(&router, Method::GET, "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");

    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let request = Request::builder().uri("/health/ready").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    daemon.scheduler.shutdown().await;
    let request = Request::builder().uri("/health/ready").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
