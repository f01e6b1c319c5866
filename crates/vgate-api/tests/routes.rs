//! HTTP route tests against in-memory backends.
//!
//! Supervisors are not started, so submitted jobs stay Pending.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use vgate_api::{create_router, ApiConfig, AppState, Orchestrator, OrchestratorConfig, Runtime, WorkerSpec};
use vgate_models::JobState;
use vgate_worker::FnCapability;

async fn app() -> (Router, Arc<Orchestrator>) {
    let config = OrchestratorConfig::memory(vec![
        WorkerSpec::new("gpu-0", 4),
        WorkerSpec::new("gpu-1", 2),
    ]);
    let capability = Arc::new(FnCapability::new("noop", |_id, _payload, _cancel| async {
        Ok("/out/noop.mp4".to_string())
    }));
    let runtime = Runtime::build(&config, capability).await.unwrap();
    let orchestrator = Arc::clone(runtime.orchestrator());

    let state = AppState::new(ApiConfig::default(), Arc::clone(&orchestrator));
    (create_router(state, None), orchestrator)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn submit(app: &Router, gpu_cost: u32) -> String {
    let (status, body) = send(
        app,
        post_json(
            "/api/jobs",
            json!({"operation": "transcode", "input_ref": "/media/in.mp4", "gpu_cost": gpu_cost}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    body["job_id"].as_str().unwrap().to_string()
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let (app, _) = app().await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["ledger"]["status"], "ok");
    assert_eq!(body["checks"]["store"]["status"], "ok");
}

#[tokio::test]
async fn test_metrics_route_absent_without_handle() {
    let (app, _) = app().await;
    let (status, _) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let (app, _) = app().await;
    let request = Request::builder()
        .uri("/health")
        .header("X-Request-ID", "req-42")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["X-Request-ID"], "req-42");
}

// ============================================================================
// Jobs
// ============================================================================

#[tokio::test]
async fn test_submit_returns_position() {
    let (app, orchestrator) = app().await;

    let (status, first) = send(
        &app,
        post_json(
            "/api/jobs",
            json!({"operation": "segment", "input_ref": "/media/a.mp4", "gpu_cost": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["position"], 1);

    let (_, second) = send(
        &app,
        post_json(
            "/api/jobs",
            json!({
                "operation": "transcode",
                "input_ref": "https://cdn.example.com/b.mp4",
                "gpu_cost": 2,
                "params": {"codec": "hevc_nvenc"}
            }),
        ),
    )
    .await;
    assert_eq!(second["position"], 2);
    assert_eq!(orchestrator.queue().queue_len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_submit_rejects_invalid_requests() {
    let (app, orchestrator) = app().await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/jobs",
            json!({"operation": "transcode", "input_ref": "", "gpu_cost": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");

    let (status, _) = send(
        &app,
        post_json(
            "/api/jobs",
            json!({"operation": "transcode", "input_ref": "/media/in.mp4", "gpu_cost": 0}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/api/jobs",
            json!({"operation": "upscale", "input_ref": "/media/in.mp4", "gpu_cost": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let malformed = Request::builder()
        .method("POST")
        .uri("/api/jobs")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(orchestrator.queue().queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unschedulable_job_is_never_recorded() {
    let (app, orchestrator) = app().await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/jobs",
            json!({"operation": "transcode", "input_ref": "/media/in.mp4", "gpu_cost": 5}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "unschedulable");

    let pending: Vec<_> = orchestrator
        .ledger()
        .list_by_state(JobState::Pending)
        .collect()
        .await;
    assert!(pending.is_empty());
    assert_eq!(orchestrator.queue().queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_get_job() {
    let (app, _) = app().await;
    let job_id = submit(&app, 2).await;

    let (status, body) = send(&app, get(&format!("/api/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], job_id.as_str());
    assert_eq!(body["state"], "pending");
    assert_eq!(body["gpu_cost"], 2);
    assert_eq!(body["attempt_count"], 0);
    assert_eq!(body["payload"]["operation"], "transcode");
    // Internal metadata stays out of the view
    assert!(body.get("worker_id").is_none());
    assert!(body.get("updated_at").is_none());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (app, _) = app().await;

    let (status, body) = send(&app, get("/api/jobs/0000aaaa-0000-0000-0000-000000000000")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = send(&app, get("/api/jobs/bad!id")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, post("/api/jobs/0000aaaa-0000-0000-0000-000000000000/cancel")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let (app, orchestrator) = app().await;
    let job_id = submit(&app, 1).await;

    let (status, body) = send(&app, post(&format!("/api/jobs/{}/cancel", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");
    assert_eq!(orchestrator.queue().queue_len().await.unwrap(), 0);

    // Terminal now
    let (status, body) = send(&app, post(&format!("/api/jobs/{}/cancel", job_id))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");

    let (status, history) = send(&app, get(&format!("/api/jobs/{}/history", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["from"], "pending");
    assert_eq!(history[0]["to"], "cancelled");
}

// ============================================================================
// Workers
// ============================================================================

#[tokio::test]
async fn test_list_and_get_workers() {
    let (app, _) = app().await;

    let (status, body) = send(&app, get("/api/workers")).await;
    assert_eq!(status, StatusCode::OK);
    let workers = body.as_array().unwrap();
    assert_eq!(workers.len(), 2);

    let gpu0 = workers.iter().find(|w| w["worker_id"] == "gpu-0").unwrap();
    assert_eq!(gpu0["total_gpu_capacity"], 4);
    assert_eq!(gpu0["reserved_gpu"], 0);
    assert_eq!(gpu0["supervisor"]["polling"], false);

    let (status, body) = send(&app, get("/api/workers/gpu-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_gpu_capacity"], 2);

    let (status, _) = send(&app, get("/api/workers/gpu-9")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
