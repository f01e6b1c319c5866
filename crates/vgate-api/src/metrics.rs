//! Prometheus metrics for the orchestrator API.

use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use regex_lite::Regex;

/// Install the Prometheus recorder and return the handle that renders it.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "vgate_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "vgate_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "vgate_http_requests_in_flight";

    // Intake
    pub const JOBS_SUBMITTED_TOTAL: &str = "vgate_jobs_submitted_total";
    pub const JOBS_REJECTED_TOTAL: &str = "vgate_jobs_rejected_total";

    // Autoheal
    pub const HEALTH_PROBES_TOTAL: &str = "vgate_health_probes_total";
    pub const WORKER_AUTOHEALS_TOTAL: &str = "vgate_worker_autoheals_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_job_submitted(operation: &str) {
    counter!(names::JOBS_SUBMITTED_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record a submission refused at intake (`validation` or `unschedulable`).
pub fn record_job_rejected(reason: &'static str) {
    counter!(names::JOBS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_probe(worker: &str, healthy: bool) {
    let result = if healthy { "healthy" } else { "unhealthy" };
    counter!(names::HEALTH_PROBES_TOTAL, "worker" => worker.to_string(), "result" => result)
        .increment(1);
}

pub fn record_autoheal(worker: &str) {
    counter!(names::WORKER_AUTOHEALS_TOTAL, "worker" => worker.to_string()).increment(1);
}

/// Sanitize path for metrics labels (replace job and worker ids).
fn sanitize_path(path: &str) -> String {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"/jobs/[^/]+", "/jobs/:job_id"),
            (r"/workers/[^/]+", "/workers/:worker_id"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
        .collect()
    });

    patterns
        .iter()
        .fold(path.to_string(), |path, (re, replacement)| {
            re.replace_all(&path, *replacement).into_owned()
        })
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
