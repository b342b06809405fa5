//! Prometheus metrics for Pontoon.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.
//!
//! Without an installed recorder (e.g. in tests) every macro is a no-op.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "pontoon_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "pontoon_http_request_duration_seconds";

/// Current term (gauge).
pub const RAFT_TERM: &str = "pontoon_raft_term";

/// Current role: 0 follower, 1 candidate, 2 leader (gauge).
pub const RAFT_ROLE: &str = "pontoon_raft_role";

/// Campaigns started by this node (counter).
pub const RAFT_ELECTIONS_TOTAL: &str = "pontoon_raft_elections_total";

/// Campaigns won by this node (counter).
pub const RAFT_LEADER_PROMOTIONS_TOTAL: &str = "pontoon_raft_leader_promotions_total";

/// Votes this node granted to candidates (counter).
pub const RAFT_VOTES_GRANTED_TOTAL: &str = "pontoon_raft_votes_granted_total";

/// Client commands by outcome (counter). Labels: outcome.
pub const RAFT_COMMANDS_TOTAL: &str = "pontoon_raft_commands_total";

/// Failed outbound RPCs (counter). Labels: rpc, kind.
pub const RAFT_RPC_FAILURES_TOTAL: &str = "pontoon_raft_rpc_failures_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_gauge!(RAFT_TERM, "Current consensus term");
    describe_gauge!(RAFT_ROLE, "Current role (0 follower, 1 candidate, 2 leader)");
    describe_counter!(RAFT_ELECTIONS_TOTAL, "Elections started by this node");
    describe_counter!(RAFT_LEADER_PROMOTIONS_TOTAL, "Elections won by this node");
    describe_counter!(RAFT_VOTES_GRANTED_TOTAL, "Votes granted to candidates");
    describe_counter!(RAFT_COMMANDS_TOTAL, "Client commands by outcome");
    describe_counter!(RAFT_RPC_FAILURES_TOTAL, "Failed outbound RPCs");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Routes served by the node; anything else is folded into one label.
const KNOWN_PATHS: &[&str] = &[
    "/ping",
    "/health",
    "/metrics",
    "/openapi.json",
    "/request_vote",
    "/append_entries",
    "/command",
    "/node",
    "/cluster",
    "/print",
];

/// Map a request path to a bounded-cardinality metric label.
fn normalize_path(path: &str) -> String {
    if KNOWN_PATHS.contains(&path) {
        path.to_string()
    } else if path.starts_with("/test/") && path.matches('/').count() == 3 {
        "/test/{id}/{body}".to_string()
    } else {
        "/{other}".to_string()
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder is not installed").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
