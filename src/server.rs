//! Axum router construction and route mapping.
//!
//! The [`app`] function wires the peer RPC endpoints, the client command
//! endpoint and the introspection endpoints to their handlers and returns a
//! ready-to-serve [`axum::Router`].
//!
//! RPC bodies are decoded by hand rather than with the `Json` extractor so
//! that every malformed body gets the same [`ApiError::MalformedRequest`]
//! answer and never reaches the node.

use axum::{
    extract::{Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::{OpenApi, ToSchema};

use crate::cluster::log::LogEntry;
use crate::cluster::rpc::{
    CommandRequest, CommandResponse, EntryRequest, EntryResponse, VoteRequest, VoteResponse,
};
use crate::cluster::state::{quorum_size, NodeStatus};
use crate::errors::{generate_request_id, ApiError};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the node's HTTP API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Pontoon Node API",
        version = "0.1.0",
        description = "Raft election RPCs, command admission and introspection"
    ),
    paths(
        health_check,
        ping,
        request_vote,
        append_entries,
        command,
        command_shortcut,
        node_status,
        cluster_view,
        print_log,
    ),
    tags(
        (name = "Health", description = "Liveness endpoints"),
        (name = "Raft", description = "Peer-to-peer consensus RPCs"),
        (name = "Client", description = "Command submission"),
        (name = "Introspection", description = "Node, cluster and log inspection"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with every node endpoint.
///
/// `/metrics` and the HTTP metrics middleware are mounted only when
/// `observability.metrics` is enabled.
pub fn app(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.config.observability.metrics;

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ping", get(ping))
        .route("/openapi.json", get(openapi_json))
        // Peer RPCs
        .route("/request_vote", post(request_vote))
        .route("/append_entries", post(append_entries))
        // Client commands
        .route("/command", post(command))
        .route("/test/:id/:body", get(command_shortcut))
        // Introspection
        .route("/node", get(node_status))
        .route("/cluster", get(cluster_view))
        .route("/print", get(print_log));
    if metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = router
        .with_state(state)
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http());
    if metrics_enabled {
        router.layer(middleware::from_fn(metrics_middleware))
    } else {
        router
    }
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id`, `date` and `server` headers to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses carry their own request id.
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("Pontoon"));

    response
}

// -- Helpers -----------------------------------------------------------------

/// Decode a JSON request body, mapping failures to a 400.
fn decode<T: DeserializeOwned>(route: &str, body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        warn!("malformed {} body: {}", route, e);
        ApiError::MalformedRequest {
            message: e.to_string(),
        }
    })
}

/// Cluster membership as seen by this node.
#[derive(Debug, Serialize, ToSchema)]
pub struct ClusterView {
    /// This node's identity.
    pub id: String,
    /// Other members.
    pub peers: Vec<String>,
    /// Votes needed to win an election.
    pub quorum: usize,
}

// -- Health ------------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses((status = 200, description = "Health check OK"))
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /ping` -- Plain-text liveness probe used by peers.
#[utoipa::path(
    get,
    path = "/ping",
    tag = "Health",
    responses((status = 200, description = "Always `OK`", body = String))
)]
async fn ping() -> &'static str {
    "OK"
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Peer RPCs ---------------------------------------------------------------

/// `POST /request_vote` -- RequestVote RPC.
#[utoipa::path(
    post,
    path = "/request_vote",
    tag = "Raft",
    request_body = VoteRequest,
    responses(
        (status = 200, description = "Vote decision", body = VoteResponse),
        (status = 400, description = "Malformed request body"),
        (status = 503, description = "Node is shutting down")
    )
)]
async fn request_vote(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<VoteResponse>, ApiError> {
    let request: VoteRequest = decode("request_vote", &body)?;
    let response = state.node.handle_request_vote(request).await?;
    Ok(Json(response))
}

/// `POST /append_entries` -- AppendEntries (heartbeat) RPC.
#[utoipa::path(
    post,
    path = "/append_entries",
    tag = "Raft",
    request_body = EntryRequest,
    responses(
        (status = 200, description = "Leader accepted or refused", body = EntryResponse),
        (status = 400, description = "Malformed request body"),
        (status = 503, description = "Node is shutting down")
    )
)]
async fn append_entries(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<EntryResponse>, ApiError> {
    let request: EntryRequest = decode("append_entries", &body)?;
    let response = state.node.handle_append_entries(request).await?;
    Ok(Json(response))
}

// -- Client commands ---------------------------------------------------------

/// `POST /command` -- Submit a command to the leader.
///
/// Non-leaders answer 503 with `success: false` and, when known, the
/// current leader so the client can retry there.
#[utoipa::path(
    post,
    path = "/command",
    tag = "Client",
    request_body = CommandRequest,
    responses(
        (status = 200, description = "Command admitted", body = CommandResponse),
        (status = 400, description = "Malformed request body"),
        (status = 503, description = "Command rejected", body = CommandResponse)
    )
)]
async fn command(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CommandRequest = decode("command", &body)?;
    Ok(submit_command(&state, request).await)
}

/// `GET /test/{id}/{body}` -- Submit a command from a plain URL.
///
/// Same outcome as `POST /command` with name `test`; handy from a browser
/// or `curl` without a JSON body.
#[utoipa::path(
    get,
    path = "/test/{id}/{body}",
    tag = "Client",
    params(
        ("id" = i64, Path, description = "Client-chosen command id"),
        ("body" = String, Path, description = "Command payload")
    ),
    responses(
        (status = 200, description = "Command admitted", body = CommandResponse),
        (status = 503, description = "Command rejected", body = CommandResponse)
    )
)]
async fn command_shortcut(
    State(state): State<Arc<AppState>>,
    Path((id, body)): Path<(i64, String)>,
) -> Response {
    let request = CommandRequest {
        id,
        name: "test".to_string(),
        body,
    };
    submit_command(&state, request).await
}

async fn submit_command(state: &AppState, request: CommandRequest) -> Response {
    let response = state.node.handle_command(request).await;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response)).into_response()
}

// -- Introspection -----------------------------------------------------------

/// `GET /node` -- Current term, role and vote of this node.
#[utoipa::path(
    get,
    path = "/node",
    tag = "Introspection",
    responses((status = 200, description = "Node status", body = NodeStatus))
)]
async fn node_status(State(state): State<Arc<AppState>>) -> Json<NodeStatus> {
    Json(state.node.status())
}

/// `GET /cluster` -- This node and its peers.
#[utoipa::path(
    get,
    path = "/cluster",
    tag = "Introspection",
    responses((status = 200, description = "Cluster membership", body = ClusterView))
)]
async fn cluster_view(State(state): State<Arc<AppState>>) -> Json<ClusterView> {
    let peers = state.node.peers().to_vec();
    Json(ClusterView {
        id: state.node.id().to_string(),
        quorum: quorum_size(peers.len()),
        peers,
    })
}

/// `GET /print` -- Every entry in this node's log.
#[utoipa::path(
    get,
    path = "/print",
    tag = "Introspection",
    responses((status = 200, description = "Log entries, oldest first", body = Vec<LogEntry>))
)]
async fn print_log(State(state): State<Arc<AppState>>) -> Json<Vec<LogEntry>> {
    Json(state.node.log().entries())
}
