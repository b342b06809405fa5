//! Error types for the node, its transport, and its HTTP surface.
//!
//! Protocol-level rejections (stale term, vote already cast, stale log,
//! not the leader) are ordinary response values and never show up here.
//! [`ApiError`] implements [`axum::response::IntoResponse`] so handlers can
//! return `Err(ApiError::MalformedRequest { .. })` directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Failures reported by a [`RaftNode`](crate::cluster::raft::RaftNode) handle.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The event loop has exited and can no longer take requests.
    #[error("the consensus event loop has stopped")]
    NodeStopped,
}

/// Failures of an outbound RPC. Always treated as "no answer" by the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer did not answer within the RPC timeout.
    #[error("request to {peer} timed out")]
    Timeout { peer: String },

    /// Connection or protocol level failure.
    #[error("request to {peer} failed: {source}")]
    Http {
        peer: String,
        #[source]
        source: reqwest::Error,
    },

    /// The peer answered with a non-success HTTP status.
    #[error("{peer} answered with HTTP {status}")]
    Status { peer: String, status: u16 },

    /// The peer's answer could not be decoded.
    #[error("malformed response from {peer}: {message}")]
    Decode { peer: String, message: String },

    /// The peer is not reachable (in-process transports).
    #[error("{peer} is unreachable")]
    Unreachable { peer: String },
}

impl TransportError {
    /// Classify a reqwest failure against `peer`.
    pub fn from_reqwest(peer: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout {
                peer: peer.to_string(),
            }
        } else if err.is_decode() {
            TransportError::Decode {
                peer: peer.to_string(),
                message: err.to_string(),
            }
        } else {
            TransportError::Http {
                peer: peer.to_string(),
                source: err,
            }
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout { .. } => "timeout",
            TransportError::Http { .. } => "http",
            TransportError::Status { .. } => "status",
            TransportError::Decode { .. } => "decode",
            TransportError::Unreachable { .. } => "unreachable",
        }
    }
}

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body could not be decoded.
    #[error("malformed request body: {message}")]
    MalformedRequest { message: String },

    /// The node is shutting down.
    #[error("the node is not running")]
    Unavailable(#[from] RaftError),

    /// Catch-all for unexpected internal errors.
    #[error("internal error")]
    InternalError(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    request_id: String,
}

impl ApiError {
    /// Stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::MalformedRequest { .. } => "MalformedRequest",
            ApiError::Unavailable(_) => "Unavailable",
            ApiError::InternalError(_) => "InternalError",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        if let ApiError::InternalError(err) = &self {
            tracing::error!(request_id = %request_id, "internal error: {err:#}");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            request_id: request_id.clone(),
        };
        (status, [("x-request-id", request_id)], Json(body)).into_response()
    }
}
