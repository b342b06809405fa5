//! Pontoon library -- a Raft leader-election node.
//!
//! This crate provides the consensus core (terms, roles, elections and the
//! single-writer event loop), the peer transport, a command log, and the
//! HTTP surface that exposes them.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod server;

use crate::cluster::raft::RaftNode;
use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Handle to this process's consensus node.
    pub node: RaftNode,
}
