//! Configuration loading and types for Pontoon.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Every section is optional: a missing file section
//! falls back to the defaults below.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cluster::raft::NodeSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Consensus settings.
    #[serde(default)]
    pub raft: RaftConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// `host:port` to bind the listener on.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Consensus configuration. Durations are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct RaftConfig {
    /// This node's identity as peers address it. Defaults to the bind
    /// address.
    pub node_id: Option<String>,

    /// Addresses (`host:port`) of the other cluster members.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Base election timeout.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Maximum random delay added to every election timeout.
    #[serde(default = "default_election_jitter_ms")]
    pub election_jitter_ms: u64,

    /// Leader heartbeat interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Timeout of one RequestVote RPC.
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,

    /// Timeout of one AppendEntries RPC.
    #[serde(default = "default_append_timeout_ms")]
    pub append_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            peers: Vec::new(),
            election_timeout_ms: default_election_timeout_ms(),
            election_jitter_ms: default_election_jitter_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            vote_timeout_ms: default_vote_timeout_ms(),
            append_timeout_ms: default_append_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

impl Config {
    /// Reject settings the protocol cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let raft = &self.raft;
        if raft.election_timeout_ms == 0 {
            anyhow::bail!("raft.election_timeout_ms must be positive");
        }
        if raft.heartbeat_interval_ms == 0 {
            anyhow::bail!("raft.heartbeat_interval_ms must be positive");
        }
        if raft.heartbeat_interval_ms >= raft.election_timeout_ms {
            anyhow::bail!(
                "raft.heartbeat_interval_ms ({}) must be shorter than raft.election_timeout_ms ({})",
                raft.heartbeat_interval_ms,
                raft.election_timeout_ms
            );
        }
        if raft.vote_timeout_ms == 0 || raft.append_timeout_ms == 0 {
            anyhow::bail!("raft RPC timeouts must be positive");
        }
        let id = self.node_id();
        if raft.peers.iter().any(|p| *p == id) {
            anyhow::bail!("raft.peers must not contain this node ({id})");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            );
        }
        Ok(())
    }

    /// Identity this node campaigns and votes under.
    pub fn node_id(&self) -> String {
        self.raft
            .node_id
            .clone()
            .unwrap_or_else(|| self.server.bind_address())
    }

    /// Settings for [`RaftNode::start`](crate::cluster::raft::RaftNode::start).
    pub fn node_settings(&self) -> NodeSettings {
        let raft = &self.raft;
        NodeSettings {
            id: self.node_id(),
            peers: raft.peers.clone(),
            election_timeout: Duration::from_millis(raft.election_timeout_ms),
            election_jitter: Duration::from_millis(raft.election_jitter_ms),
            heartbeat_interval: Duration::from_millis(raft.heartbeat_interval_ms),
            vote_timeout: Duration::from_millis(raft.vote_timeout_ms),
            append_timeout: Duration::from_millis(raft.append_timeout_ms),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8700
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_election_timeout_ms() -> u64 {
    500
}

fn default_election_jitter_ms() -> u64 {
    250
}

fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_vote_timeout_ms() -> u64 {
    100
}

fn default_append_timeout_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind_address(), "127.0.0.1:8700");
        assert_eq!(config.node_id(), "127.0.0.1:8700");
        let settings = config.node_settings();
        assert_eq!(settings.election_timeout, Duration::from_millis(500));
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(settings.vote_timeout, Duration::from_millis(100));
        assert_eq!(settings.append_timeout, Duration::from_millis(500));
        assert!(settings.peers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9001\nraft:\n  node_id: node-a:9001\n  peers:\n    - node-b:9001\n    - node-c:9001\n  election_timeout_ms: 800\nlogging:\n  format: json\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.node_id(), "node-a:9001");
        assert_eq!(config.raft.peers.len(), 2);
        assert_eq!(config.raft.election_timeout_ms, 800);
        assert_eq!(config.raft.heartbeat_interval_ms, 100);
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config("/nonexistent/pontoon.yaml").is_err());
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_election_timeout() {
        let mut config = Config::default();
        config.raft.heartbeat_interval_ms = 500;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_ms"));
    }

    #[test]
    fn test_self_in_peers_is_rejected() {
        let mut config = Config::default();
        config.raft.peers = vec!["127.0.0.1:8700".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
