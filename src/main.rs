//! Pontoon -- Raft leader-election node.
//!
//! Every start is a fresh follower at term zero; nothing is persisted.
//! SIGTERM/SIGINT stop accepting connections, drain in-flight requests,
//! then stop the consensus loop.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use pontoon::cluster::log::{MemoryLog, ReplicatedLog};
use pontoon::cluster::raft::RaftNode;
use pontoon::cluster::transport::{HttpTransport, Transport};
use pontoon::config::{Config, LoggingConfig};

/// Command-line arguments for the Pontoon node.
#[derive(Parser, Debug)]
#[command(name = "pontoon", version, about = "Raft leader-election node")]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Override this node's identity (defaults to the bind address).
    #[arg(long)]
    node_id: Option<String>,

    /// Peer address (host:port). Repeat for each peer; replaces the
    /// configured peer list.
    #[arg(short, long = "peer")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => pontoon::config::load_config(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &cli)?;

    init_tracing(&config.logging);
    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path),
        None => info!("No configuration file given, using defaults"),
    }
    config.validate()?;

    if config.observability.metrics {
        pontoon::metrics::init_metrics()?;
        pontoon::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let bind_addr = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let log: Arc<dyn ReplicatedLog> = Arc::new(MemoryLog::new());
    let node = RaftNode::start(config.node_settings(), transport, log);

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(pontoon::AppState {
        config,
        node: node.clone(),
    });
    let app = pontoon::server::app(state);

    info!("Pontoon node {} listening on {}", node.id(), bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if tokio::time::timeout(shutdown_timeout, node.shutdown())
        .await
        .is_err()
    {
        warn!("consensus loop did not stop within {:?}", shutdown_timeout);
    }

    info!("Pontoon shut down");

    Ok(())
}

/// Fold command-line overrides into the loaded configuration.
fn apply_overrides(config: &mut Config, cli: &Cli) -> anyhow::Result<()> {
    if let Some(bind) = &cli.bind {
        let (host, port) = bind
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--bind must be host:port, got '{bind}'"))?;
        config.server.host = host.to_string();
        config.server.port = port
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid port in --bind '{bind}': {e}"))?;
    }
    if let Some(id) = &cli.node_id {
        config.raft.node_id = Some(id.clone());
    }
    if !cli.peers.is_empty() {
        config.raft.peers = cli.peers.clone();
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
