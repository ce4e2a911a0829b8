//! # resourced
//!
//! Entry point for a resourced node: a typed resource store served over gRPC,
//! replicated with Raft or kept in memory.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use resourced::server::{BackendKind, ResourcedServer, ServerConfig};

/// A typed resource store with CAS writes, watches and Raft replication.
#[derive(Parser, Debug)]
#[command(name = "resourced", version, about)]
struct Args {
    /// Human-readable name for this node, used in logs.
    #[arg(long, default_value = "default")]
    name: String,

    /// Raft id of this node. Must match its entry in --initial-cluster.
    #[arg(long, default_value_t = 1)]
    node_id: u64,

    /// Directory for the Raft log and snapshots.
    #[arg(long, default_value = "default.resourced")]
    data_dir: String,

    /// URL the resource service listens on.
    #[arg(long, default_value = "http://127.0.0.1:8500")]
    listen_client_url: String,

    /// URL for Raft and leader forwarding traffic between nodes.
    #[arg(long, default_value = "http://127.0.0.1:8300")]
    listen_peer_url: String,

    /// Every member of the cluster.
    /// Format: 1=http://node1:8300,2=http://node2:8300,...
    /// Empty runs a single node.
    #[arg(long, default_value = "")]
    initial_cluster: String,

    /// Storage backend - 'raft' or 'inmem'.
    #[arg(long, default_value = "raft")]
    backend: String,

    /// Time in milliseconds between leader heartbeats.
    #[arg(long, default_value_t = 100)]
    heartbeat_interval: u64,

    /// Time in milliseconds a follower waits for a heartbeat before starting
    /// an election. The actual timeout is randomized up to twice this value.
    #[arg(long, default_value_t = 1000)]
    election_timeout: u64,

    /// Applied entries kept in the Raft log before it is snapshotted.
    #[arg(long, default_value_t = 10000)]
    snapshot_count: u64,

    /// Reject resources whose type has not been registered.
    #[arg(long, default_value_t = false)]
    strict_types: bool,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_server_config(&args)?;
    info!(
        name = %config.name,
        client_url = %config.listen_client_url,
        peer_url = %config.listen_peer_url,
        data_dir = %config.data_dir.display(),
        "Starting resourced"
    );

    let server = ResourcedServer::new(config).await?;

    match server.run(shutdown_signal()).await {
        Ok(()) => {
            info!("Server shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {:?}", e);
            Err(e)
        }
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {}. Using 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    Ok(())
}

fn build_server_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let backend: BackendKind = args.backend.parse()?;

    Ok(ServerConfig {
        name: args.name.clone(),
        node_id: args.node_id,
        data_dir: PathBuf::from(&args.data_dir),
        listen_client_url: args.listen_client_url.clone(),
        listen_peer_url: args.listen_peer_url.clone(),
        initial_cluster: args.initial_cluster.clone(),
        backend,
        heartbeat_interval_ms: args.heartbeat_interval,
        election_timeout_ms: args.election_timeout,
        snapshot_count: args.snapshot_count,
        strict_types: args.strict_types,
    })
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
