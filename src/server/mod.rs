//! Server wiring for a resourced node.
//!
//! A node runs:
//! - the resource service on the client listener
//! - with the Raft backend, the peer listener carrying Raft RPCs and leader
//!   forwarding, the Raft event loop and a task that resets the forwarding
//!   connection whenever leadership moves

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::api::{RaftInternalService, ResourceService};
use crate::raft::{GrpcTransport, PeerConfig, RaftConfig, RaftLog, RaftNode};
use crate::raftpb::raft_internal_server::RaftInternalServer;
use crate::resource::Registry;
use crate::resourcepb::resource_service_server::ResourceServiceServer;
use crate::storage::raft::{ForwardingService, Fsm};
use crate::storage::{Backend, InMemBackend, RaftBackend, Store};
use crate::storagepb::forwarding_server::ForwardingServer;

/// Which storage backend a node runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    InMem,
    Raft,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "inmem" => Ok(BackendKind::InMem),
            "raft" => Ok(BackendKind::Raft),
            _ => Err(anyhow::anyhow!(
                "Invalid backend: {}. Must be 'inmem' or 'raft'",
                s
            )),
        }
    }
}

/// Configuration for a resourced node.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Human-readable name for this node.
    pub name: String,

    /// Raft id of this node. Must appear in `initial_cluster` when it is set.
    pub node_id: u64,

    /// Directory holding the Raft log and snapshots.
    pub data_dir: PathBuf,

    /// URL the resource service listens on.
    pub listen_client_url: String,

    /// URL Raft peers and forwarded requests reach this node on.
    pub listen_peer_url: String,

    /// Every cluster member as `id=peer_url,...`. Empty means a single node
    /// whose peer URL is `listen_peer_url`.
    pub initial_cluster: String,

    pub backend: BackendKind,

    pub heartbeat_interval_ms: u64,

    pub election_timeout_ms: u64,

    /// Applied entries kept in the Raft log before it is snapshotted.
    pub snapshot_count: u64,

    /// Reject writes of types nobody registered.
    pub strict_types: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            node_id: 1,
            data_dir: PathBuf::from("default.resourced"),
            listen_client_url: "http://127.0.0.1:8500".to_string(),
            listen_peer_url: "http://127.0.0.1:8300".to_string(),
            initial_cluster: String::new(),
            backend: BackendKind::Raft,
            heartbeat_interval_ms: 100,
            election_timeout_ms: 1000,
            snapshot_count: 10000,
            strict_types: false,
        }
    }
}

impl ServerConfig {
    /// Cluster members from `initial_cluster`, or just this node.
    pub fn members(&self) -> anyhow::Result<Vec<PeerConfig>> {
        if self.initial_cluster.trim().is_empty() {
            return Ok(vec![PeerConfig {
                id: self.node_id,
                address: self.listen_peer_url.clone(),
            }]);
        }

        let members = parse_initial_cluster(&self.initial_cluster)?;
        if !members.iter().any(|m| m.id == self.node_id) {
            return Err(anyhow::anyhow!(
                "node id {} is not part of the initial cluster {}",
                self.node_id,
                self.initial_cluster
            ));
        }
        Ok(members)
    }

    pub fn raft_config(&self) -> anyhow::Result<RaftConfig> {
        let election = Duration::from_millis(self.election_timeout_ms);
        Ok(RaftConfig::new(self.node_id, self.data_dir.clone())
            .with_peers(self.members()?)
            .with_timeouts(
                election,
                election * 2,
                Duration::from_millis(self.heartbeat_interval_ms),
            )
            .with_snapshot_threshold(self.snapshot_count))
    }
}

/// Parses `id=url,id=url,...` into peer entries.
pub fn parse_initial_cluster(initial_cluster: &str) -> anyhow::Result<Vec<PeerConfig>> {
    let mut members = Vec::new();
    for member in initial_cluster.split(',') {
        let member = member.trim();
        if member.is_empty() {
            continue;
        }
        let (id, url) = member
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("malformed cluster entry: {}", member))?;
        let id: u64 = id
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid node id in {}: {}", member, e))?;
        if id == 0 {
            return Err(anyhow::anyhow!("node id 0 is reserved: {}", member));
        }
        if members.iter().any(|m: &PeerConfig| m.id == id) {
            return Err(anyhow::anyhow!("duplicate node id {}", id));
        }
        members.push(PeerConfig {
            id,
            address: url.trim().to_string(),
        });
    }
    Ok(members)
}

/// Resolves an `http://host:port` URL to a socket address.
pub fn parse_socket_addr(url: &str) -> anyhow::Result<SocketAddr> {
    let host = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    host.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("no address for {}", url))
}

/// A resourced node.
pub struct ResourcedServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    store: Arc<Store>,
    backend: Arc<dyn Backend>,
    raft: Option<RaftParts>,
    background_tasks: Vec<JoinHandle<()>>,
}

struct RaftParts {
    node: Arc<RaftNode<Fsm>>,
    backend: Arc<RaftBackend>,
}

impl ResourcedServer {
    /// Builds the storage stack. Nothing listens until `run`.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        info!(
            name = %config.name,
            node_id = config.node_id,
            backend = ?config.backend,
            "Initializing resourced server"
        );

        let registry = Arc::new(if config.strict_types {
            Registry::new()
        } else {
            Registry::permissive()
        });
        let store = Store::new();

        let (backend, raft) = match config.backend {
            BackendKind::InMem => (
                Arc::new(InMemBackend::with_store(store.clone())) as Arc<dyn Backend>,
                None,
            ),
            BackendKind::Raft => {
                let raft_config = config.raft_config()?;
                std::fs::create_dir_all(&config.data_dir)?;
                let log = Arc::new(
                    RaftLog::open(&config.data_dir.join("raft"))
                        .map_err(|e| anyhow::anyhow!("Failed to open Raft log: {}", e))?,
                );

                let peer_addresses: HashMap<u64, String> = raft_config
                    .peers
                    .iter()
                    .filter(|p| p.id != config.node_id)
                    .map(|p| (p.id, p.address.clone()))
                    .collect();
                let transport = Arc::new(GrpcTransport::new(peer_addresses));

                let fsm = Arc::new(Fsm::new(store.clone()));
                let node = Arc::new(
                    RaftNode::new(raft_config, log, transport, fsm)
                        .map_err(|e| anyhow::anyhow!("Failed to initialize Raft node: {}", e))?,
                );
                let raft_backend = Arc::new(RaftBackend::new(node.clone(), store.clone()));
                info!(node_id = config.node_id, "Raft node initialized");

                (
                    raft_backend.clone() as Arc<dyn Backend>,
                    Some(RaftParts {
                        node,
                        backend: raft_backend,
                    }),
                )
            }
        };

        Ok(Self {
            config,
            registry,
            store,
            backend,
            raft,
            background_tasks: Vec::new(),
        })
    }

    /// Binds the configured URLs and serves until `shutdown` resolves.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        let client = TcpListener::bind(parse_socket_addr(&self.config.listen_client_url)?).await?;
        let peer = match self.raft {
            Some(_) => Some(TcpListener::bind(parse_socket_addr(&self.config.listen_peer_url)?).await?),
            None => None,
        };
        self.run_with_listeners(client, peer, shutdown).await
    }

    /// Serves on already bound listeners. The peer listener is required with
    /// the Raft backend and ignored otherwise.
    pub async fn run_with_listeners(
        mut self,
        client: TcpListener,
        peer: Option<TcpListener>,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);

        if let Some(raft) = &self.raft {
            let peer = peer.ok_or_else(|| anyhow::anyhow!("Raft backend needs a peer listener"))?;
            info!(addr = %peer.local_addr()?, "Starting peer server");

            self.background_tasks.push(raft.node.clone().run());
            self.background_tasks
                .push(spawn_leader_watch(raft.node.clone(), raft.backend.clone()));

            let peer_server = Server::builder()
                .add_service(RaftInternalServer::new(RaftInternalService::new(
                    raft.node.clone(),
                )))
                .add_service(ForwardingServer::new(ForwardingService::new(
                    raft.backend.clone(),
                )))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(peer),
                    wait_for_stop(stop_rx.clone()),
                );
            self.background_tasks.push(tokio::spawn(async move {
                if let Err(e) = peer_server.await {
                    warn!(error = %e, "Peer server failed");
                }
            }));
        }

        let service = ResourceService::new(self.backend.clone(), self.registry.clone());
        info!(addr = %client.local_addr()?, "Starting resource server");

        let result = Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(10)))
            .http2_keepalive_timeout(Some(Duration::from_secs(20)))
            .add_service(ResourceServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(client), shutdown)
            .await;

        info!(name = %self.config.name, "resourced server shutting down");
        let _ = stop_tx.send(true);
        self.store.hub().close_all();
        for task in self.background_tasks.drain(..) {
            task.abort();
        }

        result?;
        Ok(())
    }

    /// Types registered here are enforced when `strict_types` is set.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn raft(&self) -> Option<Arc<RaftNode<Fsm>>> {
        self.raft.as_ref().map(|r| r.node.clone())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Drops the cached forwarding connection on every leader change.
fn spawn_leader_watch(node: Arc<RaftNode<Fsm>>, backend: Arc<RaftBackend>) -> JoinHandle<()> {
    let mut leader_rx = node.get_state().subscribe_leader();
    tokio::spawn(async move {
        while leader_rx.changed().await.is_ok() {
            let leader = *leader_rx.borrow_and_update();
            match leader {
                Some(leader) => info!(node_id = node.id(), leader, "Leader changed"),
                None => info!(node_id = node.id(), "Leader lost"),
            }
            backend.leader_changed();
        }
    })
}

async fn wait_for_stop(mut stop_rx: watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}
