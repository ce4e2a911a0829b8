use super::{RaftError, RaftNode, RaftResult, StateMachine};
use crate::raftpb::raft_internal_client::RaftInternalClient;
use crate::raftpb::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send_append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse>;

    async fn send_request_vote(
        &self,
        target: u64,
        req: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse>;

    async fn send_install_snapshot(
        &self,
        target: u64,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse>;
}

/// Peer transport over the `raftpb.RaftInternal` gRPC service.
pub struct GrpcTransport {
    peer_addresses: HashMap<u64, String>,
    clients: DashMap<u64, RaftInternalClient<Channel>>,
    client_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(peer_addresses: HashMap<u64, String>) -> Self {
        Self {
            peer_addresses,
            clients: DashMap::new(),
            client_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    /// Channels connect lazily and reconnect on their own, so a client is
    /// built once per peer and reused.
    fn client(&self, peer_id: u64) -> RaftResult<RaftInternalClient<Channel>> {
        if let Some(client) = self.clients.get(&peer_id) {
            return Ok(client.clone());
        }

        let address = self
            .peer_addresses
            .get(&peer_id)
            .ok_or_else(|| RaftError::TransportError(format!("Peer {} not found", peer_id)))?;
        let channel = Endpoint::from_shared(address.clone())
            .map_err(|e| RaftError::TransportError(format!("Invalid peer address: {}", e)))?
            .connect_timeout(self.client_timeout)
            .timeout(self.client_timeout)
            .connect_lazy();

        let client = RaftInternalClient::new(channel)
            .max_decoding_message_size(usize::MAX)
            .max_encoding_message_size(usize::MAX);
        self.clients.insert(peer_id, client.clone());
        Ok(client)
    }
}

fn status_err(peer_id: u64, status: tonic::Status) -> RaftError {
    RaftError::TransportError(format!("Peer {}: {}", peer_id, status.message()))
}

#[async_trait]
impl RaftTransport for GrpcTransport {
    async fn send_append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let mut client = self.client(target)?;
        let response = client
            .append_entries(req)
            .await
            .map_err(|s| status_err(target, s))?;
        Ok(response.into_inner())
    }

    async fn send_request_vote(
        &self,
        target: u64,
        req: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        let mut client = self.client(target)?;
        let response = client
            .request_vote(req)
            .await
            .map_err(|s| status_err(target, s))?;
        Ok(response.into_inner())
    }

    async fn send_install_snapshot(
        &self,
        target: u64,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        let mut client = self.client(target)?;
        let response = client
            .install_snapshot(req)
            .await
            .map_err(|s| status_err(target, s))?;
        Ok(response.into_inner())
    }
}

/// In-process transport that calls peer nodes directly. Nodes can be cut
/// off to simulate a partition.
pub struct LocalTransport<M: StateMachine> {
    nodes: DashMap<u64, Weak<RaftNode<M>>>,
    isolated: DashSet<u64>,
}

impl<M: StateMachine> LocalTransport<M> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            isolated: DashSet::new(),
        })
    }

    pub fn register(&self, node: &Arc<RaftNode<M>>) {
        self.nodes.insert(node.id(), Arc::downgrade(node));
    }

    /// Drops all traffic to and from `id`.
    pub fn isolate(&self, id: u64) {
        self.isolated.insert(id);
    }

    pub fn heal(&self, id: u64) {
        self.isolated.remove(&id);
    }

    fn node(&self, from: u64, target: u64) -> RaftResult<Arc<RaftNode<M>>> {
        if self.isolated.contains(&from) || self.isolated.contains(&target) {
            return Err(RaftError::TransportError(format!(
                "Peer {} unreachable",
                target
            )));
        }
        self.nodes
            .get(&target)
            .and_then(|node| node.upgrade())
            .ok_or_else(|| RaftError::TransportError(format!("Peer {} not found", target)))
    }
}

#[async_trait]
impl<M: StateMachine> RaftTransport for LocalTransport<M> {
    async fn send_append_entries(
        &self,
        target: u64,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        let node = self.node(req.leader_id, target)?;
        Ok(node.handle_append_entries(req).await)
    }

    async fn send_request_vote(
        &self,
        target: u64,
        req: RequestVoteRequest,
    ) -> RaftResult<RequestVoteResponse> {
        let node = self.node(req.candidate_id, target)?;
        Ok(node.handle_request_vote(req).await)
    }

    async fn send_install_snapshot(
        &self,
        target: u64,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        let node = self.node(req.leader_id, target)?;
        Ok(node.handle_install_snapshot(req).await)
    }
}
