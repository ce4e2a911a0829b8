//! Raft-replicated backend.
//!
//! Every replica holds a full `Store`. Writes and deletes are encoded as
//! `storagepb.Log` entries and applied on all replicas through the `Fsm`, so
//! versions (the Raft index) match everywhere. Eventually consistent reads,
//! lists and watches are served from the local store; writes and consistent
//! reads run on the leader, and followers forward them there over the
//! `storagepb.Forwarding` service.

pub mod forwarding;
pub mod fsm;

pub use forwarding::{ForwardingService, LeaderForwarder};
pub use fsm::Fsm;

use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::raft::{RaftError, RaftNode};
use crate::resource::UnversionedType;
use crate::resourcepb::{Id, Resource, Tenancy};
use crate::storage::{Backend, StorageError, StorageResult, Store};
use crate::storagepb::{log, log_response, DeleteRequest, Log, LogResponse, LogType, WriteRequest};
use crate::watch::Watch;

/// The consensus operations the backend needs.
#[async_trait]
pub trait Handle: Send + Sync {
    /// Commits an encoded `Log` and returns the FSM's response.
    async fn apply(&self, msg: Vec<u8>) -> StorageResult<LogResponse>;

    fn is_leader(&self) -> bool;

    /// Returns once this node is confirmed leader and has applied everything
    /// committed before the call.
    async fn ensure_strong_consistency(&self) -> StorageResult<()>;

    /// Opens a connection to the current leader's peer address.
    async fn dial_leader(&self) -> StorageResult<Channel>;
}

fn from_raft_error(err: RaftError) -> StorageError {
    match err {
        RaftError::NotLeader | RaftError::LeadershipLost => StorageError::Inconsistent,
        other => StorageError::Internal(other.to_string()),
    }
}

#[async_trait]
impl Handle for RaftNode<Fsm> {
    async fn apply(&self, msg: Vec<u8>) -> StorageResult<LogResponse> {
        self.propose(msg).await.map_err(from_raft_error)?
    }

    fn is_leader(&self) -> bool {
        RaftNode::is_leader(self)
    }

    async fn ensure_strong_consistency(&self) -> StorageResult<()> {
        self.verify_leader().await.map_err(from_raft_error)?;
        self.barrier().await.map_err(from_raft_error)
    }

    async fn dial_leader(&self) -> StorageResult<Channel> {
        let address = self.leader_address().ok_or(StorageError::Inconsistent)?;
        dial(address).await
    }
}

/// An unreachable leader is reported as `Inconsistent` so callers retry once
/// leadership settles.
async fn dial(address: String) -> StorageResult<Channel> {
    debug!(leader = %address, "Dialing leader");
    let endpoint = Endpoint::from_shared(address.clone())
        .map_err(|e| StorageError::Internal(format!("invalid leader address: {}", e)))?;
    endpoint.connect().await.map_err(|e| {
        warn!(leader = %address, error = %e, "Failed to dial leader");
        StorageError::Inconsistent
    })
}

/// Backend over a local store kept in sync by Raft.
pub struct RaftBackend {
    handle: Arc<dyn Handle>,
    store: Arc<Store>,
    forwarder: LeaderForwarder,
}

impl RaftBackend {
    pub fn new(handle: Arc<dyn Handle>, store: Arc<Store>) -> Self {
        Self {
            forwarder: LeaderForwarder::new(handle.clone()),
            handle,
            store,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn is_leader(&self) -> bool {
        self.handle.is_leader()
    }

    /// Drops the cached leader connection. Called on every leadership change.
    pub fn leader_changed(&self) {
        self.forwarder.invalidate();
    }

    pub(crate) async fn leader_read(&self, id: &Id) -> StorageResult<Resource> {
        self.handle.ensure_strong_consistency().await?;
        self.store.read(id)
    }

    pub(crate) async fn leader_list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        self.handle.ensure_strong_consistency().await?;
        self.store.list(resource_type, tenancy, name_prefix)
    }

    pub(crate) async fn leader_write(&self, resource: Resource) -> StorageResult<Resource> {
        if !self.handle.is_leader() {
            return Err(StorageError::Inconsistent);
        }

        let entry = Log {
            r#type: LogType::Write as i32,
            request: Some(log::Request::Write(WriteRequest {
                resource: Some(resource),
            })),
        };
        match self.handle.apply(entry.encode_to_vec()).await?.response {
            Some(log_response::Response::Write(rsp)) => rsp
                .resource
                .ok_or_else(|| StorageError::Internal("write response missing resource".into())),
            other => Err(StorageError::Internal(format!(
                "unexpected response to write: {:?}",
                other
            ))),
        }
    }

    pub(crate) async fn leader_delete(&self, id: &Id, version: &str) -> StorageResult<()> {
        if !self.handle.is_leader() {
            return Err(StorageError::Inconsistent);
        }

        let entry = Log {
            r#type: LogType::Delete as i32,
            request: Some(log::Request::Delete(DeleteRequest {
                id: Some(id.clone()),
                version: version.to_string(),
            })),
        };
        match self.handle.apply(entry.encode_to_vec()).await?.response {
            Some(log_response::Response::Delete(_)) => Ok(()),
            other => Err(StorageError::Internal(format!(
                "unexpected response to delete: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Backend for RaftBackend {
    async fn read(&self, id: &Id) -> StorageResult<Resource> {
        self.store.read(id)
    }

    async fn read_consistent(&self, id: &Id) -> StorageResult<Resource> {
        if self.handle.is_leader() {
            return self.leader_read(id).await;
        }
        self.forwarder.read(id).await
    }

    async fn write_cas(&self, resource: Resource) -> StorageResult<Resource> {
        if self.handle.is_leader() {
            return self.leader_write(resource).await;
        }
        self.forwarder.write(resource).await
    }

    async fn delete_cas(&self, id: &Id, version: &str) -> StorageResult<()> {
        if self.handle.is_leader() {
            return self.leader_delete(id, version).await;
        }
        self.forwarder.delete(id, version).await
    }

    async fn list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        self.store.list(resource_type, tenancy, name_prefix)
    }

    async fn list_consistent(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        if self.handle.is_leader() {
            return self.leader_list(resource_type, tenancy, name_prefix).await;
        }
        self.forwarder
            .list(resource_type, tenancy, name_prefix)
            .await
    }

    async fn watch_list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Watch> {
        self.store.watch_list(resource_type, tenancy, name_prefix)
    }

    async fn owner_references(&self, id: &Id) -> StorageResult<Vec<Id>> {
        self.store.owner_references(id)
    }
}
