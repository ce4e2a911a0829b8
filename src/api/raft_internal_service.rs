use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::raft::{RaftNode, StateMachine};
use crate::raftpb::raft_internal_server::RaftInternal;
use crate::raftpb::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};

/// gRPC service that handles incoming Raft peer RPCs.
/// This is the server-side counterpart to GrpcTransport (the client).
pub struct RaftInternalService<M: StateMachine> {
    raft: Arc<RaftNode<M>>,
}

impl<M: StateMachine> RaftInternalService<M> {
    pub fn new(raft: Arc<RaftNode<M>>) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl<M: StateMachine> RaftInternal for RaftInternalService<M> {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let response = self.raft.handle_append_entries(request.into_inner()).await;
        Ok(Response::new(response))
    }

    async fn request_vote(
        &self,
        request: Request<RequestVoteRequest>,
    ) -> Result<Response<RequestVoteResponse>, Status> {
        let response = self.raft.handle_request_vote(request.into_inner()).await;
        Ok(Response::new(response))
    }

    async fn install_snapshot(
        &self,
        request: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.last_included_index == 0 {
            return Err(Status::invalid_argument("snapshot must cover at least one entry"));
        }
        debug!(
            leader = req.leader_id,
            last_included_index = req.last_included_index,
            bytes = req.data.len(),
            "Received snapshot"
        );
        let response = self.raft.handle_install_snapshot(req).await;
        Ok(Response::new(response))
    }
}
