//! Raft consensus used to replicate the resource store.
//!
//! The node drives elections, log replication and commitment, and applies
//! committed entries to a `StateMachine` in log order. Proposers wait for
//! their own entry to apply and receive the state machine's response.

pub mod config;
pub mod log;
pub mod node;
pub mod state;
pub mod transport;

pub use config::{PeerConfig, RaftConfig};
pub use log::{EntryType, HardState, LogEntry, RaftLog};
pub use node::RaftNode;
pub use state::{RaftRole, RaftState};
pub use transport::{GrpcTransport, LocalTransport, RaftTransport};

use crate::raftpb::{AppendEntriesResponse, InstallSnapshotResponse};
use thiserror::Error;

/// Replication results handed back to the node's event loop.
#[derive(Debug, Clone)]
pub enum RaftMessage {
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshotResponse {
        last_included_index: u64,
        response: InstallSnapshotResponse,
    },
    /// The peer could not be reached; only clears the in-flight marker.
    Unreachable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("log error: {0}")]
    LogError(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("state machine error: {0}")]
    StateMachineError(String),

    #[error("not the leader")]
    NotLeader,

    #[error("leadership lost before the entry was applied")]
    LeadershipLost,

    #[error("timed out waiting for the log to apply")]
    Timeout,
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// The replicated state machine.
///
/// `apply` is called exactly once per committed command, in log order, and
/// never concurrently with `snapshot` or `restore`.
pub trait StateMachine: Send + Sync + 'static {
    type Response: Send + 'static;

    fn apply(&self, index: u64, data: &[u8]) -> Self::Response;

    fn snapshot(&self) -> RaftResult<Vec<u8>>;

    /// Replaces the whole state with a snapshot.
    fn restore(&self, data: &[u8]) -> RaftResult<()>;
}
