//! # resourced: a typed resource storage engine
//!
//! resourced stores strongly-typed, protobuf-encoded resources identified by
//! group/version/kind and a tenancy scope. It provides:
//!
//! - **CAS semantics**: every write and delete is a check-and-set against an
//!   opaque, storage-assigned version
//! - **Indexed store**: prefix and wildcard list queries plus an owner index
//! - **Watches**: ordered, filtered change streams with an initial snapshot
//! - **Raft replication**: a durable backend that forwards writes and
//!   consistent reads from followers to the leader
//! - **Resource service**: the gRPC surface with retry-on-conflict writes
//!
//! # Usage
//!
//! ```bash
//! resourced --name node1 --node-id 1 \
//!      --listen-client-url http://127.0.0.1:8500 \
//!      --listen-peer-url http://127.0.0.1:8300 \
//!      --initial-cluster 1=http://127.0.0.1:8300
//! ```

// Re-export generated protobuf types
pub mod resourcepb {
    tonic::include_proto!("resourcepb");
}

pub mod storagepb {
    tonic::include_proto!("storagepb");
}

pub mod raftpb {
    tonic::include_proto!("raftpb");
}

// Core modules
pub mod api;
pub mod raft;
pub mod resource;
pub mod server;
pub mod storage;
pub mod watch;

// Re-export main types at crate root for convenience
pub use resource::{Registration, Registry, UnversionedType};
pub use server::{ResourcedServer, ServerConfig};
pub use storage::{Backend, InMemBackend, RaftBackend, Store, StorageError};
pub use watch::{Watch, WatchHub};
