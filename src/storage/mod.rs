//! Storage engine for typed resources.
//!
//! The storage module defines the `Backend` contract consumed by the resource
//! service and its two implementations:
//!
//! 1. **InMemBackend**: the indexed `Store` exposed directly, no durability
//! 2. **RaftBackend**: the same store kept identical on every replica by
//!    applying a replicated Raft log, with leader forwarding for writes and
//!    consistent reads
//!
//! Every mutation is a CAS operation:
//! - Versions are opaque tokens assigned by storage and change on every write
//! - Uids identify one incarnation of a name and never change
//! - List and watch queries match on group and kind only; GroupVersion is
//!   checked on reads and left to the caller for lists

pub mod index;
pub mod inmem;
pub mod raft;
pub mod store;

pub use index::{id_key, owner_key, query_prefix};
pub use inmem::InMemBackend;
pub use raft::{Handle, RaftBackend};
pub use store::{Restoration, Snapshot, Store};

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::UnversionedType;
use crate::resourcepb::{Id, Resource, Tenancy, Type};
use crate::watch::Watch;

/// Storage engine errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("resource not found")]
    NotFound,

    /// The given version does not match the stored one.
    #[error("CAS operation failed because the given version doesn't match what is stored")]
    CasFailure,

    #[error("uid doesn't match what is stored")]
    WrongUid,

    /// The operation needs the leader (or a quorum) and this node cannot
    /// guarantee it.
    #[error("cannot satisfy consistency requirement: this node is not the leader or cannot reach a quorum")]
    Inconsistent,

    #[error(
        "resource was requested with GroupVersion {:?}, but stored with GroupVersion {:?}",
        .requested_type.group_version,
        stored_group_version(.stored)
    )]
    GroupVersionMismatch {
        requested_type: Type,
        stored: Box<Resource>,
    },

    #[error("watch closed")]
    WatchClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether the error is one of the CAS conflict classes.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::CasFailure | StorageError::WrongUid)
    }
}

fn stored_group_version(stored: &Resource) -> String {
    stored
        .id
        .as_ref()
        .and_then(|id| id.r#type.as_ref())
        .map(|ty| ty.group_version.clone())
        .unwrap_or_default()
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Read consistency requested by a caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Serve from local state, which may lag the leader.
    #[default]
    Eventual,
    /// Observe every write acknowledged before the read began.
    Strong,
}

/// The contract every storage implementation satisfies.
///
/// `write_cas` takes the expected version from `resource.version`: empty means
/// the resource must not exist yet.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn read(&self, id: &Id) -> StorageResult<Resource>;

    async fn read_consistent(&self, id: &Id) -> StorageResult<Resource>;

    async fn write_cas(&self, resource: Resource) -> StorageResult<Resource>;

    /// Deleting an absent resource, or one whose uid differs, is a no-op.
    async fn delete_cas(&self, id: &Id, version: &str) -> StorageResult<()>;

    async fn list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>>;

    /// List as seen by the leader.
    async fn list_consistent(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        self.list(resource_type, tenancy, name_prefix).await
    }

    async fn watch_list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Watch>;

    /// Ids of stored resources whose owner is exactly `id`, uid included.
    async fn owner_references(&self, id: &Id) -> StorageResult<Vec<Id>>;

    async fn read_with(&self, consistency: ReadConsistency, id: &Id) -> StorageResult<Resource> {
        match consistency {
            ReadConsistency::Eventual => self.read(id).await,
            ReadConsistency::Strong => self.read_consistent(id).await,
        }
    }
}
