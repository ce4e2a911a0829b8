pub mod raft_internal_service;
pub mod resource_service;

pub use raft_internal_service::RaftInternalService;
pub use resource_service::{ResourceService, CONSISTENCY_HEADER, CONSISTENT_MODE};
