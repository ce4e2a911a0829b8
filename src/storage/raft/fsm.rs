//! Raft state machine over the resource store.

use std::sync::Arc;

use prost::Message;
use tracing::debug;

use crate::raft::{RaftError, RaftResult, StateMachine};
use crate::resourcepb::Resource;
use crate::storage::{StorageError, StorageResult, Store};
use crate::storagepb::{
    log, log_response, DeleteResponse, Log, LogResponse, LogType, WriteResponse,
};

/// Applies committed `storagepb.Log` entries to the store.
///
/// The Raft index becomes the store's event index, so every replica
/// assigns the same versions.
pub struct Fsm {
    store: Arc<Store>,
}

impl Fsm {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

impl StateMachine for Fsm {
    type Response = StorageResult<LogResponse>;

    fn apply(&self, index: u64, data: &[u8]) -> StorageResult<LogResponse> {
        let entry = Log::decode(data)
            .map_err(|e| StorageError::Internal(format!("failed to decode log entry: {}", e)))?;

        let response = match (LogType::try_from(entry.r#type), entry.request) {
            (Ok(LogType::Write), Some(log::Request::Write(req))) => {
                let resource = req.resource.ok_or_else(|| {
                    StorageError::InvalidArgument("write log entry has no resource".into())
                })?;
                let written = self.store.write_cas_at(index, resource)?;
                log_response::Response::Write(WriteResponse {
                    resource: Some(written),
                })
            }
            (Ok(LogType::Delete), Some(log::Request::Delete(req))) => {
                let id = req.id.ok_or_else(|| {
                    StorageError::InvalidArgument("delete log entry has no id".into())
                })?;
                self.store.delete_cas_at(index, &id, &req.version)?;
                log_response::Response::Delete(DeleteResponse {})
            }
            (log_type, _) => {
                return Err(StorageError::Internal(format!(
                    "malformed log entry at index {} (type {:?})",
                    index, log_type
                )))
            }
        };

        Ok(LogResponse {
            response: Some(response),
        })
    }

    /// Length-delimited `Resource` messages, one per stored resource.
    fn snapshot(&self) -> RaftResult<Vec<u8>> {
        let mut buf = Vec::new();
        for resource in self.store.snapshot() {
            resource
                .encode_length_delimited(&mut buf)
                .map_err(|e| RaftError::StateMachineError(e.to_string()))?;
        }
        Ok(buf)
    }

    fn restore(&self, data: &[u8]) -> RaftResult<()> {
        let mut restoration = self.store.restore();
        let mut buf = data;
        let mut count = 0usize;

        while !buf.is_empty() {
            let applied = Resource::decode_length_delimited(&mut buf)
                .map_err(|e| RaftError::StateMachineError(e.to_string()))
                .and_then(|resource| {
                    restoration
                        .apply(resource)
                        .map_err(|e| RaftError::StateMachineError(e.to_string()))
                });
            if let Err(e) = applied {
                restoration.abort();
                return Err(e);
            }
            count += 1;
        }

        restoration.commit();
        debug!(count, "Restored store from snapshot");
        Ok(())
    }
}
