//! Leader forwarding over the `storagepb.Forwarding` gRPC service.
//!
//! Storage errors cross the wire as status codes:
//!
//! | error                 | code                  |
//! |-----------------------|-----------------------|
//! | NotFound              | NOT_FOUND             |
//! | CasFailure            | ABORTED               |
//! | WrongUid              | ALREADY_EXISTS        |
//! | Inconsistent          | FAILED_PRECONDITION   |
//! | GroupVersionMismatch  | OUT_OF_RANGE + details|
//! | anything else         | INTERNAL              |

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status};
use tracing::debug;

use crate::resource::UnversionedType;
use crate::resourcepb::{Id, Resource, Tenancy};
use crate::storage::raft::{Handle, RaftBackend};
use crate::storage::{StorageError, StorageResult};
use crate::storagepb::forwarding_client::ForwardingClient;
use crate::storagepb::forwarding_server::Forwarding;
use crate::storagepb::{
    DeleteRequest, DeleteResponse, GroupVersionMismatchErrorDetails, ListRequest, ListResponse,
    ReadRequest, ReadResponse, WriteRequest, WriteResponse,
};

/// Converts a storage error to its wire status.
pub fn status_from_error(err: StorageError) -> Status {
    match err {
        StorageError::NotFound => Status::not_found(err.to_string()),
        StorageError::CasFailure => Status::aborted(err.to_string()),
        StorageError::WrongUid => Status::already_exists(err.to_string()),
        StorageError::Inconsistent => Status::failed_precondition(err.to_string()),
        StorageError::GroupVersionMismatch {
            ref requested_type,
            ref stored,
        } => {
            let details = GroupVersionMismatchErrorDetails {
                requested_type: Some(requested_type.clone()),
                stored: Some((**stored).clone()),
            };
            Status::with_details(
                Code::OutOfRange,
                err.to_string(),
                Bytes::from(details.encode_to_vec()),
            )
        }
        other => Status::internal(other.to_string()),
    }
}

/// Converts a forwarded status back to the storage error it carries.
pub fn error_from_status(status: &Status) -> StorageError {
    match status.code() {
        Code::NotFound => StorageError::NotFound,
        Code::Aborted => StorageError::CasFailure,
        Code::AlreadyExists => StorageError::WrongUid,
        Code::FailedPrecondition => StorageError::Inconsistent,
        Code::OutOfRange => match GroupVersionMismatchErrorDetails::decode(status.details()) {
            Ok(details) => StorageError::GroupVersionMismatch {
                requested_type: details.requested_type.unwrap_or_default(),
                stored: Box::new(details.stored.unwrap_or_default()),
            },
            Err(e) => StorageError::Internal(format!(
                "out of range without group version details: {}",
                e
            )),
        },
        // The leader could not be reached.
        Code::Unavailable => StorageError::Inconsistent,
        _ => StorageError::Internal(status.message().to_string()),
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, Status> {
    value.ok_or_else(|| Status::invalid_argument(format!("{} is required", field)))
}

/// Server side: runs forwarded requests on the local leader path.
pub struct ForwardingService {
    backend: Arc<RaftBackend>,
}

impl ForwardingService {
    pub fn new(backend: Arc<RaftBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl Forwarding for ForwardingService {
    async fn write(
        &self,
        request: Request<WriteRequest>,
    ) -> Result<Response<WriteResponse>, Status> {
        let resource = required(request.into_inner().resource, "resource")?;
        let resource = self
            .backend
            .leader_write(resource)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(WriteResponse {
            resource: Some(resource),
        }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        let id = required(req.id, "id")?;
        self.backend
            .leader_delete(&id, &req.version)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(DeleteResponse {}))
    }

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadResponse>, Status> {
        let id = required(request.into_inner().id, "id")?;
        let resource = self
            .backend
            .leader_read(&id)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(ReadResponse {
            resource: Some(resource),
        }))
    }

    async fn list(&self, request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        let req = request.into_inner();
        let resource_type = UnversionedType::from(&required(req.r#type, "type")?);
        let tenancy = required(req.tenancy, "tenancy")?;
        let resources = self
            .backend
            .leader_list(&resource_type, &tenancy, &req.name_prefix)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(ListResponse { resources }))
    }
}

/// Client side: forwards to the leader over a cached connection.
pub struct LeaderForwarder {
    handle: Arc<dyn Handle>,
    client: Mutex<Option<ForwardingClient<Channel>>>,
}

impl LeaderForwarder {
    pub fn new(handle: Arc<dyn Handle>) -> Self {
        Self {
            handle,
            client: Mutex::new(None),
        }
    }

    /// Forgets the cached connection; the next call dials the leader again.
    pub fn invalidate(&self) {
        *self.client.lock() = None;
    }

    async fn client(&self) -> StorageResult<ForwardingClient<Channel>> {
        let cached = self.client.lock().clone();
        if let Some(client) = cached {
            return Ok(client);
        }

        let channel = self.handle.dial_leader().await?;
        let client = ForwardingClient::new(channel)
            .max_decoding_message_size(usize::MAX)
            .max_encoding_message_size(usize::MAX);
        *self.client.lock() = Some(client.clone());
        Ok(client)
    }

    fn forward_error(&self, status: Status) -> StorageError {
        let err = error_from_status(&status);
        if err == StorageError::Inconsistent {
            debug!(code = ?status.code(), "Leader forwarding refused, dropping connection");
            self.invalidate();
        }
        err
    }

    pub async fn read(&self, id: &Id) -> StorageResult<Resource> {
        let mut client = self.client().await?;
        let response = client
            .read(ReadRequest {
                id: Some(id.clone()),
            })
            .await
            .map_err(|s| self.forward_error(s))?;
        response
            .into_inner()
            .resource
            .ok_or_else(|| StorageError::Internal("read response missing resource".into()))
    }

    pub async fn write(&self, resource: Resource) -> StorageResult<Resource> {
        let mut client = self.client().await?;
        let response = client
            .write(WriteRequest {
                resource: Some(resource),
            })
            .await
            .map_err(|s| self.forward_error(s))?;
        response
            .into_inner()
            .resource
            .ok_or_else(|| StorageError::Internal("write response missing resource".into()))
    }

    pub async fn delete(&self, id: &Id, version: &str) -> StorageResult<()> {
        let mut client = self.client().await?;
        client
            .delete(DeleteRequest {
                id: Some(id.clone()),
                version: version.to_string(),
            })
            .await
            .map_err(|s| self.forward_error(s))?;
        Ok(())
    }

    pub async fn list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        let mut client = self.client().await?;
        let response = client
            .list(ListRequest {
                r#type: Some(crate::resourcepb::Type {
                    group: resource_type.group.clone(),
                    group_version: String::new(),
                    kind: resource_type.kind.clone(),
                }),
                tenancy: Some(tenancy.clone()),
                name_prefix: name_prefix.to_string(),
            })
            .await
            .map_err(|s| self.forward_error(s))?;
        Ok(response.into_inner().resources)
    }
}
