//! The `resourcepb.ResourceService` gRPC surface.
//!
//! Every write is a CAS at the storage layer. When the caller does not pass a
//! version the service reads the current one itself and retries the
//! read-modify-write cycle on conflict, so plain "apply" style writes behave
//! like last-writer-wins while controllers passing a version keep exact CAS
//! semantics.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{debug, trace};

use crate::resource::{
    equal_id, equal_status_map, id_string, is_valid_generation, new_generation, new_uid,
    type_string, Registration, Registry, Scope, UnversionedType,
};
use crate::resourcepb::resource_service_server::ResourceService as ResourceServiceRpc;
use crate::resourcepb::{
    Condition, DeleteRequest, DeleteResponse, Id, ListByOwnerRequest, ListByOwnerResponse,
    ListRequest, ListResponse, ReadRequest, ReadResponse, Reference, Resource,
    Status as ResourceStatus, Type, WatchEvent, WatchListRequest, WriteRequest, WriteResponse,
    WriteStatusRequest, WriteStatusResponse,
};
use crate::storage::{Backend, ReadConsistency, StorageError};

/// Request metadata key selecting the read consistency.
pub const CONSISTENCY_HEADER: &str = "x-resource-consistency-mode";

/// Value of [`CONSISTENCY_HEADER`] asking for a strongly consistent read.
pub const CONSISTENT_MODE: &str = "consistent";

const MAX_CAS_ATTEMPTS: u32 = 5;
const BACKOFF_MIN: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: Duration = Duration::from_millis(75);
const BACKOFF_JITTER_PERCENT: u64 = 50;

const WATCH_BUFFER: usize = 128;

const USE_WRITE_STATUS: &str = "resource.status can only be set using the WriteStatus endpoint";

/// Failure of a single CAS attempt. Storage errors stay typed so the retry
/// loop can tell conflicts apart; everything else is already a gRPC status.
#[derive(Debug)]
enum AttemptError {
    Storage(StorageError),
    Rejected(Status),
}

impl From<StorageError> for AttemptError {
    fn from(err: StorageError) -> Self {
        AttemptError::Storage(err)
    }
}

impl From<Status> for AttemptError {
    fn from(status: Status) -> Self {
        AttemptError::Rejected(status)
    }
}

impl AttemptError {
    fn is_cas_failure(&self) -> bool {
        matches!(self, AttemptError::Storage(StorageError::CasFailure))
    }

    fn into_status(self, action: &str) -> Status {
        match self {
            AttemptError::Rejected(status) => status,
            AttemptError::Storage(err) => storage_status(err, action),
        }
    }
}

/// Maps storage errors that reach a client to gRPC statuses.
fn storage_status(err: StorageError, action: &str) -> Status {
    match err {
        StorageError::NotFound => Status::not_found(err.to_string()),
        StorageError::CasFailure => Status::aborted(err.to_string()),
        StorageError::WrongUid => Status::failed_precondition(err.to_string()),
        StorageError::Inconsistent => Status::unavailable(err.to_string()),
        StorageError::GroupVersionMismatch { .. } => Status::invalid_argument(err.to_string()),
        StorageError::WatchClosed => Status::aborted("watch closed by the storage layer"),
        other => Status::internal(format!("failed to {}: {}", action, other)),
    }
}

fn consistency(metadata: &MetadataMap) -> ReadConsistency {
    match metadata
        .get(CONSISTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(CONSISTENT_MODE) => ReadConsistency::Strong,
        _ => ReadConsistency::Eventual,
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, Status> {
    value.ok_or_else(|| Status::invalid_argument(format!("{} is required", field)))
}

fn validate_id(id: &Id, field: &str) -> Result<(), Status> {
    if id.r#type.is_none() {
        return Err(Status::invalid_argument(format!("{}.type is required", field)));
    }
    if id.tenancy.is_none() {
        return Err(Status::invalid_argument(format!(
            "{}.tenancy is required",
            field
        )));
    }
    if id.name.is_empty() {
        return Err(Status::invalid_argument(format!("{}.name is required", field)));
    }
    Ok(())
}

fn validate_reference(reference: &Reference, field: &str) -> Result<(), Status> {
    if reference.r#type.is_none() {
        return Err(Status::invalid_argument(format!("{}.type is required", field)));
    }
    if reference.tenancy.is_none() {
        return Err(Status::invalid_argument(format!(
            "{}.tenancy is required",
            field
        )));
    }
    if reference.name.is_empty() {
        return Err(Status::invalid_argument(format!("{}.name is required", field)));
    }
    Ok(())
}

fn validate_condition(condition: &Condition, field: &str) -> Result<(), Status> {
    if condition.r#type.is_empty() {
        return Err(Status::invalid_argument(format!("{}.type is required", field)));
    }
    if let Some(reference) = &condition.resource {
        validate_reference(reference, &format!("{}.resource", field))?;
    }
    Ok(())
}

fn check_scope(registration: &Registration, id: &Id) -> Result<(), Status> {
    let namespace = id
        .tenancy
        .as_ref()
        .map(|t| t.namespace.as_str())
        .unwrap_or_default();
    if registration.scope == Scope::Partition && !namespace.is_empty() {
        return Err(Status::invalid_argument(format!(
            "partition scoped resource {} cannot have a namespace. got: {}",
            type_string(&registration.resource_type),
            namespace
        )));
    }
    Ok(())
}

fn same_group_version(res: &Resource, ty: &Type) -> bool {
    res.id
        .as_ref()
        .and_then(|id| id.r#type.as_ref())
        .map(|stored| stored.group_version == ty.group_version)
        .unwrap_or(false)
}

/// `factor * 2^(failures - 1)`, clamped to `[BACKOFF_MIN, BACKOFF_MAX]`.
fn backoff_base(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(31);
    BACKOFF_FACTOR
        .saturating_mul(1u32 << doublings)
        .clamp(BACKOFF_MIN, BACKOFF_MAX)
}

/// Exponential backoff plus up to 50% jitter.
fn backoff_delay(failures: u32) -> Duration {
    let base = backoff_base(failures);
    let spread = base.as_millis() as u64 * BACKOFF_JITTER_PERCENT / 100;
    let jitter = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..spread)
    };
    base + Duration::from_millis(jitter)
}

/// Runs `attempt` once when the caller supplied a version. Otherwise retries
/// CAS failures with backoff, up to `MAX_CAS_ATTEMPTS` attempts in total.
async fn retry_cas<T, F, Fut>(version: &str, mut attempt: F) -> Result<T, AttemptError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    if !version.is_empty() {
        return attempt().await;
    }

    let mut failures = 0;
    loop {
        match attempt().await {
            Err(err) if err.is_cas_failure() && failures + 1 < MAX_CAS_ATTEMPTS => {
                failures += 1;
                trace!(failure_count = failures, "Retrying failed CAS operation");
                tokio::time::sleep(backoff_delay(failures)).await;
            }
            result => return result,
        }
    }
}

/// gRPC resource service over any storage backend.
pub struct ResourceService {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
}

impl ResourceService {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<Registry>) -> Self {
        Self { backend, registry }
    }

    fn resolve(&self, ty: &Type) -> Result<Registration, Status> {
        self.registry
            .resolve(ty)
            .map_err(|e| Status::invalid_argument(e.to_string()))
    }

    fn validate_write(&self, req: &WriteRequest) -> Result<(Resource, Registration), Status> {
        let resource = required(req.resource.clone(), "resource")?;
        let id = required(resource.id.as_ref(), "resource.id")?;
        validate_id(id, "resource.id")?;
        if let Some(owner) = &resource.owner {
            validate_id(owner, "resource.owner")?;
        }

        let registration = self.resolve(&crate::resource::id_type(id))?;
        check_scope(&registration, id)?;
        Ok((resource, registration))
    }

    /// Runs the registration's data check and hooks over the input.
    fn prepare(registration: &Registration, mut resource: Resource) -> Result<Resource, Status> {
        if registration.data_type.is_some() && resource.data.is_none() {
            return Err(Status::invalid_argument("resource.data is required"));
        }
        if let Err(got) = registration.check_data_type(&resource) {
            return Err(Status::invalid_argument(format!(
                "resource.data is of wrong type (expected={}, got={})",
                registration.data_type.as_deref().unwrap_or_default(),
                got
            )));
        }

        registration
            .run_mutate(&mut resource)
            .map_err(|e| Status::internal(format!("failed mutate hook: {}", e)))?;
        registration
            .run_validate(&resource)
            .map_err(Status::invalid_argument)?;
        Ok(resource)
    }

    /// One read-modify-write cycle of `Write`.
    async fn write_attempt(&self, request: &Resource) -> Result<Resource, AttemptError> {
        let mut input = request.clone();
        let id = input.id.clone().unwrap_or_default();

        // An eventual read is enough: a stale version fails the CAS and the
        // cycle is retried.
        let existing = match self.backend.read(&id).await {
            Ok(existing) => Some(existing),
            Err(StorageError::GroupVersionMismatch { stored, .. }) => Some(*stored),
            Err(StorageError::NotFound) => None,
            Err(err) => return Err(err.into()),
        };

        match existing {
            None => {
                if let Some(id) = input.id.as_mut() {
                    id.uid = new_uid();
                }
                if !input.status.is_empty() {
                    return Err(Status::invalid_argument(USE_WRITE_STATUS).into());
                }

                // Owners named without a uid resolve to the current
                // incarnation.
                if let Some(owner) = input.owner.clone().filter(|o| o.uid.is_empty()) {
                    match self.backend.read_consistent(&owner).await {
                        Ok(stored) => input.owner = stored.id,
                        Err(StorageError::NotFound) => {
                            return Err(
                                Status::invalid_argument("resource.owner does not exist").into()
                            )
                        }
                        Err(StorageError::GroupVersionMismatch { stored, .. }) => {
                            input.owner = stored.id
                        }
                        Err(err) => {
                            return Err(Status::internal(format!(
                                "failed to resolve owner: {}",
                                err
                            ))
                            .into())
                        }
                    }
                }
            }
            Some(existing) => {
                // The stored id carries the uid. Its type keeps the caller's
                // GroupVersion so writes can move a resource to a new schema.
                let mut stored_id = existing.id.clone().unwrap_or_default();
                stored_id.r#type = id.r#type.clone();
                input.id = Some(stored_id);

                if input.version.is_empty() {
                    input.version = existing.version.clone();
                }
                if input.version != existing.version {
                    return Err(StorageError::CasFailure.into());
                }

                if let (Some(owner), Some(stored_owner)) = (input.owner.as_mut(), &existing.owner)
                {
                    if owner.uid.is_empty() {
                        owner.uid = stored_owner.uid.clone();
                    }
                }
                if !equal_id(input.owner.as_ref(), existing.owner.as_ref()) {
                    return Err(Status::invalid_argument("owner cannot be changed").into());
                }

                if input.status.is_empty() {
                    input.status = existing.status.clone();
                } else if !equal_status_map(&input.status, &existing.status) {
                    return Err(Status::invalid_argument(USE_WRITE_STATUS).into());
                }
            }
        }

        input.generation = new_generation();
        Ok(self.backend.write_cas(input).await?)
    }

    fn validate_write_status(&self, req: &WriteStatusRequest) -> Result<Registration, Status> {
        let id = required(req.id.as_ref(), "id")?;
        validate_id(id, "id")?;
        if id.uid.is_empty() {
            return Err(Status::invalid_argument("id.uid is required"));
        }
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key is required"));
        }

        let status = required(req.status.as_ref(), "status")?;
        if status.observed_generation.is_empty() {
            return Err(Status::invalid_argument(
                "status.observed_generation is required",
            ));
        }
        if !is_valid_generation(&status.observed_generation) {
            return Err(Status::invalid_argument(
                "status.observed_generation is not valid",
            ));
        }
        if status.updated_at.is_some() {
            return Err(Status::invalid_argument(
                "status.updated_at is automatically set and cannot be provided",
            ));
        }
        for (i, condition) in status.conditions.iter().enumerate() {
            validate_condition(condition, &format!("status.conditions[{}]", i))?;
        }

        let registration = self.resolve(&crate::resource::id_type(id))?;
        check_scope(&registration, id)?;
        Ok(registration)
    }

    /// One read-modify-write cycle of `WriteStatus`.
    async fn write_status_attempt(
        &self,
        id: &Id,
        version: &str,
        key: &str,
        status: &ResourceStatus,
    ) -> Result<Resource, AttemptError> {
        let not_found = || Status::not_found(format!("{} does not exist", id_string(id)));

        let mut resource = match self.backend.read(id).await {
            Ok(existing) => existing,
            Err(StorageError::GroupVersionMismatch { stored, .. }) => *stored,
            Err(StorageError::NotFound) => return Err(not_found().into()),
            Err(err) => return Err(err.into()),
        };

        let stored_uid = resource.id.as_ref().map(|i| i.uid.as_str());
        if stored_uid != Some(id.uid.as_str()) {
            return Err(not_found().into());
        }
        if !version.is_empty() && version != resource.version {
            return Err(StorageError::CasFailure.into());
        }

        let mut status = status.clone();
        status.updated_at = Some(prost_types::Timestamp::from(SystemTime::now()));
        resource.status.insert(key.to_string(), status);

        Ok(self.backend.write_cas(resource).await?)
    }

    /// Deleting something already gone succeeds. A version conflict is
    /// returned to the caller as is.
    async fn delete_once(&self, id: &Id, version: &str) -> Result<(), AttemptError> {
        let existing = match self.backend.read_consistent(id).await {
            Ok(existing) => existing,
            Err(StorageError::GroupVersionMismatch { stored, .. }) => *stored,
            Err(StorageError::NotFound) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let version = if version.is_empty() {
            existing.version.as_str()
        } else {
            version
        };
        let mut delete_id = id.clone();
        if delete_id.uid.is_empty() {
            delete_id.uid = existing.id.as_ref().map(|i| i.uid.clone()).unwrap_or_default();
        }

        Ok(self.backend.delete_cas(&delete_id, version).await?)
    }
}

#[tonic::async_trait]
impl ResourceServiceRpc for ResourceService {
    type WatchListStream = ReceiverStream<Result<WatchEvent, Status>>;

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadResponse>, Status> {
        let consistency = consistency(request.metadata());
        let id = required(request.into_inner().id, "id")?;
        validate_id(&id, "id")?;
        self.resolve(&crate::resource::id_type(&id))?;

        let resource = self
            .backend
            .read_with(consistency, &id)
            .await
            .map_err(|e| storage_status(e, "read resource"))?;
        Ok(Response::new(ReadResponse {
            resource: Some(resource),
        }))
    }

    async fn write(
        &self,
        request: Request<WriteRequest>,
    ) -> Result<Response<WriteResponse>, Status> {
        let req = request.into_inner();
        let (resource, registration) = self.validate_write(&req)?;
        let resource = Self::prepare(&registration, resource)?;

        let written = retry_cas(&resource.version, || self.write_attempt(&resource))
            .await
            .map_err(|e| e.into_status("write resource"))?;

        debug!(
            id = %written.id.as_ref().map(id_string).unwrap_or_default(),
            version = %written.version,
            "Wrote resource"
        );
        Ok(Response::new(WriteResponse {
            resource: Some(written),
        }))
    }

    async fn write_status(
        &self,
        request: Request<WriteStatusRequest>,
    ) -> Result<Response<WriteStatusResponse>, Status> {
        let req = request.into_inner();
        self.validate_write_status(&req)?;
        let id = req.id.unwrap_or_default();
        let status = req.status.unwrap_or_default();

        let written = retry_cas(&req.version, || {
            self.write_status_attempt(&id, &req.version, &req.key, &status)
        })
        .await
        .map_err(|e| e.into_status("write status"))?;

        debug!(id = %id_string(&id), key = %req.key, "Wrote resource status");
        Ok(Response::new(WriteStatusResponse {
            resource: Some(written),
        }))
    }

    async fn list(&self, request: Request<ListRequest>) -> Result<Response<ListResponse>, Status> {
        let consistency = consistency(request.metadata());
        let req = request.into_inner();
        let ty = required(req.r#type, "type")?;
        let tenancy = required(req.tenancy, "tenancy")?;
        self.resolve(&ty)?;

        let unversioned = UnversionedType::from(&ty);
        let resources = match consistency {
            ReadConsistency::Eventual => {
                self.backend
                    .list(&unversioned, &tenancy, &req.name_prefix)
                    .await
            }
            ReadConsistency::Strong => {
                self.backend
                    .list_consistent(&unversioned, &tenancy, &req.name_prefix)
                    .await
            }
        }
        .map_err(|e| storage_status(e, "list resources"))?;

        let resources = resources
            .into_iter()
            .filter(|res| same_group_version(res, &ty))
            .collect();
        Ok(Response::new(ListResponse { resources }))
    }

    async fn list_by_owner(
        &self,
        request: Request<ListByOwnerRequest>,
    ) -> Result<Response<ListByOwnerResponse>, Status> {
        let consistency = consistency(request.metadata());
        let owner = required(request.into_inner().owner, "owner")?;
        validate_id(&owner, "owner")?;
        if owner.uid.is_empty() {
            return Err(Status::invalid_argument("owner.uid is required"));
        }

        let ids = self
            .backend
            .owner_references(&owner)
            .await
            .map_err(|e| storage_status(e, "list owner references"))?;

        let mut resources = Vec::with_capacity(ids.len());
        for id in ids {
            match self.backend.read_with(consistency, &id).await {
                Ok(resource) => resources.push(resource),
                // Deleted since the index was read.
                Err(StorageError::NotFound) => {}
                Err(err) => return Err(storage_status(err, "read owned resource")),
            }
        }
        Ok(Response::new(ListByOwnerResponse { resources }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        let id = required(req.id, "id")?;
        validate_id(&id, "id")?;
        let registration = self.resolve(&crate::resource::id_type(&id))?;
        check_scope(&registration, &id)?;

        self.delete_once(&id, &req.version)
            .await
            .map_err(|e| e.into_status("delete resource"))?;

        debug!(id = %id_string(&id), "Deleted resource");
        Ok(Response::new(DeleteResponse {}))
    }

    async fn watch_list(
        &self,
        request: Request<WatchListRequest>,
    ) -> Result<Response<Self::WatchListStream>, Status> {
        let req = request.into_inner();
        let ty = required(req.r#type, "type")?;
        let tenancy = required(req.tenancy, "tenancy")?;
        self.resolve(&ty)?;

        let mut watch = self
            .backend
            .watch_list(&UnversionedType::from(&ty), &tenancy, &req.name_prefix)
            .await
            .map_err(|e| storage_status(e, "start watch"))?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = watch.next() => event,
                };
                match event {
                    Ok(event) => {
                        let wanted = event
                            .resource
                            .as_ref()
                            .map(|res| same_group_version(res, &ty))
                            .unwrap_or(false);
                        if wanted && tx.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(storage_status(err, "watch resources"))).await;
                        break;
                    }
                }
            }
            debug!(resource_type = %type_string(&ty), "Watch stream ended");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
