//! Non-durable backend over a single local `Store`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::resource::UnversionedType;
use crate::resourcepb::{Id, Resource, Tenancy};
use crate::storage::{Backend, StorageResult, Store};
use crate::watch::Watch;

/// Backend that serves everything from one in-process store. Every read is
/// trivially strongly consistent.
#[derive(Clone)]
pub struct InMemBackend {
    store: Arc<Store>,
}

impl InMemBackend {
    pub fn new() -> Self {
        Self::with_store(Store::new())
    }

    pub fn with_store(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

impl Default for InMemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemBackend {
    async fn read(&self, id: &Id) -> StorageResult<Resource> {
        self.store.read(id)
    }

    async fn read_consistent(&self, id: &Id) -> StorageResult<Resource> {
        self.store.read(id)
    }

    async fn write_cas(&self, resource: Resource) -> StorageResult<Resource> {
        self.store.write_cas(resource)
    }

    async fn delete_cas(&self, id: &Id, version: &str) -> StorageResult<()> {
        self.store.delete_cas(id, version)
    }

    async fn list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        self.store.list(resource_type, tenancy, name_prefix)
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
