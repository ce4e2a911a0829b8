//! In-process indexed resource table.
//!
//! The store keeps:
//! 1. The resources, ordered by `id_key` so list queries are prefix scans
//! 2. An owner index from owner (uid included) to the keys it owns
//! 3. A global event index, bumped by every mutation and used as the version
//!
//! Mutations publish to the `WatchHub` while the write lock is still held,
//! which is what gives watchers the global commit order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::resource::{id_string, is_wildcard_tenancy, UnversionedType};
use crate::resourcepb::{Id, Resource, Tenancy};
use crate::storage::{id_key, owner_key, query_prefix, StorageError, StorageResult};
use crate::watch::{Event, Operation, Query, Watch, WatchHub};

#[derive(Default)]
struct Table {
    index: u64,
    resources: BTreeMap<Vec<u8>, Resource>,
    owners: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
}

impl Table {
    fn link_owner(&mut self, key: &[u8], res: &Resource) {
        if let Some(owner) = res.owner.as_ref() {
            self.owners
                .entry(owner_key(owner))
                .or_default()
                .insert(key.to_vec());
        }
    }

    fn unlink_owner(&mut self, key: &[u8], res: &Resource) {
        let Some(owner) = res.owner.as_ref() else {
            return;
        };
        let owner = owner_key(owner);
        if let Some(owned) = self.owners.get_mut(&owner) {
            owned.remove(key);
            if owned.is_empty() {
                self.owners.remove(&owner);
            }
        }
    }

    fn insert(&mut self, key: Vec<u8>, res: Resource) {
        if let Some(old) = self.resources.remove(&key) {
            self.unlink_owner(&key, &old);
        }
        self.link_owner(&key, &res);
        self.resources.insert(key, res);
    }

    fn scan(&self, query: &Query) -> Vec<Resource> {
        let prefix = query_prefix(&query.resource_type, &query.tenancy, &query.name_prefix);
        self.resources
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, res)| query.matches(res))
            .map(|(_, res)| res.clone())
            .collect()
    }

    /// Index assigned to the next mutation. `at` is a floor supplied by a
    /// replicated log so every replica hands out the same versions.
    fn next_index(&self, at: u64) -> u64 {
        (self.index + 1).max(at)
    }
}

/// The indexed store shared by both backends.
pub struct Store {
    table: RwLock<Table>,
    hub: Arc<WatchHub>,
}

impl Store {
    pub fn new() -> Arc<Self> {
        Self::with_hub(WatchHub::new())
    }

    pub fn with_hub(hub: Arc<WatchHub>) -> Arc<Self> {
        Arc::new(Store {
            table: RwLock::new(Table::default()),
            hub,
        })
    }

    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    /// The index of the most recent mutation.
    pub fn index(&self) -> u64 {
        self.table.read().index
    }

    pub fn len(&self) -> usize {
        self.table.read().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads a resource by id.
    ///
    /// An empty uid matches any incarnation. The GroupVersion is checked after
    /// the lookup so callers can fall back to the stored version.
    pub fn read(&self, id: &Id) -> StorageResult<Resource> {
        let table = self.table.read();
        let stored = table
            .resources
            .get(&id_key(id))
            .ok_or(StorageError::NotFound)?;

        let stored_id = stored.id.as_ref().ok_or(StorageError::NotFound)?;
        if !id.uid.is_empty() && id.uid != stored_id.uid {
            return Err(StorageError::NotFound);
        }

        let requested = id.r#type.clone().unwrap_or_default();
        let stored_version = stored_id
            .r#type
            .as_ref()
            .map(|ty| ty.group_version.as_str())
            .unwrap_or_default();
        if requested.group_version != stored_version {
            return Err(StorageError::GroupVersionMismatch {
                requested_type: requested,
                stored: Box::new(stored.clone()),
            });
        }

        Ok(stored.clone())
    }

    pub fn write_cas(&self, res: Resource) -> StorageResult<Resource> {
        self.write_cas_at(0, res)
    }

    /// Writes `res` if `res.version` matches what is stored (empty meaning
    /// absent), assigning an event index of at least `at`.
    pub fn write_cas_at(&self, at: u64, mut res: Resource) -> StorageResult<Resource> {
        let id = res
            .id
            .as_ref()
            .ok_or_else(|| StorageError::InvalidArgument("resource id is required".into()))?;
        if id.r#type.is_none() {
            return Err(StorageError::InvalidArgument("resource type is required".into()));
        }
        match id.tenancy.as_ref() {
            None => {
                return Err(StorageError::InvalidArgument(
                    "resource tenancy is required".into(),
                ))
            }
            Some(tenancy) if is_wildcard_tenancy(tenancy) => {
                return Err(StorageError::InvalidArgument(
                    "resource tenancy cannot contain wildcards".into(),
                ))
            }
            Some(_) => {}
        }
        let key = id_key(id);

        let mut table = self.table.write();
        match table.resources.get(&key) {
            None if !res.version.is_empty() => return Err(StorageError::CasFailure),
            None => {}
            Some(stored) => {
                if stored.version != res.version {
                    return Err(StorageError::CasFailure);
                }
                let stored_uid = stored.id.as_ref().map(|id| id.uid.as_str());
                if stored_uid != Some(id.uid.as_str()) {
                    return Err(StorageError::WrongUid);
                }
            }
        }

        let index = table.next_index(at);
        res.version = index.to_string();
        table.index = index;
        table.insert(key, res.clone());

        debug!(id = %res.id.as_ref().map(id_string).unwrap_or_default(), index, "Resource written");
        self.hub.publish(Event {
            index,
            operation: Operation::Upsert,
            resource: res.clone(),
        });
        Ok(res)
    }

    pub fn delete_cas(&self, id: &Id, version: &str) -> StorageResult<()> {
        self.delete_cas_at(0, id, version)
    }

    /// Deletes the resource if `version` matches. Absent resources and uid
    /// mismatches are no-ops.
    pub fn delete_cas_at(&self, at: u64, id: &Id, version: &str) -> StorageResult<()> {
        let key = id_key(id);

        let mut table = self.table.write();
        let Some(stored) = table.resources.get(&key) else {
            return Ok(());
        };
        let stored_uid = stored.id.as_ref().map(|id| id.uid.as_str());
        if stored_uid != Some(id.uid.as_str()) {
            return Ok(());
        }
        if stored.version != version {
            return Err(StorageError::CasFailure);
        }

        let index = table.next_index(at);
        table.index = index;
        let Some(removed) = table.resources.remove(&key) else {
            return Ok(());
        };
        table.unlink_owner(&key, &removed);

        debug!(id = %id_string(id), index, "Resource deleted");
        self.hub.publish(Event {
            index,
            operation: Operation::Delete,
            resource: removed,
        });
        Ok(())
    }

    /// Lists resources of a type. Tenancy fields may be wildcards and the
    /// GroupVersion is not considered.
    pub fn list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Vec<Resource>> {
        let query = Query::new(resource_type, tenancy, name_prefix);
        Ok(self.table.read().scan(&query))
    }

    /// Opens a watch whose snapshot and subscription are taken under the same
    /// read lock, so no mutation can fall between them.
    pub fn watch_list(
        &self,
        resource_type: &UnversionedType,
        tenancy: &Tenancy,
        name_prefix: &str,
    ) -> StorageResult<Watch> {
        let query = Query::new(resource_type, tenancy, name_prefix);

        let table = self.table.read();
        let snapshot = table.scan(&query);
        let watch = Watch::open(self.hub.clone(), query, snapshot, table.index);
        drop(table);

        Ok(watch)
    }

    /// Ids of the resources owned by exactly `id`. An owner without a uid
    /// owns nothing.
    pub fn owner_references(&self, id: &Id) -> StorageResult<Vec<Id>> {
        if id.uid.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.table.read();
        let Some(owned) = table.owners.get(&owner_key(id)) else {
            return Ok(Vec::new());
        };
        Ok(owned
            .iter()
            .filter_map(|key| table.resources.get(key))
            .filter_map(|res| res.id.clone())
            .collect())
    }

    /// Point-in-time copy of every stored resource.
    pub fn snapshot(&self) -> Snapshot {
        let table = self.table.read();
        Snapshot {
            index: table.index,
            resources: table.resources.values().cloned().collect::<Vec<_>>().into_iter(),
        }
    }

    /// Starts building a replacement table.
    pub fn restore(&self) -> Restoration<'_> {
        Restoration {
            store: self,
            table: Table::default(),
        }
    }
}

/// Forward-only iterator over a store snapshot.
pub struct Snapshot {
    index: u64,
    resources: std::vec::IntoIter<Resource>,
}

impl Snapshot {
    /// Event index the snapshot was taken at.
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Iterator for Snapshot {
    type Item = Resource;

    fn next(&mut self) -> Option<Resource> {
        self.resources.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.resources.size_hint()
    }
}

/// A table under construction. Nothing is visible until `commit`.
pub struct Restoration<'a> {
    store: &'a Store,
    table: Table,
}

impl Restoration<'_> {
    pub fn apply(&mut self, res: Resource) -> StorageResult<()> {
        let id = res
            .id
            .as_ref()
            .ok_or_else(|| StorageError::InvalidArgument("resource id is required".into()))?;
        let key = id_key(id);
        if let Ok(version) = res.version.parse::<u64>() {
            self.table.index = self.table.index.max(version);
        }
        self.table.insert(key, res);
        Ok(())
    }

    /// Swaps the new table in and closes every outstanding watch, whose
    /// index bookkeeping no longer holds.
    pub fn commit(mut self) {
        let mut table = self.store.table.write();
        self.table.index = self.table.index.max(table.index);
        let count = self.table.resources.len();
        std::mem::swap(&mut *table, &mut self.table);
        self.store.hub.close_all();
        debug!(count, index = table.index, "Store restored");
    }

    pub fn abort(self) {
        debug!(count = self.table.resources.len(), "Restore aborted");
    }
}
