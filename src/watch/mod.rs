//! Watch hub for publishing store mutations and delivering them to watchers.
//!
//! Every committed write or delete produces one `Event` that the hub fans out
//! to two subjects:
//! - the resource's exact tenancy (`Subject::Tenancy`)
//! - a type-wide wildcard (`Subject::Wildcard`)
//!
//! A `Watch` subscribes to the subject that matches its query and re-filters
//! events locally, since a wildcard subject under-discriminates queries like
//! `default/*/default`. Delivery goes through a bounded channel per
//! subscriber. Publishing never blocks the store's write path: a subscriber
//! whose buffer is full is dropped, and its watch fails with `WatchClosed`
//! once it has drained what it already received.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::resource::{is_wildcard_tenancy, tenancy_matches, UnversionedType};
pub use crate::resourcepb::watch_event::Operation;
use crate::resourcepb::{Resource, Tenancy, WatchEvent};
use crate::storage::{StorageError, StorageResult};

/// Events buffered per subscriber before it counts as lagging.
pub const SUBSCRIBER_BUFFER: usize = 1024;

/// A committed mutation, stamped with the store's event index.
#[derive(Clone, Debug)]
pub struct Event {
    pub index: u64,
    pub operation: Operation,
    /// The exact stored value; for deletes, the last value before removal.
    pub resource: Resource,
}

impl Event {
    pub fn to_watch_event(&self) -> WatchEvent {
        WatchEvent {
            operation: self.operation as i32,
            resource: Some(self.resource.clone()),
        }
    }
}

/// Topic an event is published on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Subject {
    Tenancy {
        resource_type: UnversionedType,
        partition: String,
        peer_name: String,
        namespace: String,
    },
    Wildcard(UnversionedType),
}

impl Subject {
    fn exact(resource_type: UnversionedType, tenancy: &Tenancy) -> Self {
        Subject::Tenancy {
            resource_type,
            partition: tenancy.partition.clone(),
            peer_name: tenancy.peer_name.clone(),
            namespace: tenancy.namespace.clone(),
        }
    }

    /// Both subjects a resource's events are published to.
    fn for_resource(res: &Resource) -> [Subject; 2] {
        let id = res.id.clone().unwrap_or_default();
        let resource_type = id
            .r#type
            .as_ref()
            .map(UnversionedType::from)
            .unwrap_or_default();
        let tenancy = id.tenancy.unwrap_or_default();
        [
            Subject::exact(resource_type.clone(), &tenancy),
            Subject::Wildcard(resource_type),
        ]
    }

    /// The single subject a query subscribes to.
    pub fn for_query(query: &Query) -> Self {
        if is_wildcard_tenancy(&query.tenancy) {
            Subject::Wildcard(query.resource_type.clone())
        } else {
            Subject::exact(query.resource_type.clone(), &query.tenancy)
        }
    }
}

/// A list or watch query: unversioned type, tenancy (fields may be
/// wildcards) and name prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub resource_type: UnversionedType,
    pub tenancy: Tenancy,
    pub name_prefix: String,
}

impl Query {
    pub fn new(resource_type: &UnversionedType, tenancy: &Tenancy, name_prefix: &str) -> Self {
        Self {
            resource_type: resource_type.clone(),
            tenancy: tenancy.clone(),
            name_prefix: name_prefix.to_string(),
        }
    }

    pub fn matches(&self, res: &Resource) -> bool {
        let Some(id) = res.id.as_ref() else {
            return false;
        };
        let type_ok = id
            .r#type
            .as_ref()
            .map(|ty| self.resource_type.matches(ty))
            .unwrap_or(false);
        let tenancy_ok = id
            .tenancy
            .as_ref()
            .map(|t| tenancy_matches(&self.tenancy, t))
            .unwrap_or(false);
        type_ok && tenancy_ok && id.name.starts_with(&self.name_prefix)
    }
}

struct Subscription {
    subject: Subject,
    tx: mpsc::Sender<Arc<Event>>,
}

/// The Watch hub tracks subscriptions by subject and dispatches events.
pub struct WatchHub {
    /// Map of subscription id -> subscription
    subscriptions: DashMap<u64, Subscription>,

    /// Map from subject -> ids subscribed to it
    subjects: DashMap<Subject, Vec<u64>>,

    next_id: AtomicU64,

    buffer: usize,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Self::with_buffer(SUBSCRIBER_BUFFER)
    }

    /// A hub whose subscribers may fall at most `buffer` events behind.
    pub fn with_buffer(buffer: usize) -> Arc<Self> {
        Arc::new(WatchHub {
            subscriptions: DashMap::new(),
            subjects: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    /// Registers a subscriber and returns its id and event receiver.
    pub fn subscribe(&self, subject: Subject) -> (u64, mpsc::Receiver<Arc<Event>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.buffer);

        self.subscriptions.insert(
            id,
            Subscription {
                subject: subject.clone(),
                tx,
            },
        );
        self.subjects.entry(subject).or_default().push(id);

        debug!(subscription_id = id, "Watch subscribed");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        let Some((_, subscription)) = self.subscriptions.remove(&id) else {
            return;
        };

        if let Some(mut ids) = self.subjects.get_mut(&subscription.subject) {
            ids.retain(|sub| *sub != id);
            if ids.is_empty() {
                drop(ids);
                self.subjects
                    .remove_if(&subscription.subject, |_, ids| ids.is_empty());
            }
        }

        debug!(subscription_id = id, "Watch unsubscribed");
    }

    /// Publishes an event to the tenancy subject and the wildcard subject of
    /// its resource. Called by the store while it holds its write lock.
    pub fn publish(&self, event: Event) {
        let subjects = Subject::for_resource(&event.resource);
        let event = Arc::new(event);
        let mut gone = Vec::new();

        for subject in &subjects {
            let ids = match self.subjects.get(subject) {
                Some(ids) => ids.clone(),
                None => continue,
            };
            for id in ids {
                if let Some(subscription) = self.subscriptions.get(&id) {
                    match subscription.tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(subscription_id = id, "Watch subscriber lagging, closing it");
                            gone.push(id);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => gone.push(id),
                    }
                }
            }
        }

        for id in gone {
            self.unsubscribe(id);
        }
    }

    /// Drops every subscription. Outstanding watches drain what they already
    /// received and then fail with `WatchClosed`.
    pub fn close_all(&self) {
        let count = self.subscriptions.len();
        self.subjects.clear();
        self.subscriptions.clear();
        debug!(count, "Closed all watches");
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// A filtered, ordered stream of events: first a snapshot of everything that
/// matched when the watch was opened, then live changes.
pub struct Watch {
    query: Query,
    snapshot: VecDeque<WatchEvent>,
    /// Live events at or below this index are already covered by the snapshot.
    snapshot_index: u64,
    rx: mpsc::Receiver<Arc<Event>>,
    hub: Arc<WatchHub>,
    subscription_id: u64,
    closed: bool,
}

impl Watch {
    /// Subscribes to the query's subject. The caller must hold the store's
    /// read lock across capturing `snapshot` and this call.
    pub(crate) fn open(
        hub: Arc<WatchHub>,
        query: Query,
        snapshot: Vec<Resource>,
        snapshot_index: u64,
    ) -> Self {
        let (subscription_id, rx) = hub.subscribe(Subject::for_query(&query));
        let snapshot = snapshot
            .into_iter()
            .map(|resource| WatchEvent {
                operation: Operation::Upsert as i32,
                resource: Some(resource),
            })
            .collect();

        Self {
            query,
            snapshot,
            snapshot_index,
            rx,
            hub,
            subscription_id,
            closed: false,
        }
    }

    /// Waits for the next matching event.
    ///
    /// Cancel by dropping the returned future; no event is lost when that
    /// happens.
    pub async fn next(&mut self) -> StorageResult<WatchEvent> {
        if let Some(event) = self.snapshot.pop_front() {
            return Ok(event);
        }
        if self.closed {
            return Err(StorageError::WatchClosed);
        }

        loop {
            let Some(event) = self.rx.recv().await else {
                self.closed = true;
                return Err(StorageError::WatchClosed);
            };
            if event.index <= self.snapshot_index {
                continue;
            }
            if !self.query.matches(&event.resource) {
                continue;
            }
            return Ok(event.to_watch_event());
        }
    }

    /// Releases the subscription. Further calls to `next` fail with
    /// `WatchClosed`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.snapshot.clear();
        self.rx.close();
        self.hub.unsubscribe(self.subscription_id);
    }

    pub fn query(&self) -> &Query {
        &self.query
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resourcepb::{Id, Type};
    use std::time::Duration;

    fn tenancy(partition: &str, peer_name: &str, namespace: &str) -> Tenancy {
        Tenancy {
            partition: partition.to_string(),
            peer_name: peer_name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn resource(name: &str, tenancy: Tenancy) -> Resource {
        Resource {
            id: Some(Id {
                uid: "uid".to_string(),
                name: name.to_string(),
                r#type: Some(Type {
                    group: "demo".to_string(),
                    group_version: "v2".to_string(),
                    kind: "Artist".to_string(),
                }),
                tenancy: Some(tenancy),
            }),
            ..Default::default()
        }
    }

    fn artist() -> UnversionedType {
        UnversionedType::new("demo", "Artist")
    }

    fn upsert(index: u64, res: Resource) -> Event {
        Event {
            index,
            operation: Operation::Upsert,
            resource: res,
        }
    }

    #[test]
    fn test_query_matches() {
        let query = Query::new(&artist(), &tenancy("default", "*", "default"), "a");

        assert!(query.matches(&resource("admin", tenancy("default", "local", "default"))));
        assert!(query.matches(&resource("api", tenancy("default", "remote", "default"))));
        assert!(!query.matches(&resource("web", tenancy("default", "local", "default"))));
        assert!(!query.matches(&resource("api", tenancy("billing", "local", "default"))));
    }

    #[test]
    fn test_subject_for_query() {
        let exact = Query::new(&artist(), &tenancy("default", "local", "default"), "");
        let wild = Query::new(&artist(), &tenancy("default", "*", "default"), "");

        assert!(matches!(Subject::for_query(&exact), Subject::Tenancy { .. }));
        assert_eq!(Subject::for_query(&wild), Subject::Wildcard(artist()));
    }

    #[tokio::test]
    async fn test_publish_reaches_both_subjects() {
        let hub = WatchHub::new();
        let local = tenancy("default", "local", "default");

        let mut exact = Watch::open(
            hub.clone(),
            Query::new(&artist(), &local, ""),
            Vec::new(),
            0,
        );
        let mut wild = Watch::open(
            hub.clone(),
            Query::new(&artist(), &tenancy("*", "*", "*"), ""),
            Vec::new(),
            0,
        );
        assert_eq!(hub.subscription_count(), 2);

        hub.publish(upsert(1, resource("web", local.clone())));

        let event = exact.next().await.unwrap();
        assert_eq!(event.resource.unwrap().id.unwrap().name, "web");
        let event = wild.next().await.unwrap();
        assert_eq!(event.operation, Operation::Upsert as i32);
    }

    #[tokio::test]
    async fn test_snapshot_first_then_live() {
        let hub = WatchHub::new();
        let local = tenancy("default", "local", "default");

        let mut watch = Watch::open(
            hub.clone(),
            Query::new(&artist(), &local, ""),
            vec![resource("admin", local.clone())],
            5,
        );

        // Already covered by the snapshot.
        hub.publish(upsert(5, resource("admin", local.clone())));
        hub.publish(upsert(6, resource("web", local.clone())));

        let first = watch.next().await.unwrap();
        assert_eq!(first.resource.unwrap().id.unwrap().name, "admin");
        let second = watch.next().await.unwrap();
        assert_eq!(second.resource.unwrap().id.unwrap().name, "web");
    }

    #[tokio::test]
    async fn test_watch_filters_wildcard_subject() {
        let hub = WatchHub::new();
        let mut watch = Watch::open(
            hub.clone(),
            Query::new(&artist(), &tenancy("default", "*", "default"), ""),
            Vec::new(),
            0,
        );

        hub.publish(upsert(1, resource("a", tenancy("billing", "local", "payments"))));
        hub.publish(upsert(2, resource("b", tenancy("default", "remote", "default"))));

        let event = watch.next().await.unwrap();
        assert_eq!(event.resource.unwrap().id.unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_close_all_closes_watches() {
        let hub = WatchHub::new();
        let mut watch = Watch::open(
            hub.clone(),
            Query::new(&artist(), &tenancy("*", "*", "*"), ""),
            Vec::new(),
            0,
        );

        hub.close_all();
        assert_eq!(hub.subscription_count(), 0);
        assert_eq!(watch.next().await.unwrap_err(), StorageError::WatchClosed);
    }

    #[tokio::test]
    async fn test_next_blocks_until_event() {
        let hub = WatchHub::new();
        let mut watch = Watch::open(
            hub.clone(),
            Query::new(&artist(), &tenancy("*", "*", "*"), ""),
            Vec::new(),
            0,
        );

        let pending = tokio::time::timeout(Duration::from_millis(50), watch.next()).await;
        assert!(pending.is_err());

        hub.publish(upsert(1, resource("web", tenancy("default", "local", "default"))));
        assert!(watch.next().await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_and_close_unsubscribe() {
        let hub = WatchHub::new();
        let query = Query::new(&artist(), &tenancy("*", "*", "*"), "");

        let watch = Watch::open(hub.clone(), query.clone(), Vec::new(), 0);
        drop(watch);
        assert_eq!(hub.subscription_count(), 0);

        let mut watch = Watch::open(hub.clone(), query, Vec::new(), 0);
        watch.close();
        assert_eq!(hub.subscription_count(), 0);
        assert_eq!(watch.next().await.unwrap_err(), StorageError::WatchClosed);
    }

    #[test]
    fn test_watch_keeps_its_query() {
        let hub = WatchHub::new();
        let query = Query::new(&artist(), &tenancy("default", "*", "default"), "we");

        let watch = Watch::open(hub, query.clone(), Vec::new(), 0);
        assert_eq!(watch.query(), &query);
        assert_ne!(
            watch.query(),
            &Query::new(&artist(), &tenancy("default", "*", "default"), "")
        );
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_closed() {
        let hub = WatchHub::with_buffer(2);
        let local = tenancy("default", "local", "default");
        let mut slow = Watch::open(
            hub.clone(),
            Query::new(&artist(), &local, ""),
            Vec::new(),
            0,
        );

        for i in 1..=3 {
            hub.publish(upsert(i, resource(&format!("r{}", i), local.clone())));
        }
        assert_eq!(hub.subscription_count(), 0);

        // Buffered events are still delivered before the watch reports closure.
        assert_eq!(slow.next().await.unwrap().resource.unwrap().id.unwrap().name, "r1");
        assert_eq!(slow.next().await.unwrap().resource.unwrap().id.unwrap().name, "r2");
        assert_eq!(slow.next().await.unwrap_err(), StorageError::WatchClosed);

        // Other subscribers are unaffected.
        let mut fresh = Watch::open(hub.clone(), Query::new(&artist(), &local, ""), Vec::new(), 3);
        hub.publish(upsert(4, resource("r4", local.clone())));
        assert_eq!(fresh.next().await.unwrap().resource.unwrap().id.unwrap().name, "r4");
    }
}
