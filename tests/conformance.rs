//! Backend conformance suite.
//! Every check runs against the in-memory backend and a single-node Raft
//! backend, which must behave identically.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use resourced::raft::{LocalTransport, PeerConfig, RaftConfig, RaftLog, RaftNode};
use resourced::resource::UnversionedType;
use resourced::resourcepb::{watch_event, Id, Resource, Tenancy, Type};
use resourced::storage::raft::Fsm;
use resourced::storage::{Backend, InMemBackend, RaftBackend, StorageError, Store};

struct Harness {
    backend: Arc<dyn Backend>,
    _raft: Option<(TempDir, JoinHandle<()>)>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some((_, task)) = &self._raft {
            task.abort();
        }
    }
}

async fn inmem() -> Harness {
    Harness {
        backend: Arc::new(InMemBackend::new()),
        _raft: None,
    }
}

async fn raft() -> Harness {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let store = Store::new();

    let config = RaftConfig::new(1, dir.path().to_path_buf())
        .with_peers(vec![PeerConfig {
            id: 1,
            address: "http://127.0.0.1:1".to_string(),
        }])
        .with_timeouts(
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(10),
        );
    let log = Arc::new(RaftLog::open(&dir.path().join("raft")).unwrap());
    let transport = LocalTransport::<Fsm>::new();
    let node = Arc::new(
        RaftNode::new(config, log, transport.clone(), Arc::new(Fsm::new(store.clone()))).unwrap(),
    );
    transport.register(&node);
    let task = node.clone().run();

    timeout(Duration::from_secs(5), async {
        while !node.is_leader() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("single node never became leader");

    Harness {
        backend: Arc::new(RaftBackend::new(node, store)),
        _raft: Some((dir, task)),
    }
}

fn artist_type(version: &str) -> Type {
    Type {
        group: "demo".to_string(),
        group_version: version.to_string(),
        kind: "Artist".to_string(),
    }
}

fn tenancy(partition: &str, namespace: &str) -> Tenancy {
    Tenancy {
        partition: partition.to_string(),
        peer_name: "local".to_string(),
        namespace: namespace.to_string(),
    }
}

fn wildcard() -> Tenancy {
    Tenancy {
        partition: "*".to_string(),
        peer_name: "*".to_string(),
        namespace: "*".to_string(),
    }
}

fn artist_in(name: &str, tenancy: Tenancy) -> Resource {
    Resource {
        id: Some(Id {
            uid: format!("uid-{}", name),
            name: name.to_string(),
            r#type: Some(artist_type("v2")),
            tenancy: Some(tenancy),
        }),
        ..Default::default()
    }
}

fn artist(name: &str) -> Resource {
    artist_in(name, tenancy("default", "default"))
}

fn id_of(res: &Resource) -> Id {
    res.id.clone().unwrap()
}

fn unversioned() -> UnversionedType {
    UnversionedType::new("demo", "Artist")
}

fn names(resources: &[Resource]) -> Vec<String> {
    let mut names: Vec<String> = resources
        .iter()
        .map(|r| r.id.as_ref().unwrap().name.clone())
        .collect();
    names.sort();
    names
}

async fn check_write_and_read(h: Harness) {
    let b = &h.backend;
    let written = b.write_cas(artist("web")).await.unwrap();
    assert!(!written.version.is_empty());

    assert_eq!(b.read(&id_of(&written)).await.unwrap(), written);
    assert_eq!(b.read_consistent(&id_of(&written)).await.unwrap(), written);

    // An empty uid reads whatever incarnation is stored.
    let mut no_uid = id_of(&written);
    no_uid.uid.clear();
    assert_eq!(b.read(&no_uid).await.unwrap(), written);

    let mut other_uid = id_of(&written);
    other_uid.uid = "someone-else".to_string();
    assert_eq!(b.read(&other_uid).await.unwrap_err(), StorageError::NotFound);
}

async fn check_cas_versions(h: Harness) {
    let b = &h.backend;
    let v1 = b.write_cas(artist("web")).await.unwrap();

    // Creating over an existing resource.
    assert_eq!(
        b.write_cas(artist("web")).await.unwrap_err(),
        StorageError::CasFailure
    );

    let v2 = b.write_cas(v1.clone()).await.unwrap();
    assert_ne!(v2.version, v1.version);

    // Stale version.
    assert_eq!(
        b.write_cas(v1.clone()).await.unwrap_err(),
        StorageError::CasFailure
    );

    // Current version succeeds.
    let v3 = b.write_cas(v2.clone()).await.unwrap();
    assert_ne!(v3.version, v2.version);

    // A version for something that does not exist.
    let mut ghost = artist("ghost");
    ghost.version = "12".to_string();
    assert_eq!(b.write_cas(ghost).await.unwrap_err(), StorageError::CasFailure);
}

async fn check_uid_is_immutable(h: Harness) {
    let b = &h.backend;
    let written = b.write_cas(artist("web")).await.unwrap();

    let mut other = written.clone();
    other.id.as_mut().unwrap().uid = "another-incarnation".to_string();
    assert_eq!(b.write_cas(other).await.unwrap_err(), StorageError::WrongUid);

    let mut empty = written.clone();
    empty.id.as_mut().unwrap().uid.clear();
    assert_eq!(b.write_cas(empty).await.unwrap_err(), StorageError::WrongUid);
}

async fn check_delete(h: Harness) {
    let b = &h.backend;
    let written = b.write_cas(artist("web")).await.unwrap();
    let id = id_of(&written);

    assert_eq!(
        b.delete_cas(&id, "stale").await.unwrap_err(),
        StorageError::CasFailure
    );

    // A different incarnation is left alone.
    let mut other = id.clone();
    other.uid = "another-incarnation".to_string();
    b.delete_cas(&other, &written.version).await.unwrap();
    assert!(b.read(&id).await.is_ok());

    b.delete_cas(&id, &written.version).await.unwrap();
    assert_eq!(b.read(&id).await.unwrap_err(), StorageError::NotFound);

    // Idempotent.
    b.delete_cas(&id, &written.version).await.unwrap();
}

async fn check_group_version_mismatch(h: Harness) {
    let b = &h.backend;
    let written = b.write_cas(artist("web")).await.unwrap();

    let mut v1 = id_of(&written);
    v1.r#type = Some(artist_type("v1"));
    match b.read(&v1).await.unwrap_err() {
        StorageError::GroupVersionMismatch {
            requested_type,
            stored,
        } => {
            assert_eq!(requested_type.group_version, "v1");
            assert_eq!(*stored, written);
        }
        other => panic!("expected group version mismatch, got {:?}", other),
    }

    // Lists ignore GroupVersion.
    let listed = b.list(&unversioned(), &wildcard(), "").await.unwrap();
    assert_eq!(listed, vec![written]);
}

async fn check_wildcard_list(h: Harness) {
    let b = &h.backend;
    b.write_cas(artist_in("a", tenancy("default", "default")))
        .await
        .unwrap();
    b.write_cas(artist_in("b", tenancy("default", "other")))
        .await
        .unwrap();
    b.write_cas(artist_in("c", tenancy("billing", "payments")))
        .await
        .unwrap();

    let query = Tenancy {
        partition: "default".to_string(),
        peer_name: "*".to_string(),
        namespace: "*".to_string(),
    };
    let listed = b.list(&unversioned(), &query, "").await.unwrap();
    assert_eq!(names(&listed), vec!["a", "b"]);

    let exact = b
        .list(&unversioned(), &tenancy("default", "default"), "")
        .await
        .unwrap();
    assert_eq!(names(&exact), vec!["a"]);

    let all = b.list_consistent(&unversioned(), &wildcard(), "").await.unwrap();
    assert_eq!(names(&all), vec!["a", "b", "c"]);

    let other_kind = UnversionedType::new("demo", "Album");
    assert!(b.list(&other_kind, &wildcard(), "").await.unwrap().is_empty());
}

async fn check_name_prefix(h: Harness) {
    let b = &h.backend;
    for name in ["web-1", "web-2", "db-1"] {
        b.write_cas(artist(name)).await.unwrap();
    }

    let listed = b.list(&unversioned(), &wildcard(), "web-").await.unwrap();
    assert_eq!(names(&listed), vec!["web-1", "web-2"]);
}

async fn check_watch_before_writes(h: Harness) {
    let b = &h.backend;
    let mut watch = b
        .watch_list(&unversioned(), &tenancy("default", "default"), "")
        .await
        .unwrap();

    let mut written = Vec::new();
    for name in ["a", "b", "c"] {
        written.push(b.write_cas(artist(name)).await.unwrap());
    }
    // Filtered out by tenancy.
    b.write_cas(artist_in("x", tenancy("billing", "default")))
        .await
        .unwrap();
    b.delete_cas(&id_of(&written[0]), &written[0].version)
        .await
        .unwrap();

    for expected in &written {
        let event = timeout(Duration::from_secs(5), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.operation, watch_event::Operation::Upsert as i32);
        assert_eq!(event.resource.as_ref(), Some(expected));
    }

    let event = timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.operation, watch_event::Operation::Delete as i32);
    assert_eq!(event.resource.unwrap().id, written[0].id);
}

async fn check_watch_after_writes(h: Harness) {
    let b = &h.backend;
    for name in ["a", "b"] {
        b.write_cas(artist(name)).await.unwrap();
    }

    let mut watch = b.watch_list(&unversioned(), &wildcard(), "").await.unwrap();
    let mut snapshot = Vec::new();
    for _ in 0..2 {
        let event = timeout(Duration::from_secs(5), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.operation, watch_event::Operation::Upsert as i32);
        snapshot.push(event.resource.unwrap());
    }
    assert_eq!(names(&snapshot), vec!["a", "b"]);

    let c = b.write_cas(artist("c")).await.unwrap();
    let event = timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.resource, Some(c));
}

async fn check_owner_references(h: Harness) {
    let b = &h.backend;
    let owner = b.write_cas(artist("owner")).await.unwrap();

    let mut owned = Vec::new();
    for name in ["x", "y"] {
        let mut res = artist(name);
        res.owner = owner.id.clone();
        owned.push(b.write_cas(res).await.unwrap());
    }
    b.write_cas(artist("unowned")).await.unwrap();

    let mut refs: Vec<String> = b
        .owner_references(&id_of(&owner))
        .await
        .unwrap()
        .into_iter()
        .map(|id| id.name)
        .collect();
    refs.sort();
    assert_eq!(refs, vec!["x", "y"]);

    // A different incarnation of the owner owns nothing.
    let mut stale_owner = id_of(&owner);
    stale_owner.uid = "old-incarnation".to_string();
    assert!(b.owner_references(&stale_owner).await.unwrap().is_empty());

    b.delete_cas(&id_of(&owned[0]), &owned[0].version)
        .await
        .unwrap();
    let refs = b.owner_references(&id_of(&owner)).await.unwrap();
    assert_eq!(refs.len(), 1);
}

async fn check_rejects_wildcard_writes(h: Harness) {
    let b = &h.backend;
    let res = artist_in("web", wildcard());
    assert!(matches!(
        b.write_cas(res).await.unwrap_err(),
        StorageError::InvalidArgument(_)
    ));
}

macro_rules! conformance {
    ($backend:ident: $($check:ident),* $(,)?) => {
        mod $backend {
            $(
                #[tokio::test]
                async fn $check() {
                    super::$check(super::$backend().await).await;
                }
            )*
        }
    };
}

macro_rules! conformance_suite {
    ($($backend:ident),*) => {
        $(
            conformance!($backend:
                check_write_and_read,
                check_cas_versions,
                check_uid_is_immutable,
                check_delete,
                check_group_version_mismatch,
                check_wildcard_list,
                check_name_prefix,
                check_watch_before_writes,
                check_watch_after_writes,
                check_owner_references,
                check_rejects_wildcard_writes,
            );
        )*
    };
}

conformance_suite!(inmem, raft);
