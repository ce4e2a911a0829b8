//! Integration tests for resourced
//! Tests the full server with in-process gRPC client connections

use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::{Code, Request};

use resourced::api::{CONSISTENCY_HEADER, CONSISTENT_MODE};
use resourced::raft::RaftNode;
use resourced::resourcepb::resource_service_client::ResourceServiceClient;
use resourced::resourcepb::{
    watch_event, Condition, DeleteRequest, Id, ListByOwnerRequest, ListRequest, ReadRequest,
    Resource, State, Status, Tenancy, Type, WatchListRequest, WriteRequest, WriteStatusRequest,
};
use resourced::server::{BackendKind, ResourcedServer, ServerConfig};
use resourced::storage::raft::Fsm;
use std::sync::Arc;

struct Node {
    endpoint: String,
    raft: Option<Arc<RaftNode<Fsm>>>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    _handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Node {
    async fn client(&self) -> ResourceServiceClient<Channel> {
        ResourceServiceClient::connect(self.endpoint.clone())
            .await
            .expect("connect failed")
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Starts a node on pre-bound listeners so every port is known up front.
async fn start_node(
    config: ServerConfig,
    client: TcpListener,
    peer: Option<TcpListener>,
) -> Node {
    let endpoint = format!("http://{}", client.local_addr().unwrap());
    let server = ResourcedServer::new(config)
        .await
        .expect("Failed to create ResourcedServer");
    let raft = server.raft();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server
            .run_with_listeners(client, peer, async {
                shutdown_rx.await.ok();
            })
            .await
    });

    Node {
        endpoint,
        raft,
        shutdown: Some(shutdown_tx),
        _handle: handle,
    }
}

async fn start_inmem_server() -> Node {
    let (client, url) = bind().await;
    let config = ServerConfig {
        name: "test-node".to_string(),
        listen_client_url: url,
        backend: BackendKind::InMem,
        ..ServerConfig::default()
    };
    start_node(config, client, None).await
}

/// Three Raft nodes talking over real sockets.
async fn start_cluster() -> (Vec<Node>, Vec<TempDir>) {
    let mut clients = Vec::new();
    let mut peers = Vec::new();
    for _ in 0..3 {
        clients.push(bind().await);
        peers.push(bind().await);
    }
    let initial_cluster = peers
        .iter()
        .enumerate()
        .map(|(i, (_, url))| format!("{}={}", i + 1, url))
        .collect::<Vec<_>>()
        .join(",");

    let mut nodes = Vec::new();
    let mut dirs = Vec::new();
    for (i, ((client, client_url), (peer, peer_url))) in
        clients.into_iter().zip(peers.into_iter()).enumerate()
    {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config = ServerConfig {
            name: format!("node{}", i + 1),
            node_id: i as u64 + 1,
            data_dir: dir.path().to_path_buf(),
            listen_client_url: client_url,
            listen_peer_url: peer_url,
            initial_cluster: initial_cluster.clone(),
            backend: BackendKind::Raft,
            heartbeat_interval_ms: 50,
            election_timeout_ms: 300,
            ..ServerConfig::default()
        };
        nodes.push(start_node(config, client, Some(peer)).await);
        dirs.push(dir);
    }
    (nodes, dirs)
}

async fn wait_for_leader(nodes: &[Node]) -> usize {
    timeout(Duration::from_secs(10), async {
        loop {
            let leaders: Vec<usize> = nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.raft.as_ref().map(|r| r.is_leader()).unwrap_or(false))
                .map(|(i, _)| i)
                .collect();
            if leaders.len() == 1 {
                let leader_id = nodes[leaders[0]].raft.as_ref().unwrap().id();
                let agreed = nodes
                    .iter()
                    .all(|n| n.raft.as_ref().unwrap().leader_id() == Some(leader_id));
                if agreed {
                    return leaders[0];
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no leader elected")
}

fn artist_type() -> Type {
    Type {
        group: "demo".to_string(),
        group_version: "v2".to_string(),
        kind: "Artist".to_string(),
    }
}

fn tenancy() -> Tenancy {
    Tenancy {
        partition: "default".to_string(),
        peer_name: "local".to_string(),
        namespace: "default".to_string(),
    }
}

fn artist_id(name: &str) -> Id {
    Id {
        uid: String::new(),
        name: name.to_string(),
        r#type: Some(artist_type()),
        tenancy: Some(tenancy()),
    }
}

fn artist(name: &str, data: &str) -> Resource {
    Resource {
        id: Some(artist_id(name)),
        data: Some(prost_types::Any {
            type_url: "type.googleapis.com/demo.v2.Artist".to_string(),
            value: data.as_bytes().to_vec(),
        }),
        ..Default::default()
    }
}

async fn write(client: &mut ResourceServiceClient<Channel>, res: Resource) -> Resource {
    client
        .write(WriteRequest {
            resource: Some(res),
        })
        .await
        .expect("write failed")
        .into_inner()
        .resource
        .unwrap()
}

fn consistent<T>(message: T) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert(CONSISTENCY_HEADER, CONSISTENT_MODE.parse().unwrap());
    request
}

// ============================================================================
// Single node
// ============================================================================

#[tokio::test]
async fn test_write_update_delete_scenario() {
    let node = start_inmem_server().await;
    let mut client = node.client().await;

    let v1 = write(&mut client, artist("web", "first")).await;
    let uid = v1.id.as_ref().unwrap().uid.clone();
    assert!(!uid.is_empty());

    let v2 = write(&mut client, artist("web", "second")).await;
    assert_eq!(v2.id.as_ref().unwrap().uid, uid);
    assert_ne!(v2.version, v1.version);
    assert_ne!(v2.generation, v1.generation);

    let mut stale = artist("web", "third");
    stale.version = v1.version.clone();
    let err = client
        .write(WriteRequest {
            resource: Some(stale),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);

    client
        .delete(DeleteRequest {
            id: Some(artist_id("web")),
            version: String::new(),
        })
        .await
        .expect("delete failed");

    let err = client
        .read(ReadRequest {
            id: Some(artist_id("web")),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_write_status_and_list_by_owner() {
    let node = start_inmem_server().await;
    let mut client = node.client().await;

    let owner = write(&mut client, artist("owner", "band")).await;
    let mut album = artist("album", "record");
    album.owner = owner.id.clone();
    write(&mut client, album).await;

    let updated = client
        .write_status(WriteStatusRequest {
            id: owner.id.clone(),
            version: owner.version.clone(),
            key: "resourced.io/artist-controller".to_string(),
            status: Some(Status {
                observed_generation: owner.generation.clone(),
                conditions: vec![Condition {
                    r#type: "Accepted".to_string(),
                    state: State::True as i32,
                    reason: "Ok".to_string(),
                    message: String::new(),
                    resource: None,
                }],
                updated_at: None,
            }),
        })
        .await
        .expect("write status failed")
        .into_inner()
        .resource
        .unwrap();
    assert!(updated.status["resourced.io/artist-controller"]
        .updated_at
        .is_some());

    let owned = client
        .list_by_owner(ListByOwnerRequest {
            owner: owner.id.clone(),
        })
        .await
        .expect("list by owner failed")
        .into_inner()
        .resources;
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id.as_ref().unwrap().name, "album");
}

#[tokio::test]
async fn test_watch_list_over_grpc() {
    let node = start_inmem_server().await;
    let mut client = node.client().await;

    let a = write(&mut client, artist("a", "x")).await;

    let mut stream = client
        .watch_list(WatchListRequest {
            r#type: Some(artist_type()),
            tenancy: Some(tenancy()),
            name_prefix: String::new(),
        })
        .await
        .expect("watch failed")
        .into_inner();

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.operation, watch_event::Operation::Upsert as i32);
    assert_eq!(event.resource, Some(a));

    let b = write(&mut client, artist("b", "y")).await;
    let event = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.resource, Some(b.clone()));

    client
        .delete(DeleteRequest {
            id: b.id.clone(),
            version: b.version.clone(),
        })
        .await
        .expect("delete failed");
    let event = timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.operation, watch_event::Operation::Delete as i32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_blind_writers_both_succeed() {
    let node = start_inmem_server().await;
    let mut client = node.client().await;
    let created = write(&mut client, artist("web", "initial")).await;

    let mut tasks = Vec::new();
    for writer in ["a", "b"] {
        let mut client = node.client().await;
        tasks.push(tokio::spawn(async move {
            write(&mut client, artist("web", writer)).await
        }));
    }
    for task in tasks {
        let written = task.await.unwrap();
        assert_eq!(written.id.as_ref().unwrap().uid, created.id.as_ref().unwrap().uid);
    }
}

// ============================================================================
// Raft cluster
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_forwards_writes_from_followers() {
    let (nodes, _dirs) = start_cluster().await;
    let leader = wait_for_leader(&nodes).await;
    let follower = (leader + 1) % nodes.len();
    let other = (leader + 2) % nodes.len();

    // Written through a follower, committed by the leader.
    let mut follower_client = nodes[follower].client().await;
    let written = write(&mut follower_client, artist("web", "replicated")).await;

    // A consistent read from the other follower is forwarded too.
    let mut other_client = nodes[other].client().await;
    let read = other_client
        .read(consistent(ReadRequest {
            id: written.id.clone(),
        }))
        .await
        .expect("consistent read failed")
        .into_inner()
        .resource
        .unwrap();
    assert_eq!(read, written);

    // Every replica eventually applies the same version.
    for node in &nodes {
        let mut client = node.client().await;
        let replicated = timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(rsp) = client
                    .read(ReadRequest {
                        id: written.id.clone(),
                    })
                    .await
                {
                    return rsp.into_inner().resource.unwrap();
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("write never replicated");
        assert_eq!(replicated.version, written.version);
    }

    // CAS conflicts come back through forwarding with their status.
    let mut stale = written.clone();
    stale.version = "999999".to_string();
    let err = follower_client
        .write(WriteRequest {
            resource: Some(stale),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);

    let listed = other_client
        .list(consistent(ListRequest {
            r#type: Some(artist_type()),
            tenancy: Some(tenancy()),
            name_prefix: String::new(),
        }))
        .await
        .expect("consistent list failed")
        .into_inner()
        .resources;
    assert_eq!(listed.len(), 1);

    follower_client
        .delete(DeleteRequest {
            id: written.id.clone(),
            version: String::new(),
        })
        .await
        .expect("forwarded delete failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_survives_leader_loss() {
    let (mut nodes, _dirs) = start_cluster().await;
    let leader = wait_for_leader(&nodes).await;

    let mut client = nodes[(leader + 1) % 3].client().await;
    write(&mut client, artist("before", "x")).await;

    // Shutdown aborts the stopped node's Raft loop and closes its peer
    // listener, so the two survivors elect a new leader between themselves.
    let mut old_leader = nodes.remove(leader);
    old_leader.stop();
    drop(old_leader);

    let new_leader = wait_for_leader(&nodes).await;
    let mut client = nodes[new_leader].client().await;
    let after = timeout(Duration::from_secs(10), async {
        loop {
            match client
                .write(WriteRequest {
                    resource: Some(artist("after", "y")),
                })
                .await
            {
                Ok(rsp) => return rsp.into_inner().resource.unwrap(),
                Err(_) => sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("cluster never accepted writes again");
    assert!(!after.version.is_empty());

    let read = client
        .read(consistent(ReadRequest {
            id: Some(artist_id("before")),
        }))
        .await
        .expect("read failed");
    assert!(read.into_inner().resource.is_some());
}
