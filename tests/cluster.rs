//! Multi-node integration scenarios (S6 failover, S7 snapshot) driving
//! a 3-node in-process cluster over an in-process channel transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use concord::{ChannelTransport, Cluster, ClusterConfig, Consistency, Key, PutOptions, RequestOptions, Transport};
use concord_base::NoopSink;
use concord_raft::Message;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;

/// Wraps `ChannelTransport`'s peer map behind a lock so nodes can be
/// registered after construction: each `Cluster::start` needs a
/// `Transport` up front, but only exposes its inbox sender once started.
#[derive(Clone, Default)]
struct SharedTransport {
    peers: Arc<Mutex<HashMap<u64, UnboundedSender<Message>>>>,
}

impl SharedTransport {
    fn register(&self, node_id: u64, inbox: UnboundedSender<Message>) {
        self.peers.lock().unwrap().insert(node_id, inbox);
    }
}

impl Transport for SharedTransport {
    fn send(&self, to: u64, message: Message) {
        ChannelTransport::new(self.peers.lock().unwrap().clone()).send(to, message);
    }
}

fn test_config(node_id: u64, dir: &TempDir) -> ClusterConfig {
    let mut config = ClusterConfig::new("concord-it", node_id, dir.path());
    config.initial_members = vec![1, 2, 3];
    config.raft.election_timeout_ms = 300;
    config.raft.heartbeat_timeout_ms = 100;
    config.raft.tick_interval_ms = 20;
    config.ttl_cleanup_interval_s = 3600;
    config.propose_timeout_ms = 2_000;
    config
}

async fn start_node(node_id: u64, dir: &TempDir, transport: SharedTransport) -> Cluster {
    let cluster = Cluster::start(test_config(node_id, dir), Arc::new(transport.clone()), Arc::new(NoopSink)).unwrap();
    transport.register(node_id, cluster.inbox());
    cluster
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_failover_survives_leader_loss() {
    let transport = SharedTransport::default();
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    let node1 = start_node(1, &dirs[0], transport.clone()).await;
    let node2 = start_node(2, &dirs[1], transport.clone()).await;
    let node3 = start_node(3, &dirs[2], transport.clone()).await;

    node1.node().campaign().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let key = Key::new(b"k".to_vec()).unwrap();
    node1.client().put(key.clone(), b"v".to_vec(), PutOptions::default()).await.unwrap();

    // Kill the leader.
    node1.shutdown();

    // A surviving node must win a new election and keep serving strong reads.
    node2.node().campaign().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let strong = || RequestOptions { consistency: Some(Consistency::Strong), timeout: None };
    let value = match node2.client().get(&key, strong()).await {
        Ok(v) => v,
        Err(_) => node3.client().get(&key, strong()).await.unwrap(),
    };
    assert_eq!(value, b"v".to_vec());

    node2.shutdown();
    node3.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn s7_snapshot_survives_restart() {
    let transport = SharedTransport::default();
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    let node1 = start_node(1, &dirs[0], transport.clone()).await;
    let node2 = start_node(2, &dirs[1], transport.clone()).await;
    let node3 = start_node(3, &dirs[2], transport.clone()).await;

    node1.node().campaign().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    for i in 0..10 {
        let key = Key::new(format!("k{i}").into_bytes()).unwrap();
        node1.client().put(key, format!("v{i}").into_bytes(), PutOptions::default()).await.unwrap();
    }
    node1.node().trigger_snapshot().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    node1.shutdown();
    node2.shutdown();
    node3.shutdown();

    // Restart node 1 against the same data directory; it must recover
    // its applied state from the persisted snapshot plus log tail. Only
    // node 1 comes back up, so it cannot win a majority-of-3 election;
    // this checks locally-applied state, not leader consensus, so the
    // read uses eventual consistency.
    let restarted = Cluster::start(test_config(1, &dirs[0]), Arc::new(transport.clone()), Arc::new(NoopSink)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let key = Key::new(b"k3".to_vec()).unwrap();
    let opts = RequestOptions { consistency: Some(Consistency::Eventual), timeout: None };
    let value = restarted.client().get(&key, opts).await.unwrap();
    assert_eq!(value, b"v3".to_vec());

    restarted.shutdown();
}
