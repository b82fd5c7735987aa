use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one `RaftNode` replica, mapping directly to the
/// `raft.*` configuration options enumerated in spec.md §6.
#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    /// This node's id within the Raft group.
    pub node_id: u64,
    /// Persistence root (raft log segments, metadata, snapshots).
    pub data_dir: PathBuf,
    /// Voter ids present at cluster formation, including `node_id`.
    /// Ignored once a valid persisted state already exists.
    pub initial_members: Vec<u64>,

    pub election_tick: usize,
    pub heartbeat_tick: usize,
    pub max_size_per_msg: u64,
    pub max_inflight_msgs: usize,
    /// How often the tick loop calls `RawNode::tick`.
    pub tick_interval: Duration,
    /// Number of applied entries between automatic snapshots.
    pub snapshot_interval: u64,
    /// Max log entries per append-entries batch (bounds head-of-line
    /// blocking for large proposals, spec.md §5).
    pub max_batch: u64,
}

impl RaftNodeConfig {
    pub fn to_raft_config(&self) -> raft::Config {
        raft::Config {
            id: self.node_id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            max_committed_size_per_ready: self.max_batch * self.max_size_per_msg.max(1),
            pre_vote: true,
            ..Default::default()
        }
    }
}

impl Default for RaftNodeConfig {
    fn default() -> Self {
        RaftNodeConfig {
            node_id: 1,
            data_dir: PathBuf::from("./data"),
            initial_members: vec![1],
            election_tick: 10,
            heartbeat_tick: 3,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            tick_interval: Duration::from_millis(100),
            snapshot_interval: 10_000,
            max_batch: 64,
        }
    }
}
