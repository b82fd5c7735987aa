//! Concord: an embedded, strongly-consistent key-value store replicated
//! across a small cluster with Raft.
//!
//! This crate wires the `concord-*` components into a single `Cluster`
//! lifecycle handle: open persisted state, start the Raft tick loop,
//! start the TTL reaper, and hand back a `ClusterClient` for the single
//! public API surface (C5). Concrete peer transport (TCP, gRPC) and the
//! observability sink's downstream exporter are external collaborators;
//! this crate only ships the in-process `ChannelTransport` used by tests
//! and the default `slog`-backed sink.

mod config;
mod logging;

pub use concord_base::{
    CompressedEnvelope, CompressionAlgorithm, Condition, Consistency, Descriptor, Entry, Error, FieldPath, Key,
    ObserverSink, Payload, RawValue, Result,
};
pub use concord_client::{
    ClusterClient, ClusterInfo, ConditionalOptions, MembershipController, PutManyEntry, PutOptions, RequestOptions,
    Status, TtlReaper,
};
pub use concord_raft::{ChannelTransport, RaftNode, Transport};
pub use concord_statemachine::{Command, CommandReply, KeyOutcome};
pub use concord_store::MemoryStats;

pub use config::{ClusterConfig, CompressionConfig, RaftTuning};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use concord_codec::{Codec, CodecConfig};
use concord_raft::RaftNodeConfig;
use concord_statemachine::StateMachine;
use slog::Logger;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// A running Concord replica: a `RaftNode` driven by a background tick
/// loop, a `ClusterClient` in front of it, and a `TtlReaper` sweeping
/// expired keys on a timer. Dropping this handle does not stop the
/// background tasks; call [`Cluster::shutdown`].
pub struct Cluster {
    client: Arc<ClusterClient>,
    membership: MembershipController,
    node: Arc<RaftNode>,
    inbox: UnboundedSender<concord_raft::Message>,
    tick_handle: JoinHandle<()>,
    ttl_handle: JoinHandle<()>,
    logger: Logger,
}

impl Cluster {
    /// Start a replica: open (or recover) its persisted Raft state,
    /// build the state machine, and spawn the tick loop and TTL reaper.
    ///
    /// `sink` is the observability hook (spec.md §6); pass
    /// `Arc::new(concord_base::NoopSink)` to disable structured events
    /// beyond the default `slog` logging this crate always performs.
    pub fn start(config: ClusterConfig, transport: Arc<dyn Transport>, sink: Arc<dyn ObserverSink>) -> Result<Self> {
        let logger = logging::root_logger(&config.cluster_name, config.node_id);

        let raft_dir = config.data_dir.join("raft");
        let storage = concord_raft::RaftStorage::open(&raft_dir, &config.initial_members)
            .map_err(|e| Error::Internal(format!("failed to open raft storage: {e}")))?;

        let codec = Codec::new(config.compression.to_codec_config());
        let state_machine = StateMachine::new(codec.clone(), sink.clone(), logger.clone());

        let raft_node_config = RaftNodeConfig {
            node_id: config.node_id,
            data_dir: raft_dir,
            initial_members: config.initial_members.clone(),
            election_tick: config.raft.election_tick(),
            heartbeat_tick: config.raft.heartbeat_tick(),
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            tick_interval: Duration::from_millis(config.raft.tick_interval_ms),
            snapshot_interval: config.raft.snapshot_interval,
            max_batch: config.raft.max_batch,
        };

        let node = RaftNode::new(raft_node_config, storage, state_machine, transport, sink.clone(), logger.clone())?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let tick_handle = node.clone().spawn_tick_loop(rx);

        let propose_timeout = Duration::from_millis(config.propose_timeout_ms);
        let client = Arc::new(ClusterClient::new(
            node.clone(),
            codec,
            config.default_read_consistency,
            propose_timeout,
            sink,
            logger.clone(),
        ));

        let ttl_handle = TtlReaper::new(
            client.clone(),
            Duration::from_secs(config.ttl_cleanup_interval_s),
            propose_timeout,
            logger.clone(),
        )
        .spawn();

        let membership = MembershipController::new(node.clone());

        Ok(Cluster { client, membership, node, inbox: tx, tick_handle, ttl_handle, logger })
    }

    /// The public API surface (C5).
    pub fn client(&self) -> &Arc<ClusterClient> {
        &self.client
    }

    pub fn membership(&self) -> &MembershipController {
        &self.membership
    }

    /// This replica's embedded `RaftNode`, for wiring an in-process
    /// transport's receiving side in tests.
    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// The sender half of this replica's inbound message channel; a
    /// `Transport` implementation feeds peer messages in here.
    pub fn inbox(&self) -> UnboundedSender<concord_raft::Message> {
        self.inbox.clone()
    }

    /// Stop the background tick loop and TTL reaper. Already-open
    /// persisted state is left on disk; a subsequent `Cluster::start`
    /// with the same `data_dir` recovers it.
    pub fn shutdown(self) {
        slog::info!(self.logger, "shutting down cluster"; "node_id" => self.node.id());
        self.tick_handle.abort();
        self.ttl_handle.abort();
    }
}

/// Build an in-process [`ChannelTransport`] wiring each node in `inboxes`
/// to every other node; used by tests and the single-process demo, not
/// by a real multi-process deployment.
pub fn channel_transport(inboxes: &HashMap<u64, UnboundedSender<concord_raft::Message>>) -> ChannelTransport {
    ChannelTransport::new(inboxes.clone())
}
