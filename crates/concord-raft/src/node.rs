use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_base::{Error, ObserverSink, Result};
use concord_statemachine::{Command, CommandReply, StateMachine, StoreSnapshot};
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, EntryType, Message};
use raft::{RawNode, StateRole, Storage as _};
use rand::Rng;
use slog::Logger;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::config::RaftNodeConfig;
use crate::storage::RaftStorage;
use crate::transport::Transport;

struct PendingProposal {
    tx: oneshot::Sender<Result<CommandReply>>,
}

struct PendingRead {
    tx: oneshot::Sender<u64>,
}

/// One replica of the Raft protocol (C4), hosting its own log, term
/// state, leader election, replication, and snapshot transfer. Wraps
/// `raft::RawNode` — the "uses a library implementation internally"
/// option spec.md §4.4 explicitly recommends.
pub struct RaftNode {
    config: RaftNodeConfig,
    raw_node: Mutex<RawNode<RaftStorage>>,
    storage: RaftStorage,
    state_machine: RwLock<StateMachine>,
    pending: Mutex<HashMap<u64, PendingProposal>>,
    pending_reads: Mutex<HashMap<Vec<u8>, PendingRead>>,
    proposal_id: AtomicU64,
    applied_since_snapshot: AtomicU64,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ObserverSink>,
    logger: Logger,
}

impl RaftNode {
    pub fn new(
        config: RaftNodeConfig,
        storage: RaftStorage,
        state_machine: StateMachine,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ObserverSink>,
        logger: Logger,
    ) -> Result<Arc<Self>> {
        let raft_config = config.to_raft_config();
        raft_config
            .validate()
            .map_err(|e| Error::Internal(format!("invalid raft config: {e}")))?;

        let raw_node = RawNode::new(&raft_config, storage.clone(), &logger)
            .map_err(|e| Error::Internal(format!("failed to start raft node: {e}")))?;

        Ok(Arc::new(RaftNode {
            config,
            raw_node: Mutex::new(raw_node),
            storage,
            state_machine: RwLock::new(state_machine),
            pending: Mutex::new(HashMap::new()),
            pending_reads: Mutex::new(HashMap::new()),
            proposal_id: AtomicU64::new(1),
            applied_since_snapshot: AtomicU64::new(0),
            transport,
            sink,
            logger,
        }))
    }

    pub fn id(&self) -> u64 {
        self.config.node_id
    }

    pub async fn role(&self) -> StateRole {
        self.raw_node.lock().await.raft.state
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == StateRole::Leader
    }

    pub async fn leader_id(&self) -> Option<u64> {
        let id = self.raw_node.lock().await.raft.leader_id;
        if id == raft::INVALID_ID {
            None
        } else {
            Some(id)
        }
    }

    pub async fn term(&self) -> u64 {
        self.raw_node.lock().await.raft.term
    }

    /// `members() -> {members, leader_or_nil}` (spec.md §4.4).
    pub async fn members(&self) -> (Vec<u64>, Option<u64>) {
        let voters = self
            .storage
            .initial_state()
            .map(|s| s.conf_state.voters)
            .unwrap_or_default();
        (voters, self.leader_id().await)
    }

    /// Submit a command for replication; suspends until it applies (on
    /// the leader), times out, or is rejected as `not_leader`.
    pub async fn propose(&self, command: Command, timeout: Duration) -> Result<CommandReply> {
        if !self.is_leader().await {
            return Err(Error::NotLeader { leader_hint: self.leader_id().await });
        }

        let data = rmp_serde::to_vec(&command).map_err(|e| Error::Internal(format!("encode command: {e}")))?;
        let id = self.proposal_id.fetch_add(1, Ordering::SeqCst);
        let mut framed = Vec::with_capacity(8 + data.len());
        framed.extend_from_slice(&id.to_be_bytes());
        framed.extend_from_slice(&data);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, PendingProposal { tx });

        {
            let mut node = self.raw_node.lock().await;
            node.propose(vec![], framed)
                .map_err(|e| Error::Internal(format!("propose failed: {e}")))?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal("proposal channel dropped".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    /// `local_query` (spec.md §4.4): answer against this node's current
    /// applied state, no consensus round-trip.
    pub async fn local_query<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&StateMachine) -> R,
    {
        let sm = self.state_machine.read().await;
        f(&sm)
    }

    /// `consistent_query` (spec.md §4.4): a linearizable read via
    /// raft-rs's read-index protocol. The leader confirms it is still
    /// leader (a quorum heartbeat round) before the closure runs against
    /// local state, satisfying "reflects at least all commands committed
    /// at the time the query was accepted".
    pub async fn consistent_query<F, R>(&self, f: F, timeout: Duration) -> Result<R>
    where
        F: FnOnce(&StateMachine) -> R,
    {
        if !self.is_leader().await {
            return Err(Error::NotLeader { leader_hint: self.leader_id().await });
        }

        let ctx: Vec<u8> = rand::thread_rng().gen::<[u8; 16]>().to_vec();
        let (tx, rx) = oneshot::channel();
        self.pending_reads.lock().await.insert(ctx.clone(), PendingRead { tx });

        {
            let mut node = self.raw_node.lock().await;
            node.read_index(ctx.clone());
        }

        let required_index = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(index)) => index,
            Ok(Err(_)) => return Err(Error::Internal("read-index channel dropped".into())),
            Err(_) => {
                self.pending_reads.lock().await.remove(&ctx);
                return Err(Error::Timeout);
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            {
                let sm = self.state_machine.read().await;
                if sm.applied_index() >= required_index {
                    return Ok(f(&sm));
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub async fn add_voter(&self, node_id: u64, timeout: Duration) -> Result<()> {
        self.propose_conf_change(ConfChangeType::AddNode, node_id, timeout).await
    }

    pub async fn remove_voter(&self, node_id: u64, timeout: Duration) -> Result<()> {
        self.propose_conf_change(ConfChangeType::RemoveNode, node_id, timeout).await
    }

    async fn propose_conf_change(&self, change_type: ConfChangeType, node_id: u64, timeout: Duration) -> Result<()> {
        if !self.is_leader().await {
            return Err(Error::NotLeader { leader_hint: self.leader_id().await });
        }
        let mut cc = ConfChange::default();
        cc.set_change_type(change_type);
        cc.node_id = node_id;

        {
            let mut node = self.raw_node.lock().await;
            node.propose_conf_change(vec![], cc)
                .map_err(|e| Error::Internal(format!("propose_conf_change failed: {e}")))?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let (voters, _) = self.members().await;
            let present = voters.contains(&node_id);
            if present == matches!(change_type, ConfChangeType::AddNode) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn trigger_snapshot(&self) -> Result<()> {
        self.maybe_snapshot(true).await
    }

    /// Feed an inbound peer message into the raft state machine.
    pub async fn step(&self, msg: Message) -> Result<()> {
        self.raw_node
            .lock()
            .await
            .step(msg)
            .map_err(|e| Error::Internal(format!("step failed: {e}")))
    }

    pub async fn campaign(&self) -> Result<()> {
        self.raw_node
            .lock()
            .await
            .campaign()
            .map_err(|e| Error::Internal(format!("campaign failed: {e}")))
    }

    /// Drive one tick + ready cycle. Returns the messages that must be
    /// sent to peers; the caller (the background tick loop, or a test
    /// harness) is responsible for dispatch via `Transport`.
    pub async fn advance(&self) -> Result<Vec<Message>> {
        {
            let mut node = self.raw_node.lock().await;
            node.tick();
        }

        let mut messages = Vec::new();
        let mut node = self.raw_node.lock().await;
        if !node.has_ready() {
            return Ok(messages);
        }

        let prev_role = node.raft.state;
        let mut ready = node.ready();

        messages.extend(ready.take_messages());
        messages.extend(ready.take_persisted_messages());

        if !raft::is_empty_snap(ready.snapshot()) {
            let snapshot = ready.snapshot().clone();
            self.storage
                .apply_snapshot(snapshot.clone())
                .map_err(|e| Error::Internal(format!("apply_snapshot failed: {e}")))?;
            let bytes = snapshot.get_data().to_vec();
            if !bytes.is_empty() {
                self.install_snapshot_bytes(&bytes, snapshot.get_metadata().index).await?;
            }
        }

        if !ready.entries().is_empty() {
            self.storage
                .append(ready.entries())
                .map_err(|e| Error::Internal(format!("append failed: {e}")))?;
        }

        if let Some(hs) = ready.hs() {
            self.storage
                .set_hard_state(hs)
                .map_err(|e| Error::Internal(format!("set_hard_state failed: {e}")))?;
        }

        for read_state in ready.read_states() {
            self.resolve_pending_read(&read_state.request_ctx, read_state.index).await;
        }

        let committed = ready.take_committed_entries();
        if !committed.is_empty() {
            drop(node);
            self.apply_entries(committed).await?;
            node = self.raw_node.lock().await;
        }

        let mut light_rd = node.advance(ready);
        messages.extend(light_rd.take_messages());
        if !light_rd.committed_entries().is_empty() {
            let committed = light_rd.take_committed_entries();
            drop(node);
            self.apply_entries(committed).await?;
            node = self.raw_node.lock().await;
        }
        node.advance_apply();

        let new_role = node.raft.state;
        drop(node);
        if new_role != prev_role {
            self.sink.on_role_change(self.id(), role_name(new_role));
        }

        self.maybe_snapshot(false).await?;

        Ok(messages)
    }

    async fn apply_entries(&self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            if entry.data.is_empty() {
                continue;
            }
            match entry.get_entry_type() {
                EntryType::EntryNormal => self.apply_normal_entry(&entry).await?,
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    self.apply_conf_change(&entry).await?;
                }
            }
            self.applied_since_snapshot.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn apply_normal_entry(&self, entry: &Entry) -> Result<()> {
        if entry.data.len() < 8 {
            slog::warn!(self.logger, "short log entry, skipping"; "index" => entry.index);
            return Ok(());
        }
        let (id_bytes, cmd_bytes) = entry.data.split_at(8);
        let proposal_id = u64::from_be_bytes(id_bytes.try_into().map_err(|_| Error::Internal("bad proposal id".into()))?);

        let command: Command = rmp_serde::from_slice(cmd_bytes)
            .map_err(|e| Error::Internal(format!("corrupt committed command at index {}: {e}", entry.index)))?;

        let reply = {
            let mut sm = self.state_machine.write().await;
            sm.apply(entry.index, command)
        };

        if let Some(pending) = self.pending.lock().await.remove(&proposal_id) {
            let _ = pending.tx.send(reply);
        }
        Ok(())
    }

    async fn apply_conf_change(&self, entry: &Entry) -> Result<()> {
        let cc = decode_conf_change(entry)?;
        let conf_state = {
            let mut node = self.raw_node.lock().await;
            node.apply_conf_change(&cc)
                .map_err(|e| Error::Internal(format!("apply_conf_change failed: {e}")))?
        };
        self.storage
            .set_conf_state(&conf_state)
            .map_err(|e| Error::Internal(format!("persist conf_state failed: {e}")))?;
        slog::info!(self.logger, "applied conf change"; "index" => entry.index);
        Ok(())
    }

    async fn resolve_pending_read(&self, ctx: &[u8], index: u64) {
        if let Some(pending) = self.pending_reads.lock().await.remove(ctx) {
            let _ = pending.tx.send(index);
        }
    }

    async fn install_snapshot_bytes(&self, bytes: &[u8], applied_index: u64) -> Result<()> {
        let snapshot: StoreSnapshot =
            rmp_serde::from_slice(bytes).map_err(|e| Error::Internal(format!("corrupt snapshot payload: {e}")))?;
        let mut sm = self.state_machine.write().await;
        sm.restore(snapshot, applied_index)?;
        self.applied_since_snapshot.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn maybe_snapshot(&self, forced: bool) -> Result<()> {
        let since = self.applied_since_snapshot.load(Ordering::SeqCst);
        if !forced && since < self.config.snapshot_interval {
            return Ok(());
        }
        let applied_index = self.state_machine.read().await.applied_index();
        if applied_index == 0 {
            return Ok(());
        }
        let bytes = {
            let sm = self.state_machine.read().await;
            rmp_serde::to_vec(&sm.snapshot()).map_err(|e| Error::Internal(format!("encode snapshot: {e}")))?
        };
        self.storage
            .create_snapshot(applied_index, bytes)
            .map_err(|e| Error::Internal(format!("create_snapshot failed: {e}")))?;
        self.applied_since_snapshot.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Spawn the background tick loop: ticks on `config.tick_interval`,
    /// dispatching outbound messages through `transport` and delivering
    /// inbound messages from `inbox`.
    pub fn spawn_tick_loop(
        self: Arc<Self>,
        mut inbox: tokio::sync::mpsc::UnboundedReceiver<Message>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.advance().await {
                            Ok(messages) => {
                                for message in messages {
                                    self.transport.send(message.to, message);
                                }
                            }
                            Err(e) => slog::error!(self.logger, "advance failed"; "error" => %e),
                        }
                    }
                    Some(msg) = inbox.recv() => {
                        if let Err(e) = self.step(msg).await {
                            slog::warn!(self.logger, "step failed"; "error" => %e);
                        }
                    }
                    else => break,
                }
            }
        })
    }
}

fn role_name(role: StateRole) -> &'static str {
    match role {
        StateRole::Follower => "follower",
        StateRole::Candidate => "candidate",
        StateRole::Leader => "leader",
        StateRole::PreCandidate => "pre_candidate",
    }
}

fn decode_conf_change(entry: &Entry) -> Result<ConfChange> {
    use protobuf::Message as _;
    let mut cc = ConfChange::default();
    cc.merge_from_bytes(&entry.data)
        .map_err(|e| Error::Internal(format!("corrupt conf change: {e}")))?;
    Ok(cc)
}
