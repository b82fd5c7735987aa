use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_base::{Condition, Consistency, Descriptor, Error, Key, RawValue, Result};
use concord_codec::Codec;
use concord_raft::RaftNode;
use concord_statemachine::{Command, CommandReply, PutEntry, TouchEntry};
use concord_store::MemoryStats;
use slog::Logger;

/// Options common to every request: which read consistency to use (reads
/// only) and how long to wait before giving up.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub consistency: Option<Consistency>,
    pub timeout: Option<Duration>,
}

/// Options for `put`/`put_many`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub ttl_s: Option<i64>,
    /// Force compression regardless of `compression.threshold_bytes`.
    pub compress: bool,
    pub timeout: Option<Duration>,
}

/// Options for `put_if`/`delete_if`: exactly one of `expected` or
/// `condition` must be set (spec.md §4.5's "conditional operation
/// argument validation").
#[derive(Debug, Clone, Default)]
pub struct ConditionalOptions {
    pub expected: Option<RawValue>,
    pub condition: Option<Descriptor>,
    pub ttl_s: Option<i64>,
    pub timeout: Option<Duration>,
}

/// One entry of a `put_many` batch.
#[derive(Debug, Clone)]
pub struct PutManyEntry {
    pub key: Key,
    pub value: RawValue,
    pub ttl_s: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub members: Vec<u64>,
    pub leader: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub cluster: ClusterInfo,
    pub storage: MemoryStats,
    pub node: u64,
}

/// How many times `propose` retries after `not_leader` before giving up,
/// spaced out across whatever remains of the caller's timeout. Bounded
/// per spec.md §4.5's "small bounded number of redirects".
const MAX_NOT_LEADER_RETRIES: u32 = 5;

/// The single public entry point (C5). Validates inputs, routes commands
/// through the embedded `RaftNode`, applies the configured compression
/// policy before proposing, and surfaces typed errors — never panics.
pub struct ClusterClient {
    node: Arc<RaftNode>,
    codec: Codec,
    default_consistency: Consistency,
    default_timeout: Duration,
    sink: Arc<dyn concord_base::ObserverSink>,
    logger: Logger,
}

impl ClusterClient {
    pub fn new(
        node: Arc<RaftNode>,
        codec: Codec,
        default_consistency: Consistency,
        default_timeout: Duration,
        sink: Arc<dyn concord_base::ObserverSink>,
        logger: Logger,
    ) -> Self {
        ClusterClient {
            node,
            codec,
            default_consistency,
            default_timeout,
            sink,
            logger,
        }
    }

    fn timeout_of(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.default_timeout)
    }

    fn consistency_of(&self, consistency: Option<Consistency>) -> Consistency {
        consistency.unwrap_or(self.default_consistency)
    }

    fn record<T>(&self, op: &'static str, consistency: Consistency, started: Instant, result: &Result<T>) {
        self.sink.on_api_call(op, result.is_ok(), started.elapsed(), consistency);
    }

    /// Proposes `command`, retrying a bounded number of times if the
    /// local replica is not currently the leader — the redirect to a
    /// remote leader, if this process isn't it, is a peer-transport
    /// concern owned by the collaborator embedding this client.
    async fn propose(&self, command: Command, timeout: Duration) -> Result<CommandReply> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match self.node.propose(command.clone(), remaining).await {
                Err(Error::NotLeader { leader_hint }) if attempt < MAX_NOT_LEADER_RETRIES => {
                    attempt += 1;
                    slog::debug!(self.logger, "not leader, retrying"; "attempt" => attempt, "hint" => ?leader_hint);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => return other,
            }
        }
    }

    pub async fn put(&self, key: Key, value: RawValue, opts: PutOptions) -> Result<()> {
        let started = Instant::now();
        let timeout = self.timeout_of(opts.timeout);
        let payload = self.codec.encode(value, opts.compress)?;
        let result = self
            .propose(
                Command::Put { key, payload, expires_at: opts.ttl_s.map(|s| now() + s) },
                timeout,
            )
            .await
            .map(|_| ());
        self.record("put", Consistency::Leader, started, &result);
        result
    }

    pub async fn get(&self, key: &Key, opts: RequestOptions) -> Result<RawValue> {
        let started = Instant::now();
        let consistency = self.consistency_of(opts.consistency);
        let timeout = self.timeout_of(opts.timeout);
        let key = key.clone();
        let result = self.read(consistency, timeout, move |sm| sm.get(&key)).await;
        self.record("get", consistency, started, &result);
        result
    }

    pub async fn get_with_ttl(&self, key: &Key, opts: RequestOptions) -> Result<(RawValue, Option<i64>)> {
        let started = Instant::now();
        let consistency = self.consistency_of(opts.consistency);
        let timeout = self.timeout_of(opts.timeout);
        let key = key.clone();
        let result = self.read(consistency, timeout, move |sm| sm.get_with_ttl(&key)).await;
        self.record("get_with_ttl", consistency, started, &result);
        result
    }

    pub async fn ttl(&self, key: &Key, opts: RequestOptions) -> Result<i64> {
        let started = Instant::now();
        let consistency = self.consistency_of(opts.consistency);
        let timeout = self.timeout_of(opts.timeout);
        let key = key.clone();
        let result = self.read(consistency, timeout, move |sm| sm.ttl(&key)).await;
        self.record("ttl", consistency, started, &result);
        result
    }

    pub async fn delete(&self, key: Key, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let timeout = self.timeout_of(timeout);
        let result = self.propose(Command::Delete { key }, timeout).await.map(|_| ());
        self.record("delete", Consistency::Leader, started, &result);
        result
    }

    pub async fn touch(&self, key: Key, additional_ttl_s: i64, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let timeout = self.timeout_of(timeout);
        let result = self
            .propose(Command::Touch { key, additional_ttl_s }, timeout)
            .await
            .map(|_| ());
        self.record("touch", Consistency::Leader, started, &result);
        result
    }

    pub async fn put_if(&self, key: Key, value: RawValue, opts: ConditionalOptions) -> Result<()> {
        let started = Instant::now();
        let timeout = self.timeout_of(opts.timeout);
        let condition = condition_from(opts.expected, opts.condition)?;
        let payload = self.codec.encode(value, false)?;
        let result = self
            .propose(
                Command::PutIf { key, payload, expires_at: opts.ttl_s.map(|s| now() + s), condition },
                timeout,
            )
            .await
            .map(|_| ());
        self.record("put_if", Consistency::Leader, started, &result);
        result
    }

    pub async fn delete_if(&self, key: Key, opts: ConditionalOptions) -> Result<()> {
        let started = Instant::now();
        let timeout = self.timeout_of(opts.timeout);
        let condition = condition_from(opts.expected, opts.condition)?;
        let result = self.propose(Command::DeleteIf { key, condition }, timeout).await.map(|_| ());
        self.record("delete_if", Consistency::Leader, started, &result);
        result
    }

    pub async fn put_many(&self, entries: Vec<PutManyEntry>, timeout: Option<Duration>) -> Result<Vec<concord_statemachine::KeyOutcome>> {
        let started = Instant::now();
        let timeout = self.timeout_of(timeout);
        if entries.len() > concord_base::MAX_BATCH_SIZE {
            let result = Err(Error::BatchTooLarge { max: concord_base::MAX_BATCH_SIZE });
            self.record("put_many", Consistency::Leader, started, &result);
            return result;
        }
        let mut put_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = self.codec.encode(entry.value, false)?;
            put_entries.push(PutEntry {
                key: entry.key,
                payload,
                expires_at: entry.ttl_s.map(|s| now() + s),
            });
        }
        let result = self
            .propose(Command::PutMany { entries: put_entries }, timeout)
            .await
            .and_then(expect_batch);
        self.record("put_many", Consistency::Leader, started, &result);
        result
    }

    pub async fn get_many(&self, keys: &[Key], opts: RequestOptions) -> Result<BTreeMap<Key, Result<RawValue>>> {
        let started = Instant::now();
        let consistency = self.consistency_of(opts.consistency);
        let timeout = self.timeout_of(opts.timeout);
        if keys.len() > concord_base::MAX_BATCH_SIZE {
            let result: Result<BTreeMap<Key, Result<RawValue>>> = Err(Error::BatchTooLarge { max: concord_base::MAX_BATCH_SIZE });
            self.record("get_many", consistency, started, &result);
            return result;
        }
        let keys = keys.to_vec();
        let result = self.read(consistency, timeout, move |sm| Ok(sm.get_many(&keys))).await;
        self.record("get_many", consistency, started, &result);
        result
    }

    pub async fn delete_many(&self, keys: Vec<Key>, timeout: Option<Duration>) -> Result<Vec<concord_statemachine::KeyOutcome>> {
        let started = Instant::now();
        let timeout = self.timeout_of(timeout);
        if keys.len() > concord_base::MAX_BATCH_SIZE {
            let result = Err(Error::BatchTooLarge { max: concord_base::MAX_BATCH_SIZE });
            self.record("delete_many", Consistency::Leader, started, &result);
            return result;
        }
        let result = self.propose(Command::DeleteMany { keys }, timeout).await.and_then(expect_batch);
        self.record("delete_many", Consistency::Leader, started, &result);
        result
    }

    pub async fn touch_many(&self, pairs: Vec<(Key, i64)>, timeout: Option<Duration>) -> Result<Vec<concord_statemachine::KeyOutcome>> {
        let started = Instant::now();
        let timeout = self.timeout_of(timeout);
        if pairs.len() > concord_base::MAX_BATCH_SIZE {
            let result = Err(Error::BatchTooLarge { max: concord_base::MAX_BATCH_SIZE });
            self.record("touch_many", Consistency::Leader, started, &result);
            return result;
        }
        let pairs = pairs
            .into_iter()
            .map(|(key, additional_ttl_s)| TouchEntry { key, additional_ttl_s })
            .collect();
        let result = self.propose(Command::TouchMany { pairs }, timeout).await.and_then(expect_batch);
        self.record("touch_many", Consistency::Leader, started, &result);
        result
    }

    pub async fn get_all(&self, opts: RequestOptions) -> Result<BTreeMap<Key, RawValue>> {
        let started = Instant::now();
        let consistency = self.consistency_of(opts.consistency);
        let timeout = self.timeout_of(opts.timeout);
        let result = self.read(consistency, timeout, |sm| Ok(sm.get_all())).await;
        self.record("get_all", consistency, started, &result);
        result
    }

    pub async fn create_index(&self, name: String, extractor: Descriptor, timeout: Option<Duration>) -> Result<()> {
        let timeout = self.timeout_of(timeout);
        self.propose(Command::CreateIndex { name, extractor }, timeout).await.map(|_| ())
    }

    pub async fn drop_index(&self, name: String, timeout: Option<Duration>) -> Result<()> {
        let timeout = self.timeout_of(timeout);
        self.propose(Command::DropIndex { name }, timeout).await.map(|_| ())
    }

    pub async fn index_lookup(&self, name: String, term: RawValue, opts: RequestOptions) -> Result<Vec<Key>> {
        let consistency = self.consistency_of(opts.consistency);
        let timeout = self.timeout_of(opts.timeout);
        self.read(consistency, timeout, move |sm| sm.index_lookup(&name, &term)).await
    }

    /// Issues a single `cleanup_expired` command; used directly by tests
    /// and by `TtlReaper`'s periodic timer.
    pub async fn propose_cleanup(&self, timeout: Duration) -> Result<usize> {
        match self.propose(Command::CleanupExpired, timeout).await? {
            CommandReply::Count(n) => Ok(n),
            other => Err(Error::Internal(format!("unexpected reply to cleanup_expired: {other:?}"))),
        }
    }

    pub async fn members(&self) -> Vec<u64> {
        self.node.members().await.0
    }

    pub async fn status(&self, opts: RequestOptions) -> Result<Status> {
        let consistency = self.consistency_of(opts.consistency);
        let timeout = self.timeout_of(opts.timeout);
        let storage = self.read(consistency, timeout, |sm| Ok(sm.stats())).await?;
        let (members, leader) = self.node.members().await;
        Ok(Status {
            cluster: ClusterInfo { members, leader },
            storage,
            node: self.node.id(),
        })
    }

    async fn read<F, R>(&self, consistency: Consistency, timeout: Duration, f: F) -> Result<R>
    where
        F: FnOnce(&concord_statemachine::StateMachine) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        match consistency {
            Consistency::Eventual => self.node.local_query(f).await,
            Consistency::Leader => {
                if !self.node.is_leader().await {
                    return Err(Error::NotLeader { leader_hint: self.node.leader_id().await });
                }
                self.node.local_query(f).await
            }
            Consistency::Strong => self.node.consistent_query(f, timeout).await?,
        }
    }
}

fn condition_from(expected: Option<RawValue>, condition: Option<Descriptor>) -> Result<Condition> {
    match (expected, condition) {
        (Some(v), None) => Ok(Condition::Expected(v)),
        (None, Some(d)) => Ok(Condition::Predicate(d)),
        (None, None) => Err(Error::MissingCondition),
        (Some(_), Some(_)) => Err(Error::ConflictingConditions),
    }
}

fn expect_batch(reply: CommandReply) -> Result<Vec<concord_statemachine::KeyOutcome>> {
    match reply {
        CommandReply::Batch(outcomes) => Ok(outcomes),
        other => Err(Error::Internal(format!("unexpected reply to batch command: {other:?}"))),
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
