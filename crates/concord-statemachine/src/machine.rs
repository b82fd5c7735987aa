use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use concord_base::{
    Condition, Entry, Error, Key, ObserverSink, Payload, RawValue, Result, MAX_BATCH_SIZE,
};
use concord_codec::Codec;
use concord_store::{IndexName, MemoryStats, SecondaryIndex, Store};
use slog::Logger;

use crate::command::{Command, CommandReply, KeyOutcome, PutEntry, StoreSnapshot, TouchEntry, SNAPSHOT_SCHEMA_VERSION};

/// The deterministic transition function `(state, command) -> (state',
/// reply)`, plus the (unlogged) query handlers and snapshot machinery.
///
/// Every mutation goes through `apply`, called in strict log order by
/// exactly one thread per replica (spec.md §5's single-threaded apply
/// loop invariant). Queries borrow `&self` and never mutate.
pub struct StateMachine {
    store: Store,
    indexes: BTreeMap<IndexName, SecondaryIndex>,
    codec: Codec,
    sink: Arc<dyn ObserverSink>,
    logger: Logger,
    applied_index: u64,
}

impl StateMachine {
    pub fn new(codec: Codec, sink: Arc<dyn ObserverSink>, logger: Logger) -> Self {
        StateMachine {
            store: Store::new(),
            indexes: BTreeMap::new(),
            codec,
            sink,
            logger,
            applied_index: 0,
        }
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Apply one committed command. Infallible in the Rust-panic sense:
    /// every branch returns a typed `Result`, and the only way to abort
    /// the replica is the explicit `Error::Internal` + caller-driven
    /// shutdown path documented in spec.md §7.
    pub fn apply(&mut self, index: u64, command: Command) -> Result<CommandReply> {
        let start = Instant::now();
        let op = command_name(&command);
        let key_label = command_key_label(&command);

        let result = self.apply_inner(command);
        self.applied_index = index;

        self.sink.on_apply(op, key_label.as_deref(), start.elapsed());
        result
    }

    fn apply_inner(&mut self, command: Command) -> Result<CommandReply> {
        match command {
            Command::Put { key, payload, expires_at } => {
                self.do_put(key, payload, expires_at);
                Ok(CommandReply::Ok)
            }
            Command::Delete { key } => {
                self.do_delete(&key);
                Ok(CommandReply::Ok)
            }
            Command::PutIf { key, payload, expires_at, condition } => {
                self.do_put_if(key, payload, expires_at, condition)?;
                Ok(CommandReply::Ok)
            }
            Command::DeleteIf { key, condition } => {
                self.do_delete_if(key, condition)?;
                Ok(CommandReply::Ok)
            }
            Command::Touch { key, additional_ttl_s } => {
                self.do_touch(&key, additional_ttl_s)?;
                Ok(CommandReply::Ok)
            }
            Command::CleanupExpired => {
                let sweep_start = Instant::now();
                let (deleted, scanned) = self.store.sweep_expired(now());
                self.sink.on_ttl_cleanup(deleted, scanned, sweep_start.elapsed());
                Ok(CommandReply::Count(deleted))
            }
            Command::PutMany { entries } => {
                if entries.len() > MAX_BATCH_SIZE {
                    return Err(Error::BatchTooLarge { max: MAX_BATCH_SIZE });
                }
                let outcomes = entries
                    .into_iter()
                    .map(|e| {
                        let key = e.key.clone();
                        self.do_put(e.key, e.payload, e.expires_at);
                        KeyOutcome::ok(key)
                    })
                    .collect();
                Ok(CommandReply::Batch(outcomes))
            }
            Command::DeleteMany { keys } => {
                if keys.len() > MAX_BATCH_SIZE {
                    return Err(Error::BatchTooLarge { max: MAX_BATCH_SIZE });
                }
                let outcomes = keys
                    .into_iter()
                    .map(|key| {
                        if self.do_delete(&key) {
                            KeyOutcome::ok(key)
                        } else {
                            KeyOutcome::err(key, Error::NotFound)
                        }
                    })
                    .collect();
                Ok(CommandReply::Batch(outcomes))
            }
            Command::TouchMany { pairs } => {
                if pairs.len() > MAX_BATCH_SIZE {
                    return Err(Error::BatchTooLarge { max: MAX_BATCH_SIZE });
                }
                let outcomes = pairs
                    .into_iter()
                    .map(|TouchEntry { key, additional_ttl_s }| {
                        match self.do_touch(&key, additional_ttl_s) {
                            Ok(()) => KeyOutcome::ok(key),
                            Err(e) => KeyOutcome::err(key, e),
                        }
                    })
                    .collect();
                Ok(CommandReply::Batch(outcomes))
            }
            Command::CreateIndex { name, extractor } => {
                if self.indexes.contains_key(&name) {
                    return Err(Error::IndexExists);
                }
                let mut index = SecondaryIndex::new(extractor);
                for (key, entry) in self.store.entries() {
                    if entry.is_expired(now()) {
                        continue;
                    }
                    if let Ok(value) = self.codec.decode(&entry.payload) {
                        index.update(key, &value);
                    }
                }
                self.indexes.insert(name, index);
                Ok(CommandReply::Ok)
            }
            Command::DropIndex { name } => {
                if self.indexes.remove(&name).is_none() {
                    return Err(Error::IndexNotFound);
                }
                Ok(CommandReply::Ok)
            }
        }
    }

    fn do_put(&mut self, key: Key, payload: Payload, expires_at: Option<i64>) {
        if let Ok(value) = self.codec.decode(&payload) {
            self.reindex_key(&key, &value);
        }
        self.store.insert(key, Entry::new(payload, expires_at));
    }

    /// Removes `key`, returning whether it was actually present.
    fn do_delete(&mut self, key: &Key) -> bool {
        let present = self.store.remove(key);
        for index in self.indexes.values_mut() {
            index.remove(key);
        }
        present
    }

    fn do_put_if(&mut self, key: Key, payload: Payload, expires_at: Option<i64>, condition: Condition) -> Result<()> {
        self.check_condition(&key, &condition)?;
        self.do_put(key, payload, expires_at);
        Ok(())
    }

    fn do_delete_if(&mut self, key: Key, condition: Condition) -> Result<()> {
        self.check_condition(&key, &condition)?;
        self.do_delete(&key);
        Ok(())
    }

    fn check_condition(&self, key: &Key, condition: &Condition) -> Result<()> {
        let current = self.store.lookup(key).filter(|e| !e.is_expired(now()));
        let current = current.ok_or(Error::NotFound)?;
        let current_value = self.codec.decode(&current.payload)?;
        let holds = match condition {
            Condition::Expected(expected) => &current_value == expected,
            Condition::Predicate(descriptor) => descriptor.test(&current_value),
        };
        if holds {
            Ok(())
        } else {
            Err(Error::ConditionFailed)
        }
    }

    fn do_touch(&mut self, key: &Key, additional_ttl_s: i64) -> Result<()> {
        let now_ts = now();
        let entry = self
            .store
            .lookup(key)
            .filter(|e| !e.is_expired(now_ts))
            .cloned()
            .ok_or(Error::NotFound)?;
        let new_expires_at = Some(now_ts + additional_ttl_s);
        self.store.insert(key.clone(), Entry::new(entry.payload, new_expires_at));
        Ok(())
    }

    fn reindex_key(&mut self, key: &Key, value: &RawValue) {
        for index in self.indexes.values_mut() {
            index.update(key, value);
        }
    }

    // ----- Queries (not logged) -----

    pub fn get(&self, key: &Key) -> Result<RawValue> {
        let entry = self.live_entry(key)?;
        self.codec.decode(&entry.payload)
    }

    pub fn get_with_ttl(&self, key: &Key) -> Result<(RawValue, Option<i64>)> {
        let entry = self.live_entry(key)?;
        let value = self.codec.decode(&entry.payload)?;
        Ok((value, entry.remaining_ttl(now())))
    }

    pub fn get_many(&self, keys: &[Key]) -> BTreeMap<Key, Result<RawValue>> {
        keys.iter().map(|k| (k.clone(), self.get(k))).collect()
    }

    pub fn get_all(&self) -> BTreeMap<Key, RawValue> {
        let now_ts = now();
        self.store
            .scan()
            .filter(|(_, e)| !e.is_expired(now_ts))
            .filter_map(|(k, e)| self.codec.decode(&e.payload).ok().map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn get_all_with_ttl(&self) -> BTreeMap<Key, (RawValue, Option<i64>)> {
        let now_ts = now();
        self.store
            .scan()
            .filter(|(_, e)| !e.is_expired(now_ts))
            .filter_map(|(k, e)| {
                self.codec
                    .decode(&e.payload)
                    .ok()
                    .map(|v| (k.clone(), (v, e.remaining_ttl(now_ts))))
            })
            .collect()
    }

    pub fn ttl(&self, key: &Key) -> Result<i64> {
        let entry = self.live_entry(key)?;
        entry.remaining_ttl(now()).ok_or(Error::NoTtl)
    }

    pub fn stats(&self) -> MemoryStats {
        self.store.stats()
    }

    pub fn index_lookup(&self, name: &str, term: &RawValue) -> Result<Vec<Key>> {
        let index = self.indexes.get(name).ok_or(Error::IndexNotFound)?;
        Ok(index.lookup(term).unwrap_or_default())
    }

    pub fn list_indexes(&self) -> Vec<IndexName> {
        self.indexes.keys().cloned().collect()
    }

    fn live_entry(&self, key: &Key) -> Result<&Entry> {
        self.store
            .lookup(key)
            .filter(|e| !e.is_expired(now()))
            .ok_or(Error::NotFound)
    }

    // ----- Snapshotting -----

    /// Produce a full snapshot of the Store. Installation (`restore`)
    /// replaces Store contents atomically and rebuilds every registered
    /// index from the restored entries.
    pub fn snapshot(&self) -> StoreSnapshot {
        let entries: Vec<(Key, Entry)> = self
            .store
            .entries()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.sink.on_snapshot("created", entries.len());
        StoreSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            entries,
        }
    }

    pub fn restore(&mut self, snapshot: StoreSnapshot, applied_index: u64) -> Result<()> {
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(Error::Internal(format!(
                "unsupported snapshot schema version {}",
                snapshot.schema_version
            )));
        }
        let count = snapshot.entries.len();
        self.store.restore(snapshot.entries.into_iter().collect());
        self.applied_index = applied_index;

        let extractors: Vec<(IndexName, concord_base::Descriptor)> = self
            .indexes
            .iter()
            .map(|(name, idx)| (name.clone(), idx.extractor().clone()))
            .collect();
        for (name, extractor) in extractors {
            let mut index = SecondaryIndex::new(extractor);
            for (key, entry) in self.store.entries() {
                if entry.is_expired(now()) {
                    continue;
                }
                if let Ok(value) = self.codec.decode(&entry.payload) {
                    index.update(key, &value);
                }
            }
            self.indexes.insert(name, index);
        }

        self.sink.on_snapshot("installed", count);
        slog::info!(self.logger, "installed snapshot"; "entries" => count, "index" => applied_index);
        Ok(())
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Put { .. } => "put",
        Command::Delete { .. } => "delete",
        Command::PutIf { .. } => "put_if",
        Command::DeleteIf { .. } => "delete_if",
        Command::Touch { .. } => "touch",
        Command::CleanupExpired => "cleanup_expired",
        Command::PutMany { .. } => "put_many",
        Command::DeleteMany { .. } => "delete_many",
        Command::TouchMany { .. } => "touch_many",
        Command::CreateIndex { .. } => "create_index",
        Command::DropIndex { .. } => "drop_index",
    }
}

fn command_key_label(command: &Command) -> Option<String> {
    match command {
        Command::Put { key, .. }
        | Command::Delete { key }
        | Command::PutIf { key, .. }
        | Command::DeleteIf { key, .. }
        | Command::Touch { key, .. } => Some(key.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_base::{Descriptor, FieldPath, NoopSink};
    use concord_codec::{Codec, CodecConfig};

    fn sm() -> StateMachine {
        StateMachine::new(Codec::new(CodecConfig::default()), Arc::new(NoopSink), Logger::root(slog::Discard, slog::o!()))
    }

    fn key(s: &str) -> Key {
        Key::new(s.as_bytes().to_vec()).unwrap()
    }

    fn value(s: &str) -> RawValue {
        concord_base::encode_value(&s.to_string()).unwrap()
    }

    fn decode(v: &RawValue) -> String {
        concord_base::decode_value(v).unwrap()
    }

    /// S1: put then get; delete then get returns not_found.
    #[test]
    fn s1_basic_put_get_delete() {
        let mut m = sm();
        m.apply(1, Command::Put { key: key("k"), payload: Payload::Raw(value("v")), expires_at: None }).unwrap();
        assert_eq!(decode(&m.get(&key("k")).unwrap()), "v");

        m.apply(2, Command::Delete { key: key("k") }).unwrap();
        assert!(matches!(m.get(&key("k")), Err(Error::NotFound)));
    }

    /// S2: TTL visibility and expiry.
    #[test]
    fn s2_ttl_visibility() {
        let mut m = sm();
        let now_ts = now();
        m.apply(1, Command::Put { key: key("s"), payload: Payload::Raw(value("x")), expires_at: Some(now_ts + 1) }).unwrap();
        let (_, ttl) = m.get_with_ttl(&key("s")).unwrap();
        assert_eq!(ttl, Some(1));

        // simulate time passing past expiry by checking against a future `now`
        let entry = m.store.lookup(&key("s")).unwrap().clone();
        assert!(entry.is_expired(now_ts + 2));
    }

    /// S3: CAS — exactly one of two racing put_if(expected=0) wins.
    #[test]
    fn s3_cas_race() {
        let mut m = sm();
        m.apply(1, Command::Put { key: key("c"), payload: Payload::Raw(value("0")), expires_at: None }).unwrap();

        let first = m.apply(
            2,
            Command::PutIf {
                key: key("c"),
                payload: Payload::Raw(value("1")),
                expires_at: None,
                condition: Condition::Expected(value("0")),
            },
        );
        let second = m.apply(
            3,
            Command::PutIf {
                key: key("c"),
                payload: Payload::Raw(value("2")),
                expires_at: None,
                condition: Condition::Expected(value("0")),
            },
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::ConditionFailed)));
        assert_eq!(decode(&m.get(&key("c")).unwrap()), "1");
    }

    /// S4: batch put_many / get_many.
    #[test]
    fn s4_batch_put_get_many() {
        let mut m = sm();
        let entries = vec![
            PutEntry { key: key("a"), payload: Payload::Raw(value("1")), expires_at: None },
            PutEntry { key: key("b"), payload: Payload::Raw(value("2")), expires_at: None },
            PutEntry { key: key("c"), payload: Payload::Raw(value("3")), expires_at: None },
        ];
        let reply = m.apply(1, Command::PutMany { entries }).unwrap();
        match reply {
            CommandReply::Batch(outcomes) => assert!(outcomes.iter().all(|o| o.ok)),
            _ => panic!("expected batch reply"),
        }

        let results = m.get_many(&[key("a"), key("b"), key("c"), key("d")]);
        assert_eq!(decode(results[&key("a")].as_ref().unwrap()), "1");
        assert_eq!(decode(results[&key("b")].as_ref().unwrap()), "2");
        assert_eq!(decode(results[&key("c")].as_ref().unwrap()), "3");
        assert!(matches!(results[&key("d")], Err(Error::NotFound)));
    }

    /// Property 8: batch size cap.
    #[test]
    fn batch_too_large_rejected() {
        let mut m = sm();
        let keys: Vec<Key> = (0..MAX_BATCH_SIZE + 1).map(|i| key(&format!("k{i}"))).collect();
        let result = m.apply(1, Command::DeleteMany { keys });
        assert!(matches!(result, Err(Error::BatchTooLarge { max }) if max == MAX_BATCH_SIZE));
    }

    /// Property 4: idempotent delete.
    #[test]
    fn idempotent_delete() {
        let mut m = sm();
        m.apply(1, Command::Put { key: key("k"), payload: Payload::Raw(value("v")), expires_at: None }).unwrap();
        m.apply(2, Command::Delete { key: key("k") }).unwrap();
        let reply = m.apply(3, Command::Delete { key: key("k") });
        assert!(matches!(reply, Ok(CommandReply::Ok)));
    }

    /// Property 7: touch resets from `now`, not from the previous deadline.
    #[test]
    fn touch_sets_absolute_deadline() {
        let mut m = sm();
        let now_ts = now();
        m.apply(1, Command::Put { key: key("k"), payload: Payload::Raw(value("v")), expires_at: Some(now_ts + 5) }).unwrap();
        m.apply(2, Command::Touch { key: key("k"), additional_ttl_s: 100 }).unwrap();
        let entry = m.store.lookup(&key("k")).unwrap();
        assert_eq!(entry.expires_at, Some(now_ts + 100));
    }

    #[test]
    fn index_create_lookup_drop() {
        let mut m = sm();
        m.apply(1, Command::Put { key: key("a"), payload: Payload::Raw(value("blue")), expires_at: None }).unwrap();
        m.apply(2, Command::CreateIndex { name: "by_value".into(), extractor: Descriptor::Field(FieldPath::Root) }).unwrap();
        m.apply(3, Command::Put { key: key("b"), payload: Payload::Raw(value("blue")), expires_at: None }).unwrap();

        let hits = m.index_lookup("by_value", &value("blue")).unwrap();
        assert_eq!(hits.len(), 2);

        m.apply(4, Command::DropIndex { name: "by_value".into() }).unwrap();
        assert!(matches!(m.index_lookup("by_value", &value("blue")), Err(Error::IndexNotFound)));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut m = sm();
        for i in 0..50 {
            m.apply(i + 1, Command::Put { key: key(&format!("k{i}")), payload: Payload::Raw(value("v")), expires_at: None }).unwrap();
        }
        let snap = m.snapshot();
        assert_eq!(snap.entries.len(), 50);

        let mut restored = sm();
        restored.restore(snap, 50).unwrap();
        assert_eq!(restored.get_all().len(), 50);
        assert_eq!(restored.applied_index(), 50);
    }

    #[test]
    fn create_index_twice_errs() {
        let mut m = sm();
        m.apply(1, Command::CreateIndex { name: "i".into(), extractor: Descriptor::Field(FieldPath::Root) }).unwrap();
        let second = m.apply(2, Command::CreateIndex { name: "i".into(), extractor: Descriptor::Field(FieldPath::Root) });
        assert!(matches!(second, Err(Error::IndexExists)));
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn sm() -> StateMachine {
        StateMachine::new(
            Codec::new(concord_codec::CodecConfig::default()),
            Arc::new(concord_base::NoopSink),
            Logger::root(slog::Discard, slog::o!()),
        )
    }

    proptest! {
        /// Property 1 (spec.md §8): put(k, v) followed by get(k) on the
        /// same replica always returns exactly `v`, for any key/value.
        #[test]
        fn put_then_get_round_trips(key_bytes in proptest::collection::vec(any::<u8>(), 1..64), value in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut m = sm();
            let key = Key::new(key_bytes).unwrap();
            let encoded = concord_base::encode_value(&value).unwrap();
            m.apply(1, Command::Put { key: key.clone(), payload: Payload::Raw(encoded), expires_at: None }).unwrap();
            let got: Vec<u8> = concord_base::decode_value(&m.get(&key).unwrap()).unwrap();
            prop_assert_eq!(got, value);
        }

        /// Property 4 (spec.md §8): deleting a key twice is a no-op the
        /// second time and leaves the key absent either way.
        #[test]
        fn double_delete_is_idempotent(key_bytes in proptest::collection::vec(any::<u8>(), 1..64)) {
            let mut m = sm();
            let key = Key::new(key_bytes).unwrap();
            m.apply(1, Command::Put { key: key.clone(), payload: Payload::Raw(vec![0]), expires_at: None }).unwrap();
            m.apply(2, Command::Delete { key: key.clone() }).unwrap();
            let second = m.apply(3, Command::Delete { key: key.clone() });
            prop_assert!(matches!(second, Ok(CommandReply::Ok)));
            prop_assert!(matches!(m.get(&key), Err(Error::NotFound)));
        }
    }
}
