use serde::{Deserialize, Serialize};

use concord_base::{Condition, Descriptor, Entry, Key, Payload};

/// A single key/payload/ttl triple inside a `put_many` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutEntry {
    pub key: Key,
    pub payload: Payload,
    pub expires_at: Option<i64>,
}

/// A single key/ttl pair inside a `touch_many` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchEntry {
    pub key: Key,
    pub additional_ttl_s: i64,
}

/// The replicated command alphabet (spec.md §4.3). Every replica applies
/// exactly this enum, in exactly this log order.
///
/// `payload` fields already carry whatever compression ClusterClient
/// chose to apply before proposing — the state machine never compresses,
/// it only ever decodes for reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Put {
        key: Key,
        payload: Payload,
        expires_at: Option<i64>,
    },
    Delete {
        key: Key,
    },
    PutIf {
        key: Key,
        payload: Payload,
        expires_at: Option<i64>,
        condition: Condition,
    },
    DeleteIf {
        key: Key,
        condition: Condition,
    },
    Touch {
        key: Key,
        additional_ttl_s: i64,
    },
    CleanupExpired,
    PutMany {
        entries: Vec<PutEntry>,
    },
    DeleteMany {
        keys: Vec<Key>,
    },
    TouchMany {
        pairs: Vec<TouchEntry>,
    },
    CreateIndex {
        name: String,
        extractor: Descriptor,
    },
    DropIndex {
        name: String,
    },
}

/// The outcome of one key within a batch command. Lives only in the
/// in-process reply path (never serialized onto the log), so it can
/// carry `concord_base::Error` directly.
#[derive(Debug, Clone)]
pub struct KeyOutcome {
    pub key: Key,
    pub ok: bool,
    pub error: Option<concord_base::Error>,
}

impl KeyOutcome {
    pub fn ok(key: Key) -> Self {
        KeyOutcome { key, ok: true, error: None }
    }

    pub fn err(key: Key, error: concord_base::Error) -> Self {
        KeyOutcome { key, ok: false, error: Some(error) }
    }
}

/// The reply produced by `StateMachine::apply`.
#[derive(Debug, Clone)]
pub enum CommandReply {
    /// `put`, `delete`, `create_index`, `drop_index` success.
    Ok,
    /// `cleanup_expired` success, carrying the deleted count.
    Count(usize),
    /// `put_many`/`delete_many`/`touch_many` per-key outcomes.
    Batch(Vec<KeyOutcome>),
}

/// Snapshot of the Store as of a given applied index: the unit
/// `StateMachine::snapshot`/`restore_snapshot` exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: u32,
    pub entries: Vec<(Key, Entry)>,
}

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
