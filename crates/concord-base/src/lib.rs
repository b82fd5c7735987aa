//! Shared types for Concord: keys, values, entries, the replicated
//! descriptor DSL, the error taxonomy, and the observability hook.
//!
//! Nothing in this crate talks to Raft or touches disk; it is the
//! vocabulary every other `concord-*` crate is built from, so that the
//! same `Entry` bytes mean the same thing on every replica.

mod descriptor;
mod entry;
mod error;
mod key;
mod observer;

pub use descriptor::{Condition, Descriptor, FieldPath};
pub use entry::{CompressedEnvelope, CompressionAlgorithm, Entry, Payload};
pub use error::{Error, Result};
pub use key::{Key, MAX_BATCH_SIZE, MAX_KEY_BYTES};
pub use observer::{ObserverSink, NoopSink};

/// Read consistency level requested by a `ClusterClient` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Consistency {
    /// Route to any replica, answer from that replica's local applied state.
    Eventual,
    /// Route to the leader, answer from the leader's local applied state.
    Leader,
    /// Route to the leader, go through a read-index/lease barrier first.
    Strong,
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::Leader
    }
}

/// Opaque replicated value as it crosses the `concord-base` boundary.
///
/// The core never inspects the bytes beyond the compression envelope tag;
/// typed producers serialize with `rmp_serde::to_vec` before calling
/// `put`, and deserialize what `get` returns.
pub type RawValue = Vec<u8>;

/// Encode a serializable value into the canonical wire form (MessagePack).
pub fn encode_value<T: serde::Serialize>(value: &T) -> Result<RawValue> {
    rmp_serde::to_vec(value).map_err(|e| Error::Internal(format!("value encode failed: {e}")))
}

/// Decode a value previously produced by [`encode_value`].
pub fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Internal(format!("value decode failed: {e}")))
}
