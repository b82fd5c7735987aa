//! The deterministic in-memory map from `Key` to `Entry` (C1), plus the
//! per-node secondary index tables (C8) kept in sync with it.
//!
//! Both are owned exclusively by the state machine's apply loop —
//! nothing in this crate takes a lock or spawns a thread. Concurrent
//! access from query paths happens over a read-only snapshot taken by
//! the caller, never over a reference into a `Store` being mutated.

mod index;
mod store;

pub use index::{IndexName, SecondaryIndex};
pub use store::{MemoryStats, Store};
