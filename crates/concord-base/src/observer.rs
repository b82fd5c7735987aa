use std::time::Duration;

use crate::Consistency;

/// Structured event sink injected at `Cluster::start` time.
///
/// This is the entire observability surface the core exposes: metrics
/// exporters, tracing bridges, and audit logs are external collaborators
/// that implement this trait (or wrap one that does). Every method has a
/// no-op default so a sink only needs to implement the events it cares
/// about. Implementations must be side-effect-only — they run inline on
/// the apply loop and must not block or panic.
pub trait ObserverSink: Send + Sync {
    /// Fired after every state machine apply.
    fn on_apply(&self, _op: &str, _key: Option<&str>, _duration: Duration) {}

    /// Fired after every public `ClusterClient` call.
    fn on_api_call(&self, _op: &str, _ok: bool, _duration: Duration, _consistency: Consistency) {}

    /// Fired whenever this node's Raft role changes.
    fn on_role_change(&self, _node_id: u64, _role: &str) {}

    /// Fired when a snapshot is created or installed.
    fn on_snapshot(&self, _kind: &str, _entry_count: usize) {}

    /// Fired after a `cleanup_expired` command is applied.
    fn on_ttl_cleanup(&self, _deleted: usize, _scanned: usize, _duration: Duration) {}
}

/// An `ObserverSink` that discards every event; the default when no sink
/// is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ObserverSink for NoopSink {}
