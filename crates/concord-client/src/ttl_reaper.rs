use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::Logger;

use crate::client::ClusterClient;

/// A named background worker, in the spirit of the teacher's
/// `tikv_util::worker::Worker` lazy-worker pattern, that periodically
/// issues a single `cleanup_expired` command (C6). Running on every
/// replica is harmless: a follower's attempt resolves to `NotLeader`
/// and is silently skipped, only the leader's own timer actually sweeps,
/// and repeated sweeps are cheap no-ops regardless.
pub struct TtlReaper {
    client: Arc<ClusterClient>,
    interval: Duration,
    propose_timeout: Duration,
    logger: Logger,
}

impl TtlReaper {
    pub fn new(client: Arc<ClusterClient>, interval: Duration, propose_timeout: Duration, logger: Logger) -> Self {
        TtlReaper { client, interval, propose_timeout, logger }
    }

    /// Spawns the periodic sweep task; drop the returned handle (or call
    /// `.abort()`) to stop it.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let started = Instant::now();
                match self.client.propose_cleanup(self.propose_timeout).await {
                    Ok(deleted) => {
                        slog::debug!(self.logger, "ttl sweep completed";
                            "deleted" => deleted, "elapsed_ms" => started.elapsed().as_millis() as u64);
                    }
                    Err(concord_base::Error::NotLeader { .. }) => {
                        // expected on followers; the leader's own timer will sweep.
                    }
                    Err(e) => {
                        slog::warn!(self.logger, "ttl sweep failed"; "error" => %e);
                    }
                }
            }
        })
    }
}
