use std::path::PathBuf;

use concord_base::{CompressionAlgorithm, Consistency};
use concord_codec::CodecConfig;

/// Compression policy (spec.md §6 `compression.*` options).
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    pub threshold_bytes: usize,
    pub level: u32,
}

impl CompressionConfig {
    pub(crate) fn to_codec_config(&self) -> CodecConfig {
        CodecConfig {
            enabled: self.enabled,
            algorithm: self.algorithm,
            threshold_bytes: self.threshold_bytes,
            level: self.level,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        let codec = CodecConfig::default();
        CompressionConfig {
            enabled: codec.enabled,
            algorithm: codec.algorithm,
            threshold_bytes: codec.threshold_bytes,
            level: codec.level,
        }
    }
}

/// Raft timing and batching knobs (spec.md §6 `raft.*` options).
/// Election/heartbeat timeouts are expressed in milliseconds at the
/// configuration boundary and converted to raft-rs's tick units using
/// `tick_interval_ms`, matching how `raft::Config` itself counts ticks
/// rather than wall-clock time.
#[derive(Debug, Clone)]
pub struct RaftTuning {
    pub election_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub snapshot_interval: u64,
    pub max_batch: u64,
}

impl RaftTuning {
    pub(crate) fn election_tick(&self) -> usize {
        (self.election_timeout_ms / self.tick_interval_ms.max(1)).max(1) as usize
    }

    pub(crate) fn heartbeat_tick(&self) -> usize {
        (self.heartbeat_timeout_ms / self.tick_interval_ms.max(1)).max(1) as usize
    }
}

impl Default for RaftTuning {
    fn default() -> Self {
        RaftTuning {
            election_timeout_ms: 1_000,
            heartbeat_timeout_ms: 300,
            tick_interval_ms: 100,
            snapshot_interval: 10_000,
            max_batch: 64,
        }
    }
}

/// Everything needed to start one replica (spec.md §6 "Configuration
/// options (enumerated)").
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub data_dir: PathBuf,
    pub node_id: u64,
    /// Voter ids at first bootstrap; ignored once persisted state exists.
    pub initial_members: Vec<u64>,
    pub default_read_consistency: Consistency,
    pub compression: CompressionConfig,
    pub ttl_cleanup_interval_s: u64,
    pub raft: RaftTuning,
    pub propose_timeout_ms: u64,
}

impl ClusterConfig {
    pub fn new(cluster_name: impl Into<String>, node_id: u64, data_dir: impl Into<PathBuf>) -> Self {
        ClusterConfig {
            cluster_name: cluster_name.into(),
            data_dir: data_dir.into(),
            node_id,
            initial_members: vec![node_id],
            default_read_consistency: Consistency::default(),
            compression: CompressionConfig::default(),
            ttl_cleanup_interval_s: 60,
            raft: RaftTuning::default(),
            propose_timeout_ms: 5_000,
        }
    }
}
