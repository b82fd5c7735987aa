/// Error kinds surfaced by the Concord core.
///
/// Every variant is a typed value; nothing in the core throws or panics
/// its way out. `Internal` is reserved for determinism-violating
/// failures (a corrupted snapshot, a poisoned apply) and is fatal to the
/// replica that raises it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("key is empty or exceeds the maximum key length")]
    InvalidKey,

    #[error("key not found")]
    NotFound,

    #[error("key has no expiration")]
    NoTtl,

    #[error("condition did not hold")]
    ConditionFailed,

    #[error("conditional operation requires exactly one of `expected` or `condition`")]
    MissingCondition,

    #[error("conditional operation specified both `expected` and `condition`")]
    ConflictingConditions,

    #[error("batch exceeds the maximum of {max} entries")]
    BatchTooLarge { max: usize },

    #[error("operation exceeded its deadline")]
    Timeout,

    #[error("this node is not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    #[error("cluster is not ready (no quorum or bootstrap in progress)")]
    ClusterNotReady,

    #[error("cluster is unavailable (propose queue full or no quorum)")]
    Unavailable,

    #[error("index already exists")]
    IndexExists,

    #[error("index not found")]
    IndexNotFound,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
