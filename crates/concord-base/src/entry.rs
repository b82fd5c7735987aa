use serde::{Deserialize, Serialize};

use crate::RawValue;

/// Compression back end applied to a value's payload. Both are
/// deterministic for a fixed compression level, which is required
/// because the resulting bytes are themselves replicated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    Zlib,
    Gzip,
}

/// Tagged, compressed form of a value. Opaque to the `Store`; only the
/// codec knows how to invert it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedEnvelope {
    pub algorithm: CompressionAlgorithm,
    pub bytes: RawValue,
}

/// A value as stored, either raw or wrapped in a compression envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Raw(RawValue),
    Compressed(CompressedEnvelope),
}

/// The unit stored in the `Store` against a `Key`.
///
/// `expires_at` is an absolute Unix-second timestamp; `None` means no
/// expiration. Expiration is a read-time filter — the physical record
/// survives until a `cleanup_expired` command removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub payload: Payload,
    pub expires_at: Option<i64>,
}

impl Entry {
    pub fn new(payload: Payload, expires_at: Option<i64>) -> Self {
        Entry { payload, expires_at }
    }

    /// Whether this entry is logically invisible to reads at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(t) if t < now)
    }

    /// Remaining seconds until expiration at `now`, if this entry has a TTL
    /// and has not already expired.
    pub fn remaining_ttl(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|t| (t - now).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_entry(expires_at: Option<i64>) -> Entry {
        Entry::new(Payload::Raw(vec![1, 2, 3]), expires_at)
    }

    #[test]
    fn no_ttl_never_expires() {
        let e = raw_entry(None);
        assert!(!e.is_expired(i64::MAX));
        assert_eq!(e.remaining_ttl(0), None);
    }

    #[test]
    fn expiration_is_strict() {
        let e = raw_entry(Some(100));
        assert!(!e.is_expired(100));
        assert!(e.is_expired(101));
        assert_eq!(e.remaining_ttl(100), Some(0));
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Property 7 (spec.md §8): a key with `expires_at = t` is
        /// invisible when `now > t`, visible when `now <= t`, for any
        /// `t`/`now` pair.
        #[test]
        fn expiration_monotonicity(t in -10_000i64..10_000i64, now in -10_000i64..10_000i64) {
            let e = Entry::new(Payload::Raw(vec![0]), Some(t));
            prop_assert_eq!(e.is_expired(now), now > t);
        }

        /// No-TTL entries are never expired, for any `now`.
        #[test]
        fn no_ttl_never_expires(now in -10_000i64..10_000i64) {
            let e = Entry::new(Payload::Raw(vec![0]), None);
            prop_assert!(!e.is_expired(now));
        }
    }
}
