//! Value compression, threshold-gated and applied before a `put` is
//! proposed so that only one set of bytes — the leader's — ever enters
//! the Raft log.
//!
//! `flate2`'s zlib/gzip encoders are a pure function of `(bytes,
//! algorithm, level)`: the same input at the same level always produces
//! the same output, which is the determinism requirement the replicated
//! envelope relies on.

use std::io::{Read, Write};

use concord_base::{CompressedEnvelope, CompressionAlgorithm, Entry, Error, Payload, RawValue, Result};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

/// Compression policy, matching the `compression.*` configuration
/// options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    pub threshold_bytes: usize,
    pub level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            enabled: false,
            algorithm: CompressionAlgorithm::Zlib,
            threshold_bytes: 1024,
            level: 6,
        }
    }
}

/// A pure (value, algorithm, level) -> envelope function, plus the
/// inverse. Stateless: safe to call independently on every replica (or,
/// per the put path, only ever on the proposing client).
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Codec { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Produce the payload that should be stored for `value`, compressing
    /// it when the policy calls for it (or when `force` is set).
    pub fn encode(&self, value: RawValue, force: bool) -> Result<Payload> {
        if !force && (!self.config.enabled || value.len() < self.config.threshold_bytes) {
            return Ok(Payload::Raw(value));
        }
        let bytes = compress(&value, self.config.algorithm, self.config.level)?;
        Ok(Payload::Compressed(CompressedEnvelope {
            algorithm: self.config.algorithm,
            bytes,
        }))
    }

    /// Recover the logical value from a stored payload, transparently
    /// undoing compression if present.
    pub fn decode(&self, payload: &Payload) -> Result<RawValue> {
        match payload {
            Payload::Raw(bytes) => Ok(bytes.clone()),
            Payload::Compressed(envelope) => decompress(&envelope.bytes, envelope.algorithm),
        }
    }

    /// Convenience: decode straight from an `Entry`.
    pub fn decode_entry(&self, entry: &Entry) -> Result<RawValue> {
        self.decode(&entry.payload)
    }
}

fn compress(bytes: &[u8], algorithm: CompressionAlgorithm, level: u32) -> Result<RawValue> {
    let level = Compression::new(level.min(9));
    match algorithm {
        CompressionAlgorithm::Zlib => {
            let mut enc = ZlibEncoder::new(Vec::new(), level);
            enc.write_all(bytes)
                .map_err(|e| Error::Internal(format!("zlib compress failed: {e}")))?;
            enc.finish()
                .map_err(|e| Error::Internal(format!("zlib compress failed: {e}")))
        }
        CompressionAlgorithm::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), level);
            enc.write_all(bytes)
                .map_err(|e| Error::Internal(format!("gzip compress failed: {e}")))?;
            enc.finish()
                .map_err(|e| Error::Internal(format!("gzip compress failed: {e}")))
        }
    }
}

fn decompress(bytes: &[u8], algorithm: CompressionAlgorithm) -> Result<RawValue> {
    let mut out = Vec::new();
    match algorithm {
        CompressionAlgorithm::Zlib => ZlibDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| Error::Internal(format!("zlib decompress failed: {e}")))?,
        CompressionAlgorithm::Gzip => GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| Error::Internal(format!("gzip decompress failed: {e}")))?,
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_stays_raw() {
        let codec = Codec::new(CodecConfig {
            enabled: true,
            threshold_bytes: 1024,
            ..Default::default()
        });
        let payload = codec.encode(vec![1, 2, 3], false).unwrap();
        assert!(matches!(payload, Payload::Raw(_)));
    }

    #[test]
    fn above_threshold_compresses_and_round_trips() {
        let codec = Codec::new(CodecConfig {
            enabled: true,
            threshold_bytes: 8,
            algorithm: CompressionAlgorithm::Gzip,
            level: 6,
        });
        let value = vec![b'x'; 4096];
        let payload = codec.encode(value.clone(), false).unwrap();
        assert!(matches!(payload, Payload::Compressed(_)));
        assert_eq!(codec.decode(&payload).unwrap(), value);
    }

    #[test]
    fn force_bypasses_threshold() {
        let codec = Codec::new(CodecConfig {
            enabled: true,
            threshold_bytes: 10_000,
            ..Default::default()
        });
        let payload = codec.encode(vec![1, 2, 3], true).unwrap();
        assert!(matches!(payload, Payload::Compressed(_)));
    }

    #[test]
    fn disabled_never_compresses_without_force() {
        let codec = Codec::new(CodecConfig {
            enabled: false,
            threshold_bytes: 0,
            ..Default::default()
        });
        let payload = codec.encode(vec![1, 2, 3], false).unwrap();
        assert!(matches!(payload, Payload::Raw(_)));
    }

    #[test]
    fn same_input_produces_identical_envelope_bytes() {
        let codec = Codec::new(CodecConfig {
            enabled: true,
            threshold_bytes: 0,
            algorithm: CompressionAlgorithm::Zlib,
            level: 6,
        });
        let value = b"deterministic payload".to_vec();
        let a = codec.encode(value.clone(), true).unwrap();
        let b = codec.encode(value, true).unwrap();
        assert_eq!(a, b, "compression must be a pure function of its inputs");
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn algorithm() -> impl Strategy<Value = CompressionAlgorithm> {
        prop_oneof![Just(CompressionAlgorithm::Zlib), Just(CompressionAlgorithm::Gzip)]
    }

    proptest! {
        /// Property 2 (spec.md §8, as applied to the codec): for any
        /// bytes and any algorithm/level, decode(encode(bytes)) == bytes.
        #[test]
        fn encode_decode_round_trips(bytes in proptest::collection::vec(any::<u8>(), 0..4096), algorithm in algorithm(), level in 0u32..10u32) {
            let codec = Codec::new(CodecConfig { enabled: true, algorithm, threshold_bytes: 0, level });
            let payload = codec.encode(bytes.clone(), true).unwrap();
            let decoded = codec.decode(&payload).unwrap();
            prop_assert_eq!(decoded, bytes);
        }

        /// Same fixed input at the same level always compresses to the
        /// same bytes, regardless of how many times it is asked.
        #[test]
        fn encode_is_deterministic(bytes in proptest::collection::vec(any::<u8>(), 0..4096), algorithm in algorithm(), level in 0u32..10u32) {
            let codec = Codec::new(CodecConfig { enabled: true, algorithm, threshold_bytes: 0, level });
            let a = codec.encode(bytes.clone(), true).unwrap();
            let b = codec.encode(bytes, true).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
