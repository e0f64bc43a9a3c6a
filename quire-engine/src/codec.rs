//! Adaptive payload compression with integrity hashing.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 CompressionCodec                      │
//! │                                                      │
//! │   payload ──► choose_algorithm ──┬─► none            │
//! │                                  ├─► lz4   (light)   │
//! │                                  └─► deflate (heavy) │
//! │                                                      │
//! │   sha256(payload) travels with every compressed blob │
//! │   and is re-checked after decompression.             │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Selection heuristic:
//! - below `min_compress_bytes`: not worth the CPU, store as-is
//! - below `heavy_threshold_bytes` or highly repetitive: LZ4 block format
//! - everything else: deflate
//!
//! Compression never blocks a save: any failure, or a result that does
//! not shrink the payload, falls back to `none`.
//!
//! Reference: Patterson & Hennessy — Section 5.7 (Data Compression)

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Bytes inspected when estimating repetitiveness.
const REPETITION_SAMPLE: usize = 4096;

/// Compression algorithm tag carried alongside every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    None,
    Lz4,
    Deflate,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Lz4 => "lz4",
            Algorithm::Deflate => "deflate",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Algorithm::None),
            "lz4" => Ok(Algorithm::Lz4),
            "deflate" => Ok(Algorithm::Deflate),
            other => Err(CodecError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("payload of {size} bytes exceeds the {limit} byte ceiling")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Codec configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Disable to always ship payloads uncompressed
    pub enabled: bool,
    /// Payloads smaller than this are stored as-is (default: 512B)
    pub min_compress_bytes: usize,
    /// Payloads at or above this use deflate (default: 16KB)
    pub heavy_threshold_bytes: usize,
    /// Samples with at most this many distinct bytes count as repetitive
    pub repetitive_max_distinct: usize,
    /// Hard ceiling; larger payloads are never compressed (default: 16MB)
    pub max_payload_bytes: usize,
    /// flate2 level 0-9 (default: 6)
    pub deflate_level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_compress_bytes: 512,
            heavy_threshold_bytes: 16 * 1024,
            repetitive_max_distinct: 8,
            max_payload_bytes: 16 * 1024 * 1024,
            deflate_level: 6,
        }
    }
}

impl CodecConfig {
    /// Small thresholds so tests exercise every algorithm with tiny inputs.
    pub fn for_testing() -> Self {
        Self {
            enabled: true,
            min_compress_bytes: 32,
            heavy_threshold_bytes: 2 * 1024,
            repetitive_max_distinct: 8,
            max_payload_bytes: 1024 * 1024,
            deflate_level: 6,
        }
    }
}

/// A compressed payload plus everything needed to verify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedPayload {
    pub bytes: Vec<u8>,
    pub original_size: usize,
    pub compressed_size: usize,
    /// original / compressed (1.0 for `none` and empty input)
    pub ratio: f64,
    /// Hex SHA-256 of the uncompressed payload
    pub hash: String,
    pub algorithm: Algorithm,
}

/// Running codec totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CodecStats {
    pub payloads: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub none_count: u64,
    pub lz4_count: u64,
    pub deflate_count: u64,
    /// Compressions that failed or did not shrink the input
    pub fallbacks: u64,
}

impl CodecStats {
    /// Overall compression ratio across all payloads.
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            return 1.0;
        }
        self.bytes_in as f64 / self.bytes_out as f64
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Adaptive compressor shared by the orchestrator and both queues.
pub struct CompressionCodec {
    config: CodecConfig,
    stats: Mutex<CodecStats>,
}

impl CompressionCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(CodecStats::default()),
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Hash used for change detection and integrity checks.
    pub fn hash(&self, bytes: &[u8]) -> String {
        content_hash(bytes)
    }

    /// Pick an algorithm for `payload` without compressing it.
    pub fn choose_algorithm(&self, payload: &[u8]) -> Algorithm {
        let len = payload.len();
        if !self.config.enabled
            || len < self.config.min_compress_bytes
            || len > self.config.max_payload_bytes
        {
            return Algorithm::None;
        }
        if len < self.config.heavy_threshold_bytes
            || distinct_bytes(payload) <= self.config.repetitive_max_distinct
        {
            Algorithm::Lz4
        } else {
            Algorithm::Deflate
        }
    }

    /// Compress a payload. Never fails: falls back to `none`.
    pub fn compress(&self, payload: &[u8]) -> CompressedPayload {
        let hash = content_hash(payload);
        let chosen = self.choose_algorithm(payload);

        let (algorithm, bytes, fell_back) = match chosen {
            Algorithm::None => (Algorithm::None, payload.to_vec(), false),
            algorithm => match self.encode(algorithm, payload) {
                Ok(bytes) if bytes.len() < payload.len() => (algorithm, bytes, false),
                Ok(bytes) => {
                    debug!(
                        "{algorithm} did not shrink payload ({} -> {} bytes), storing as-is",
                        payload.len(),
                        bytes.len()
                    );
                    (Algorithm::None, payload.to_vec(), true)
                }
                Err(e) => {
                    warn!("{e}; storing payload uncompressed");
                    (Algorithm::None, payload.to_vec(), true)
                }
            },
        };

        let compressed_size = bytes.len();
        let ratio = if compressed_size == 0 {
            1.0
        } else {
            payload.len() as f64 / compressed_size as f64
        };

        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.payloads += 1;
            stats.bytes_in += payload.len() as u64;
            stats.bytes_out += compressed_size as u64;
            match algorithm {
                Algorithm::None => stats.none_count += 1,
                Algorithm::Lz4 => stats.lz4_count += 1,
                Algorithm::Deflate => stats.deflate_count += 1,
            }
            if fell_back {
                stats.fallbacks += 1;
            }
        }

        CompressedPayload {
            bytes,
            original_size: payload.len(),
            compressed_size,
            ratio,
            hash,
            algorithm,
        }
    }

    /// Decompress and verify against `expected_hash`.
    ///
    /// The returned bytes are safe to apply; on mismatch nothing is returned.
    pub fn decompress(
        &self,
        bytes: &[u8],
        algorithm: Algorithm,
        expected_hash: &str,
    ) -> Result<Vec<u8>, CodecError> {
        let data = self.decode(algorithm, bytes)?;
        let actual = content_hash(&data);
        if actual != expected_hash {
            return Err(CodecError::IntegrityMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }
        Ok(data)
    }

    /// Decompress a [`CompressedPayload`] produced by [`compress`](Self::compress).
    pub fn decompress_payload(&self, payload: &CompressedPayload) -> Result<Vec<u8>, CodecError> {
        self.decompress(&payload.bytes, payload.algorithm, &payload.hash)
    }

    pub fn stats(&self) -> CodecStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn encode(&self, algorithm: Algorithm, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        match algorithm {
            Algorithm::None => Ok(payload.to_vec()),
            Algorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(payload)),
            Algorithm::Deflate => {
                let level = Compression::new(self.config.deflate_level.min(9));
                let mut encoder = DeflateEncoder::new(Vec::with_capacity(payload.len() / 2), level);
                encoder
                    .write_all(payload)
                    .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| CodecError::CompressionFailed(e.to_string()))
            }
        }
    }

    fn decode(&self, algorithm: Algorithm, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let limit = self.config.max_payload_bytes;
        match algorithm {
            Algorithm::None => Ok(bytes.to_vec()),
            Algorithm::Lz4 => {
                // The size prefix is attacker-controlled; check it before allocating.
                if bytes.len() >= 4 {
                    let declared =
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                    if declared > limit {
                        return Err(CodecError::PayloadTooLarge {
                            size: declared,
                            limit,
                        });
                    }
                }
                lz4_flex::decompress_size_prepended(bytes)
                    .map_err(|e| CodecError::DecompressionFailed(e.to_string()))
            }
            Algorithm::Deflate => {
                let mut out = Vec::with_capacity(bytes.len() * 2);
                DeflateDecoder::new(bytes)
                    .take(limit as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;
                if out.len() > limit {
                    return Err(CodecError::PayloadTooLarge {
                        size: out.len(),
                        limit,
                    });
                }
                Ok(out)
            }
        }
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

/// Distinct byte values in a prefix sample: low counts mean repetitive data.
fn distinct_bytes(payload: &[u8]) -> usize {
    let sample = &payload[..payload.len().min(REPETITION_SAMPLE)];
    let mut seen = [false; 256];
    let mut distinct = 0usize;
    for &b in sample {
        if !seen[b as usize] {
            seen[b as usize] = true;
            distinct += 1;
        }
    }
    distinct
}
