//! Object compression for the repository
//!
//! Every object written to the repository carries a 4-byte header telling the
//! reader how to decode the payload:
//!
//! - `LZ4S` followed by an LZ4 block with the uncompressed size prepended
//! - four zero bytes followed by the raw payload
//!
//! Compression is only kept when it actually shrinks the payload, so
//! incompressible chunks are stored raw.
//!
//! ## Examples
//!
//! ```rust
//! use snaprestore::compression::{CompressionEngine, CompressionStrategy};
//!
//! let engine = CompressionEngine::new(CompressionStrategy::Fast);
//! let data = b"restore me ".repeat(64);
//! let packed = engine.compress(&data).unwrap();
//! assert!(packed.len() < data.len());
//! assert_eq!(engine.decompress(&packed).unwrap(), data);
//! ```

use crate::error::{Result, RestoreError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

const LZ4_MAGIC: &[u8; 4] = b"LZ4S";
const RAW_MAGIC: &[u8; 4] = &[0, 0, 0, 0];

/// Payloads smaller than this are never worth compressing
const MIN_COMPRESS_SIZE: usize = 64;

/// How objects are compressed when written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionStrategy {
    /// Store everything raw
    None,
    /// LZ4 for every payload that benefits from it
    #[default]
    Fast,
}

impl CompressionStrategy {
    /// Name persisted in the repository config
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionStrategy::None => "none",
            CompressionStrategy::Fast => "fast",
        }
    }
}

impl FromStr for CompressionStrategy {
    type Err = RestoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionStrategy::None),
            "fast" => Ok(CompressionStrategy::Fast),
            other => Err(RestoreError::InvalidConfiguration(format!(
                "unknown compression strategy: {}",
                other
            ))),
        }
    }
}

/// Statistics about write-side compression
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    /// Objects stored LZ4-compressed
    pub objects_compressed: usize,
    /// Objects stored raw
    pub objects_stored_raw: usize,
    /// Bytes saved by compression
    pub bytes_saved: usize,
}

/// Encodes and decodes repository objects
///
/// Counters are atomic, so one engine is shared by all writer threads
/// without a lock around compression.
#[derive(Debug, Default)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    compressed: AtomicUsize,
    stored_raw: AtomicUsize,
    bytes_saved: AtomicUsize,
}

impl CompressionEngine {
    /// Create a new engine with the given strategy
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Active strategy
    pub fn strategy(&self) -> CompressionStrategy {
        self.strategy
    }

    /// Statistics since creation
    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            objects_compressed: self.compressed.load(Ordering::Relaxed),
            objects_stored_raw: self.stored_raw.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }

    /// Encode `content` with the appropriate header
    pub fn compress(&self, content: &[u8]) -> Result<Vec<u8>> {
        if self.strategy == CompressionStrategy::Fast && content.len() >= MIN_COMPRESS_SIZE {
            let compressed = compress_prepend_size(content);
            if compressed.len() < content.len() {
                self.compressed.fetch_add(1, Ordering::Relaxed);
                self.bytes_saved
                    .fetch_add(content.len() - compressed.len(), Ordering::Relaxed);
                trace!("Compressed {} -> {} bytes", content.len(), compressed.len());
                return Ok(framed(LZ4_MAGIC, &compressed));
            }
        }

        self.stored_raw.fetch_add(1, Ordering::Relaxed);
        Ok(framed(RAW_MAGIC, content))
    }

    /// Decode an object written by [`compress`](Self::compress)
    pub fn decompress(&self, content: &[u8]) -> Result<Vec<u8>> {
        if content.len() < 4 {
            return Err(RestoreError::decompression("Content too short"));
        }

        let (header, payload) = content.split_at(4);
        if header == LZ4_MAGIC {
            decompress_size_prepended(payload)
                .map_err(|e| RestoreError::decompression(format!("LZ4 decompression failed: {}", e)))
        } else if header == RAW_MAGIC {
            Ok(payload.to_vec())
        } else {
            Err(RestoreError::decompression(format!(
                "Unknown object header: {}",
                hex::encode(header)
            )))
        }
    }
}

fn framed(magic: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(magic.len() + payload.len());
    result.extend_from_slice(magic);
    result.extend_from_slice(payload);
    result
}
