//! Body compression for the file cache
//!
//! Stored files start with a one-byte codec tag so that entries written
//! under a different configuration stay readable.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    None,
    /// Zstandard (good balance of speed and ratio)
    Zstd,
    /// LZ4 (very fast, lower ratio)
    Lz4,
}

impl CompressionAlgorithm {
    fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Zstd => 1,
            CompressionAlgorithm::Lz4 => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Zstd),
            2 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,

    /// Compression level (1-22 for zstd, 1-12 for lz4)
    pub level: i32,

    /// Values smaller than this are stored as-is
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            level: 3,
            min_size: 1024,
        }
    }
}

/// Compression errors
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown codec tag {0}")]
    UnknownTag(u8),

    #[error("Empty input")]
    Empty,
}

/// Frames values with a codec tag, compressing when worthwhile
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Encode `data` as `[tag][body]`
    ///
    /// Falls back to storing uncompressed when the value is small or
    /// compression would expand it.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let algorithm = if data.len() < self.config.min_size {
            CompressionAlgorithm::None
        } else {
            self.config.algorithm
        };

        let body = match algorithm {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Zstd => Some(self.compress_zstd(data)?),
            CompressionAlgorithm::Lz4 => Some(self.compress_lz4(data)?),
        };

        let mut out = Vec::with_capacity(data.len() + 1);
        match body {
            Some(compressed) if compressed.len() < data.len() => {
                debug!(
                    "Compressed {} -> {} bytes ({:?})",
                    data.len(),
                    compressed.len(),
                    algorithm
                );
                out.push(algorithm.tag());
                out.extend_from_slice(&compressed);
            }
            _ => {
                out.push(CompressionAlgorithm::None.tag());
                out.extend_from_slice(data);
            }
        }
        Ok(out)
    }

    /// Decode a value produced by [`Compressor::encode`]
    pub fn decode(&self, framed: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let (&tag, body) = framed.split_first().ok_or(CompressionError::Empty)?;
        match CompressionAlgorithm::from_tag(tag).ok_or(CompressionError::UnknownTag(tag))? {
            CompressionAlgorithm::None => Ok(body.to_vec()),
            CompressionAlgorithm::Zstd => {
                let mut decoder = zstd::Decoder::new(body)?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            CompressionAlgorithm::Lz4 => {
                let mut decoder = lz4::Decoder::new(body)?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    fn compress_zstd(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut encoder = zstd::Encoder::new(Vec::new(), self.config.level)?;
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn compress_lz4(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.config.level.max(0) as u32)
            .build(Vec::new())?;
        encoder.write_all(data)?;
        let (compressed, result) = encoder.finish();
        result?;
        Ok(compressed)
    }
}
