/*!
Compression adapters for raw-file snapshots.

Table snapshots are stored as plain JSON so the remote copy stays readable;
only the raw database payload is optionally gzip-compressed before base64.
*/

use crate::{RekindleError, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

/// Compression abstraction for snapshot payloads
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Name recorded in snapshot metadata
    fn algorithm_name(&self) -> &str;
}

/// Gzip (DEFLATE) compression
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 is no compression and 9 is maximum)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);
        encoder.write_all(data).map_err(|e| {
            RekindleError::compression(format!("Failed to write data for compression: {e}"))
        })?;
        encoder
            .finish()
            .map_err(|e| RekindleError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| RekindleError::compression(format!("Failed to decompress data: {e}")))?;
        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}

/// Adapter for an algorithm name found in snapshot metadata
pub fn compressor_for(algorithm: &str) -> Result<Box<dyn CompressionAdapter>> {
    match algorithm {
        "gzip" => Ok(Box::new(GzipCompressor::new())),
        "none" | "" => Ok(Box::new(NoCompression)),
        other => Err(RekindleError::compression(format!(
            "unsupported compression algorithm '{other}'"
        ))),
    }
}
