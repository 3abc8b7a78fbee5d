/*!
Snapshot metadata and integrity verification.
*/

use crate::{RekindleError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current metadata format version for compatibility tracking
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// How the snapshot payload was produced
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotEncoding {
    /// Per-table JSON records
    Tables,
    /// Whole database file, base64 encoded
    RawSqlite,
}

/// Metadata stored alongside every snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMetadata {
    /// Unique identifier for this specific snapshot
    pub snapshot_id: String,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// SHA-256 of the canonical payload bytes
    pub content_hash: String,

    /// Format version for compatibility (current: 1)
    pub format_version: u8,

    pub encoding: SnapshotEncoding,

    /// Number of records across all tables
    #[serde(default)]
    pub row_count: usize,

    #[serde(default)]
    pub table_count: usize,

    /// Size of the payload before compression
    pub uncompressed_size: usize,

    /// Size after compression, when compressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<usize>,

    pub compression_algorithm: String,
}

impl SnapshotMetadata {
    /// Create metadata for a payload taken at `timestamp`
    ///
    /// # Arguments
    /// * `encoding` - Payload encoding
    /// * `timestamp` - Snapshot time, from the service clock
    /// * `payload` - The canonical payload bytes that the hash covers
    pub fn new(encoding: SnapshotEncoding, timestamp: DateTime<Utc>, payload: &[u8]) -> Self {
        Self {
            snapshot_id: Uuid::new_v4().to_string(),
            timestamp,
            content_hash: Self::compute_hash(payload),
            format_version: METADATA_FORMAT_VERSION,
            encoding,
            row_count: 0,
            table_count: 0,
            uncompressed_size: payload.len(),
            compressed_size: None,
            compression_algorithm: "none".to_string(),
        }
    }

    /// Record table and row counts
    pub fn with_counts(mut self, table_count: usize, row_count: usize) -> Self {
        self.table_count = table_count;
        self.row_count = row_count;
        self
    }

    /// Set the compressed size after compression
    pub fn with_compressed_size(mut self, compressed_size: usize) -> Self {
        self.compressed_size = Some(compressed_size);
        self
    }

    /// Set the compression algorithm
    pub fn with_compression_algorithm<S: Into<String>>(mut self, algorithm: S) -> Self {
        self.compression_algorithm = algorithm.into();
        self
    }

    /// Compute SHA-256 hash of the provided data
    ///
    /// # Returns
    /// Hexadecimal string representation of the SHA-256 hash
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Verify payload bytes against the stored hash
    ///
    /// # Returns
    /// Ok(()) if the hash matches, Err(RekindleError::IntegrityCheckFailed) otherwise
    pub fn verify_integrity(&self, payload: &[u8]) -> Result<()> {
        let computed_hash = Self::compute_hash(payload);
        if computed_hash == self.content_hash {
            Ok(())
        } else {
            Err(RekindleError::IntegrityCheckFailed {
                expected: self.content_hash.clone(),
                actual: computed_hash,
            })
        }
    }

    /// Check if this metadata is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= METADATA_FORMAT_VERSION
    }

    /// Reject metadata from a newer writer
    pub fn ensure_compatible(&self) -> Result<()> {
        if self.is_compatible() {
            Ok(())
        } else {
            Err(RekindleError::invalid_format(format!(
                "snapshot format version {} is newer than supported version {}",
                self.format_version, METADATA_FORMAT_VERSION
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let data = b"test data";
        let hash = SnapshotMetadata::compute_hash(data);

        assert_eq!(
            hash,
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_integrity_verification() {
        let data = b"test data";
        let metadata = SnapshotMetadata::new(SnapshotEncoding::Tables, Utc::now(), data);

        assert!(metadata.verify_integrity(data).is_ok());
        assert!(matches!(
            metadata.verify_integrity(b"different data"),
            Err(RekindleError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_newer_format_is_rejected() {
        let mut metadata = SnapshotMetadata::new(SnapshotEncoding::RawSqlite, Utc::now(), b"x");
        assert!(metadata.ensure_compatible().is_ok());

        metadata.format_version = METADATA_FORMAT_VERSION + 1;
        assert!(!metadata.is_compatible());
        assert!(metadata.ensure_compatible().is_err());
    }
}
