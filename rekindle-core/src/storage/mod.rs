/*!
Storage adapters for snapshot replication.

[`BlobStore`] is the port to the remote side: one document addressed by an
id, holding many named text files. Writes replace a whole file and the last
writer wins; there is no concurrency token.

Local rotated copies of the database live in [`LocalBackupDir`].
*/

pub mod error;
pub mod handle;
pub mod http;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;

pub use error::RemoteError;
pub use handle::{BlobHandle, WriteOutcome};
pub use http::HttpBlobClient;
pub use local::{BackupRecord, LocalBackupDir};
pub use memory::MemoryBlobStore;

/// File holding the table snapshot
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// File holding the raw database snapshot
pub const RAW_SNAPSHOT_FILE: &str = "store_backup.json";

/// File holding the shared process state
pub const PROCESS_STATE_FILE: &str = "process_state.json";

/// File name to content
pub type BlobFiles = BTreeMap<String, String>;

/// Remote blob abstraction
///
/// Implementations must be safe to share between the backup scheduler and
/// the restart coordinator.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Create a new blob holding `files`
    ///
    /// # Returns
    /// The new blob id
    async fn create(&self, description: &str, files: &BlobFiles) -> Result<String, RemoteError>;

    /// Fetch every file of a blob
    ///
    /// # Returns
    /// The files, or `RemoteError::NotFound` when the id does not exist
    async fn fetch(&self, blob_id: &str) -> Result<BlobFiles, RemoteError>;

    /// Fetch one file of a blob
    ///
    /// # Returns
    /// The content, `None` when the blob exists without that file
    async fn fetch_file(&self, blob_id: &str, filename: &str) -> Result<Option<String>, RemoteError> {
        Ok(self.fetch(blob_id).await?.remove(filename))
    }

    /// Overwrite (or add) one file, leaving the others untouched
    async fn replace_file(
        &self,
        blob_id: &str,
        filename: &str,
        content: &str,
    ) -> Result<(), RemoteError>;
}
