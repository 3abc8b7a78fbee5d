/*!
The shared "current blob" cell.

Both background loops write into the same blob. Whoever writes first when no
id is known creates the blob; the async lock makes concurrent first writers
create exactly one. The new id is written to a file in the data directory
and logged, because it must be put into the configuration to survive a
redeploy of an ephemeral host.
*/

use super::{BlobFiles, BlobStore, RemoteError};
use crate::{RekindleError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub blob_id: String,
    /// True when this write created the blob
    pub created: bool,
}

#[derive(Debug)]
pub struct BlobHandle {
    store: Arc<dyn BlobStore>,
    blob_id: Mutex<Option<String>>,
    description: String,
    id_file: Option<PathBuf>,
}

impl BlobHandle {
    /// # Arguments
    /// * `store` - Remote blob store
    /// * `blob_id` - Configured blob id, if any
    /// * `description` - Description used when creating a blob
    /// * `id_file` - Where a newly created id is recorded
    pub fn new<S: Into<String>>(
        store: Arc<dyn BlobStore>,
        blob_id: Option<String>,
        description: S,
        id_file: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            blob_id: Mutex::new(blob_id),
            description: description.into(),
            id_file,
        }
    }

    /// Read an id previously recorded by [`BlobHandle::write_file`]
    pub fn load_recorded_id(path: &Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub async fn blob_id(&self) -> Option<String> {
        self.blob_id.lock().await.clone()
    }

    /// All files of the current blob
    pub async fn fetch(&self) -> Result<BlobFiles> {
        let blob_id = self
            .blob_id()
            .await
            .ok_or_else(|| RemoteError::NotFound("no blob id configured".to_string()))?;
        Ok(self.store.fetch(&blob_id).await?)
    }

    /// One file of the current blob
    pub async fn fetch_file(&self, filename: &str) -> Result<String> {
        let blob_id = self
            .blob_id()
            .await
            .ok_or_else(|| RemoteError::NotFound("no blob id configured".to_string()))?;
        let content = self.store.fetch_file(&blob_id, filename).await?;
        content.ok_or_else(|| RekindleError::MissingFile {
            blob_id,
            file: filename.to_string(),
        })
    }

    /// Replace one file, creating the blob when none is known or the known
    /// one no longer exists
    pub async fn write_file(&self, filename: &str, content: &str) -> Result<WriteOutcome> {
        let mut vanished = None;
        if let Some(blob_id) = self.blob_id().await {
            match self.store.replace_file(&blob_id, filename, content).await {
                Ok(()) => {
                    return Ok(WriteOutcome {
                        blob_id,
                        created: false,
                    })
                }
                Err(RemoteError::NotFound(_)) => {
                    warn!(blob_id = %blob_id, "Configured blob no longer exists, creating a new one");
                    vanished = Some(blob_id);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut current = self.blob_id.lock().await;
        // Another writer may have created the blob while we waited
        if let Some(blob_id) = current.clone().filter(|id| Some(id) != vanished.as_ref()) {
            self.store.replace_file(&blob_id, filename, content).await?;
            return Ok(WriteOutcome {
                blob_id,
                created: false,
            });
        }

        let files = BlobFiles::from([(filename.to_string(), content.to_string())]);
        let blob_id = self.store.create(&self.description, &files).await?;
        *current = Some(blob_id.clone());
        drop(current);

        self.record_id(&blob_id);
        Ok(WriteOutcome {
            blob_id,
            created: true,
        })
    }

    fn record_id(&self, blob_id: &str) {
        warn!(
            blob_id,
            "Created a new remote blob; set REKINDLE_BLOB_ID={blob_id} so the next deployment restores from it"
        );
        let Some(path) = &self.id_file else { return };
        let written = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(path, format!("{blob_id}\n")));
        match written {
            Ok(()) => info!(path = %path.display(), "Recorded blob id"),
            Err(err) => warn!(path = %path.display(), error = %err, "Failed to record blob id"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_first_write_creates_and_records_id() {
        let temp_dir = TempDir::new().unwrap();
        let id_file = temp_dir.path().join("data/blob_id");
        let remote = MemoryBlobStore::new();
        let handle = BlobHandle::new(Arc::new(remote.clone()), None, "test", Some(id_file.clone()));

        let first = handle.write_file("snapshot.json", "{}").await.unwrap();
        assert!(first.created);
        assert_eq!(BlobHandle::load_recorded_id(&id_file), Some(first.blob_id.clone()));

        let second = handle.write_file("process_state.json", "{}").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.blob_id, first.blob_id);
        assert_eq!(remote.blob_count(), 1);
        assert_eq!(handle.fetch().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_writes_create_one_blob() {
        let remote = MemoryBlobStore::new();
        let handle = Arc::new(BlobHandle::new(Arc::new(remote.clone()), None, "test", None));

        let a = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.write_file("a.json", "1").await }
        });
        let b = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move { handle.write_file("b.json", "2").await }
        });
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

        assert_eq!(a.blob_id, b.blob_id);
        assert_eq!(remote.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_vanished_blob_is_recreated() {
        let remote = MemoryBlobStore::new();
        let handle = BlobHandle::new(Arc::new(remote.clone()), Some("deleted".into()), "test", None);

        let outcome = handle.write_file("snapshot.json", "{}").await.unwrap();
        assert!(outcome.created);
        assert_ne!(outcome.blob_id, "deleted");
        assert_eq!(handle.blob_id().await, Some(outcome.blob_id));
    }

    #[tokio::test]
    async fn test_fetch_file_errors() {
        let remote = MemoryBlobStore::new()
            .with_blob("abc", BlobFiles::from([("other.json".to_string(), "{}".to_string())]));
        let handle = BlobHandle::new(Arc::new(remote), Some("abc".into()), "test", None);
        assert!(matches!(
            handle.fetch_file("snapshot.json").await,
            Err(RekindleError::MissingFile { .. })
        ));

        let unconfigured = BlobHandle::new(Arc::new(MemoryBlobStore::new()), None, "test", None);
        let err = unconfigured.fetch_file("snapshot.json").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }
}
