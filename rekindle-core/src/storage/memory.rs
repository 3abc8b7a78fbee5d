/*!
In-process [`BlobStore`] for tests and dry runs.
*/

use super::{BlobFiles, BlobStore, RemoteError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Blob store backed by a HashMap. Clones share the same blobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, BlobFiles>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob under a known id
    pub fn with_blob<S: Into<String>>(self, blob_id: S, files: BlobFiles) -> Self {
        self.lock().insert(blob_id.into(), files);
        self
    }

    /// Contents of one file, if the blob and file exist
    pub fn file(&self, blob_id: &str, filename: &str) -> Option<String> {
        self.lock()
            .get(blob_id)
            .and_then(|files| files.get(filename).cloned())
    }

    pub fn blob_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BlobFiles>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create(&self, _description: &str, files: &BlobFiles) -> Result<String, RemoteError> {
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().insert(id.clone(), files.clone());
        Ok(id)
    }

    async fn fetch(&self, blob_id: &str) -> Result<BlobFiles, RemoteError> {
        self.lock()
            .get(blob_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("blob {blob_id}")))
    }

    async fn replace_file(
        &self,
        blob_id: &str,
        filename: &str,
        content: &str,
    ) -> Result<(), RemoteError> {
        let mut blobs = self.lock();
        let files = blobs
            .get_mut(blob_id)
            .ok_or_else(|| RemoteError::NotFound(format!("blob {blob_id}")))?;
        files.insert(filename.to_string(), content.to_string());
        Ok(())
    }
}
