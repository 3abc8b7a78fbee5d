/*!
Boot-time restore.

Runs once, before the service accepts mutations. The remote snapshot is
tried a bounded number of times with a fixed delay; every failure kind
(network, missing blob or file, malformed payload) costs one attempt. A
rejected credential stops the loop at once. When nothing can be restored
the service starts with the store as opened, which on a fresh host is
empty and freshly migrated.

Decoding never partially applies: table snapshots are decoded in one
transaction and raw snapshots are staged and integrity-checked before the
live store changes, so a failed attempt leaves the pre-attempt state.
*/

use crate::codec::{RawFileCodec, Snapshot, SnapshotCodec};
use crate::config::{ServiceConfig, SnapshotFormat, StorageBackend};
use crate::storage::{BlobHandle, LocalBackupDir, RAW_SNAPSHOT_FILE, SNAPSHOT_FILE};
use crate::store::LocalStore;
use crate::{RekindleError, Result};
use rekindle_retry::{constant_policy, retry_bounded, RetryError};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Where the restored data came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    Remote { blob_id: String, file: String },
    LocalBackup(PathBuf),
    /// Nothing was restored; the store is as opened
    Nothing,
}

impl fmt::Display for RestoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSource::Remote { blob_id, file } => write!(f, "remote blob {blob_id} ({file})"),
            RestoreSource::LocalBackup(path) => write!(f, "local backup {}", path.display()),
            RestoreSource::Nothing => f.write_str("nothing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub source: RestoreSource,
    /// Remote attempts made, zero when the remote was not consulted
    pub attempts: usize,
    /// Rows in the store after the restore
    pub rows: usize,
    /// The credential was rejected and the service continues local-only
    pub degraded_to_local: bool,
    /// A blob id was known but its snapshot could not be read
    pub remote_unavailable: bool,
}

impl RestoreOutcome {
    fn nothing() -> Self {
        Self {
            source: RestoreSource::Nothing,
            attempts: 0,
            rows: 0,
            degraded_to_local: false,
            remote_unavailable: false,
        }
    }

    pub fn restored(&self) -> bool {
        self.source != RestoreSource::Nothing
    }
}

#[derive(Debug, Clone)]
pub struct StartupRestorer {
    handle: Option<Arc<BlobHandle>>,
    format: SnapshotFormat,
    attempts: usize,
    initial_delay: Duration,
    retry_delay: Duration,
    remote_required: bool,
    local_backups: Option<LocalBackupDir>,
    fallback_dir: LocalBackupDir,
}

impl StartupRestorer {
    /// # Arguments
    /// * `config` - Attempt budget, delays, snapshot format and backup directory
    /// * `handle` - Shared blob, `None` when remote replication is off
    pub fn new(config: &ServiceConfig, handle: Option<Arc<BlobHandle>>) -> Self {
        let backups = LocalBackupDir::new(&config.local_backup_dir, config.local_backup_retention);
        Self {
            handle,
            format: config.snapshot_format,
            attempts: config.restore_attempts,
            initial_delay: config.restore_initial_delay,
            retry_delay: config.restore_retry_delay,
            remote_required: config.backend == StorageBackend::Remote,
            local_backups: config.local_backups_enabled().then(|| backups.clone()),
            fallback_dir: backups,
        }
    }

    /// Name of the blob file read for the configured format
    pub fn snapshot_file(&self) -> &'static str {
        match self.format {
            SnapshotFormat::Tables => SNAPSHOT_FILE,
            SnapshotFormat::Raw => RAW_SNAPSHOT_FILE,
        }
    }

    /// Populate `store` from the best available source
    ///
    /// # Returns
    /// The outcome; an error only when the remote backend was explicitly
    /// requested and the credential was rejected
    pub async fn restore(&self, store: &LocalStore) -> Result<RestoreOutcome> {
        let mut outcome = RestoreOutcome::nothing();

        if let Some(handle) = &self.handle {
            match handle.blob_id().await {
                Some(blob_id) => match self.restore_remote(handle, store).await {
                    Ok((rows, attempts)) => {
                        info!(blob_id = %blob_id, rows, attempts, "Restored from remote snapshot");
                        return Ok(RestoreOutcome {
                            source: RestoreSource::Remote {
                                blob_id,
                                file: self.snapshot_file().to_string(),
                            },
                            attempts,
                            rows,
                            ..RestoreOutcome::nothing()
                        });
                    }
                    Err(RetryError::Permanent { error, attempt, .. }) if error.is_auth() => {
                        outcome.attempts = attempt;
                        if self.remote_required {
                            return Err(error);
                        }
                        warn!(error = %error, "Remote credential rejected, continuing with local backups only");
                        outcome.degraded_to_local = true;
                    }
                    Err(err) => {
                        outcome.attempts = err.attempts();
                        outcome.remote_unavailable = true;
                        warn!(
                            blob_id = %blob_id,
                            attempts = outcome.attempts,
                            error = %err.into_inner(),
                            "Remote restore failed, starting without remote data"
                        );
                    }
                },
                None => info!("No blob id configured, nothing to restore remotely"),
            }
        }

        let local = match (&self.local_backups, outcome.degraded_to_local) {
            (Some(backups), _) => Some(backups),
            (None, true) => Some(&self.fallback_dir),
            (None, false) => None,
        };
        if let Some(backups) = local {
            let backups = backups.clone();
            let target = store.clone();
            if let Some(record) =
                tokio::task::spawn_blocking(move || backups.restore_latest(&target)).await??
            {
                outcome.source = RestoreSource::LocalBackup(record.path);
            }
        }

        let counted = store.clone();
        outcome.rows = tokio::task::spawn_blocking(move || counted.total_rows()).await??;
        if !outcome.restored() {
            info!(rows = outcome.rows, "Starting without restored data");
        }
        Ok(outcome)
    }

    async fn restore_remote(
        &self,
        handle: &BlobHandle,
        store: &LocalStore,
    ) -> std::result::Result<(usize, usize), RetryError<RekindleError>> {
        if !self.initial_delay.is_zero() {
            info!(delay_secs = self.initial_delay.as_secs(), "Waiting before the first restore attempt");
            tokio::time::sleep(self.initial_delay).await;
        }

        let file = self.snapshot_file();
        let format = self.format;
        retry_bounded(
            "startup_restore",
            self.attempts,
            constant_policy(self.retry_delay),
            |attempt| {
                let store = store.clone();
                async move {
                    info!(attempt, file, "Fetching remote snapshot");
                    #[cfg(feature = "metrics")]
                    crate::observability::with_metrics(|m| m.record_restore_attempt());

                    let document = handle.fetch_file(file).await?;
                    let rows =
                        tokio::task::spawn_blocking(move || decode_document(format, &document, &store))
                            .await??;
                    Ok::<_, RekindleError>((rows, attempt))
                }
            },
        )
        .await
    }
}

/// Decode a snapshot document of the given format into `store`
///
/// # Returns
/// Number of rows now in the store
pub fn decode_document(format: SnapshotFormat, document: &str, store: &LocalStore) -> Result<usize> {
    match format {
        SnapshotFormat::Tables => {
            let snapshot = Snapshot::from_document(document)?;
            Ok(SnapshotCodec::decode(&snapshot, store)?.rows)
        }
        SnapshotFormat::Raw => RawFileCodec::decode(document, store),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlobFiles, MemoryBlobStore};
    use crate::store::StoreSchema;

    fn config(backend: StorageBackend) -> ServiceConfig {
        ServiceConfig {
            backend,
            remote_credential: Some("token".into()),
            restore_initial_delay: Duration::from_secs(10),
            restore_retry_delay: Duration::from_secs(10),
            ..ServiceConfig::default()
        }
    }

    fn handle(remote: MemoryBlobStore, blob_id: &str) -> Arc<BlobHandle> {
        Arc::new(BlobHandle::new(Arc::new(remote), Some(blob_id.into()), "test", None))
    }

    fn store() -> LocalStore {
        LocalStore::in_memory(StoreSchema::operations()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_on_first_attempt() {
        let remote = MemoryBlobStore::new().with_blob(
            "abc",
            BlobFiles::from([(
                SNAPSHOT_FILE.to_string(),
                r#"{"vehicles": [{"id": 3, "plate": "ZZ999"}]}"#.to_string(),
            )]),
        );
        let restorer = StartupRestorer::new(&config(StorageBackend::Remote), Some(handle(remote, "abc")));
        let store = store();

        let outcome = restorer.restore(&store).await.unwrap();

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.rows, 1);
        assert!(matches!(outcome.source, RestoreSource::Remote { .. }));
        assert_eq!(store.records("vehicles").unwrap()[0]["plate"], "ZZ999");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_blob_falls_back_to_empty_store() {
        let restorer = StartupRestorer::new(
            &config(StorageBackend::Remote),
            Some(handle(MemoryBlobStore::new(), "gone")),
        );
        let store = store();
        let started = tokio::time::Instant::now();

        let outcome = restorer.restore(&store).await.unwrap();

        assert_eq!(outcome.source, RestoreSource::Nothing);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.remote_unavailable);
        assert_eq!(store.total_rows().unwrap(), 0);
        // initial delay plus two inter-attempt delays
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_is_discarded() {
        let remote = MemoryBlobStore::new().with_blob(
            "abc",
            BlobFiles::from([(SNAPSHOT_FILE.to_string(), "{not json".to_string())]),
        );
        let restorer = StartupRestorer::new(&config(StorageBackend::Auto), Some(handle(remote, "abc")));
        let store = store();

        let outcome = restorer.restore(&store).await.unwrap();
        assert_eq!(outcome.source, RestoreSource::Nothing);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_without_blob_id_nothing_is_fetched() {
        let config = ServiceConfig {
            restore_initial_delay: Duration::from_secs(3600),
            ..config(StorageBackend::Remote)
        };
        let handle = Arc::new(BlobHandle::new(Arc::new(MemoryBlobStore::new()), None, "test", None));
        let restorer = StartupRestorer::new(&config, Some(handle));

        let outcome = restorer.restore(&store()).await.unwrap();
        assert_eq!(outcome.attempts, 0);
        assert!(!outcome.remote_unavailable);
    }

    #[tokio::test]
    async fn test_local_mode_restores_latest_backup() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = ServiceConfig {
            backend: StorageBackend::Local,
            local_backup_dir: temp_dir.path().to_path_buf(),
            ..ServiceConfig::default()
        };
        let source = store();
        let serde_json::Value::Object(record) = serde_json::json!({"id": 1, "plate": "AB123"}) else {
            unreachable!()
        };
        source.insert("vehicles", &record).unwrap();
        LocalBackupDir::new(temp_dir.path(), 5)
            .rotate(&source, chrono::Utc::now())
            .unwrap();

        let target = store();
        let outcome = StartupRestorer::new(&config, None).restore(&target).await.unwrap();

        assert!(matches!(outcome.source, RestoreSource::LocalBackup(_)));
        assert_eq!(outcome.rows, 1);
        assert_eq!(outcome.attempts, 0);
    }
}
