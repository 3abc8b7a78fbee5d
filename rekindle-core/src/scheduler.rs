/*!
Periodic snapshot backups.

The scheduler ticks once as soon as its loop starts and then every backup
interval. A tick encodes the store, releases it, and only then talks to
the remote blob. Failures are logged and the scheduler returns to
[`BackupState::Idle`]; the next tick is the retry.
*/

use crate::clock::Clock;
use crate::codec::{RawFileCodec, SnapshotCodec};
use crate::config::SnapshotFormat;
use crate::storage::{
    BackupRecord, BlobHandle, LocalBackupDir, WriteOutcome, RAW_SNAPSHOT_FILE, SNAPSHOT_FILE,
};
use crate::store::LocalStore;
use crate::{RekindleError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    BackingUp,
}

/// What one backup tick did
#[derive(Debug)]
pub struct BackupReport {
    pub at: DateTime<Utc>,
    /// `None` when remote replication is off or the push was withheld
    pub remote: Option<Result<WriteOutcome>>,
    /// `None` when local copies are off
    pub local: Option<Result<BackupRecord>>,
    pub snapshot_bytes: usize,
}

impl BackupReport {
    /// True when every enabled target succeeded
    pub fn is_success(&self) -> bool {
        self.remote.as_ref().map_or(true, |r| r.is_ok())
            && self.local.as_ref().map_or(true, |r| r.is_ok())
    }
}

#[derive(Debug)]
pub struct BackupScheduler {
    store: LocalStore,
    handle: Option<Arc<BlobHandle>>,
    local: Option<LocalBackupDir>,
    format: SnapshotFormat,
    raw_compression: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<BackupState>,
    gate: tokio::sync::Mutex<()>,
    hold_empty: AtomicBool,
}

impl BackupScheduler {
    /// # Arguments
    /// * `store` - Store to snapshot
    /// * `handle` - Remote blob, `None` when remote replication is off
    /// * `local` - Rotated local copies, `None` when off
    /// * `format` - Snapshot encoding pushed to the remote
    /// * `clock` - Wall clock for snapshot timestamps
    pub fn new(
        store: LocalStore,
        handle: Option<Arc<BlobHandle>>,
        local: Option<LocalBackupDir>,
        format: SnapshotFormat,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            handle,
            local,
            format,
            raw_compression: false,
            clock,
            state: Mutex::new(BackupState::Idle),
            gate: tokio::sync::Mutex::new(()),
            hold_empty: AtomicBool::new(false),
        }
    }

    /// Gzip raw snapshots before encoding them
    pub fn with_raw_compression(mut self, enabled: bool) -> Self {
        self.raw_compression = enabled;
        self
    }

    /// Withhold remote pushes while the store is empty
    ///
    /// Set when a blob exists but could not be restored at boot, so an empty
    /// store does not overwrite the remote snapshot. Released by the first
    /// push of a non-empty store.
    pub fn hold_empty_snapshots(self, hold: bool) -> Self {
        self.hold_empty.store(hold, Ordering::SeqCst);
        self
    }

    pub fn state(&self) -> BackupState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: BackupState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn remote_file(&self) -> &'static str {
        match self.format {
            SnapshotFormat::Tables => SNAPSHOT_FILE,
            SnapshotFormat::Raw => RAW_SNAPSHOT_FILE,
        }
    }

    /// Run one backup against every enabled target
    ///
    /// Ticks are serialized; a call made while another is running waits
    /// for it.
    pub async fn run_once(&self) -> BackupReport {
        let _gate = self.gate.lock().await;
        self.set_state(BackupState::BackingUp);
        let at = self.clock.now();

        let mut report = BackupReport {
            at,
            remote: None,
            local: None,
            snapshot_bytes: 0,
        };

        if let Some(handle) = &self.handle {
            match self.encode(at).await {
                Ok((_, 0)) if self.hold_empty.load(Ordering::SeqCst) => {
                    warn!("Store is empty and the remote snapshot was not restored, skipping remote push");
                }
                Ok((document, _)) => {
                    report.snapshot_bytes = document.len();
                    let pushed = handle.write_file(self.remote_file(), &document).await;
                    if pushed.is_ok() {
                        self.hold_empty.store(false, Ordering::SeqCst);
                    }
                    report.remote = Some(pushed);
                }
                Err(err) => report.remote = Some(Err(err)),
            }
        }

        if let Some(local) = &self.local {
            let local = local.clone();
            let store = self.store.clone();
            let rotated = tokio::task::spawn_blocking(move || local.rotate(&store, at))
                .await
                .map_err(RekindleError::from)
                .and_then(|r| r);
            report.local = Some(rotated);
        }

        self.log_report(&report);
        self.set_state(BackupState::Idle);
        report
    }

    /// Final backup during shutdown
    pub async fn flush(&self) -> BackupReport {
        info!("Running final backup");
        self.run_once().await
    }

    /// Encode under the store lock, off the async workers
    ///
    /// # Returns
    /// The document and the number of rows it carries
    async fn encode(&self, at: DateTime<Utc>) -> Result<(String, usize)> {
        let store = self.store.clone();
        let format = self.format;
        let compress = self.raw_compression;
        tokio::task::spawn_blocking(move || match format {
            SnapshotFormat::Tables => {
                let snapshot = SnapshotCodec::encode(&store, at)?;
                Ok((snapshot.to_document()?, snapshot.row_count()))
            }
            SnapshotFormat::Raw => {
                let document = RawFileCodec::new(compress).encode(&store, at)?;
                Ok((document, store.total_rows()?))
            }
        })
        .await?
    }

    fn log_report(&self, report: &BackupReport) {
        match &report.remote {
            Some(Ok(outcome)) => info!(
                blob_id = %outcome.blob_id,
                created = outcome.created,
                bytes = report.snapshot_bytes,
                "Snapshot pushed to remote"
            ),
            Some(Err(err)) => error!(kind = ?err.kind(), error = %err, "Remote backup failed, will retry next tick"),
            None => {}
        }
        match &report.local {
            Some(Ok(record)) => debug!(path = %record.path.display(), "Local backup written"),
            Some(Err(err)) => error!(error = %err, "Local backup failed, will retry next tick"),
            None => {}
        }

        #[cfg(feature = "metrics")]
        crate::observability::with_metrics(|m| {
            if report.is_success() {
                m.record_backup(report.snapshot_bytes);
            } else {
                m.record_backup_failure();
            }
        });
    }

    /// Tick immediately, then every `interval`, until `cancel` fires
    ///
    /// A tick in flight when `cancel` fires gets `grace` to finish and is
    /// abandoned after that.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken, grace: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Backup scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let tick = self.run_once();
                    tokio::pin!(tick);
                    tokio::select! {
                        _ = &mut tick => {}
                        _ = cancel.cancelled() => {
                            if tokio::time::timeout(grace, &mut tick).await.is_err() {
                                warn!(grace_secs = grace.as_secs(), "Abandoning in-flight backup");
                            }
                            break;
                        }
                    }
                }
            }
        }
        info!("Backup scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::Snapshot;
    use crate::storage::{BlobFiles, BlobStore, MemoryBlobStore, RemoteError};
    use crate::store::{Record, StoreSchema};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()))
    }

    fn seeded_store() -> LocalStore {
        let store = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        let serde_json::Value::Object(record) = json!({"id": 1, "plate": "AB123"}) else {
            unreachable!()
        };
        store.insert("vehicles", &record).unwrap();
        store
    }

    fn scheduler(store: LocalStore, remote: &MemoryBlobStore, blob_id: Option<&str>) -> BackupScheduler {
        let handle = BlobHandle::new(
            Arc::new(remote.clone()),
            blob_id.map(str::to_string),
            "test",
            None,
        );
        BackupScheduler::new(store, Some(Arc::new(handle)), None, SnapshotFormat::Tables, clock())
    }

    /// Fails every call until `healthy` is set
    #[derive(Debug, Default)]
    struct Outage {
        inner: MemoryBlobStore,
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    impl Outage {
        fn check(&self) -> std::result::Result<(), RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RemoteError::ServerError {
                    status: 502,
                    message: "bad gateway".into(),
                })
            }
        }
    }

    #[async_trait]
    impl BlobStore for Outage {
        async fn create(&self, description: &str, files: &BlobFiles) -> std::result::Result<String, RemoteError> {
            self.check()?;
            self.inner.create(description, files).await
        }

        async fn fetch(&self, blob_id: &str) -> std::result::Result<BlobFiles, RemoteError> {
            self.check()?;
            self.inner.fetch(blob_id).await
        }

        async fn replace_file(
            &self,
            blob_id: &str,
            filename: &str,
            content: &str,
        ) -> std::result::Result<(), RemoteError> {
            self.check()?;
            self.inner.replace_file(blob_id, filename, content).await
        }
    }

    #[tokio::test]
    async fn test_first_backup_creates_blob() {
        let remote = MemoryBlobStore::new();
        let scheduler = scheduler(seeded_store(), &remote, None);

        let report = scheduler.run_once().await;
        let outcome = report.remote.unwrap().unwrap();

        assert!(outcome.created);
        assert_eq!(scheduler.state(), BackupState::Idle);
        let document = remote.file(&outcome.blob_id, SNAPSHOT_FILE).unwrap();
        let snapshot = Snapshot::from_document(&document).unwrap();
        let rows: &Vec<Record> = &snapshot.table("vehicles").unwrap().records;
        assert_eq!(rows[0]["plate"], json!("AB123"));
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_retried_inline() {
        let outage = Arc::new(Outage::default());
        let handle = BlobHandle::new(outage.clone(), Some("abc".into()), "test", None);
        let scheduler =
            BackupScheduler::new(seeded_store(), Some(Arc::new(handle)), None, SnapshotFormat::Tables, clock());

        let report = scheduler.run_once().await;
        assert!(!report.is_success());
        assert_eq!(report.remote.unwrap().unwrap_err().kind(), crate::ErrorKind::TransientNetwork);
        assert_eq!(outage.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), BackupState::Idle);
    }

    #[tokio::test]
    async fn test_empty_store_is_held_back() {
        let remote = MemoryBlobStore::new()
            .with_blob("abc", BlobFiles::from([(SNAPSHOT_FILE.to_string(), "precious".to_string())]));
        let empty = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        let scheduler = scheduler(empty.clone(), &remote, Some("abc")).hold_empty_snapshots(true);

        let report = scheduler.run_once().await;
        assert!(report.remote.is_none());
        assert_eq!(remote.file("abc", SNAPSHOT_FILE).as_deref(), Some("precious"));

        let serde_json::Value::Object(record) = json!({"plate": "NEW1"}) else { unreachable!() };
        empty.insert("vehicles", &record).unwrap();
        scheduler.run_once().await.remote.unwrap().unwrap();
        assert_ne!(remote.file("abc", SNAPSHOT_FILE).as_deref(), Some("precious"));
    }

    #[tokio::test]
    async fn test_local_and_raw_targets() {
        let temp_dir = TempDir::new().unwrap();
        let remote = MemoryBlobStore::new();
        let handle = BlobHandle::new(Arc::new(remote.clone()), None, "test", None);
        let scheduler = BackupScheduler::new(
            seeded_store(),
            Some(Arc::new(handle)),
            Some(LocalBackupDir::new(temp_dir.path(), 2)),
            SnapshotFormat::Raw,
            clock(),
        )
        .with_raw_compression(true);

        let report = scheduler.run_once().await;
        assert!(report.is_success());
        let blob_id = report.remote.unwrap().unwrap().blob_id;
        assert!(remote.file(&blob_id, RAW_SNAPSHOT_FILE).is_some());
        assert!(remote.file(&blob_id, SNAPSHOT_FILE).is_none());
        assert!(report.local.unwrap().unwrap().path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_immediately_then_every_interval() {
        let outage = Arc::new(Outage::default());
        let handle = BlobHandle::new(outage.clone(), Some("abc".into()), "test", None);
        let scheduler = Arc::new(BackupScheduler::new(
            seeded_store(),
            Some(Arc::new(handle)),
            None,
            SnapshotFormat::Tables,
            clock(),
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&scheduler).run(
            Duration::from_secs(60),
            cancel.clone(),
            Duration::from_secs(5),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(outage.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(outage.calls.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
