/*!
The explicit service context.

Built once at boot and handed to every component; there are no global
clients or stores.
*/

use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::restart::{RestartCoordinator, RestartPolicy};
use crate::restore::StartupRestorer;
use crate::scheduler::BackupScheduler;
use crate::shutdown::ShutdownSignal;
use crate::storage::{BlobHandle, BlobStore, LocalBackupDir};
use crate::store::LocalStore;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<ServiceConfig>,
    pub store: LocalStore,
    pub remote: Option<Arc<dyn BlobStore>>,
    pub blob: Option<Arc<BlobHandle>>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: ShutdownSignal,
}

impl ServiceContext {
    /// # Arguments
    /// * `config` - Validated configuration
    /// * `store` - Opened and migrated local store
    /// * `remote` - Remote blob store, `None` for local-only operation
    /// * `clock` - Wall clock
    pub fn new(
        config: ServiceConfig,
        store: LocalStore,
        remote: Option<Arc<dyn BlobStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let blob_id_file = config.blob_id_file();
        let blob = remote.as_ref().map(|remote| {
            let blob_id = config.blob_id.clone().or_else(|| {
                let recorded = BlobHandle::load_recorded_id(&blob_id_file);
                if let Some(id) = &recorded {
                    info!(blob_id = %id, "Using blob id recorded by a previous run");
                }
                recorded
            });
            Arc::new(BlobHandle::new(
                Arc::clone(remote),
                blob_id,
                config.blob_description.clone(),
                Some(blob_id_file.clone()),
            ))
        });

        Self {
            config: Arc::new(config),
            store,
            remote,
            blob,
            clock,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Stop replicating to the remote blob
    pub fn disable_remote(&mut self) {
        self.remote = None;
        self.blob = None;
    }

    pub fn remote_enabled(&self) -> bool {
        self.blob.is_some()
    }

    pub fn backup_dir(&self) -> LocalBackupDir {
        LocalBackupDir::new(&self.config.local_backup_dir, self.config.local_backup_retention)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::new(self.config.freeze_prevention)
    }

    pub fn restorer(&self) -> StartupRestorer {
        StartupRestorer::new(&self.config, self.blob.clone())
    }

    pub fn coordinator(&self) -> RestartCoordinator {
        RestartCoordinator::new(
            self.blob.clone(),
            self.config.state_file(),
            self.restart_policy(),
            Arc::clone(&self.clock),
            self.shutdown.clone(),
        )
    }

    /// Local copies are kept when configured, or whenever the remote is off
    pub fn scheduler(&self) -> BackupScheduler {
        let local = (self.config.local_backups_enabled() || !self.remote_enabled())
            .then(|| self.backup_dir());
        BackupScheduler::new(
            self.store.clone(),
            self.blob.clone(),
            local,
            self.config.snapshot_format,
            Arc::clone(&self.clock),
        )
        .with_raw_compression(self.config.raw_compression)
    }
}
