/*!
Service lifecycle: boot, run, graceful shutdown.

```text
boot:  open + migrate store -> StartupRestorer -> RestartCoordinator::on_boot
run:   BackupScheduler loop  | RestartCoordinator loop  (until shutdown)
stop:  join loops -> final backup -> record shutdown, all before one
       deadline `shutdown_grace` after the signal
```
*/

use crate::clock::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::context::ServiceContext;
use crate::restart::RestartCoordinator;
use crate::restore::{RestoreOutcome, RestoreSource};
use crate::scheduler::{BackupReport, BackupScheduler};
use crate::shutdown::{ShutdownReason, ShutdownSignal};
use crate::storage::{BlobStore, HttpBlobClient};
use crate::store::{LocalStore, StoreSchema};
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

/// How the service stopped
#[derive(Debug)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// `None` when the final backup did not finish before the deadline
    pub final_backup: Option<BackupReport>,
}

#[derive(Debug)]
pub struct Service {
    context: ServiceContext,
    restore: RestoreOutcome,
    coordinator: Arc<RestartCoordinator>,
    scheduler: Arc<BackupScheduler>,
}

/// Boot with the HTTP client, the system clock and the operations schema
pub async fn boot(config: ServiceConfig) -> Result<Service> {
    let remote: Option<Arc<dyn BlobStore>> = if config.remote_enabled() {
        Some(Arc::new(HttpBlobClient::from_config(&config)?))
    } else {
        None
    };
    boot_with(config, StoreSchema::operations(), remote, Arc::new(SystemClock)).await
}

/// Boot with explicit collaborators
///
/// # Arguments
/// * `config` - Service configuration
/// * `schema` - Tables of the local store
/// * `remote` - Remote blob store, `None` for local-only operation
/// * `clock` - Wall clock
pub async fn boot_with(
    config: ServiceConfig,
    schema: StoreSchema,
    remote: Option<Arc<dyn BlobStore>>,
    clock: Arc<dyn Clock>,
) -> Result<Service> {
    config.validate()?;
    let path = config.database_path.clone();
    let store = tokio::task::spawn_blocking(move || LocalStore::open(path, schema)).await??;
    info!(path = %config.database_path.display(), remote = remote.is_some(), "Local store opened");

    let mut context = ServiceContext::new(config, store, remote, clock);
    let blob_known = match &context.blob {
        Some(blob) => blob.blob_id().await.is_some(),
        None => false,
    };

    let restore = context.restorer().restore(&context.store).await?;
    if restore.degraded_to_local {
        context.disable_remote();
    }

    let coordinator = Arc::new(context.coordinator());
    if let Err(err) = coordinator.on_boot().await {
        warn!(error = %err, "Failed to record boot in process state");
    }

    let hold_empty = blob_known && !matches!(restore.source, RestoreSource::Remote { .. });
    let scheduler = Arc::new(context.scheduler().hold_empty_snapshots(hold_empty));

    info!(source = %restore.source, rows = restore.rows, "Service booted");
    Ok(Service {
        context,
        restore,
        coordinator,
        scheduler,
    })
}

impl Service {
    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    pub fn store(&self) -> &LocalStore {
        &self.context.store
    }

    pub fn restore_outcome(&self) -> &RestoreOutcome {
        &self.restore
    }

    pub fn coordinator(&self) -> &Arc<RestartCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Arc<BackupScheduler> {
        &self.scheduler
    }

    /// Signal that stops [`Service::run`]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.context.shutdown.clone()
    }

    /// Run the background loops until shutdown is requested, then stop
    /// gracefully
    pub async fn run(self) -> Result<ShutdownReport> {
        let config = Arc::clone(&self.context.config);
        let shutdown = self.context.shutdown.clone();
        let grace = config.shutdown_grace;

        let backups = tokio::spawn(Arc::clone(&self.scheduler).run(
            config.backup_interval,
            shutdown.token(),
            grace,
        ));
        let heartbeats = tokio::spawn(
            Arc::clone(&self.coordinator).run(config.heartbeat_interval, shutdown.token()),
        );

        shutdown.cancelled().await;
        let deadline = Instant::now() + grace;
        let reason = shutdown.reason().unwrap_or(ShutdownReason::Signal);
        info!(reason = %reason, grace_secs = grace.as_secs(), "Stopping background tasks");

        join_within("backup scheduler", backups, deadline).await;
        join_within("restart coordinator", heartbeats, deadline).await;

        let final_backup = match timeout_at(deadline, self.scheduler.flush()).await {
            Ok(report) => Some(report),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Final backup did not finish in time");
                None
            }
        };

        match timeout_at(deadline, self.coordinator.record_shutdown(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "Failed to record shutdown"),
            Err(_) => warn!("Recording shutdown timed out"),
        }

        info!(reason = %reason, "Shutdown complete");
        Ok(ShutdownReport {
            reason,
            final_backup,
        })
    }
}

async fn join_within(name: &'static str, mut task: JoinHandle<()>, deadline: Instant) {
    match timeout_at(deadline, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(task = name, error = %err, "Background task failed"),
        Err(_) => {
            warn!(task = name, "Background task did not stop in time, aborting");
            task.abort();
        }
    }
}
