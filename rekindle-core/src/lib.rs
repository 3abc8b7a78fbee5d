/*!
# Rekindle Core

Keeps a small SQLite working copy durable across restarts of a host whose
filesystem is thrown away on every redeploy.

- [`store::LocalStore`]: the working copy, shared by the application and
  the background loops
- [`codec`]: table snapshots as JSON, plus a base64 raw-file fallback
- [`storage`]: the remote blob port, its HTTP client and rotated local copies
- [`scheduler::BackupScheduler`]: pushes a snapshot now and every interval
- [`restore::StartupRestorer`]: bounded restore before the service starts
- [`restart::RestartCoordinator`]: heartbeat, restart policy, graceful shutdown

## Usage

```rust,no_run
use rekindle_core::{service, ServiceConfig};

# async fn run() -> rekindle_core::Result<()> {
let config = ServiceConfig::from_env()?;
let service = service::boot(config).await?;
let store = service.store().clone();
// hand `store` to the application, then:
let report = service.run().await?;
println!("stopped: {}", report.reason);
# Ok(())
# }
```
*/

pub mod clock;
pub mod codec;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod metadata;
pub mod observability;
pub mod restart;
pub mod restore;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod storage;
pub mod store;

#[cfg(test)]
mod error_tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{RawFileCodec, Snapshot, SnapshotCodec};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{ServiceConfig, SnapshotFormat, StorageBackend};
pub use context::ServiceContext;
pub use error::{ErrorKind, RekindleError, Result};
pub use metadata::{SnapshotEncoding, SnapshotMetadata};
pub use restart::{ProcessState, RestartCheck, RestartCoordinator, RestartDecision, RestartPolicy, RestartReason};
pub use restore::{RestoreOutcome, RestoreSource, StartupRestorer};
pub use scheduler::{BackupReport, BackupScheduler, BackupState};
pub use service::{Service, ShutdownReport};
pub use shutdown::{ShutdownReason, ShutdownSignal};
pub use storage::{BlobHandle, BlobStore, HttpBlobClient, LocalBackupDir, MemoryBlobStore, RemoteError};
pub use store::{LocalStore, StoreSchema, TableDef};
