/*!
Rekindle CLI - run the snapshot service and operate on its backups.

Configuration comes from the same `REKINDLE_*` environment variables the
service reads.
*/

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use rekindle_core::observability::{init_observability_with, DEFAULT_FILTER};
use rekindle_core::service;
use rekindle_core::shutdown::wait_for_os_signal;
use rekindle_core::storage::BackupRecord;
use rekindle_core::{
    BlobHandle, HttpBlobClient, LocalBackupDir, LocalStore, RestartCoordinator, RestartPolicy,
    ServiceConfig, ServiceContext, ShutdownReason, ShutdownSignal, StoreSchema, SystemClock,
};
use rekindle_retry::with_backoff;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rekindle")]
#[command(about = "Snapshot persistence and restart coordination for ephemeral hosts")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log one JSON object per line
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore, then run backups and heartbeats until shut down
    Serve,
    /// Take one backup now
    Backup,
    /// Restore the store from the configured source
    Restore {
        /// Skip the delay before the first remote attempt
        #[arg(long)]
        no_initial_delay: bool,
    },
    /// Evaluate the restart policy without changing anything
    CheckRestart {
        #[arg(short, long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
    /// Ask the running instance to restart at its next heartbeat
    RequestRestart,
    /// List local backup copies
    Backups,
    /// Print the shared process state
    State,
}

#[derive(Tabled)]
struct BackupInfo {
    #[tabled(rename = "File")]
    file: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
}

impl From<&BackupRecord> for BackupInfo {
    fn from(record: &BackupRecord) -> Self {
        Self {
            file: record
                .path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            created: record.created_at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
            size: format_size(record.size_bytes),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { DEFAULT_FILTER };
    init_observability_with(filter, cli.json_logs)?;

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::Backup => backup(config).await?,
        Commands::Restore { no_initial_delay } => restore(config, no_initial_delay).await?,
        Commands::CheckRestart { output } => check_restart(&config, output).await?,
        Commands::RequestRestart => request_restart(&config).await?,
        Commands::Backups => list_backups(&config)?,
        Commands::State => show_state(&config).await?,
    }

    Ok(())
}

async fn serve(config: ServiceConfig) -> Result<(), anyhow::Error> {
    let service = service::boot(config).await?;
    let signal = service.shutdown_signal();
    tokio::spawn(async move {
        wait_for_os_signal().await;
        signal.trigger(ShutdownReason::Signal);
    });

    let report = service.run().await?;
    match &report.final_backup {
        Some(backup) if !backup.is_success() => error!("Final backup failed"),
        None => error!("Final backup did not complete"),
        Some(_) => {}
    }
    info!(reason = %report.reason, "Exiting");
    Ok(())
}

async fn open_context(config: ServiceConfig) -> Result<ServiceContext, anyhow::Error> {
    let remote: Option<Arc<dyn rekindle_core::BlobStore>> = if config.remote_enabled() {
        Some(Arc::new(HttpBlobClient::from_config(&config)?))
    } else {
        None
    };
    let path = config.database_path.clone();
    let store = tokio::task::spawn_blocking(move || LocalStore::open(path, StoreSchema::operations()))
        .await??;
    Ok(ServiceContext::new(config, store, remote, Arc::new(SystemClock)))
}

async fn backup(config: ServiceConfig) -> Result<(), anyhow::Error> {
    let context = open_context(config).await?;
    let report = context.scheduler().run_once().await;

    if let Some(remote) = report.remote {
        let outcome = remote?;
        let verb = if outcome.created { "Created" } else { "Updated" };
        println!("✓ {verb} blob {} ({})", outcome.blob_id, format_size(report.snapshot_bytes as u64));
    }
    if let Some(local) = report.local {
        println!("✓ Local backup {}", local?.path.display());
    }
    Ok(())
}

async fn restore(mut config: ServiceConfig, no_initial_delay: bool) -> Result<(), anyhow::Error> {
    if no_initial_delay {
        config.restore_initial_delay = Duration::ZERO;
    }
    let context = open_context(config).await?;
    let outcome = context.restorer().restore(&context.store).await?;

    if outcome.restored() {
        println!("✓ Restored {} rows from {}", outcome.rows, outcome.source);
    } else {
        println!("Nothing restored after {} attempts; store has {} rows", outcome.attempts, outcome.rows);
    }
    Ok(())
}

/// Coordinator over the shared state only, without opening the store
fn coordinator(config: &ServiceConfig) -> Result<RestartCoordinator, anyhow::Error> {
    let handle = if config.remote_enabled() {
        let blob_id = config
            .blob_id
            .clone()
            .or_else(|| BlobHandle::load_recorded_id(&config.blob_id_file()));
        let Some(blob_id) = blob_id else {
            bail!("REKINDLE_BLOB_ID is required to reach the shared process state");
        };
        let client = HttpBlobClient::from_config(config)?;
        Some(Arc::new(BlobHandle::new(
            Arc::new(client),
            Some(blob_id),
            config.blob_description.clone(),
            None,
        )))
    } else {
        None
    };

    Ok(RestartCoordinator::new(
        handle,
        config.state_file(),
        RestartPolicy::new(config.freeze_prevention),
        Arc::new(SystemClock),
        ShutdownSignal::new(),
    ))
}

async fn check_restart(config: &ServiceConfig, output: OutputFormat) -> Result<(), anyhow::Error> {
    let check = coordinator(config)?.check_restart().await?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&check)?),
        OutputFormat::Text => {
            if check.restart_needed {
                println!("Restart needed: {}", check.restart_reason);
            } else {
                println!("Restart not needed");
            }
            match (check.last_restart, check.hours_since_restart) {
                (Some(at), Some(hours)) => println!("  Last restart: {at} ({hours:.1} h ago)"),
                _ => println!("  Last restart: never"),
            }
            println!("  Restart count: {}", check.restart_count);
        }
    }

    if let Ok(path) = std::env::var("GITHUB_OUTPUT") {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open step output file {path}"))?;
        file.write_all(check.to_step_outputs().as_bytes())?;
    }
    Ok(())
}

async fn request_restart(config: &ServiceConfig) -> Result<(), anyhow::Error> {
    let coordinator = coordinator(config)?;
    let state = with_backoff("request_restart", |_| coordinator.request_restart())
        .await
        .map_err(|e| e.into_inner())?;

    println!(
        "✓ Restart requested at {}",
        state
            .restart_requested_at
            .map_or_else(|| "unknown".to_string(), |at| at.to_rfc3339())
    );
    Ok(())
}

fn list_backups(config: &ServiceConfig) -> Result<(), anyhow::Error> {
    let backups = LocalBackupDir::new(&config.local_backup_dir, config.local_backup_retention);
    let records = backups.list()?;

    if records.is_empty() {
        println!("No backups found in {}", backups.dir().display());
    } else {
        let rows: Vec<BackupInfo> = records.iter().map(BackupInfo::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

async fn show_state(config: &ServiceConfig) -> Result<(), anyhow::Error> {
    match coordinator(config)?.load_state().await? {
        Some(state) => println!("{}", state.to_document()?),
        None => println!("No process state recorded yet"),
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["rekindle", "--json-logs", "check-restart", "-o", "json"]).unwrap();
        assert!(cli.json_logs);
        assert!(matches!(
            cli.command,
            Commands::CheckRestart {
                output: OutputFormat::Json
            }
        ));
        assert!(Cli::try_parse_from(["rekindle", "restore", "--no-initial-delay"]).is_ok());
    }
}
