//! Service configuration loaded from the environment
//!
//! All settings have defaults so a bare environment yields a working
//! local-only service. Variables use the `REKINDLE_` prefix; the remote
//! credential and blob id also accept the `GITHUB_TOKEN`/`GH_TOKEN` and
//! `GIST_ID` names used by existing deployments.

use crate::{RekindleError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where snapshots are replicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Remote blob only; auth failures are fatal
    Remote,
    /// Rotated local copies only
    Local,
    /// Remote when a credential is configured, degrading to local otherwise
    Auto,
}

impl FromStr for StorageBackend {
    type Err = RekindleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "gist" => Ok(StorageBackend::Remote),
            "local" => Ok(StorageBackend::Local),
            "auto" => Ok(StorageBackend::Auto),
            other => Err(RekindleError::config(format!(
                "unknown backend '{other}', expected remote, local or auto"
            ))),
        }
    }
}

/// Encoding of the replicated snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// Per-table JSON document in `snapshot.json`
    Tables,
    /// Base64 copy of the whole database file in `store_backup.json`
    Raw,
}

impl FromStr for SnapshotFormat {
    type Err = RekindleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tables" | "json" => Ok(SnapshotFormat::Tables),
            "raw" | "raw-file" | "file" => Ok(SnapshotFormat::Raw),
            other => Err(RekindleError::config(format!(
                "unknown snapshot format '{other}', expected tables or raw"
            ))),
        }
    }
}

/// Full runtime configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub backend: StorageBackend,
    /// Bearer credential for the blob API; never serialized
    #[serde(skip)]
    pub remote_credential: Option<String>,
    pub remote_endpoint: String,
    pub blob_id: Option<String>,
    pub blob_description: String,
    pub snapshot_format: SnapshotFormat,
    pub raw_compression: bool,
    pub database_path: PathBuf,
    pub local_backups: bool,
    pub local_backup_dir: PathBuf,
    pub local_backup_retention: usize,
    pub backup_interval: Duration,
    pub heartbeat_interval: Duration,
    pub freeze_prevention: Duration,
    pub restore_attempts: usize,
    pub restore_retry_delay: Duration,
    pub restore_initial_delay: Duration,
    pub shutdown_grace: Duration,
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Auto,
            remote_credential: None,
            remote_endpoint: "https://api.github.com/gists".to_string(),
            blob_id: None,
            blob_description: "rekindle snapshot store".to_string(),
            snapshot_format: SnapshotFormat::Tables,
            raw_compression: false,
            database_path: PathBuf::from("data/rekindle.db"),
            local_backups: false,
            local_backup_dir: PathBuf::from("backups"),
            local_backup_retention: 5,
            backup_interval: Duration::from_secs(1500),
            heartbeat_interval: Duration::from_secs(300),
            freeze_prevention: Duration::from_secs(24 * 3600),
            restore_attempts: 3,
            restore_retry_delay: Duration::from_secs(10),
            restore_initial_delay: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("backend", &self.backend)
            .field(
                "remote_credential",
                &self.remote_credential.as_ref().map(|_| "<redacted>"),
            )
            .field("remote_endpoint", &self.remote_endpoint)
            .field("blob_id", &self.blob_id)
            .field("snapshot_format", &self.snapshot_format)
            .field("raw_compression", &self.raw_compression)
            .field("database_path", &self.database_path)
            .field("local_backups", &self.local_backups)
            .field("local_backup_dir", &self.local_backup_dir)
            .field("local_backup_retention", &self.local_backup_retention)
            .field("backup_interval", &self.backup_interval)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("freeze_prevention", &self.freeze_prevention)
            .field("restore_attempts", &self.restore_attempts)
            .field("restore_retry_delay", &self.restore_retry_delay)
            .field("restore_initial_delay", &self.restore_initial_delay)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ServiceConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// Empty values are treated as unset. Unparseable values are errors
    /// rather than silently falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = get("REKINDLE_BACKEND") {
            config.backend = v.parse()?;
        }
        config.remote_credential = get("REKINDLE_REMOTE_CREDENTIAL")
            .or_else(|| get("GITHUB_TOKEN"))
            .or_else(|| get("GH_TOKEN"));
        if let Some(v) = get("REKINDLE_REMOTE_ENDPOINT") {
            config.remote_endpoint = v.trim_end_matches('/').to_string();
        }
        config.blob_id = get("REKINDLE_BLOB_ID").or_else(|| get("GIST_ID"));
        if let Some(v) = get("REKINDLE_BLOB_DESCRIPTION") {
            config.blob_description = v;
        }
        if let Some(v) = get("REKINDLE_SNAPSHOT_FORMAT") {
            config.snapshot_format = v.parse()?;
        }
        if let Some(v) = get("REKINDLE_RAW_COMPRESSION") {
            config.raw_compression = parse_bool("REKINDLE_RAW_COMPRESSION", &v)?;
        }
        if let Some(v) = get("REKINDLE_DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("REKINDLE_LOCAL_BACKUPS") {
            config.local_backups = parse_bool("REKINDLE_LOCAL_BACKUPS", &v)?;
        }
        if let Some(v) = get("REKINDLE_LOCAL_BACKUP_DIR") {
            config.local_backup_dir = PathBuf::from(v);
        }
        if let Some(v) = get("REKINDLE_LOCAL_BACKUP_RETENTION") {
            config.local_backup_retention = parse_number("REKINDLE_LOCAL_BACKUP_RETENTION", &v)?;
        }
        if let Some(v) = get("REKINDLE_BACKUP_INTERVAL_SECONDS") {
            config.backup_interval = parse_seconds("REKINDLE_BACKUP_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = get("REKINDLE_HEARTBEAT_INTERVAL_SECONDS") {
            config.heartbeat_interval = parse_seconds("REKINDLE_HEARTBEAT_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = get("REKINDLE_FREEZE_PREVENTION_HOURS") {
            let hours: u64 = parse_number("REKINDLE_FREEZE_PREVENTION_HOURS", &v)?;
            config.freeze_prevention = Duration::from_secs(hours * 3600);
        }
        if let Some(v) = get("REKINDLE_RESTORE_ATTEMPTS") {
            config.restore_attempts = parse_number("REKINDLE_RESTORE_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("REKINDLE_RESTORE_RETRY_DELAY_SECONDS") {
            config.restore_retry_delay = parse_seconds("REKINDLE_RESTORE_RETRY_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = get("REKINDLE_RESTORE_INITIAL_DELAY_SECONDS") {
            config.restore_initial_delay =
                parse_seconds("REKINDLE_RESTORE_INITIAL_DELAY_SECONDS", &v)?;
        }
        if let Some(v) = get("REKINDLE_SHUTDOWN_GRACE_SECONDS") {
            config.shutdown_grace = parse_seconds("REKINDLE_SHUTDOWN_GRACE_SECONDS", &v)?;
        }
        if let Some(v) = get("REKINDLE_REQUEST_TIMEOUT_SECONDS") {
            config.request_timeout = parse_seconds("REKINDLE_REQUEST_TIMEOUT_SECONDS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend == StorageBackend::Remote && self.remote_credential.is_none() {
            return Err(RekindleError::config(
                "remote backend requires REKINDLE_REMOTE_CREDENTIAL",
            ));
        }
        if self.remote_enabled() && self.remote_endpoint.is_empty() {
            return Err(RekindleError::config("remote endpoint cannot be empty"));
        }
        for (name, value) in [
            ("backup interval", self.backup_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("freeze prevention", self.freeze_prevention),
            ("request timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(RekindleError::config(format!("{name} must be greater than zero")));
            }
        }
        if self.restore_attempts == 0 {
            return Err(RekindleError::config("restore attempts must be at least 1"));
        }
        if self.local_backups_enabled() && self.local_backup_retention == 0 {
            return Err(RekindleError::config(
                "local backup retention must be at least 1",
            ));
        }
        Ok(())
    }

    /// True when snapshots go to the remote blob
    pub fn remote_enabled(&self) -> bool {
        match self.backend {
            StorageBackend::Remote => true,
            StorageBackend::Local => false,
            StorageBackend::Auto => self.remote_credential.is_some(),
        }
    }

    /// True when rotated local copies are kept
    pub fn local_backups_enabled(&self) -> bool {
        self.local_backups || !self.remote_enabled()
    }

    /// Directory holding the database file and the persisted blob id
    pub fn data_dir(&self) -> PathBuf {
        self.database_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Where a newly created blob id is recorded
    pub fn blob_id_file(&self) -> PathBuf {
        self.data_dir().join("blob_id")
    }

    /// Local copy of the process state
    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join("process_state.json")
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RekindleError::config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RekindleError::config(format!("{key}: expected a number, got '{value}'")))
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_empty_environment() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend, StorageBackend::Auto);
        assert_eq!(config.snapshot_format, SnapshotFormat::Tables);
        assert_eq!(config.backup_interval, Duration::from_secs(1500));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(300));
        assert_eq!(config.freeze_prevention, Duration::from_secs(86_400));
        assert_eq!(config.restore_attempts, 3);
        assert_eq!(config.restore_retry_delay, Duration::from_secs(10));
        assert!(!config.remote_enabled());
        assert!(config.local_backups_enabled());
    }

    #[test]
    fn test_legacy_variable_names() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("GITHUB_TOKEN", "ghp_secret"),
            ("GIST_ID", "abc123"),
        ]))
        .unwrap();
        assert_eq!(config.remote_credential.as_deref(), Some("ghp_secret"));
        assert_eq!(config.blob_id.as_deref(), Some("abc123"));
        assert!(config.remote_enabled());
        assert!(!config.local_backups_enabled());
    }

    #[test]
    fn test_prefixed_variables_win() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("GITHUB_TOKEN", "legacy"),
            ("REKINDLE_REMOTE_CREDENTIAL", "primary"),
            ("REKINDLE_BACKUP_INTERVAL_SECONDS", "900"),
            ("REKINDLE_FREEZE_PREVENTION_HOURS", "12"),
            ("REKINDLE_SNAPSHOT_FORMAT", "raw"),
            ("REKINDLE_REMOTE_ENDPOINT", "http://localhost:9000/blobs/"),
        ]))
        .unwrap();
        assert_eq!(config.remote_credential.as_deref(), Some("primary"));
        assert_eq!(config.backup_interval, Duration::from_secs(900));
        assert_eq!(config.freeze_prevention, Duration::from_secs(12 * 3600));
        assert_eq!(config.snapshot_format, SnapshotFormat::Raw);
        assert_eq!(config.remote_endpoint, "http://localhost:9000/blobs");
    }

    #[test]
    fn test_remote_backend_requires_credential() {
        let result = ServiceConfig::from_lookup(lookup(&[("REKINDLE_BACKEND", "remote")]));
        assert!(result.unwrap_err().to_string().contains("requires"));
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!(ServiceConfig::from_lookup(lookup(&[("REKINDLE_RESTORE_ATTEMPTS", "0")])).is_err());
        assert!(
            ServiceConfig::from_lookup(lookup(&[("REKINDLE_BACKUP_INTERVAL_SECONDS", "soon")]))
                .is_err()
        );
        assert!(ServiceConfig::from_lookup(lookup(&[("REKINDLE_LOCAL_BACKUPS", "maybe")])).is_err());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let config = ServiceConfig {
            remote_credential: Some("ghp_supersecret".to_string()),
            ..ServiceConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("ghp_supersecret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_data_dir() {
        let mut config = ServiceConfig::default();
        assert_eq!(config.data_dir(), PathBuf::from("data"));
        config.database_path = PathBuf::from("store.db");
        assert_eq!(config.data_dir(), PathBuf::from("."));
    }
}
