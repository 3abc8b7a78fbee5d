/*!
Rotated local copies of the store file.
*/

use crate::store::LocalStore;
use crate::{RekindleError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PREFIX: &str = "backup_";
const SUFFIX: &str = ".db";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S%.3f";

/// One timestamped copy in the backup directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub path: PathBuf,
    /// Parsed from the file name
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Directory of `backup_%Y%m%d_%H%M%S%.3f.db` files capped at `retention` entries
///
/// Ordering is by the time encoded in the file name, never by filesystem
/// metadata, so copies restored onto a fresh disk keep their order. Files
/// that do not match the naming pattern are ignored.
#[derive(Debug, Clone)]
pub struct LocalBackupDir {
    dir: PathBuf,
    retention: usize,
}

impl LocalBackupDir {
    /// # Arguments
    /// * `dir` - Backup directory, created on first write
    /// * `retention` - Maximum number of copies kept
    pub fn new<P: AsRef<Path>>(dir: P, retention: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retention: retention.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// File name for a copy taken at `at`
    pub fn file_name_for(at: DateTime<Utc>) -> String {
        format!("{PREFIX}{}{SUFFIX}", at.format(STAMP_FORMAT))
    }

    /// Creation time encoded in a backup file name
    pub fn parse_file_name(name: &str) -> Option<DateTime<Utc>> {
        let stamp = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            RekindleError::storage(format!(
                "Failed to create backup directory {}: {e}",
                self.dir.display()
            ))
        })
    }

    /// Copy the store into a new record
    pub fn create(&self, store: &LocalStore, at: DateTime<Utc>) -> Result<BackupRecord> {
        self.ensure_dir()?;
        let path = self.dir.join(Self::file_name_for(at));
        store.copy_to(&path)?;
        let size_bytes = fs::metadata(&path)?.len();
        debug!(path = %path.display(), size_bytes, "Created local backup");
        Ok(BackupRecord {
            path,
            created_at: at,
            size_bytes,
        })
    }

    /// All records, oldest first
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(created_at) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Self::parse_file_name)
            else {
                continue;
            };
            records.push(BackupRecord {
                size_bytes: entry.metadata()?.len(),
                path,
                created_at,
            });
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
        Ok(records)
    }

    pub fn latest(&self) -> Result<Option<BackupRecord>> {
        Ok(self.list()?.pop())
    }

    /// Delete the oldest records until at most `retention` remain
    ///
    /// # Returns
    /// Paths that were deleted
    pub fn prune(&self) -> Result<Vec<PathBuf>> {
        let records = self.list()?;
        let excess = records.len().saturating_sub(self.retention);
        let mut removed = Vec::with_capacity(excess);
        for record in records.into_iter().take(excess) {
            fs::remove_file(&record.path).map_err(|e| {
                RekindleError::storage(format!(
                    "Failed to delete backup {}: {e}",
                    record.path.display()
                ))
            })?;
            debug!(path = %record.path.display(), "Pruned local backup");
            removed.push(record.path);
        }
        Ok(removed)
    }

    /// Create a record, then prune to the retention cap
    pub fn rotate(&self, store: &LocalStore, at: DateTime<Utc>) -> Result<BackupRecord> {
        let record = self.create(store, at)?;
        let removed = self.prune()?;
        info!(
            path = %record.path.display(),
            pruned = removed.len(),
            retention = self.retention,
            "Rotated local backups"
        );
        Ok(record)
    }

    /// Replace the store from the newest record that passes the integrity check
    ///
    /// # Returns
    /// The record used, or `None` if there was no usable record
    pub fn restore_latest(&self, store: &LocalStore) -> Result<Option<BackupRecord>> {
        for record in self.list()?.into_iter().rev() {
            match store.replace_from_file(&record.path) {
                Ok(rows) => {
                    info!(path = %record.path.display(), rows, "Restored from local backup");
                    return Ok(Some(record));
                }
                Err(err) => {
                    warn!(path = %record.path.display(), error = %err, "Skipping unusable local backup");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Record, StoreSchema};
    use chrono::{Duration, TimeZone};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()
    }

    fn store_with_plate(plate: &str) -> LocalStore {
        let store = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        let Value::Object(record) = json!({"plate": plate}) else { unreachable!() };
        store.insert("vehicles", &record).unwrap();
        store
    }

    #[test]
    fn test_file_name_round_trip() {
        let at = start() + Duration::milliseconds(250);
        let name = LocalBackupDir::file_name_for(at);
        assert_eq!(name, "backup_20240501_083000.250.db");
        assert_eq!(LocalBackupDir::parse_file_name(&name), Some(at));
        assert_eq!(LocalBackupDir::parse_file_name("notes.txt"), None);
    }

    #[test]
    fn test_retention_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        let backups = LocalBackupDir::new(temp_dir.path().join("backups"), 3);
        let store = store_with_plate("AB123");

        let stamps: Vec<_> = (0..7).map(|i| start() + Duration::minutes(i)).collect();
        for at in &stamps {
            backups.rotate(&store, *at).unwrap();
        }

        let kept: Vec<_> = backups.list().unwrap().into_iter().map(|r| r.created_at).collect();
        assert_eq!(kept, stamps[4..].to_vec());
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let backups = LocalBackupDir::new(temp_dir.path(), 1);
        fs::write(temp_dir.path().join("README"), "keep me").unwrap();

        backups.rotate(&store_with_plate("A"), start()).unwrap();
        backups.rotate(&store_with_plate("B"), start() + Duration::hours(1)).unwrap();

        assert_eq!(backups.list().unwrap().len(), 1);
        assert!(temp_dir.path().join("README").exists());
    }

    #[test]
    fn test_restore_latest_skips_corrupt_copy() {
        let temp_dir = TempDir::new().unwrap();
        let backups = LocalBackupDir::new(temp_dir.path(), 5);
        backups.create(&store_with_plate("OLD"), start()).unwrap();

        let corrupt = temp_dir
            .path()
            .join(LocalBackupDir::file_name_for(start() + Duration::hours(1)));
        fs::write(&corrupt, b"truncated upload, nothing sqlite about it at all").unwrap();

        let target = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        let used = backups.restore_latest(&target).unwrap().unwrap();

        assert_eq!(used.created_at, start());
        let rows: Vec<Record> = target.records("vehicles").unwrap();
        assert_eq!(rows[0]["plate"], json!("OLD"));
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let backups = LocalBackupDir::new(temp_dir.path().join("missing"), 2);
        assert!(backups.latest().unwrap().is_none());
        assert!(backups.prune().unwrap().is_empty());
        let target = LocalStore::in_memory(StoreSchema::operations()).unwrap();
        assert!(backups.restore_latest(&target).unwrap().is_none());
    }
}
