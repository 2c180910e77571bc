//! Status Store — durable current-policy snapshot with backup-before-overwrite.
//!
//! Exactly one live snapshot exists per VM role. Writes are atomic from any
//! reader's perspective (write-to-temp-then-rename in the same directory),
//! the prior snapshot is copied to a timestamped backup first, and
//! `last_update` strictly increases on every successful write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Current policy snapshot: key→value map plus apply-time metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Toggle key → raw value. Sorted map keeps serialization deterministic.
    pub policy: BTreeMap<String, String>,
    /// Epoch seconds of the last successful write.
    pub last_update: i64,
}

/// Status store failure. Read problems are recoverable (empty default);
/// only writes surface errors.
#[derive(Debug, Error)]
pub enum StatusStoreError {
    /// Persisting the snapshot (or its backup) failed.
    #[error("status write failed at {path}: {reason}")]
    WriteFailed {
        /// Status file path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
}

/// Single-writer, multi-reader persisted snapshot store.
///
/// Injected into components rather than accessed ambiently, so tests can
/// substitute [`MemoryStatusStore`] or a failure-injecting fake.
pub trait SnapshotStore: Send + Sync {
    /// Read the live snapshot. A missing or unparsable file yields the
    /// empty default with a warning — recoverable, never fatal.
    fn read(&self) -> PolicySnapshot;

    /// Persist a snapshot, backing up the prior one first. Implementations
    /// must guarantee readers never observe a torn snapshot and must bump
    /// `last_update` to be strictly greater than the previous snapshot's.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::WriteFailed`] when persistence fails;
    /// the prior snapshot remains intact.
    fn write(&self, snapshot: &PolicySnapshot) -> Result<(), StatusStoreError>;
}

/// Production JSON-file store with timestamped backups.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    path: PathBuf,
    backups_dir: PathBuf,
    backup_retain: usize,
}

impl FileStatusStore {
    /// Create a store over `path`, keeping at most `backup_retain` backups
    /// under `backups_dir`.
    pub fn new(
        path: impl Into<PathBuf>,
        backups_dir: impl Into<PathBuf>,
        backup_retain: usize,
    ) -> Self {
        Self {
            path: path.into(),
            backups_dir: backups_dir.into(),
            backup_retain,
        }
    }

    /// Path of the live snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_err(&self, reason: impl std::fmt::Display) -> StatusStoreError {
        StatusStoreError::WriteFailed {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    /// Copy the live snapshot into `backups_dir/<epoch>.json`.
    ///
    /// Backups are retained across boots so an operator can roll back to a
    /// prior policy; retention is bounded to avoid filling flash on a
    /// constrained device.
    fn backup_current(&self, now: i64) -> Result<(), StatusStoreError> {
        if !self.path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.backups_dir).map_err(|e| self.write_err(e))?;

        let mut backup = self.backups_dir.join(format!("{now}.json"));
        // A second write within the same wall-clock second must not clobber
        // the earlier backup.
        let mut suffix = 1u32;
        while backup.exists() {
            backup = self.backups_dir.join(format!("{now}-{suffix}.json"));
            suffix = suffix.saturating_add(1);
        }

        std::fs::copy(&self.path, &backup).map_err(|e| self.write_err(e))?;
        debug!(backup = %backup.display(), "status snapshot backed up");
        self.prune_backups();
        Ok(())
    }

    /// Remove oldest backups beyond the retention bound. Best-effort: a
    /// prune failure is logged, never surfaced.
    fn prune_backups(&self) {
        let entries = match std::fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list status backups for pruning");
                return;
            }
        };

        let mut names: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
            .collect();
        if names.len() <= self.backup_retain {
            return;
        }

        // Backup names sort chronologically (epoch-second prefixes).
        names.sort();
        let excess = names.len().saturating_sub(self.backup_retain);
        for old in names.iter().take(excess) {
            if let Err(e) = std::fs::remove_file(old) {
                warn!(path = %old.display(), error = %e, "failed to prune status backup");
            }
        }
    }
}

impl SnapshotStore for FileStatusStore {
    fn read(&self) -> PolicySnapshot {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return PolicySnapshot::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "status unreadable, using empty default");
                return PolicySnapshot::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "status unparsable, using empty default");
                PolicySnapshot::default()
            }
        }
    }

    fn write(&self, snapshot: &PolicySnapshot) -> Result<(), StatusStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.write_err(e))?;
        }

        let prev = self.read();
        self.backup_current(snapshot.last_update)?;

        // last_update strictly increases on every successful write, even if
        // the wall clock stalls or steps backwards.
        let mut next = snapshot.clone();
        if next.last_update <= prev.last_update {
            next.last_update = prev.last_update.saturating_add(1);
        }

        let json = serde_json::to_string_pretty(&next).map_err(|e| self.write_err(e))?;

        // Temp file in the same directory so the rename is atomic; readers
        // see either the old snapshot or the new one, never a torn write.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.write_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.write_err(e))?;
        debug!(path = %self.path.display(), last_update = next.last_update, "status snapshot written");
        Ok(())
    }
}

/// In-memory store for tests and single-process wiring.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    inner: std::sync::Mutex<PolicySnapshot>,
}

impl MemoryStatusStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStatusStore {
    fn read(&self) -> PolicySnapshot {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn write(&self, snapshot: &PolicySnapshot) -> Result<(), StatusStoreError> {
        let mut guard = self.inner.lock().map_err(|_| StatusStoreError::WriteFailed {
            path: PathBuf::from("<memory>"),
            reason: "lock poisoned".to_owned(),
        })?;
        let mut next = snapshot.clone();
        if next.last_update <= guard.last_update {
            next.last_update = guard.last_update.saturating_add(1);
        }
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store(dir: &tempfile::TempDir) -> FileStatusStore {
        FileStatusStore::new(
            dir.path().join("status.json"),
            dir.path().join("backups"),
            3,
        )
    }

    fn snapshot(pairs: &[(&str, &str)], last_update: i64) -> PolicySnapshot {
        PolicySnapshot {
            policy: pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            last_update,
        }
    }

    #[test]
    fn missing_file_reads_empty_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store(&dir);
        assert_eq!(store.read(), PolicySnapshot::default());
    }

    #[test]
    fn unparsable_file_reads_empty_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store(&dir);
        std::fs::write(store.path(), "{ not json").expect("write");
        assert_eq!(store.read(), PolicySnapshot::default());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store(&dir);
        let snap = snapshot(&[("RADIO_ISOLATION", "on")], 1000);
        store.write(&snap).expect("write");
        assert_eq!(store.read(), snap);
    }

    #[test]
    fn first_write_creates_no_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store(&dir);
        store.write(&snapshot(&[], 1000)).expect("write");
        assert!(!dir.path().join("backups").exists());
    }

    #[test]
    fn overwrite_backs_up_prior_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store(&dir);
        store
            .write(&snapshot(&[("AUDIT_UPLOAD", "off")], 1000))
            .expect("first");
        store
            .write(&snapshot(&[("AUDIT_UPLOAD", "on")], 2000))
            .expect("second");

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .expect("read backups")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(backups.len(), 1);

        let backed_up: PolicySnapshot = serde_json::from_str(
            &std::fs::read_to_string(backups[0].path()).expect("read backup"),
        )
        .expect("parse backup");
        assert_eq!(backed_up.policy.get("AUDIT_UPLOAD").map(String::as_str), Some("off"));
    }

    #[test]
    fn backups_pruned_to_retention_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store(&dir); // retain 3
        for i in 0..6i64 {
            store
                .write(&snapshot(&[], 1000i64.saturating_add(i)))
                .expect("write");
        }
        let count = std::fs::read_dir(dir.path().join("backups"))
            .expect("read backups")
            .filter_map(|e| e.ok())
            .count();
        assert!(count <= 3, "expected at most 3 backups, found {count}");
    }

    #[test]
    fn last_update_strictly_increases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = file_store(&dir);
        store.write(&snapshot(&[], 5000)).expect("first");
        // Same timestamp — must still advance.
        store.write(&snapshot(&[], 5000)).expect("second");
        let after_second = store.read().last_update;
        assert!(after_second > 5000);
        // Clock stepping backwards — must still advance.
        store.write(&snapshot(&[], 100)).expect("third");
        assert!(store.read().last_update > after_second);
    }

    #[test]
    fn memory_store_behaves_like_file_store() {
        let store = MemoryStatusStore::new();
        assert_eq!(store.read(), PolicySnapshot::default());
        store
            .write(&snapshot(&[("TRUSTED_OVERLAY", "on")], 42))
            .expect("write");
        assert_eq!(
            store.read().policy.get("TRUSTED_OVERLAY").map(String::as_str),
            Some("on")
        );
        store.write(&snapshot(&[], 42)).expect("same stamp");
        assert!(store.read().last_update > 42);
    }
}
