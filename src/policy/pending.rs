//! Pending Change Store — durable queue of reboot-required changes.
//!
//! Line-oriented `KEY=VALUE` text file. Arrival order is preserved; later
//! entries for the same key shadow earlier ones when merged. The file is
//! deleted only by the Boot Applier after every entry has been merged and
//! the status snapshot persisted (at-least-once delivery, idempotent
//! consumer).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// One queued reboot-required change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// Toggle key.
    pub key: String,
    /// Raw value as staged.
    pub value: String,
}

/// Pending store failure.
#[derive(Debug, Error)]
pub enum PendingStoreError {
    /// The pending file exists but cannot be read — fatal to boot-apply.
    #[error("pending store unreadable at {path}: {source}")]
    Unreadable {
        /// Pending file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Appending or clearing the file failed.
    #[error("pending store write failed at {path}: {source}")]
    WriteFailed {
        /// Pending file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// File-backed pending change queue.
#[derive(Debug, Clone)]
pub struct PendingStore {
    path: PathBuf,
}

impl PendingStore {
    /// Create a store over the given pending file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any changes are queued.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one change. Creates the file (with a comment header) on
    /// first use. A later append for the same key shadows the earlier one
    /// at merge time; both lines remain recorded until drained.
    ///
    /// # Errors
    ///
    /// Returns [`PendingStoreError::WriteFailed`] on I/O failure.
    pub fn append(&self, key: &str, value: &str) -> Result<(), PendingStoreError> {
        let write_err = |source| PendingStoreError::WriteFailed {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let fresh = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;

        if fresh {
            writeln!(file, "# pending reboot-required changes, applied at next boot")
                .map_err(write_err)?;
        }
        writeln!(file, "{key}={value}").map_err(write_err)?;
        Ok(())
    }

    /// Read every queued change in arrival order — a single consuming pass
    /// in the sense that the caller is expected to [`clear`](Self::clear)
    /// only after all entries are merged successfully.
    ///
    /// Blank lines and `#` comments are ignored; a malformed line (no `=`)
    /// is skipped with a warning, not fatal.
    ///
    /// # Errors
    ///
    /// Returns [`PendingStoreError::Unreadable`] if the file exists but
    /// cannot be read. A missing file yields an empty sequence.
    pub fn drain_all(&self) -> Result<Vec<PendingChange>, PendingStoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PendingStoreError::Unreadable {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let mut changes = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => changes.push(PendingChange {
                    key: key.trim().to_owned(),
                    value: value.trim().to_owned(),
                }),
                None => warn!(
                    path = %self.path.display(),
                    line = lineno.saturating_add(1),
                    content = line,
                    "skipping malformed pending line (no '=')"
                ),
            }
        }
        Ok(changes)
    }

    /// Delete the pending file. Called by the Boot Applier only after the
    /// merged snapshot has been persisted.
    ///
    /// # Errors
    ///
    /// Returns [`PendingStoreError::WriteFailed`] if the file exists but
    /// cannot be removed.
    pub fn clear(&self) -> Result<(), PendingStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PendingStoreError::WriteFailed {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}
