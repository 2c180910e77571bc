//! Boot Applier — drains the pending store into the status store at boot.
//!
//! Runs once at bring-up, before enforcers start, so read-during-drain
//! races are eliminated by ordering rather than locking. Delivery contract:
//! at-least-once. The pending file is deleted only after the merged
//! snapshot persists; any earlier failure leaves it intact so the next boot
//! retries, which is safe because the merge is an idempotent
//! overwrite-by-key.

use thiserror::Error;
use tracing::{info, warn};

use crate::policy::merge::{self, DispatchTable};
use crate::policy::pending::{PendingStore, PendingStoreError};
use crate::policy::registry::ToggleRegistry;
use crate::policy::status::{SnapshotStore, StatusStoreError};

/// Boot-apply failure, mapped to the supervisor-visible exit code.
#[derive(Debug, Error)]
pub enum BootError {
    /// The pending store exists but cannot be read — exit 1, nothing touched.
    #[error("pending store unreadable: {0}")]
    UnreadablePending(#[from] PendingStoreError),
    /// Persisting the merged snapshot failed — exit 2, pending retained.
    #[error("failed to persist merged status: {0}")]
    PersistFailed(#[from] StatusStoreError),
}

impl BootError {
    /// Exit code surfaced to the calling supervisor.
    pub fn exit_code(&self) -> u8 {
        match self {
            BootError::UnreadablePending(_) => 1,
            BootError::PersistFailed(_) => 2,
        }
    }
}

/// Successful boot-apply result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// No pending store existed; trivial success.
    NothingPending,
    /// Changes were merged and the pending store cleared.
    Applied {
        /// Number of pending entries processed.
        changes: usize,
    },
}

/// Drains pending changes through the merge engine into the status store.
pub struct BootApplier<'a> {
    registry: &'a ToggleRegistry,
    pending: &'a PendingStore,
    status: &'a dyn SnapshotStore,
    dispatch: &'a DispatchTable,
}

impl<'a> BootApplier<'a> {
    /// Wire the applier over its collaborating stores.
    pub fn new(
        registry: &'a ToggleRegistry,
        pending: &'a PendingStore,
        status: &'a dyn SnapshotStore,
        dispatch: &'a DispatchTable,
    ) -> Self {
        Self {
            registry,
            pending,
            status,
            dispatch,
        }
    }

    /// Apply all pending changes.
    ///
    /// Sequence: drain, dispatch each change's boot-time side effect
    /// (recoverable anomalies logged, never fatal), merge, persist, and
    /// only then clear the pending store.
    ///
    /// # Errors
    ///
    /// [`BootError::UnreadablePending`] if the pending file cannot be read;
    /// [`BootError::PersistFailed`] if the status write fails — in both
    /// cases the pending store is left unmodified.
    pub fn run(&self, now: i64) -> Result<BootOutcome, BootError> {
        if !self.pending.exists() {
            info!("no pending changes, boot-apply is a no-op");
            return Ok(BootOutcome::NothingPending);
        }

        let changes = self.pending.drain_all()?;
        let current = self.status.read();
        info!(
            pending = changes.len(),
            current_keys = current.policy.len(),
            "applying pending changes from previous session"
        );

        for change in &changes {
            let outcome = self.dispatch.dispatch(self.registry, &change.key, &change.value);
            info!(key = %change.key, value = %change.value, outcome = ?outcome, "boot-apply change");
        }

        let merged = merge::merge(&current, &changes, now);
        self.status.write(&merged)?;

        // Clearing after a successful write; if removal itself fails the
        // next boot re-applies the same set, which the merge tolerates.
        if let Err(e) = self.pending.clear() {
            warn!(error = %e, "pending store could not be cleared; next boot will re-apply");
        }

        info!(changes = changes.len(), "boot-apply complete, pending store cleared");
        Ok(BootOutcome::Applied {
            changes: changes.len(),
        })
    }
}
