//! Policy control plane: toggle catalog, durable stores, merge engine,
//! boot applier, and the authority-side runtime flow.

pub mod boot;
pub mod merge;
pub mod pending;
pub mod registry;
pub mod status;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use crate::bus::Publisher;
use crate::policy::merge::DispatchTable;
use crate::policy::pending::{PendingChange, PendingStore};
use crate::policy::registry::{ToggleClass, ToggleRegistry};
use crate::policy::status::SnapshotStore;

/// How a submitted toggle change was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Runtime-safe: applied immediately and persisted to the status store.
    AppliedNow,
    /// Reboot-required: staged in the pending store for the next boot.
    StagedForBoot,
}

/// Authority-side entry point for toggle changes.
///
/// Classifies each request: runtime-safe (and unknown) toggles apply
/// immediately — side-effect dispatch, merge, status write, signed bus
/// publish to the toggle's target VMs; reboot-required toggles are appended
/// to the pending store and picked up by the Boot Applier.
pub struct PolicyAuthority<'a> {
    registry: &'a ToggleRegistry,
    pending: &'a PendingStore,
    status: &'a dyn SnapshotStore,
    dispatch: &'a DispatchTable,
    publisher: Option<&'a Publisher>,
}

impl<'a> PolicyAuthority<'a> {
    /// Wire the authority over its collaborating stores. `publisher` is
    /// optional so single-VM deployments and tests can run without keys.
    pub fn new(
        registry: &'a ToggleRegistry,
        pending: &'a PendingStore,
        status: &'a dyn SnapshotStore,
        dispatch: &'a DispatchTable,
        publisher: Option<&'a Publisher>,
    ) -> Self {
        Self {
            registry,
            pending,
            status,
            dispatch,
            publisher,
        }
    }

    /// Record one toggle change.
    ///
    /// # Errors
    ///
    /// Returns an error only for persistence failures (pending append or
    /// status write). Validation anomalies are recoverable: the raw value
    /// is still recorded, with a warning.
    pub fn submit(&self, key: &str, value: &str, now: i64) -> anyhow::Result<SubmitOutcome> {
        if let Err(e) = self.registry.validate(key, value) {
            warn!(key, value, error = %e, "submitting out-of-domain value; recording raw");
        }

        if self.registry.classify(key) == ToggleClass::RebootRequired {
            self.pending
                .append(key, value)
                .context("failed to stage reboot-required change")?;
            info!(key, value, "change staged; reboot required to apply");
            return Ok(SubmitOutcome::StagedForBoot);
        }

        // Runtime-safe (or unknown): apply now.
        let outcome = self.dispatch.dispatch(self.registry, key, value);
        let current = self.status.read();
        let merged = merge::merge(
            &current,
            &[PendingChange {
                key: key.to_owned(),
                value: value.to_owned(),
            }],
            now,
        );
        self.status
            .write(&merged)
            .context("failed to persist status snapshot")?;
        info!(key, value, dispatch = ?outcome, "runtime change applied");

        // Best-effort distribution; a transport failure never unwinds the
        // local apply (enforcers also converge from the status store).
        if let Some(publisher) = self.publisher {
            // Unknown keys have no target table; enforcers pick them up
            // from the status store instead.
            let targets = self.registry.get(key).map(|t| t.targets).unwrap_or(&[]);
            let mut payload = BTreeMap::new();
            payload.insert(key.to_owned(), value.to_owned());
            for target in targets {
                if let Err(e) = publisher.publish(target, "reload_policy", &payload, now) {
                    warn!(target, error = %e, "control bus publish failed");
                }
            }
        }

        Ok(SubmitOutcome::AppliedNow)
    }
}

/// Parse an operator-editable policy file: `KEY=VALUE` lines, `#` comments,
/// blank lines and trailing `SIG=` signature lines ignored.
pub fn parse_policy_file(contents: &str) -> BTreeMap<String, String> {
    let mut policy = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("SIG=") {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            policy.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    policy
}

/// Diff a freshly parsed policy file against the live snapshot and submit
/// every changed toggle. Returns the number of changes submitted.
///
/// # Errors
///
/// Propagates persistence failures from [`PolicyAuthority::submit`];
/// the file being missing or unreadable is recoverable (zero changes).
pub fn apply_policy_file(
    authority: &PolicyAuthority<'_>,
    status: &dyn SnapshotStore,
    path: &Path,
    now: i64,
) -> anyhow::Result<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "policy file unreadable, skipping");
            return Ok(0);
        }
    };

    let desired = parse_policy_file(&contents);
    let current = status.read();

    let mut submitted = 0usize;
    for (key, value) in &desired {
        if current.policy.get(key) == Some(value) {
            continue;
        }
        let old = current.policy.get(key).map(String::as_str).unwrap_or("<unset>");
        info!(key = %key, old = %old, new = %value, "policy file change detected");
        authority.submit(key, value, now)?;
        submitted = submitted.saturating_add(1);
    }

    if submitted == 0 {
        info!("no policy changes detected");
    }
    Ok(submitted)
}
