//! Policy Merge Engine — pure merge plus side-effect dispatch.
//!
//! [`merge`] is a pure function of (current snapshot, ordered changes,
//! apply time) with no storage dependency, so it tests deterministically
//! and re-applies idempotently. Side effects live in a separate
//! [`DispatchTable`]: an open/closed map from toggle key to registered
//! handler, so new toggles are added without touching dispatch logic.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::policy::pending::PendingChange;
use crate::policy::registry::{ToggleClass, ToggleRegistry};
use crate::policy::status::PolicySnapshot;

/// Compute the snapshot resulting from applying `changes` to `current`.
///
/// Iterates in arrival order, overwriting `policy[key] = value` —
/// last-write-wins for duplicate keys. Stamps `last_update = now`. Pure:
/// same inputs, same output, and re-applying the same change set yields the
/// same policy map (only `last_update` differs across real applies).
pub fn merge(current: &PolicySnapshot, changes: &[PendingChange], now: i64) -> PolicySnapshot {
    let mut policy = current.policy.clone();
    for change in changes {
        policy.insert(change.key.clone(), change.value.clone());
    }
    PolicySnapshot {
        policy,
        last_update: now,
    }
}

/// Result of dispatching one change's side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran successfully.
    Applied,
    /// Recognized toggle with no handler registered on this VM role.
    NoHandler,
    /// Key is not in the catalog; merged verbatim, warning emitted.
    UnknownKey,
    /// Value outside the toggle's domain; handler skipped, raw value still
    /// participates in the merge.
    InvalidValue,
    /// Handler returned an error; recoverable, merge proceeds.
    HandlerFailed,
}

/// Side-effect handler for one toggle.
pub trait ToggleHandler: Send + Sync {
    /// Apply the local effect of setting the toggle to `value`.
    ///
    /// # Errors
    ///
    /// Any error is recorded as [`DispatchOutcome::HandlerFailed`] and does
    /// not interrupt the broader merge.
    fn apply(&self, value: &str) -> anyhow::Result<()>;
}

impl<F> ToggleHandler for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn apply(&self, value: &str) -> anyhow::Result<()> {
        self(value)
    }
}

/// Registered side-effect handlers keyed by toggle identity.
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Box<dyn ToggleHandler>>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `key`, replacing any existing one.
    pub fn register(&mut self, key: impl Into<String>, handler: Box<dyn ToggleHandler>) {
        self.handlers.insert(key.into(), handler);
    }

    /// Dispatch one change's side effect.
    ///
    /// Validation and classification come from the registry; every anomaly
    /// here is recoverable by design — the caller merges the raw value
    /// regardless of the outcome.
    pub fn dispatch(
        &self,
        registry: &ToggleRegistry,
        key: &str,
        value: &str,
    ) -> DispatchOutcome {
        if registry.classify(key) == ToggleClass::Unknown {
            warn!(key, value, "unknown toggle key, merging verbatim");
            return DispatchOutcome::UnknownKey;
        }

        if let Err(e) = registry.validate(key, value) {
            warn!(key, value, error = %e, "invalid toggle value, skipping side effect");
            return DispatchOutcome::InvalidValue;
        }

        match self.handlers.get(key) {
            None => {
                debug!(key, "no side-effect handler registered on this role");
                DispatchOutcome::NoHandler
            }
            Some(handler) => match handler.apply(value) {
                Ok(()) => {
                    debug!(key, value, "toggle side effect applied");
                    DispatchOutcome::Applied
                }
                Err(e) => {
                    warn!(key, value, error = %e, "toggle side effect failed");
                    DispatchOutcome::HandlerFailed
                }
            },
        }
    }
}
