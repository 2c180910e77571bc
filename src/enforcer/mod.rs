//! Enforcer-side components: the gateway firewall mode controller, the
//! radio idle monitor, and the consumer that applies signed policy
//! updates from the control bus. All of them converge on the live
//! policy snapshot rather than trusting any single delivery.

pub mod firewall;
pub mod radio;

use anyhow::Context;
use tracing::{info, warn};

use crate::bus::{ControlMessage, DirTransport, MessageVerifier};
use crate::policy::merge::{self, DispatchTable};
use crate::policy::pending::PendingChange;
use crate::policy::registry::ToggleRegistry;
use crate::policy::status::SnapshotStore;

/// Receiving end of the control bus for one VM role.
///
/// Drains the role's queue, verifies each envelope, and applies the
/// verified payloads through the same dispatch-and-merge path the boot
/// applier uses. A verification failure discards that message with a
/// warning and never interrupts the rest of the batch.
pub struct BusConsumer<'a> {
    verifier: MessageVerifier,
    transport: DirTransport,
    target: String,
    registry: &'a ToggleRegistry,
    dispatch: &'a DispatchTable,
    status: &'a dyn SnapshotStore,
}

impl<'a> BusConsumer<'a> {
    /// Wire the consumer over its collaborators.
    pub fn new(
        verifier: MessageVerifier,
        transport: DirTransport,
        target: impl Into<String>,
        registry: &'a ToggleRegistry,
        dispatch: &'a DispatchTable,
        status: &'a dyn SnapshotStore,
    ) -> Self {
        Self {
            verifier,
            transport,
            target: target.into(),
            registry,
            dispatch,
            status,
        }
    }

    /// Drain the queue and converge local enforcement on it. Returns the
    /// number of messages applied.
    ///
    /// Delivery is at-least-once and possibly reordered, so verified
    /// messages are ordered by send time before applying — last write
    /// wins per key, and a re-delivered message is an idempotent
    /// overwrite.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue cannot be read or the merged
    /// snapshot cannot be persisted. Bad envelopes are not errors.
    pub fn consume(&self, now: i64) -> anyhow::Result<usize> {
        let envelopes = self
            .transport
            .drain(&self.target)
            .context("failed to drain bus queue")?;
        if envelopes.is_empty() {
            return Ok(0);
        }

        let mut verified: Vec<ControlMessage> = Vec::new();
        for envelope in &envelopes {
            match self.verifier.verify(envelope, now) {
                Ok(msg) => verified.push(msg),
                Err(e) => {
                    warn!(target = %self.target, error = %e, "discarding bus message");
                }
            }
        }
        verified.sort_by_key(|m| m.timestamp);

        let mut changes = Vec::new();
        for msg in &verified {
            for (key, value) in &msg.payload {
                self.dispatch.dispatch(self.registry, key, value);
                changes.push(PendingChange {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        if !changes.is_empty() {
            let current = self.status.read();
            let merged = merge::merge(&current, &changes, now);
            self.status
                .write(&merged)
                .context("failed to persist status snapshot")?;
        }

        info!(
            target = %self.target,
            received = envelopes.len(),
            applied = verified.len(),
            "bus queue consumed"
        );
        Ok(verified.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::bus::{BusTransport, MessageSigner, Publisher};
    use crate::policy::status::MemoryStatusStore;

    struct Harness {
        signer: MessageSigner,
        transport: DirTransport,
        registry: ToggleRegistry,
        status: MemoryStatusStore,
    }

    impl Harness {
        fn new(dir: &tempfile::TempDir) -> (Self, MessageVerifier) {
            let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
            let verifier = MessageVerifier::new(signing.verifying_key(), 300);
            (
                Self {
                    signer: MessageSigner::new(signing),
                    transport: DirTransport::new(dir.path().join("bus")),
                    registry: ToggleRegistry::new(),
                    status: MemoryStatusStore::new(),
                },
                verifier,
            )
        }

        fn publish(&self, key: &str, value: &str, timestamp: i64) {
            let mut payload = BTreeMap::new();
            payload.insert(key.to_owned(), value.to_owned());
            let envelope = self
                .signer
                .sign("gateway", "reload_policy", &payload, timestamp)
                .expect("sign");
            self.transport.send("gateway", &envelope).expect("send");
        }
    }

    #[test]
    fn consume_applies_verified_payloads_latest_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (harness, verifier) = Harness::new(&dir);
        harness.publish("AUDIT_UPLOAD", "on", 1000);
        harness.publish("AUDIT_UPLOAD", "off", 1001);

        let dispatch = DispatchTable::new();
        let consumer = BusConsumer::new(
            verifier,
            harness.transport.clone(),
            "gateway",
            &harness.registry,
            &dispatch,
            &harness.status,
        );
        assert_eq!(consumer.consume(1001).expect("consume"), 2);
        assert_eq!(
            harness.status.read().policy.get("AUDIT_UPLOAD").map(String::as_str),
            Some("off")
        );
    }

    #[test]
    fn tampered_message_is_discarded_rest_of_batch_applies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (harness, verifier) = Harness::new(&dir);
        harness.publish("AUDIT_UPLOAD", "on", 1000);

        // Forge a second message by altering a signed payload.
        let mut payload = BTreeMap::new();
        payload.insert("RADIO_ISOLATION".to_owned(), "off".to_owned());
        let mut forged = harness
            .signer
            .sign("gateway", "reload_policy", &payload, 1001)
            .expect("sign");
        forged
            .msg
            .payload
            .insert("RADIO_ISOLATION".to_owned(), "on".to_owned());
        harness.transport.send("gateway", &forged).expect("send");

        let dispatch = DispatchTable::new();
        let consumer = BusConsumer::new(
            verifier,
            harness.transport.clone(),
            "gateway",
            &harness.registry,
            &dispatch,
            &harness.status,
        );
        // The forged envelope is dropped; the valid one still applies.
        assert_eq!(consumer.consume(1001).expect("consume"), 1);
        let snap = harness.status.read();
        assert_eq!(snap.policy.get("AUDIT_UPLOAD").map(String::as_str), Some("on"));
        assert!(!snap.policy.contains_key("RADIO_ISOLATION"));
    }

    #[test]
    fn consume_runs_registered_side_effects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (harness, verifier) = Harness::new(&dir);
        harness.publish("RADIO_ISOLATION", "on", 1000);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        let mut dispatch = DispatchTable::new();
        dispatch.register(
            "RADIO_ISOLATION",
            Box::new(move |value: &str| {
                assert_eq!(value, "on");
                calls_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let consumer = BusConsumer::new(
            verifier,
            harness.transport.clone(),
            "gateway",
            &harness.registry,
            &dispatch,
            &harness.status,
        );
        consumer.consume(1000).expect("consume");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_queue_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (harness, verifier) = Harness::new(&dir);
        let dispatch = DispatchTable::new();
        let consumer = BusConsumer::new(
            verifier,
            harness.transport.clone(),
            "gateway",
            &harness.registry,
            &dispatch,
            &harness.status,
        );
        assert_eq!(consumer.consume(1000).expect("consume"), 0);
        assert!(harness.status.read().policy.is_empty());
    }
}
