//! End-to-end lifecycle over the real file-backed stores: stage, reboot,
//! apply, verify persistence and distribution.

use std::collections::BTreeMap;

use posture::bus::{DirTransport, MessageSigner, MessageVerifier, Publisher};
use posture::config::FirewallConfig;
use posture::enforcer::firewall::{FileBackend, FirewallController, FirewallMode};
use posture::policy::boot::{BootApplier, BootOutcome};
use posture::policy::merge::DispatchTable;
use posture::policy::pending::PendingStore;
use posture::policy::registry::ToggleRegistry;
use posture::policy::status::{FileStatusStore, SnapshotStore};
use posture::policy::{PolicyAuthority, SubmitOutcome};

fn file_store(dir: &tempfile::TempDir) -> FileStatusStore {
    FileStatusStore::new(
        dir.path().join("status.json"),
        dir.path().join("backups"),
        20,
    )
}

#[test]
fn staged_changes_survive_restart_and_apply_at_boot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = ToggleRegistry::new();
    let dispatch = DispatchTable::new();

    // Session one: one runtime change, one staged change.
    {
        let pending = PendingStore::new(dir.path().join("pending.conf"));
        let status = file_store(&dir);
        let authority = PolicyAuthority::new(&registry, &pending, &status, &dispatch, None);

        assert_eq!(
            authority.submit("RADIO_ISOLATION", "on", 100).expect("submit"),
            SubmitOutcome::AppliedNow
        );
        assert_eq!(
            authority
                .submit("VERIFIED_BOOT_ENFORCE", "enforce", 101)
                .expect("submit"),
            SubmitOutcome::StagedForBoot
        );

        let snap = status.read();
        assert_eq!(snap.policy.get("RADIO_ISOLATION").map(String::as_str), Some("on"));
        // Staged change is not live yet.
        assert!(!snap.policy.contains_key("VERIFIED_BOOT_ENFORCE"));
    }

    // Session two (after "reboot"): fresh store handles, same files.
    {
        let pending = PendingStore::new(dir.path().join("pending.conf"));
        let status = file_store(&dir);
        let applier = BootApplier::new(&registry, &pending, &status, &dispatch);

        assert_eq!(
            applier.run(200).expect("boot apply"),
            BootOutcome::Applied { changes: 1 }
        );
        assert!(!pending.exists());

        let snap = status.read();
        assert_eq!(snap.policy.get("RADIO_ISOLATION").map(String::as_str), Some("on"));
        assert_eq!(
            snap.policy.get("VERIFIED_BOOT_ENFORCE").map(String::as_str),
            Some("enforce")
        );
        assert_eq!(snap.last_update, 200);

        // A second boot-apply is a no-op.
        assert_eq!(applier.run(300).expect("rerun"), BootOutcome::NothingPending);
    }

    // Overwrites along the way produced backups of prior snapshots.
    assert!(dir.path().join("backups").exists());
}

#[test]
fn runtime_change_distributes_over_signed_bus() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = ToggleRegistry::new();
    let dispatch = DispatchTable::new();
    let pending = PendingStore::new(dir.path().join("pending.conf"));
    let status = file_store(&dir);

    let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
    let verifier = MessageVerifier::new(signing.verifying_key(), 300);
    let transport = DirTransport::new(dir.path().join("bus"));
    let publisher = Publisher::new(MessageSigner::new(signing), Box::new(transport.clone()));

    let authority =
        PolicyAuthority::new(&registry, &pending, &status, &dispatch, Some(&publisher));
    authority
        .submit("E2E_TUNNEL_POLICY", "tor-only", 1000)
        .expect("submit");

    // The gateway enforces this toggle; its queue holds one verified update.
    let envelopes = transport.drain("gateway").expect("drain");
    assert_eq!(envelopes.len(), 1);
    let msg = verifier.verify(&envelopes[0], 1000).expect("verify");
    assert_eq!(msg.command, "reload_policy");
    assert_eq!(
        msg.payload.get("E2E_TUNNEL_POLICY").map(String::as_str),
        Some("tor-only")
    );

    // Redelivery of the same envelope is refused.
    assert!(verifier.verify(&envelopes[0], 1001).is_err());
}

#[test]
fn firewall_posture_survives_controller_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mode_path = dir.path().join("firewall.mode");
    let rules_path = dir.path().join("firewall.rules");

    {
        let controller = FirewallController::new(
            &mode_path,
            FirewallConfig::default(),
            FileBackend::new(&rules_path),
        );
        controller.select_mode(FirewallMode::Basic).expect("select");
    }
    let rules_before = std::fs::read_to_string(&rules_path).expect("rules");

    // New controller instance converges on the recorded posture.
    let controller = FirewallController::new(
        &mode_path,
        FirewallConfig::default(),
        FileBackend::new(&rules_path),
    );
    controller.reapply_last().expect("reapply");
    assert_eq!(std::fs::read_to_string(&rules_path).expect("rules"), rules_before);
}

#[test]
fn boot_apply_dispatches_registered_side_effects() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let dir = tempfile::tempdir().expect("tempdir");
    let registry = ToggleRegistry::new();
    let pending = PendingStore::new(dir.path().join("pending.conf"));
    pending.append("KERNEL_HARDENING", "strict").expect("append");
    let status = file_store(&dir);

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = Arc::clone(&calls);
    let mut dispatch = DispatchTable::new();
    dispatch.register(
        "KERNEL_HARDENING",
        Box::new(move |value: &str| {
            assert_eq!(value, "strict");
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let applier = BootApplier::new(&registry, &pending, &status, &dispatch);
    applier.run(500).expect("boot apply");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let payload: BTreeMap<String, String> = status.read().policy;
    assert_eq!(payload.get("KERNEL_HARDENING").map(String::as_str), Some("strict"));
}
