//! `postured` — security posture control plane daemon and operator CLI.
//!
//! One binary, several roles: the boot-time applier of staged changes,
//! the policy-file watcher, the radio idle monitor, and one-shot
//! operator subcommands for toggles, firewall posture and key
//! bootstrap.

use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify::Watcher;
use tracing::{info, warn};

use posture::bus::{self, DirTransport, MessageSigner, MessageVerifier, Publisher};
use posture::config::PostureConfig;
use posture::enforcer::firewall::{
    mode_for_hardening_level, FileBackend, FirewallController, FirewallMode,
};
use posture::enforcer::radio::{self, RadioMonitor, SysfsCellular};
use posture::enforcer::BusConsumer;
use posture::logging;
use posture::policy::boot::BootApplier;
use posture::policy::merge::DispatchTable;
use posture::policy::pending::PendingStore;
use posture::policy::registry::ToggleRegistry;
use posture::policy::status::{FileStatusStore, SnapshotStore};
use posture::policy::{apply_policy_file, PolicyAuthority, SubmitOutcome};

#[derive(Parser)]
#[command(name = "postured", version, about = "Security posture control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply staged reboot-required changes; run once at boot, before
    /// enforcers start.
    BootApply,
    /// Set one toggle. Runtime-safe toggles apply immediately;
    /// reboot-required toggles are staged for the next boot.
    Set {
        /// Toggle key, e.g. RADIO_ISOLATION.
        key: String,
        /// Toggle value.
        value: String,
    },
    /// Print the live policy snapshot, staged changes and enforcer state.
    Status,
    /// Describe the toggle catalog.
    Toggles,
    /// Watch the policy file and apply edits as they land.
    Watch,
    /// Radio control: on | off | status | monitor | reset-idle.
    Radio {
        /// Action to perform.
        action: String,
    },
    /// Firewall posture control.
    Firewall {
        #[command(subcommand)]
        mode: FirewallCommand,
    },
    /// Drain this VM's signed bus queue and apply verified updates.
    BusConsume {
        /// VM role whose queue to drain, e.g. gateway.
        target: String,
    },
    /// Generate the authority signing keypair.
    Keygen,
}

#[derive(Subcommand)]
enum FirewallCommand {
    /// Tunnel-only egress; baseband and wlan rejected.
    Strict,
    /// Strict plus the minimal carrier service set.
    Basic,
    /// Re-install the last recorded posture.
    Reapply,
}

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PostureConfig::load().context("failed to load configuration")?;

    // Long-running subcommands get the rotating JSON file layer; one-shot
    // subcommands log to stderr only.
    let daemon_mode = matches!(
        &cli.command,
        Command::BootApply | Command::Watch
    ) || matches!(&cli.command, Command::Radio { action } if action == "monitor");
    let guard = if daemon_mode {
        Some(logging::init_daemon(&config.paths.logs_dir)?)
    } else {
        logging::init_cli();
        None
    };

    match cli.command {
        Command::BootApply => {
            let result = boot_apply(&config);
            if let Err(e) = result {
                eprintln!("boot-apply failed: {e}");
                let code = i32::from(e.exit_code());
                drop(guard);
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Set { key, value } => set_toggle(&config, &key, &value),
        Command::Status => print_status(&config),
        Command::Toggles => {
            for toggle in ToggleRegistry::new().iter() {
                let class = match toggle.class {
                    posture::policy::registry::ToggleClass::RuntimeSafe => "runtime",
                    posture::policy::registry::ToggleClass::RebootRequired => "reboot",
                    posture::policy::registry::ToggleClass::Unknown => "unknown",
                };
                println!(
                    "{:<28} {:<8} targets: {}",
                    toggle.key,
                    class,
                    toggle.targets.join(",")
                );
            }
            Ok(())
        }
        Command::Watch => watch_policy_file(&config),
        Command::Radio { action } => radio_command(&config, &action).await,
        Command::Firewall { mode } => {
            let controller = firewall_controller(&config);
            match mode {
                FirewallCommand::Strict => controller.select_mode(FirewallMode::Strict)?,
                FirewallCommand::Basic => controller.select_mode(FirewallMode::Basic)?,
                FirewallCommand::Reapply => controller.reapply_last()?,
            }
            Ok(())
        }
        Command::BusConsume { target } => {
            let verifier = MessageVerifier::from_file(
                &config.bus.public_key,
                config.bus.timestamp_skew_secs,
            )?;
            let transport = DirTransport::new(config.bus.dir.clone());
            let registry = ToggleRegistry::new();
            let dispatch = dispatch_table(&config);
            let status = status_store(&config);
            let consumer =
                BusConsumer::new(verifier, transport, target, &registry, &dispatch, &status);
            let applied = consumer.consume(now_epoch())?;
            println!("applied {applied} update(s)");
            Ok(())
        }
        Command::Keygen => {
            bus::generate_keypair(&config.bus.secret_key, &config.bus.public_key)?;
            println!("keypair written to {}", config.bus.public_key.display());
            Ok(())
        }
    }
}

// ── Wiring ──────────────────────────────────────────────────────

fn status_store(config: &PostureConfig) -> FileStatusStore {
    FileStatusStore::new(
        config.paths.status_path(),
        config.paths.backups_dir(),
        config.paths.backup_retain,
    )
}

fn firewall_controller(config: &PostureConfig) -> FirewallController<FileBackend> {
    FirewallController::new(
        config.paths.firewall_mode_path(),
        config.firewall.clone(),
        FileBackend::new(config.paths.firewall_rules_path()),
    )
}

/// Side-effect handlers for the toggles this VM role enforces locally.
/// Toggles without a handler here still merge and distribute; their
/// effects live on other VMs.
fn dispatch_table(config: &PostureConfig) -> DispatchTable {
    let mut table = DispatchTable::new();

    let controller = firewall_controller(config);
    table.register(
        "RADIO_HARDENING.level",
        Box::new(move |value: &str| {
            controller.select_mode(mode_for_hardening_level(value))?;
            Ok(())
        }),
    );

    let cellular = SysfsCellular::from_config(&config.radio);
    let state_path = config.paths.radio_state_path();
    table.register(
        "RADIO_ISOLATION",
        Box::new(move |value: &str| {
            if value == "on" {
                radio::power_off(&cellular, &state_path, now_epoch())?;
            } else {
                radio::power_on(&cellular, &state_path, now_epoch())?;
            }
            Ok(())
        }),
    );

    table
}

/// Authority-side bus publisher; absent (with a warning) when no signing
/// key is installed, which is the normal state on enforcer VMs.
fn bus_publisher(config: &PostureConfig) -> Option<Publisher> {
    if !config.bus.secret_key.exists() {
        return None;
    }
    match MessageSigner::from_file(&config.bus.secret_key) {
        Ok(signer) => Some(Publisher::new(
            signer,
            Box::new(DirTransport::new(config.bus.dir.clone())),
        )),
        Err(e) => {
            warn!(error = %e, "signing key unusable, distributing via status store only");
            None
        }
    }
}

// ── Subcommands ─────────────────────────────────────────────────

fn boot_apply(config: &PostureConfig) -> Result<(), posture::policy::boot::BootError> {
    let registry = ToggleRegistry::new();
    let pending = PendingStore::new(config.paths.pending_path());
    let status = status_store(config);
    let dispatch = dispatch_table(config);

    let applier = BootApplier::new(&registry, &pending, &status, &dispatch);
    let outcome = applier.run(now_epoch())?;
    info!(?outcome, "boot-apply finished");
    Ok(())
}

fn set_toggle(config: &PostureConfig, key: &str, value: &str) -> Result<()> {
    let registry = ToggleRegistry::new();
    let pending = PendingStore::new(config.paths.pending_path());
    let status = status_store(config);
    let dispatch = dispatch_table(config);
    let publisher = bus_publisher(config);
    let authority =
        PolicyAuthority::new(&registry, &pending, &status, &dispatch, publisher.as_ref());

    match authority.submit(key, value, now_epoch())? {
        SubmitOutcome::AppliedNow => println!("{key}={value} applied"),
        SubmitOutcome::StagedForBoot => println!("{key}={value} staged; reboot required"),
    }
    Ok(())
}

fn print_status(config: &PostureConfig) -> Result<()> {
    let status = status_store(config);
    let snapshot = status.read();

    println!("policy ({} keys, last_update {})", snapshot.policy.len(), snapshot.last_update);
    for (key, value) in &snapshot.policy {
        println!("  {key}={value}");
    }

    let pending = PendingStore::new(config.paths.pending_path());
    if pending.exists() {
        let staged = pending.drain_all().context("failed to read pending store")?;
        println!("pending reboot-required changes: {}", staged.len());
        for change in &staged {
            println!("  {}={}", change.key, change.value);
        }
    } else {
        println!("pending reboot-required changes: none");
    }

    println!(
        "{}",
        radio::status_line(&config.paths.radio_state_path(), now_epoch())
    );
    let mode = std::fs::read_to_string(config.paths.firewall_mode_path())
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "strict (unrecorded)".to_owned());
    println!("firewall mode: {mode}");
    Ok(())
}

fn watch_policy_file(config: &PostureConfig) -> Result<()> {
    let registry = ToggleRegistry::new();
    let pending = PendingStore::new(config.paths.pending_path());
    let status = status_store(config);
    let dispatch = dispatch_table(config);
    let publisher = bus_publisher(config);
    let authority =
        PolicyAuthority::new(&registry, &pending, &status, &dispatch, publisher.as_ref());

    let policy_file = config.paths.policy_file.clone();
    // Converge on the file's current contents before waiting for edits.
    apply_policy_file(&authority, &status, &policy_file, now_epoch())?;

    let watch_dir = policy_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| policy_file.clone());
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        // A send failure means the loop below has exited.
        let _ = tx.send(res);
    })
    .context("failed to create file watcher")?;
    watcher
        .watch(&watch_dir, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;
    info!(path = %policy_file.display(), "watching policy file");

    loop {
        let event = match rx.recv() {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => {
                warn!(error = %e, "watch error, continuing");
                continue;
            }
            Err(_) => return Ok(()),
        };
        if !event.paths.iter().any(|p| p == &policy_file) {
            continue;
        }
        // Editors often emit a burst of events per save; let it settle,
        // then drain the queue and converge once.
        std::thread::sleep(Duration::from_millis(200));
        while rx.try_recv().is_ok() {}
        apply_policy_file(&authority, &status, &policy_file, now_epoch())?;
    }
}

async fn radio_command(config: &PostureConfig, action: &str) -> Result<()> {
    let cellular = SysfsCellular::from_config(&config.radio);
    let state_path = config.paths.radio_state_path();

    match action {
        "on" => {
            radio::power_on(&cellular, &state_path, now_epoch())?;
            println!("radio on");
        }
        "off" => {
            radio::power_off(&cellular, &state_path, now_epoch())?;
            println!("radio off");
        }
        "status" => println!("{}", radio::status_line(&state_path, now_epoch())),
        "reset-idle" => radio::reset_idle(&state_path, now_epoch())?,
        "monitor" => {
            let status = status_store(config);
            let monitor = RadioMonitor::new(
                config.radio.clone(),
                state_path,
                config.paths.radio_lock_path(),
                cellular,
                &status,
            );
            monitor.run().await?;
        }
        other => {
            eprintln!("unknown radio action '{other}' (on|off|status|monitor|reset-idle)");
            std::process::exit(1);
        }
    }
    Ok(())
}
