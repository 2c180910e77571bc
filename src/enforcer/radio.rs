//! Radio idle monitor.
//!
//! Samples the cellular interface receive counter once per tick; when
//! the counter has not moved for the configured idle window the radio is
//! powered down. Activity is inferred from counter *changes* only — a
//! driver that wedges with a frozen counter is indistinguishable from a
//! genuinely idle link and will be powered off when the window elapses.
//!
//! Power state and the last-activity instant are persisted across
//! monitor restarts. The counter baseline is not: rx counters reset
//! with the interface, so the first tick after a restart re-baselines
//! and restarts the idle window.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RadioConfig;
use crate::policy::status::SnapshotStore;

/// Policy key consulted each tick for the idle window, in minutes.
pub const IDLE_TIMEOUT_KEY: &str = "RADIO_IDLE_TIMEOUT_MIN";

/// Radio monitor failure.
#[derive(Debug, Error)]
pub enum RadioError {
    /// Another monitor instance holds the lock.
    #[error("radio monitor already running (lock at {path})")]
    AlreadyRunning {
        /// Lock file path.
        path: PathBuf,
    },
    /// Interface receive counter could not be read.
    #[error("cannot read rx counter for {iface}: {source}")]
    CounterUnreadable {
        /// Interface name.
        iface: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// State file or power control I/O failure.
    #[error("radio state I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Radio power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioPower {
    /// Radio powered and monitored.
    On,
    /// Radio powered down; monitoring is suspended until power-on.
    Off,
}

impl FromStr for RadioPower {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => Err(format!("unknown radio power state '{other}'")),
        }
    }
}

impl fmt::Display for RadioPower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// Persisted monitor state plus the in-memory counter baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioState {
    /// Current power state.
    pub power: RadioPower,
    /// Epoch seconds of the last observed counter movement.
    pub last_activity: i64,
    /// Counter value at the previous tick; not persisted — counters
    /// reset across reboots, so the first tick after a restart only
    /// re-baselines.
    pub last_seen_rx: Option<u64>,
}

impl RadioState {
    /// Fresh powered-on state with the idle clock starting at `now`.
    pub fn new(now: i64) -> Self {
        Self {
            power: RadioPower::On,
            last_activity: now,
            last_seen_rx: None,
        }
    }

    /// Load state from `path`; a missing or malformed file yields a fresh
    /// powered-on state (with a warning when malformed).
    pub fn load(path: &Path, now: i64) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "radio state unreadable, starting fresh");
                }
                return Self::new(now);
            }
        };

        let mut lines = contents.lines();
        match lines.next().and_then(|l| l.parse().ok()) {
            // The off state carries no activity line; the idle clock
            // restarts at power-on.
            Some(RadioPower::Off) => Self {
                power: RadioPower::Off,
                last_activity: now,
                last_seen_rx: None,
            },
            Some(RadioPower::On) => match lines.next().and_then(|l| l.trim().parse().ok()) {
                Some(last_activity) => Self {
                    power: RadioPower::On,
                    last_activity,
                    last_seen_rx: None,
                },
                None => {
                    warn!(path = %path.display(), "radio state malformed, starting fresh");
                    Self::new(now)
                }
            },
            None => {
                warn!(path = %path.display(), "radio state malformed, starting fresh");
                Self::new(now)
            }
        }
    }

    /// Persist the state atomically: `on` plus the last-activity line, or
    /// a single `off` line.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::Io`] on write failure.
    pub fn save(&self, path: &Path) -> Result<(), RadioError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = match self.power {
            RadioPower::On => format!("on\n{}\n", self.last_activity),
            RadioPower::Off => "off\n".to_owned(),
        };
        let tmp = path.with_extension("state.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// What one monitor tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Radio is off; nothing sampled.
    SkippedOff,
    /// Counter moved (or first sample); idle clock reset.
    ActivityDetected,
    /// Counter unchanged but still inside the idle window.
    Idle {
        /// Seconds since last observed activity.
        idle_secs: i64,
    },
    /// Idle window elapsed; power transitioned to off.
    PoweredOff,
}

/// Pure per-tick decision: compare the sampled counter against the
/// baseline and advance the state machine.
pub fn observe(state: &mut RadioState, now: i64, rx_bytes: u64, timeout_secs: i64) -> TickAction {
    if state.power == RadioPower::Off {
        return TickAction::SkippedOff;
    }

    if state.last_seen_rx != Some(rx_bytes) {
        state.last_seen_rx = Some(rx_bytes);
        state.last_activity = now;
        return TickAction::ActivityDetected;
    }

    let idle_secs = now.saturating_sub(state.last_activity);
    if idle_secs >= timeout_secs {
        state.power = RadioPower::Off;
        return TickAction::PoweredOff;
    }
    TickAction::Idle { idle_secs }
}

/// Idle window in seconds: the live policy value when present and
/// parseable, else the configured default.
pub fn effective_timeout_secs(store: &dyn SnapshotStore, default_min: i64) -> i64 {
    let snapshot = store.read();
    let minutes = snapshot
        .policy
        .get(IDLE_TIMEOUT_KEY)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|m| *m > 0)
        .unwrap_or(default_min);
    minutes.saturating_mul(60)
}

/// Access seam to the cellular interface.
pub trait CellularInterface {
    /// Current receive byte counter.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::CounterUnreadable`] when the counter cannot
    /// be read (interface gone, driver quiesced).
    fn rx_bytes(&self) -> Result<u64, RadioError>;

    /// Drive the radio power rail.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::Io`] on write failure.
    fn set_power(&self, power: RadioPower) -> Result<(), RadioError>;
}

/// Sysfs-backed interface: counter from
/// `{root}/{iface}/statistics/rx_bytes`, power via the optional driver
/// control file (logged only when unconfigured).
#[derive(Debug, Clone)]
pub struct SysfsCellular {
    sysfs_root: PathBuf,
    iface: String,
    power_ctl: Option<PathBuf>,
}

impl SysfsCellular {
    /// Build from radio configuration.
    pub fn from_config(radio: &RadioConfig) -> Self {
        Self {
            sysfs_root: radio.sysfs_root.clone(),
            iface: radio.iface.clone(),
            power_ctl: radio.power_ctl.clone(),
        }
    }
}

impl CellularInterface for SysfsCellular {
    fn rx_bytes(&self) -> Result<u64, RadioError> {
        let path = self
            .sysfs_root
            .join(&self.iface)
            .join("statistics/rx_bytes");
        let contents = std::fs::read_to_string(&path).map_err(|e| RadioError::CounterUnreadable {
            iface: self.iface.clone(),
            source: e,
        })?;
        contents
            .trim()
            .parse()
            .map_err(|e| RadioError::CounterUnreadable {
                iface: self.iface.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e}")),
            })
    }

    fn set_power(&self, power: RadioPower) -> Result<(), RadioError> {
        match &self.power_ctl {
            Some(ctl) => {
                let value = match power {
                    RadioPower::On => "1",
                    RadioPower::Off => "0",
                };
                std::fs::write(ctl, value)?;
                info!(iface = %self.iface, %power, ctl = %ctl.display(), "radio power set");
            }
            None => {
                info!(iface = %self.iface, %power, "radio power change (no driver control configured)");
            }
        }
        Ok(())
    }
}

/// Removes the monitor lock file when the monitor exits.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove radio monitor lock");
        }
    }
}

/// Long-running idle monitor for one cellular interface.
pub struct RadioMonitor<'a, I: CellularInterface> {
    radio: RadioConfig,
    state_path: PathBuf,
    lock_path: PathBuf,
    iface: I,
    status: &'a dyn SnapshotStore,
}

impl<'a, I: CellularInterface> RadioMonitor<'a, I> {
    /// Wire the monitor over its interface and the live policy snapshot.
    pub fn new(
        radio: RadioConfig,
        state_path: PathBuf,
        lock_path: PathBuf,
        iface: I,
        status: &'a dyn SnapshotStore,
    ) -> Self {
        Self {
            radio,
            state_path,
            lock_path,
            iface,
            status,
        }
    }

    fn acquire_lock(&self) -> Result<LockGuard, RadioError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(_) => Ok(LockGuard {
                path: self.lock_path.clone(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RadioError::AlreadyRunning {
                    path: self.lock_path.clone(),
                })
            }
            Err(e) => Err(RadioError::Io(e)),
        }
    }

    /// One sampling step against wall-clock `now`; persists state when it
    /// changed and drives the power rail on idle expiry.
    fn tick(&self, state: &mut RadioState, now: i64) -> Result<TickAction, RadioError> {
        if state.power == RadioPower::Off {
            return Ok(TickAction::SkippedOff);
        }
        let timeout_secs = effective_timeout_secs(self.status, self.radio.idle_timeout_min);
        let rx = match self.iface.rx_bytes() {
            Ok(rx) => rx,
            Err(e) => {
                // Transient counter failures leave the idle clock alone.
                warn!(error = %e, "skipping tick");
                return Ok(TickAction::Idle {
                    idle_secs: now.saturating_sub(state.last_activity),
                });
            }
        };

        let action = observe(state, now, rx, timeout_secs);
        match action {
            TickAction::ActivityDetected => {
                debug!(rx, "radio activity, idle clock reset");
                state.save(&self.state_path)?;
            }
            TickAction::PoweredOff => {
                info!(
                    iface = %self.radio.iface,
                    timeout_secs,
                    "idle window elapsed, powering radio down"
                );
                self.iface.set_power(RadioPower::Off)?;
                state.save(&self.state_path)?;
            }
            TickAction::Idle { idle_secs } => {
                debug!(idle_secs, timeout_secs, "radio idle");
            }
            TickAction::SkippedOff => {}
        }
        Ok(action)
    }

    /// Run the monitor loop until interrupted. Holds the singleton lock
    /// for the whole run.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::AlreadyRunning`] when another instance holds
    /// the lock, or [`RadioError::Io`] on state persistence failure.
    pub async fn run(&self) -> Result<(), RadioError> {
        let _lock = self.acquire_lock()?;
        let mut state = RadioState::load(&self.state_path, chrono::Utc::now().timestamp());
        info!(
            iface = %self.radio.iface,
            poll_secs = self.radio.poll_interval_secs,
            power = %state.power,
            "radio idle monitor started"
        );

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.radio.poll_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut state, chrono::Utc::now().timestamp())?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("radio idle monitor stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Power the radio on and restart the idle clock.
///
/// # Errors
///
/// Returns [`RadioError`] on driver or state persistence failure.
pub fn power_on<I: CellularInterface>(
    iface: &I,
    state_path: &Path,
    now: i64,
) -> Result<(), RadioError> {
    iface.set_power(RadioPower::On)?;
    RadioState::new(now).save(state_path)
}

/// Power the radio off immediately.
///
/// # Errors
///
/// Returns [`RadioError`] on driver or state persistence failure.
pub fn power_off<I: CellularInterface>(
    iface: &I,
    state_path: &Path,
    now: i64,
) -> Result<(), RadioError> {
    iface.set_power(RadioPower::Off)?;
    let mut state = RadioState::load(state_path, now);
    state.power = RadioPower::Off;
    state.save(state_path)
}

/// Restart the idle clock without touching power. A no-op (with a
/// warning) while the radio is off — the clock restarts at power-on.
///
/// # Errors
///
/// Returns [`RadioError::Io`] on state persistence failure.
pub fn reset_idle(state_path: &Path, now: i64) -> Result<(), RadioError> {
    let mut state = RadioState::load(state_path, now);
    if state.power == RadioPower::Off {
        warn!("radio is off; idle clock untouched");
        return Ok(());
    }
    state.last_activity = now;
    state.save(state_path)
}

/// One-line human status: power state and current idle seconds.
pub fn status_line(state_path: &Path, now: i64) -> String {
    let state = RadioState::load(state_path, now);
    match state.power {
        RadioPower::On => format!(
            "radio on, idle {}s",
            now.saturating_sub(state.last_activity)
        ),
        RadioPower::Off => "radio off".to_owned(),
    }
}
