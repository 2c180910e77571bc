//! Configuration loading and management.
//!
//! Loads posture configuration from `./posture.toml` (or `$POSTURE_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level posture configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PostureConfig {
    /// Filesystem paths for persisted policy state.
    pub paths: PathsConfig,
    /// Radio idle monitor settings.
    pub radio: RadioConfig,
    /// Firewall interface names.
    pub firewall: FirewallConfig,
    /// Control bus settings.
    pub bus: BusConfig,
}

impl PostureConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$POSTURE_CONFIG_PATH` or `./posture.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: PostureConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(PostureConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        match env("POSTURE_CONFIG_PATH") {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("posture.toml"),
        }
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("POSTURE_STATE_DIR") {
            self.paths.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env("POSTURE_POLICY_FILE") {
            self.paths.policy_file = PathBuf::from(v);
        }
        if let Some(v) = env("POSTURE_RADIO_IFACE") {
            self.radio.iface = v;
        }
        if let Some(v) = env("POSTURE_RADIO_IDLE_TIMEOUT_MIN") {
            match v.parse() {
                Ok(n) => self.radio.idle_timeout_min = n,
                Err(_) => tracing::warn!(
                    var = "POSTURE_RADIO_IDLE_TIMEOUT_MIN",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("POSTURE_BUS_DIR") {
            self.bus.dir = PathBuf::from(v);
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Filesystem paths for persisted policy state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding all mutable posture state.
    pub state_dir: PathBuf,
    /// Operator-editable policy file watched by `postured watch`.
    pub policy_file: PathBuf,
    /// Directory for rotated JSON log files.
    pub logs_dir: PathBuf,
    /// Number of status backups to retain (oldest pruned first).
    pub backup_retain: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/posture"),
            policy_file: PathBuf::from("/etc/posture/policy.conf"),
            logs_dir: PathBuf::from("/var/log/posture"),
            backup_retain: 20,
        }
    }
}

impl PathsConfig {
    /// Pending reboot-required changes, drained at boot.
    pub fn pending_path(&self) -> PathBuf {
        self.state_dir.join("pending.conf")
    }

    /// Live policy snapshot.
    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    /// Directory of timestamped status backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Radio power/activity state file.
    pub fn radio_state_path(&self) -> PathBuf {
        self.state_dir.join("radio.state")
    }

    /// Singleton lock for the radio monitor loop.
    pub fn radio_lock_path(&self) -> PathBuf {
        self.state_dir.join("radio.lock")
    }

    /// Last selected firewall mode, re-applied after a crash.
    pub fn firewall_mode_path(&self) -> PathBuf {
        self.state_dir.join("firewall.mode")
    }

    /// Rendered firewall rule set consumed by the platform filter.
    pub fn firewall_rules_path(&self) -> PathBuf {
        self.state_dir.join("firewall.rules")
    }
}

// ── Radio ───────────────────────────────────────────────────────

/// Radio idle monitor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Cellular network interface name.
    pub iface: String,
    /// Idle minutes before the radio is powered down.
    pub idle_timeout_min: i64,
    /// Seconds between monitor ticks.
    pub poll_interval_secs: u64,
    /// Root of the per-interface statistics tree.
    pub sysfs_root: PathBuf,
    /// Optional driver power-control file; when unset, power commands are
    /// logged only (driver integration is platform-specific).
    pub power_ctl: Option<PathBuf>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            iface: "rmnet0".to_owned(),
            idle_timeout_min: 10,
            poll_interval_secs: 60,
            sysfs_root: PathBuf::from("/sys/class/net"),
            power_ctl: None,
        }
    }
}

// ── Firewall ────────────────────────────────────────────────────

/// Interface names the firewall rule sets are rendered against.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Designated egress tunnel interface.
    pub tunnel_iface: String,
    /// Baseband (cellular) interface.
    pub baseband_iface: String,
    /// Local wireless interface.
    pub wlan_iface: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            tunnel_iface: "tun0".to_owned(),
            baseband_iface: "rmnet0".to_owned(),
            wlan_iface: "wlan0".to_owned(),
        }
    }
}

// ── Control bus ─────────────────────────────────────────────────

/// Control bus settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Directory holding one message file per target VM.
    pub dir: PathBuf,
    /// Authority verifying key (32 bytes).
    pub public_key: PathBuf,
    /// Authority signing key (32 bytes); present only on the authority VM.
    pub secret_key: PathBuf,
    /// Maximum accepted clock skew for message timestamps, in seconds.
    pub timestamp_skew_secs: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/posture/bus"),
            public_key: PathBuf::from("/etc/posture/keys/authority.pub"),
            secret_key: PathBuf::from("/etc/posture/keys/authority.sec"),
            timestamp_skew_secs: 300,
        }
    }
}
