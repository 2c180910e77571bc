//! Firewall mode controller for the gateway VM.
//!
//! Two postures: `strict` tunnels all egress and rejects baseband, wlan
//! and plaintext DNS with a logged reject; `basic` additionally opens the
//! narrow carrier set (SIP, IKE, DNS over baseband, local mDNS). Every
//! mode change is flush-then-rebuild: the full desired rule set is
//! rendered from scratch and swapped in atomically, so the filter never
//! runs a partial mix of two postures.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::FirewallConfig;

/// Firewall controller failure.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// Selected mode could not be recorded.
    #[error("failed to persist firewall mode to {path}: {source}")]
    ModePersistFailed {
        /// Mode file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Rendered rule set could not be installed.
    #[error("failed to apply firewall rule set: {0}")]
    ApplyFailed(#[from] std::io::Error),
}

/// Gateway firewall posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallMode {
    /// Tunnel-only egress; baseband, wlan and plaintext DNS rejected.
    Strict,
    /// Strict plus the minimal carrier service set over baseband.
    Basic,
}

impl FromStr for FirewallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "basic" => Ok(Self::Basic),
            other => Err(format!("unknown firewall mode '{other}' (strict|basic)")),
        }
    }
}

impl fmt::Display for FirewallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Basic => write!(f, "basic"),
        }
    }
}

/// A fully rendered rule set for one mode. Rendering is pure and
/// deterministic: the same mode and interface names always produce the
/// same lines in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    /// Posture the rules were rendered for.
    pub mode: FirewallMode,
    /// Ordered rule lines, first line flushes the previous set.
    pub lines: Vec<String>,
}

impl RuleSet {
    /// Rendered rule text, one rule per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Render the complete rule set for `mode`.
pub fn desired_ruleset(mode: FirewallMode, fw: &FirewallConfig) -> RuleSet {
    let tun = &fw.tunnel_iface;
    let bb = &fw.baseband_iface;
    let wlan = &fw.wlan_iface;

    let mut lines = vec![
        "flush".to_owned(),
        "default in reject".to_owned(),
        "default out reject".to_owned(),
        "default forward reject".to_owned(),
        "allow in on lo".to_owned(),
        "allow out on lo".to_owned(),
        format!("allow out on {tun}"),
        format!("allow forward out on {tun}"),
    ];

    match mode {
        FirewallMode::Strict => {
            // Plaintext DNS may only leave inside the tunnel.
            lines.push("log reject out proto udp port 53".to_owned());
            lines.push("log reject out proto tcp port 53".to_owned());
            lines.push(format!("log reject out on {bb}"));
            lines.push(format!("log reject out on {wlan}"));
        }
        FirewallMode::Basic => {
            // Carrier services the baseband needs to stay registered.
            lines.push(format!("allow out on {bb} proto tcp port 5060"));
            lines.push(format!("allow out on {bb} proto udp port 5060"));
            lines.push(format!("allow out on {bb} proto udp port 500"));
            lines.push(format!("allow out on {bb} proto udp port 4500"));
            lines.push(format!("allow out on {bb} proto udp port 53"));
            lines.push(format!("allow out on {bb} proto tcp port 53"));
            lines.push("allow out proto udp port 5353".to_owned());
            lines.push(format!("log reject out on {wlan}"));
        }
    }

    // Each direction terminates in a logged reject: unmatched traffic is
    // recorded and refused deterministically, never silently dropped.
    for direction in ["in", "out", "forward"] {
        lines.push(format!("log unmatched {direction}"));
        lines.push(format!("final reject {direction}"));
    }

    RuleSet { mode, lines }
}

/// Installation seam for rendered rule sets.
pub trait RuleBackend {
    /// Install the rule set, replacing whatever was active.
    ///
    /// # Errors
    ///
    /// Returns [`FirewallError::ApplyFailed`] when installation fails;
    /// the previously recorded mode file still names the target posture
    /// so a restart retries the same rule set.
    fn apply(&self, rules: &RuleSet) -> Result<(), FirewallError>;
}

/// Writes the rendered rule set to the file consumed by the platform
/// packet filter, via temp-file-then-rename so the filter never reads a
/// half-written set.
#[derive(Debug, Clone)]
pub struct FileBackend {
    rules_path: PathBuf,
}

impl FileBackend {
    /// Back rules with the given file.
    pub fn new(rules_path: impl Into<PathBuf>) -> Self {
        Self {
            rules_path: rules_path.into(),
        }
    }
}

impl RuleBackend for FileBackend {
    fn apply(&self, rules: &RuleSet) -> Result<(), FirewallError> {
        if let Some(parent) = self.rules_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.rules_path.with_extension("rules.tmp");
        std::fs::write(&tmp, rules.render())?;
        std::fs::rename(&tmp, &self.rules_path)?;
        Ok(())
    }
}

/// Drives mode selection: records the target mode durably, then renders
/// and installs its rule set.
pub struct FirewallController<B: RuleBackend> {
    mode_path: PathBuf,
    fw: FirewallConfig,
    backend: B,
}

impl<B: RuleBackend> FirewallController<B> {
    /// Build a controller over the given backend.
    pub fn new(mode_path: impl Into<PathBuf>, fw: FirewallConfig, backend: B) -> Self {
        Self {
            mode_path: mode_path.into(),
            fw,
            backend,
        }
    }

    /// Switch to `mode`: persist it first, then flush-and-rebuild.
    ///
    /// The mode file is written before the rules are touched — if the
    /// apply is interrupted, the next [`Self::reapply_last`] converges on
    /// the intended posture rather than the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`FirewallError`] when the mode cannot be recorded or the
    /// rule set cannot be installed.
    pub fn select_mode(&self, mode: FirewallMode) -> Result<(), FirewallError> {
        if let Some(parent) = self.mode_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FirewallError::ModePersistFailed {
                path: self.mode_path.clone(),
                source: e,
            })?;
        }
        let tmp = self.mode_path.with_extension("mode.tmp");
        std::fs::write(&tmp, format!("{mode}\n"))
            .and_then(|()| std::fs::rename(&tmp, &self.mode_path))
            .map_err(|e| FirewallError::ModePersistFailed {
                path: self.mode_path.clone(),
                source: e,
            })?;

        let rules = desired_ruleset(mode, &self.fw);
        self.backend.apply(&rules)?;
        let allowed = rules.lines.iter().filter(|l| l.starts_with("allow")).count();
        let rejected = rules.lines.iter().filter(|l| l.contains("reject")).count();
        info!(%mode, allowed, rejected, "firewall rule set installed");
        Ok(())
    }

    /// Re-install the last recorded mode; defaults to strict when no mode
    /// was ever recorded or the file is unreadable.
    ///
    /// # Errors
    ///
    /// Returns [`FirewallError`] from [`Self::select_mode`].
    pub fn reapply_last(&self) -> Result<(), FirewallError> {
        let mode = match std::fs::read_to_string(&self.mode_path) {
            Ok(contents) => match contents.parse::<FirewallMode>() {
                Ok(mode) => mode,
                Err(e) => {
                    warn!(error = %e, "recorded firewall mode unreadable, defaulting to strict");
                    FirewallMode::Strict
                }
            },
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "firewall mode file unreadable, defaulting to strict");
                }
                FirewallMode::Strict
            }
        };
        self.select_mode(mode)
    }
}

/// Map a `RADIO_HARDENING.level` toggle value to a firewall mode.
/// `2`/`strict` selects strict, anything else basic.
pub fn mode_for_hardening_level(value: &str) -> FirewallMode {
    match value.trim() {
        "2" | "strict" => FirewallMode::Strict,
        _ => FirewallMode::Basic,
    }
}
