//! Toggle Registry — static catalog of recognized policy toggles.
//!
//! Each toggle is tagged runtime-safe or reboot-required, carries a value
//! validator, and names the VM(s) that enforce it. Unknown keys are never
//! rejected: older enforcers must be able to ignore toggles they do not
//! understand, so classification of an unrecognized key is `Unknown` and
//! validation passes trivially.

use thiserror::Error;

/// How a toggle change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleClass {
    /// Applies immediately without restart.
    RuntimeSafe,
    /// Queued in the pending store and applied at next boot.
    RebootRequired,
    /// Not in the catalog; merged verbatim with a warning.
    Unknown,
}

/// Value domain for a catalog entry.
#[derive(Debug, Clone, Copy)]
pub enum ValueSpec {
    /// `on`/`off`/`true`/`false`.
    Bool,
    /// One of a fixed set of strings.
    Enum(&'static [&'static str]),
    /// Integer minutes within an inclusive range.
    IntMinutes {
        /// Smallest accepted value.
        min: i64,
        /// Largest accepted value.
        max: i64,
    },
}

/// Immutable catalog entry for one policy toggle.
#[derive(Debug, Clone, Copy)]
pub struct Toggle {
    /// Policy key, e.g. `RADIO_ISOLATION`.
    pub key: &'static str,
    /// Runtime-safe or reboot-required.
    pub class: ToggleClass,
    /// Accepted value domain.
    pub values: ValueSpec,
    /// VM roles that enforce this toggle; control-bus messages are
    /// addressed to these targets.
    pub targets: &'static [&'static str],
}

/// Validation failure for a recognized toggle.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The value is outside the toggle's domain.
    #[error("invalid value '{value}' for {key}: {expected}")]
    InvalidValue {
        /// Toggle key.
        key: String,
        /// Offending value.
        value: String,
        /// Human-readable description of the accepted domain.
        expected: String,
    },
}

/// The twelve recognized toggles: nine runtime-safe, three reboot-required.
const CATALOG: &[Toggle] = &[
    Toggle {
        key: "RADIO_ISOLATION",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Bool,
        targets: &["gateway"],
    },
    Toggle {
        key: "RADIO_HARDENING.level",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Enum(&["basic", "strict"]),
        targets: &["gateway"],
    },
    Toggle {
        key: "RADIO_IDLE_TIMEOUT_MIN",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::IntMinutes { min: 1, max: 240 },
        targets: &["gateway"],
    },
    Toggle {
        key: "TRUSTED_OVERLAY",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Bool,
        targets: &["ui"],
    },
    Toggle {
        key: "REMOTE_ATTESTATION",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Bool,
        targets: &["attestation"],
    },
    Toggle {
        key: "PANIC_GESTURE",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Bool,
        targets: &["authority"],
    },
    Toggle {
        key: "DURESS_PROFILE",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Enum(&["off", "decoy", "wipe"]),
        targets: &["authority"],
    },
    Toggle {
        key: "E2E_TUNNEL_POLICY",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Enum(&["direct", "tor-only", "tor+vpn"]),
        targets: &["gateway"],
    },
    Toggle {
        key: "AUDIT_UPLOAD",
        class: ToggleClass::RuntimeSafe,
        values: ValueSpec::Bool,
        targets: &["gateway"],
    },
    Toggle {
        key: "VERIFIED_BOOT_ENFORCE",
        class: ToggleClass::RebootRequired,
        values: ValueSpec::Enum(&["permissive", "enforce"]),
        targets: &["bootloader"],
    },
    Toggle {
        key: "KERNEL_HARDENING",
        class: ToggleClass::RebootRequired,
        values: ValueSpec::Enum(&["standard", "strict"]),
        targets: &["kernel"],
    },
    Toggle {
        key: "BASEBAND_DRIVER_DISABLE",
        class: ToggleClass::RebootRequired,
        values: ValueSpec::Bool,
        targets: &["kernel"],
    },
];

/// Static catalog lookup for classification and validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToggleRegistry;

impl ToggleRegistry {
    /// Create the registry over the built-in catalog.
    pub fn new() -> Self {
        Self
    }

    /// Look up a catalog entry by key.
    pub fn get(&self, key: &str) -> Option<&'static Toggle> {
        CATALOG.iter().find(|t| t.key == key)
    }

    /// Classify a key as runtime-safe, reboot-required, or unknown.
    pub fn classify(&self, key: &str) -> ToggleClass {
        self.get(key).map_or(ToggleClass::Unknown, |t| t.class)
    }

    /// Validate a value against the toggle's domain.
    ///
    /// Unknown keys validate trivially — policy is forward-compatible.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidValue`] when a recognized toggle is
    /// given a value outside its domain.
    pub fn validate(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        let Some(toggle) = self.get(key) else {
            return Ok(());
        };

        let ok = match toggle.values {
            ValueSpec::Bool => matches!(value, "on" | "off" | "true" | "false"),
            ValueSpec::Enum(options) => options.contains(&value),
            ValueSpec::IntMinutes { min, max } => value
                .parse::<i64>()
                .is_ok_and(|n| n >= min && n <= max),
        };

        if ok {
            Ok(())
        } else {
            Err(RegistryError::InvalidValue {
                key: key.to_owned(),
                value: value.to_owned(),
                expected: describe(toggle.values),
            })
        }
    }

    /// Iterate over all catalog entries.
    pub fn iter(&self) -> impl Iterator<Item = &'static Toggle> {
        CATALOG.iter()
    }
}

/// Render a value domain for error messages.
fn describe(values: ValueSpec) -> String {
    match values {
        ValueSpec::Bool => "one of on/off/true/false".to_owned(),
        ValueSpec::Enum(options) => format!("one of {}", options.join("/")),
        ValueSpec::IntMinutes { min, max } => format!("integer minutes {min}..={max}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_has_nine_runtime_and_three_reboot() {
        let registry = ToggleRegistry::new();
        let runtime = registry
            .iter()
            .filter(|t| t.class == ToggleClass::RuntimeSafe)
            .count();
        let reboot = registry
            .iter()
            .filter(|t| t.class == ToggleClass::RebootRequired)
            .count();
        assert_eq!(runtime, 9);
        assert_eq!(reboot, 3);
    }

    #[test]
    fn classify_runtime_safe() {
        let registry = ToggleRegistry::new();
        assert_eq!(
            registry.classify("RADIO_ISOLATION"),
            ToggleClass::RuntimeSafe
        );
        assert_eq!(
            registry.classify("RADIO_HARDENING.level"),
            ToggleClass::RuntimeSafe
        );
    }

    #[test]
    fn classify_reboot_required() {
        let registry = ToggleRegistry::new();
        assert_eq!(
            registry.classify("KERNEL_HARDENING"),
            ToggleClass::RebootRequired
        );
        assert_eq!(
            registry.classify("BASEBAND_DRIVER_DISABLE"),
            ToggleClass::RebootRequired
        );
    }

    #[test]
    fn classify_unknown() {
        let registry = ToggleRegistry::new();
        assert_eq!(registry.classify("FOO_BAR"), ToggleClass::Unknown);
    }

    #[test]
    fn validate_bool_values() {
        let registry = ToggleRegistry::new();
        for v in ["on", "off", "true", "false"] {
            assert!(registry.validate("RADIO_ISOLATION", v).is_ok());
        }
        assert!(registry.validate("RADIO_ISOLATION", "enabled").is_err());
    }

    #[test]
    fn validate_enum_values() {
        let registry = ToggleRegistry::new();
        assert!(registry.validate("E2E_TUNNEL_POLICY", "tor-only").is_ok());
        assert!(registry.validate("E2E_TUNNEL_POLICY", "clearnet").is_err());
    }

    #[test]
    fn validate_int_range() {
        let registry = ToggleRegistry::new();
        assert!(registry.validate("RADIO_IDLE_TIMEOUT_MIN", "10").is_ok());
        assert!(registry.validate("RADIO_IDLE_TIMEOUT_MIN", "240").is_ok());
        assert!(registry.validate("RADIO_IDLE_TIMEOUT_MIN", "0").is_err());
        assert!(registry.validate("RADIO_IDLE_TIMEOUT_MIN", "241").is_err());
        assert!(registry.validate("RADIO_IDLE_TIMEOUT_MIN", "ten").is_err());
    }

    #[test]
    fn validate_unknown_key_passes() {
        let registry = ToggleRegistry::new();
        assert!(registry.validate("FOO_BAR", "baz").is_ok());
    }

    #[test]
    fn invalid_value_error_names_domain() {
        let registry = ToggleRegistry::new();
        let err = registry
            .validate("KERNEL_HARDENING", "paranoid")
            .expect_err("out of domain");
        let msg = err.to_string();
        assert!(msg.contains("KERNEL_HARDENING"));
        assert!(msg.contains("standard/strict"));
    }
}
