//! Posture — security posture control plane for a multi-VM mobile platform.
//!
//! The policy authority VM records toggle changes, classifies them as
//! runtime-safe or reboot-required, and distributes signed updates over the
//! control bus. Enforcer VMs (network gateway, trusted UI) converge their
//! local state — firewall rules, cellular radio power — to match policy.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod enforcer;
pub mod logging;
pub mod policy;
