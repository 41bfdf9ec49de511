//! Tool paths and fallback constants used by discovery and mutation.

use std::env;
use std::path::PathBuf;

use anyhow::Result;

use tcshape_shared::units::IPROUTE2_UPPER_LIMIT_BPS;

/// Root of the per-interface sysfs tree.
pub const SYSFS_NET_ROOT: &str = "/sys/class/net";

/// First iptables mark handed out to a rule.
pub const DEFAULT_MARK_BASE: u32 = 100;

const ENV_TC: &str = "TCSHAPE_TC";
const ENV_IP: &str = "TCSHAPE_IP";
const ENV_MODPROBE: &str = "TCSHAPE_MODPROBE";
const ENV_IPTABLES: &str = "TCSHAPE_IPTABLES";
const ENV_SYSFS_NET: &str = "TCSHAPE_SYSFS_NET";
const ENV_MARK_BASE: &str = "TCSHAPE_MARK_BASE";

/// Explicit configuration value passed into discovery and mutation.
///
/// Nothing in the crate reads process-wide defaults; two invocations in one
/// process can run with different tools or fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaperConfig {
    pub tc_program: String,
    pub ip_program: String,
    pub modprobe_program: String,
    /// Overrides `iptables`/`ip6tables` when set.
    pub iptables_program: Option<String>,
    pub sysfs_net_root: PathBuf,
    /// Bandwidth ceiling used when the interface speed is unreadable.
    pub upper_limit_fallback_bps: u64,
    pub mark_base: u32,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            tc_program: "tc".to_string(),
            ip_program: "ip".to_string(),
            modprobe_program: "modprobe".to_string(),
            iptables_program: None,
            sysfs_net_root: PathBuf::from(SYSFS_NET_ROOT),
            upper_limit_fallback_bps: IPROUTE2_UPPER_LIMIT_BPS,
            mark_base: DEFAULT_MARK_BASE,
        }
    }
}

impl ShaperConfig {
    /// Defaults overridden by `TCSHAPE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(tc) = lookup(ENV_TC) {
            config.tc_program = tc;
        }
        if let Some(ip) = lookup(ENV_IP) {
            config.ip_program = ip;
        }
        if let Some(modprobe) = lookup(ENV_MODPROBE) {
            config.modprobe_program = modprobe;
        }
        config.iptables_program = lookup(ENV_IPTABLES);
        if let Some(root) = lookup(ENV_SYSFS_NET) {
            config.sysfs_net_root = PathBuf::from(root);
        }
        if let Some(base) = lookup(ENV_MARK_BASE) {
            config.mark_base = base
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{} must be a positive integer, got '{}'", ENV_MARK_BASE, base))?;
        }
        Ok(config)
    }

    /// Packet filter program for a protocol version.
    pub fn iptables_for(&self, ip_version: tcshape_shared::IpVersion) -> String {
        self.iptables_program
            .clone()
            .unwrap_or_else(|| ip_version.iptables_program().to_string())
    }
}
