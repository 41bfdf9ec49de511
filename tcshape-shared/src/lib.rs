//! Shared types for tcshape.
//!
//! This crate holds the data model used on both sides of the tool: the read
//! path that rebuilds shaping rules from `tc ... show` output and the write
//! path that turns shaping intent into `tc`/`iptables` invocations.
//!
//! # Key Components
//!
//! * [`Handle`] - hierarchical `major:minor` identifier of qdiscs and classes
//! * [`ShapingParams`] - normalized netem/rate parameters
//! * [`NetworkFilter`] - destination/source network and port constraints
//! * [`ShapingRule`] - one observable traffic-control object chain
//! * [`RuleMapping`] - device → handle → rule projection of kernel state
//!
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod errors;
pub mod network;
pub mod units;

use errors::TcshapeError;

/// Direction of the traffic a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outgoing => write!(f, "outgoing"),
            Direction::Incoming => write!(f, "incoming"),
        }
    }
}

impl FromStr for Direction {
    type Err = TcshapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outgoing" | "out" | "egress" => Ok(Direction::Outgoing),
            "incoming" | "in" | "ingress" => Ok(Direction::Incoming),
            _ => Err(TcshapeError::invalid(
                "direction",
                s,
                "expected 'outgoing' or 'incoming'",
            )),
        }
    }
}

/// IP protocol version of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpVersion {
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "6")]
    V6,
}

impl IpVersion {
    /// Protocol word used by `tc filter ... protocol <word>`.
    pub fn tc_protocol(&self) -> &'static str {
        match self {
            IpVersion::V4 => "ip",
            IpVersion::V6 => "ipv6",
        }
    }

    /// Selector used by u32 `match <word> dst ...` clauses.
    pub fn match_selector(&self) -> &'static str {
        match self {
            IpVersion::V4 => "ip",
            IpVersion::V6 => "ip6",
        }
    }

    /// Packet filter program for this version.
    pub fn iptables_program(&self) -> &'static str {
        match self {
            IpVersion::V4 => "iptables",
            IpVersion::V6 => "ip6tables",
        }
    }

    /// Version from a tc `protocol` word. `all` and others yield `None`.
    pub fn from_tc_protocol(protocol: &str) -> Option<Self> {
        match protocol {
            "ip" => Some(IpVersion::V4),
            "ipv6" => Some(IpVersion::V6),
            _ => None,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "4"),
            IpVersion::V6 => write!(f, "6"),
        }
    }
}

/// Hierarchical `major:minor` handle of a qdisc, class or flow.
///
/// Rendered in tc's hexadecimal form: `1a1a:` for a qdisc (minor 0) and
/// `1a1a:2` for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub major: u16,
    pub minor: u16,
}

impl Handle {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// The qdisc handle (`major:`) owning this handle.
    pub const fn qdisc(&self) -> Self {
        Self {
            major: self.major,
            minor: 0,
        }
    }

    pub const fn is_qdisc(&self) -> bool {
        self.minor == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{:x}:", self.major)
        } else {
            write!(f, "{:x}:{:x}", self.major, self.minor)
        }
    }
}

impl FromStr for Handle {
    type Err = TcshapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| TcshapeError::invalid("handle", s, "expected 'major:minor'"))?;

        let parse_part = |part: &str| -> Result<u16, TcshapeError> {
            if part.is_empty() {
                return Ok(0);
            }
            u16::from_str_radix(part.trim_start_matches("0x"), 16)
                .map_err(|_| TcshapeError::invalid("handle", s, "not a hexadecimal number"))
        };

        Ok(Handle {
            major: parse_part(major)?,
            minor: parse_part(minor)?,
        })
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Delay distribution table used by netem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayDistribution {
    Normal,
    Pareto,
    ParetoNormal,
}

impl fmt::Display for DelayDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayDistribution::Normal => write!(f, "normal"),
            DelayDistribution::Pareto => write!(f, "pareto"),
            DelayDistribution::ParetoNormal => write!(f, "paretonormal"),
        }
    }
}

impl FromStr for DelayDistribution {
    type Err = TcshapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(DelayDistribution::Normal),
            "pareto" => Ok(DelayDistribution::Pareto),
            "paretonormal" => Ok(DelayDistribution::ParetoNormal),
            _ => Err(TcshapeError::invalid(
                "delay-distribution",
                s,
                "expected normal, pareto or paretonormal",
            )),
        }
    }
}

/// Queueing algorithm used to enforce the bandwidth rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapingAlgorithm {
    Htb,
    Tbf,
}

impl fmt::Display for ShapingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapingAlgorithm::Htb => write!(f, "htb"),
            ShapingAlgorithm::Tbf => write!(f, "tbf"),
        }
    }
}

impl FromStr for ShapingAlgorithm {
    type Err = TcshapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "htb" => Ok(ShapingAlgorithm::Htb),
            "tbf" => Ok(ShapingAlgorithm::Tbf),
            _ => Err(TcshapeError::invalid(
                "shaping-algo",
                s,
                "expected 'htb' or 'tbf'",
            )),
        }
    }
}

/// Normalized shaping parameters.
///
/// Times are milliseconds, rates bits per second and percentages fractions
/// of one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_bps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_distribution: Option<DelayDistribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrupt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reorder: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ShapingParams {
    pub fn is_empty(&self) -> bool {
        *self == ShapingParams::default()
    }

    /// Overlay `other` on top of `self`; fields set in `other` win.
    pub fn merge(&mut self, other: &ShapingParams) {
        fn overlay<T: Copy>(base: &mut Option<T>, top: Option<T>) {
            if top.is_some() {
                *base = top;
            }
        }
        overlay(&mut self.rate_bps, other.rate_bps);
        overlay(&mut self.delay_ms, other.delay_ms);
        overlay(&mut self.delay_jitter_ms, other.delay_jitter_ms);
        overlay(&mut self.delay_distribution, other.delay_distribution);
        overlay(&mut self.loss, other.loss);
        overlay(&mut self.duplicate, other.duplicate);
        overlay(&mut self.corrupt, other.corrupt);
        overlay(&mut self.reorder, other.reorder);
        overlay(&mut self.limit, other.limit);
    }
}

/// Network/port constraints of a filter. All fields empty means "anywhere".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark: Option<u32>,
}

impl NetworkFilter {
    /// True when the filter constrains nothing.
    pub fn is_anywhere(&self, ip_version: IpVersion) -> bool {
        let net_any = |net: &Option<String>| {
            net.as_deref()
                .is_none_or(|n| network::is_anywhere_network(n, ip_version))
        };
        net_any(&self.dst_network)
            && net_any(&self.src_network)
            && self.dst_port.is_none()
            && self.src_port.is_none()
            && self.mark.is_none()
    }
}

/// One logical shaping rule: qdisc/class/filter chain on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapingRule {
    pub device: String,
    pub ip_version: IpVersion,
    pub direction: Direction,
    pub handle: Handle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_id: Option<String>,
    #[serde(flatten)]
    pub params: ShapingParams,
    pub filter: NetworkFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusion: Option<NetworkFilter>,
}

impl ShapingRule {
    /// A rule with an implicit "anywhere" filter and no parameters yet.
    pub fn new(device: &str, ip_version: IpVersion, direction: Direction, handle: Handle) -> Self {
        Self {
            device: device.to_string(),
            ip_version,
            direction,
            handle,
            filter_id: None,
            params: ShapingParams::default(),
            filter: NetworkFilter::default(),
            exclusion: None,
        }
    }
}

/// Rules of one device keyed by handle, ascending.
pub type DeviceRules = BTreeMap<Handle, ShapingRule>;

/// Device → handle → rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleMapping(BTreeMap<String, DeviceRules>);

impl RuleMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device; devices without rules still appear in the output.
    pub fn insert_device(&mut self, device: &str, rules: DeviceRules) {
        self.0.entry(device.to_string()).or_default().extend(rules);
    }

    pub fn insert(&mut self, rule: ShapingRule) {
        self.0
            .entry(rule.device.clone())
            .or_default()
            .insert(rule.handle, rule);
    }

    pub fn device(&self, device: &str) -> Option<&DeviceRules> {
        self.0.get(device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Total number of rules across all devices.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
