//! Lookup of an existing rule to reuse its handle.

use tcshape_shared::errors::TcshapeResult;
use tcshape_shared::network::sanitize_network;
use tcshape_shared::{DeviceRules, Direction, IpVersion, NetworkFilter, ShapingRule};

/// Requested filter attributes, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleQuery {
    pub direction: Direction,
    pub ip_version: IpVersion,
    pub dst_network: String,
    pub src_network: String,
    pub dst_port: Option<u16>,
    pub src_port: Option<u16>,
}

impl RuleQuery {
    pub fn new(direction: Direction, ip_version: IpVersion, filter: &NetworkFilter) -> TcshapeResult<Self> {
        Ok(Self {
            direction,
            ip_version,
            dst_network: sanitize_network(filter.dst_network.as_deref(), ip_version)?,
            src_network: sanitize_network(filter.src_network.as_deref(), ip_version)?,
            dst_port: filter.dst_port,
            src_port: filter.src_port,
        })
    }

    /// Rules classified by an iptables mark never match: their networks
    /// live in the mangle table, not in the tc filter.
    pub fn matches(&self, rule: &ShapingRule) -> bool {
        if rule.filter.mark.is_some() {
            return false;
        }
        let same_network = |network: &Option<String>, wanted: &str| {
            sanitize_network(network.as_deref(), self.ip_version).is_ok_and(|n| n == wanted)
        };
        rule.direction == self.direction
            && rule.ip_version == self.ip_version
            && same_network(&rule.filter.dst_network, &self.dst_network)
            && same_network(&rule.filter.src_network, &self.src_network)
            && rule.filter.dst_port == self.dst_port
            && rule.filter.src_port == self.src_port
    }
}

/// First rule (ascending handle) whose filter matches the query.
pub fn find_rule<'a>(rules: &'a DeviceRules, query: &RuleQuery) -> Option<&'a ShapingRule> {
    rules.values().find(|rule| query.matches(rule))
}

/// Smallest minor `>= start` not used by a rule under `major`.
pub fn unused_minor(rules: &DeviceRules, major: u16, start: u16) -> u16 {
    let mut minor = start;
    for handle in rules.keys().filter(|h| h.major == major && h.minor >= start) {
        if handle.minor == minor {
            minor = minor.saturating_add(1);
        } else if handle.minor > minor {
            break;
        }
    }
    minor
}
