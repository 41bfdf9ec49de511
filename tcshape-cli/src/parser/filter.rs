//! `tc filter show` parsing.
//!
//! A filter spans a header line plus indented continuation lines:
//!
//! ```text
//! filter parent 1a1a: protocol ip pref 5 u32 chain 0
//! filter parent 1a1a: protocol ip pref 5 u32 chain 0 fh 800: ht divisor 1
//! filter parent 1a1a: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1a1a:2 not_in_hw
//!   match c0a80000/ffffff00 at 16
//!   match 00000050/0000ffff at 20
//! filter parent 1a1a: protocol ip pref 5 fw chain 0 handle 0x65 classid 1a1a:2
//! ```
//!
//! Header lines without a `flowid`/`classid` describe hash tables, not
//! classification rules, and are skipped.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use tcshape_shared::network::{ipv4_network, ipv6_network};
use tcshape_shared::{Handle, IpVersion, NetworkFilter};
use tracing::debug;

use super::tokens::Tokens;
use super::{FilterRecord, RawRecord, U32Match};

static REDIRECT_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Redirect to device ([^)\s]+)\)").ok());

const IPV4_SRC_OFFSET: u32 = 12;
const IPV4_DST_OFFSET: u32 = 16;
const IPV4_PORT_OFFSET: u32 = 20;
const IPV6_SRC_OFFSET: u32 = 8;
const IPV6_DST_OFFSET: u32 = 24;
const IPV6_PORT_OFFSET: u32 = 40;

pub fn parse_filter_records(text: &str) -> Vec<FilterRecord> {
    let mut records = Vec::new();
    let mut current: Option<FilterRecord> = None;

    for line in text.lines() {
        let tokens = Tokens::new(line);
        match tokens.nth(0) {
            Some("filter") => {
                records.extend(current.take());
                current = parse_filter_header(&tokens);
            }
            Some("match") => {
                if let (Some(record), Some(m)) = (current.as_mut(), parse_match(&tokens)) {
                    record.matches.push(m);
                }
            }
            _ => {}
        }
    }
    records.extend(current);
    records
}

pub fn parse_filters(text: &str) -> Vec<RawRecord> {
    parse_filter_records(text)
        .into_iter()
        .map(RawRecord::Filter)
        .collect()
}

fn parse_filter_header(tokens: &Tokens<'_>) -> Option<FilterRecord> {
    let flow_id = tokens
        .value_after("flowid")
        .or_else(|| tokens.value_after("classid"))?;
    let flow_id: Handle = match flow_id.parse() {
        Ok(handle) => handle,
        Err(_) => {
            debug!("Skipping filter with unparsable flow id '{}'", flow_id);
            return None;
        }
    };

    let parent = tokens.value_after("parent")?.parse().ok()?;
    let protocol = tokens.value_after("protocol").unwrap_or("all").to_string();
    let pref_values = tokens.values_after("pref", 2);
    let pref = pref_values.first().and_then(|p| p.parse().ok()).unwrap_or(0);
    let kind = pref_values.get(1).copied().unwrap_or("u32").to_string();

    let (filter_id, mark) = if kind == "fw" {
        let handle = tokens.value_after("handle");
        let mark = handle.and_then(|h| u32::from_str_radix(h.trim_start_matches("0x"), 16).ok());
        (handle.map(str::to_string), mark)
    } else {
        (tokens.value_after("fh").map(str::to_string), None)
    };

    Some(FilterRecord {
        protocol,
        parent,
        pref,
        kind,
        filter_id,
        flow_id,
        matches: Vec::new(),
        mark,
    })
}

fn parse_match(tokens: &Tokens<'_>) -> Option<U32Match> {
    let (value, mask) = tokens.nth(1)?.split_once('/')?;
    let offset = tokens.value_after("at")?.parse().ok()?;
    Some(U32Match {
        value: u32::from_str_radix(value, 16).ok()?,
        mask: u32::from_str_radix(mask, 16).ok()?,
        offset,
    })
}

/// Interface names of `mirred ... Redirect to device <ifb>` actions.
pub fn parse_redirect_devices(text: &str) -> Vec<String> {
    let Some(pattern) = REDIRECT_PATTERN.as_ref() else {
        return Vec::new();
    };
    let mut devices: Vec<String> = pattern
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect();
    devices.dedup();
    devices
}

impl FilterRecord {
    pub fn ip_version(&self) -> Option<IpVersion> {
        IpVersion::from_tc_protocol(&self.protocol)
    }

    /// Decode u32 matches (or the fw mark) into network/port constraints.
    pub fn network_filter(&self) -> NetworkFilter {
        let mut filter = NetworkFilter {
            mark: self.mark,
            ..Default::default()
        };

        match self.ip_version() {
            Some(IpVersion::V4) => {
                filter.src_network = self.ipv4_network_at(IPV4_SRC_OFFSET);
                filter.dst_network = self.ipv4_network_at(IPV4_DST_OFFSET);
                self.decode_ports(IPV4_PORT_OFFSET, &mut filter);
            }
            Some(IpVersion::V6) => {
                filter.src_network = self.ipv6_network_at(IPV6_SRC_OFFSET);
                filter.dst_network = self.ipv6_network_at(IPV6_DST_OFFSET);
                self.decode_ports(IPV6_PORT_OFFSET, &mut filter);
            }
            None => {}
        }
        filter
    }

    fn match_at(&self, offset: u32) -> Option<&U32Match> {
        self.matches.iter().find(|m| m.offset == offset)
    }

    fn ipv4_network_at(&self, offset: u32) -> Option<String> {
        let m = self.match_at(offset)?;
        ipv4_network(Ipv4Addr::from(m.value), m.mask.count_ones() as u8)
    }

    /// IPv6 addresses span four consecutive 32-bit words.
    fn ipv6_network_at(&self, base: u32) -> Option<String> {
        let mut value: u128 = 0;
        let mut mask: u128 = 0;
        let mut found = false;
        for word in 0..4u32 {
            if let Some(m) = self.match_at(base + word * 4) {
                let shift = 96 - word * 32;
                value |= u128::from(m.value) << shift;
                mask |= u128::from(m.mask) << shift;
                found = true;
            }
        }
        if !found {
            return None;
        }
        ipv6_network(Ipv6Addr::from(value), mask.count_ones() as u8)
    }

    /// Source port in the high half-word, destination port in the low one.
    fn decode_ports(&self, offset: u32, filter: &mut NetworkFilter) {
        let Some(m) = self.match_at(offset) else {
            return;
        };
        if m.mask >> 16 == 0xffff {
            filter.src_port = Some((m.value >> 16) as u16);
        }
        if m.mask & 0xffff == 0xffff {
            filter.dst_port = Some((m.value & 0xffff) as u16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPV4_LISTING: &str = "\
filter parent 1a1a: protocol ip pref 1 u32 chain 0
filter parent 1a1a: protocol ip pref 1 u32 chain 0 fh 801: ht divisor 1
filter parent 1a1a: protocol ip pref 1 u32 chain 0 fh 801::800 order 2048 key ht 801 bkt 0 flowid 1a1a:2 not_in_hw
  match c0a80010/fffffff0 at 16
filter parent 1a1a: protocol ip pref 5 u32 chain 0
filter parent 1a1a: protocol ip pref 5 u32 chain 0 fh 800: ht divisor 1
filter parent 1a1a: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1a1a:2 not_in_hw
  match c0a80000/ffffff00 at 16
  match 0a000001/ffffffff at 12
  match 1f900050/ffffffff at 20
";

    #[test]
    fn test_header_lines_without_flowid_are_skipped() {
        let records = parse_filter_records(IPV4_LISTING);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].pref, 1);
        assert_eq!(records[1].pref, 5);
        assert_eq!(records[1].kind, "u32");
        assert_eq!(records[1].filter_id.as_deref(), Some("800::800"));
        assert_eq!(records[1].flow_id, Handle::new(0x1a1a, 2));
        assert_eq!(records[1].parent, Handle::new(0x1a1a, 0));
        assert_eq!(records[1].matches.len(), 3);
    }

    #[test]
    fn test_decode_ipv4_matches() {
        let records = parse_filter_records(IPV4_LISTING);
        let filter = records[1].network_filter();
        assert_eq!(filter.dst_network.as_deref(), Some("192.168.0.0/24"));
        assert_eq!(filter.src_network.as_deref(), Some("10.0.0.1/32"));
        assert_eq!(filter.src_port, Some(8080));
        assert_eq!(filter.dst_port, Some(80));

        let exclusion = records[0].network_filter();
        assert_eq!(exclusion.dst_network.as_deref(), Some("192.168.0.16/28"));
        assert_eq!(exclusion.src_port, None);
    }

    #[test]
    fn test_decode_dst_port_only() {
        let text = "\
filter parent 1a1a: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1a1a:3
  match 000001bb/0000ffff at 20
";
        let filter = parse_filter_records(text)[0].network_filter();
        assert_eq!(filter.dst_port, Some(443));
        assert_eq!(filter.src_port, None);
        assert_eq!(filter.dst_network, None);
    }

    #[test]
    fn test_decode_ipv6_matches() {
        let text = "\
filter parent 1a1a: protocol ipv6 pref 6 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1a1a:2 not_in_hw
  match 20010db8/ffffffff at 24
  match 00000000/ffff0000 at 28
";
        let records = parse_filter_records(text);
        assert_eq!(records[0].ip_version(), Some(IpVersion::V6));
        let filter = records[0].network_filter();
        assert_eq!(filter.dst_network.as_deref(), Some("2001:db8::/48"));
        assert_eq!(filter.src_network, None);
    }

    #[test]
    fn test_fw_filter_mark() {
        let text = "filter parent 1a1a: protocol ip pref 5 fw chain 0 handle 0x65 classid 1a1a:2\n";
        let records = parse_filter_records(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, "fw");
        assert_eq!(records[0].mark, Some(101));
        assert_eq!(records[0].filter_id.as_deref(), Some("0x65"));
        assert_eq!(records[0].network_filter().mark, Some(101));
    }

    #[test]
    fn test_redirect_devices() {
        let text = "\
filter parent ffff: protocol ip pref 49152 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1a1a: not_in_hw
  match 00000000/00000000 at 0
\taction order 1: mirred (Egress Redirect to device ifb6714) stolen
\tindex 1 ref 1 bind 1
";
        assert_eq!(parse_redirect_devices(text), vec!["ifb6714".to_string()]);
        assert!(parse_redirect_devices("").is_empty());
    }
}
