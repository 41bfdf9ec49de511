//! Network literal normalization.
//!
//! Rules are matched by comparing normalized strings, so every network that
//! enters the system (user input or decoded u32 matches) goes through
//! [`sanitize_network`] first.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::IpVersion;
use crate::errors::{TcshapeError, TcshapeResult};

pub const IPV4_ANYWHERE: &str = "0.0.0.0/0";
pub const IPV6_ANYWHERE: &str = "::/0";

/// The "match everything" network for an IP version.
pub fn anywhere_network(ip_version: IpVersion) -> &'static str {
    match ip_version {
        IpVersion::V4 => IPV4_ANYWHERE,
        IpVersion::V6 => IPV6_ANYWHERE,
    }
}

pub fn is_anywhere_network(network: &str, ip_version: IpVersion) -> bool {
    let network = network.trim();
    match ip_version {
        IpVersion::V4 => network == IPV4_ANYWHERE,
        IpVersion::V6 => network == IPV6_ANYWHERE || network == "0:0:0:0:0:0:0:0/0",
    }
}

/// Normalize a network string.
///
/// * empty or `anywhere` → the anywhere network of `ip_version`
/// * a bare address → a host network (`/32` or `/128`)
/// * a CIDR → its compressed network form with host bits cleared
pub fn sanitize_network(network: Option<&str>, ip_version: IpVersion) -> TcshapeResult<String> {
    let network = match network.map(str::trim) {
        None | Some("") => return Ok(anywhere_network(ip_version).to_string()),
        Some(value) if value.eq_ignore_ascii_case("anywhere") => {
            return Ok(anywhere_network(ip_version).to_string());
        }
        Some(value) => value,
    };

    let parsed: IpNet = match network.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ipv4Net::new(addr, 32)
            .map(IpNet::V4)
            .map_err(|e| TcshapeError::invalid("network", network, e.to_string()))?,
        Ok(IpAddr::V6(addr)) => Ipv6Net::new(addr, 128)
            .map(IpNet::V6)
            .map_err(|e| TcshapeError::invalid("network", network, e.to_string()))?,
        Err(_) => network
            .parse::<IpNet>()
            .map_err(|e| TcshapeError::invalid("network", network, e.to_string()))?,
    };

    match (ip_version, parsed) {
        (IpVersion::V4, IpNet::V4(net)) => Ok(net.trunc().to_string()),
        (IpVersion::V6, IpNet::V6(net)) => Ok(net.trunc().to_string()),
        (IpVersion::V4, IpNet::V6(_)) => Err(TcshapeError::invalid(
            "network",
            network,
            "IPv6 network given without --ipv6",
        )),
        (IpVersion::V6, IpNet::V4(_)) => Err(TcshapeError::invalid(
            "network",
            network,
            "IPv4 network given with --ipv6",
        )),
    }
}

/// Build a network string from an address and a contiguous mask length.
pub fn ipv4_network(addr: Ipv4Addr, prefix_len: u8) -> Option<String> {
    Ipv4Net::new(addr, prefix_len).ok().map(|net| net.trunc().to_string())
}

pub fn ipv6_network(addr: Ipv6Addr, prefix_len: u8) -> Option<String> {
    Ipv6Net::new(addr, prefix_len).ok().map(|net| net.trunc().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anywhere_forms() {
        assert_eq!(sanitize_network(None, IpVersion::V4).unwrap(), "0.0.0.0/0");
        assert_eq!(sanitize_network(Some(""), IpVersion::V6).unwrap(), "::/0");
        assert_eq!(
            sanitize_network(Some("Anywhere"), IpVersion::V4).unwrap(),
            "0.0.0.0/0"
        );
        assert!(is_anywhere_network("0:0:0:0:0:0:0:0/0", IpVersion::V6));
        assert!(is_anywhere_network(" 0.0.0.0/0 ", IpVersion::V4));
        assert!(!is_anywhere_network("10.0.0.0/8", IpVersion::V4));
    }

    #[test]
    fn test_bare_addresses_become_host_networks() {
        assert_eq!(
            sanitize_network(Some("192.168.0.10"), IpVersion::V4).unwrap(),
            "192.168.0.10/32"
        );
        assert_eq!(
            sanitize_network(Some("2001:0db8::0001"), IpVersion::V6).unwrap(),
            "2001:db8::1/128"
        );
    }

    #[test]
    fn test_cidr_is_truncated() {
        assert_eq!(
            sanitize_network(Some("192.168.0.77/24"), IpVersion::V4).unwrap(),
            "192.168.0.0/24"
        );
        assert_eq!(
            sanitize_network(Some("2001:db8:0:0::/32"), IpVersion::V6).unwrap(),
            "2001:db8::/32"
        );
    }

    #[test]
    fn test_invalid_and_mismatched_networks() {
        assert!(sanitize_network(Some("192.168.0.0/33"), IpVersion::V4).is_err());
        assert!(sanitize_network(Some("not-a-network"), IpVersion::V4).is_err());
        assert!(sanitize_network(Some("::1"), IpVersion::V4).is_err());
        assert!(sanitize_network(Some("10.0.0.1"), IpVersion::V6).is_err());
    }

    #[test]
    fn test_network_from_prefix() {
        assert_eq!(
            ipv4_network(Ipv4Addr::new(192, 168, 0, 5), 24).as_deref(),
            Some("192.168.0.0/24")
        );
        assert_eq!(ipv4_network(Ipv4Addr::UNSPECIFIED, 40), None);
    }
}
