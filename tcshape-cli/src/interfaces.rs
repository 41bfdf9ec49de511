//! Network interface enumeration and link speed probing via sysfs.

use std::fs;
use std::io;
use std::path::PathBuf;

use tcshape_shared::errors::{TcshapeError, TcshapeResult};
use tracing::{debug, warn};

use crate::config::ShaperConfig;

/// Host interface queries.
pub trait InterfaceProbe {
    fn list_interfaces(&self) -> TcshapeResult<Vec<String>>;

    /// Link speed in Mbps as reported by the kernel. May be negative.
    fn read_speed_mbps(&self, device: &str) -> io::Result<i64>;
}

/// Reads `/sys/class/net` (or another root, for tests).
#[derive(Debug, Clone)]
pub struct SysfsInterfaces {
    root: PathBuf,
}

impl SysfsInterfaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &ShaperConfig) -> Self {
        Self::new(config.sysfs_net_root.clone())
    }
}

impl InterfaceProbe for SysfsInterfaces {
    fn list_interfaces(&self) -> TcshapeResult<Vec<String>> {
        let mut interfaces = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                interfaces.push(name.to_string());
            }
        }
        interfaces.sort();
        Ok(interfaces)
    }

    fn read_speed_mbps(&self, device: &str) -> io::Result<i64> {
        let raw = fs::read_to_string(self.root.join(device).join("speed"))?;
        raw.trim()
            .parse::<i64>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Fail with `NetworkInterfaceNotFound` unless `device` exists on the host.
pub fn verify_network_interface(probe: &dyn InterfaceProbe, device: &str) -> TcshapeResult<()> {
    if probe.list_interfaces()?.iter().any(|name| name == device) {
        Ok(())
    } else {
        Err(TcshapeError::NetworkInterfaceNotFound {
            device: device.to_string(),
        })
    }
}

/// Bandwidth ceiling of `device` in bits per second.
///
/// Virtual interfaces commonly have no readable speed or report `-1`; both
/// fall back to the iproute2 upper bound. A reported `0` is taken as is.
pub fn upper_limit_rate(probe: &dyn InterfaceProbe, device: &str, config: &ShaperConfig) -> u64 {
    let fallback = config.upper_limit_fallback_bps;
    match probe.read_speed_mbps(device) {
        Ok(speed) if speed >= 0 => (speed as u64).saturating_mul(1_000_000).min(fallback),
        Ok(speed) => {
            debug!("{} reports speed {}, using upper bound", device, speed);
            fallback
        }
        Err(e) => {
            warn!("cannot read speed of {}: {}", device, e);
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sysfs(devices: &[(&str, Option<&str>)]) -> (TempDir, SysfsInterfaces) {
        let dir = tempfile::tempdir().unwrap();
        for (name, speed) in devices {
            let path = dir.path().join(name);
            fs::create_dir(&path).unwrap();
            if let Some(speed) = speed {
                fs::write(path.join("speed"), format!("{}\n", speed)).unwrap();
            }
        }
        let probe = SysfsInterfaces::new(dir.path());
        (dir, probe)
    }

    #[test]
    fn test_list_and_verify() {
        let (_dir, probe) = sysfs(&[("lo", None), ("eth0", Some("1000"))]);
        assert_eq!(probe.list_interfaces().unwrap(), vec!["eth0", "lo"]);
        assert!(verify_network_interface(&probe, "eth0").is_ok());
        assert!(matches!(
            verify_network_interface(&probe, "bogus0"),
            Err(TcshapeError::NetworkInterfaceNotFound { device }) if device == "bogus0"
        ));
    }

    #[test]
    fn test_upper_limit_from_speed() {
        let (_dir, probe) = sysfs(&[("eth0", Some("1000")), ("veth0", Some("-1")), ("lo", None)]);
        let config = ShaperConfig::default();
        assert_eq!(upper_limit_rate(&probe, "eth0", &config), 1_000_000_000);
        assert_eq!(upper_limit_rate(&probe, "veth0", &config), 32_000_000_000);
        assert_eq!(upper_limit_rate(&probe, "lo", &config), 32_000_000_000);
    }

    #[test]
    fn test_zero_speed_is_not_a_fallback() {
        let (_dir, probe) = sysfs(&[("eth0", Some("0"))]);
        assert_eq!(upper_limit_rate(&probe, "eth0", &ShaperConfig::default()), 0);
    }

    #[test]
    fn test_upper_limit_is_capped() {
        let (_dir, probe) = sysfs(&[("eth0", Some("100000"))]);
        let config = ShaperConfig {
            upper_limit_fallback_bps: 40_000_000_000,
            ..Default::default()
        };
        assert_eq!(upper_limit_rate(&probe, "eth0", &config), 40_000_000_000);
        assert_eq!(upper_limit_rate(&probe, "eth0", &ShaperConfig::default()), 32_000_000_000);
    }

    #[test]
    fn test_missing_root_is_io_error() {
        let probe = SysfsInterfaces::new("/nonexistent/sys/class/net");
        assert!(matches!(probe.list_interfaces(), Err(TcshapeError::Io(_))));
    }
}
