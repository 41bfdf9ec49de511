//! Shaping algorithms.
//!
//! Every algorithm builds the same chain (root qdisc, per-rule class or
//! band, netem, optional rate limiter, filter) but lays it out differently.
//! [`Shaper`] is the capability set; [`shaper_for`] selects the variant.
//! Device, handle and operation are passed in a [`ShaperContext`].

mod htb;
mod tbf;

pub use htb::HtbShaper;
pub use tbf::TbfShaper;

use tcshape_shared::errors::{TcshapeError, TcshapeResult};
use tcshape_shared::network::anywhere_network;
use tcshape_shared::{DeviceRules, Direction, Handle, IpVersion, NetworkFilter, ShapingAlgorithm, ShapingParams};

use crate::capture::ToolCommand;
use crate::commands::{TcCommandBuilder, TcOperation};
use crate::finder::unused_minor;

/// Major of the ingress qdisc (`ffff:`).
pub const INGRESS_MAJOR: u16 = 0xffff;

/// Filter preferences 1-3 hold exclusion filters; primary filters use 5-7.
pub const EXCLUSION_PREF_MAX: u32 = 3;
const PRIMARY_PREF_OFFSET: u32 = 4;

const QDISC_MAJOR_BASE: u16 = 0x1000;
const QDISC_MAJOR_SPAN: u32 = 0x6000;
const CHILD_MAJOR_OFFSET: u16 = 0x800;

/// Highest rule minor; keeps derived netem/tbf majors below `0x9000`.
pub const MAX_RULE_MINOR: u16 = 0x7ff;

/// Stable qdisc major of a device (FNV-1a of the name).
pub fn qdisc_major(device: &str) -> u16 {
    let hash = device.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    QDISC_MAJOR_BASE + (hash % QDISC_MAJOR_SPAN) as u16
}

/// Name of the ifb device receiving redirected ingress traffic of `device`.
pub fn ifb_device_name(device: &str) -> String {
    format!("ifb{}", qdisc_major(device))
}

/// tc filter preference for a protocol.
pub fn filter_pref(ip_version: IpVersion, exclusion: bool) -> u32 {
    let base = match ip_version {
        IpVersion::V4 => 1,
        IpVersion::V6 => 2,
    };
    if exclusion {
        base
    } else {
        base + PRIMARY_PREF_OFFSET
    }
}

/// Everything a shaper needs to know about the rule being written.
#[derive(Debug, Clone)]
pub struct ShaperContext {
    pub tc_program: String,
    /// Device carrying the qdiscs: the interface itself for outgoing
    /// traffic, its ifb device for incoming traffic.
    pub device: String,
    pub qdisc_major: u16,
    pub minor: u16,
    pub ip_version: IpVersion,
    pub direction: Direction,
    pub operation: TcOperation,
    pub upper_limit_bps: u64,
}

impl ShaperContext {
    pub fn root_handle(&self) -> Handle {
        Handle::new(self.qdisc_major, 0)
    }

    pub fn class_handle(&self) -> Handle {
        Handle::new(self.qdisc_major, self.minor)
    }

    pub fn netem_handle(&self) -> Handle {
        Handle::new(
            self.qdisc_major
                .wrapping_add(CHILD_MAJOR_OFFSET)
                .wrapping_add(self.minor),
            0,
        )
    }

    pub fn tbf_handle(&self) -> Handle {
        Handle::new(
            self.netem_handle().major.wrapping_add(CHILD_MAJOR_OFFSET),
            0,
        )
    }

    pub fn is_change(&self) -> bool {
        self.operation == TcOperation::Change
    }

    fn qdisc(&self) -> TcCommandBuilder {
        TcCommandBuilder::qdisc(&self.tc_program)
            .operation(self.operation)
            .device(&self.device)
    }

    fn class(&self) -> TcCommandBuilder {
        TcCommandBuilder::class(&self.tc_program)
            .operation(self.operation)
            .device(&self.device)
    }
}

/// One shaping algorithm.
pub trait Shaper {
    fn algorithm(&self) -> ShapingAlgorithm;

    /// Handle for a new rule under `qdisc_major`, avoiding existing rules.
    fn compute_handle(&self, existing: &DeviceRules, qdisc_major: u16) -> TcshapeResult<Handle>;

    /// Root qdisc plus the class or band of the rule.
    fn build_queue_commands(
        &self,
        ctx: &ShaperContext,
        params: &ShapingParams,
    ) -> TcshapeResult<Vec<ToolCommand>>;

    fn build_netem_command(
        &self,
        ctx: &ShaperContext,
        params: &ShapingParams,
    ) -> TcshapeResult<Option<ToolCommand>>;

    fn build_rate_commands(
        &self,
        ctx: &ShaperContext,
        params: &ShapingParams,
    ) -> TcshapeResult<Vec<ToolCommand>>;
}

pub fn shaper_for(algorithm: ShapingAlgorithm) -> Box<dyn Shaper> {
    match algorithm {
        ShapingAlgorithm::Htb => Box::new(HtbShaper),
        ShapingAlgorithm::Tbf => Box::new(TbfShaper),
    }
}

/// Token bucket size: ten milliseconds worth of traffic, at least one MTU.
pub(crate) fn burst_bytes(rate_bps: u64) -> u64 {
    (rate_bps / 800).max(1600)
}

pub(crate) fn first_free_minor(existing: &DeviceRules, qdisc_major: u16, start: u16, max: u16) -> TcshapeResult<Handle> {
    let minor = unused_minor(existing, qdisc_major, start);
    if minor > max {
        return Err(TcshapeError::invalid(
            "handle",
            format!("{:x}:{:x}", qdisc_major, minor),
            format!("no free class below {:x}:{:x}", qdisc_major, max),
        ));
    }
    Ok(Handle::new(qdisc_major, minor))
}

/// u32 classification filter sending `filter` matches to the rule's class.
pub fn build_filter_command(
    ctx: &ShaperContext,
    filter: &NetworkFilter,
    exclusion: bool,
) -> TcshapeResult<ToolCommand> {
    let selector = ctx.ip_version.match_selector();
    let mut args: Vec<String> = Vec::new();
    let mut add_match = |field: &str, value: String, mask: Option<&str>| {
        args.extend(["match".to_string(), selector.to_string(), field.to_string(), value]);
        if let Some(mask) = mask {
            args.push(mask.to_string());
        }
    };

    match (&filter.dst_network, &filter.src_network) {
        (Some(dst), _) => add_match("dst", dst.clone(), None),
        (None, None) => add_match("dst", anywhere_network(ctx.ip_version).to_string(), None),
        (None, Some(_)) => {}
    }
    if let Some(src) = &filter.src_network {
        add_match("src", src.clone(), None);
    }
    if let Some(port) = filter.src_port {
        add_match("sport", port.to_string(), Some("0xffff"));
    }
    if let Some(port) = filter.dst_port {
        add_match("dport", port.to_string(), Some("0xffff"));
    }
    args.extend(["flowid".to_string(), ctx.class_handle().to_string()]);

    TcCommandBuilder::filter(&ctx.tc_program)
        .device(&ctx.device)
        .parent(ctx.root_handle())
        .protocol(ctx.ip_version)
        .pref(filter_pref(ctx.ip_version, exclusion))
        .kind("u32")
        .args(args)
        .build()
}

/// fw filter classifying packets carrying an iptables mark.
pub fn build_mark_filter_command(ctx: &ShaperContext, mark: u32) -> TcshapeResult<ToolCommand> {
    TcCommandBuilder::filter(&ctx.tc_program)
        .device(&ctx.device)
        .parent(ctx.root_handle())
        .protocol(ctx.ip_version)
        .pref(filter_pref(ctx.ip_version, false))
        .filter_handle(mark.to_string())
        .kind("fw")
        .args(["flowid".to_string(), ctx.class_handle().to_string()])
        .build()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn context(operation: TcOperation) -> ShaperContext {
        ShaperContext {
            tc_program: "tc".to_string(),
            device: "eth0".to_string(),
            qdisc_major: 0x1a1a,
            minor: 2,
            ip_version: IpVersion::V4,
            direction: Direction::Outgoing,
            operation,
            upper_limit_bps: 1_000_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;

    #[test]
    fn test_qdisc_major_is_stable_and_bounded() {
        let major = qdisc_major("eth0");
        assert_eq!(major, qdisc_major("eth0"));
        assert_ne!(major, qdisc_major(&ifb_device_name("eth0")));
        for device in ["lo", "eth0", "enp3s0", "wlp2s0", "ifb4660", "veth1234567"] {
            let major = qdisc_major(device);
            assert!((0x1000..0x7000).contains(&major), "{} -> {:x}", device, major);
        }
        assert_eq!(ifb_device_name("eth0"), format!("ifb{}", qdisc_major("eth0")));
    }

    #[test]
    fn test_derived_handles() {
        let ctx = context(TcOperation::Add);
        assert_eq!(ctx.root_handle().to_string(), "1a1a:");
        assert_eq!(ctx.class_handle().to_string(), "1a1a:2");
        assert_eq!(ctx.netem_handle().to_string(), "221c:");
        assert_eq!(ctx.tbf_handle().to_string(), "2a1c:");
    }

    #[test]
    fn test_filter_prefs() {
        assert_eq!(filter_pref(IpVersion::V4, false), 5);
        assert_eq!(filter_pref(IpVersion::V6, false), 6);
        assert_eq!(filter_pref(IpVersion::V4, true), 1);
        assert!(filter_pref(IpVersion::V6, true) <= EXCLUSION_PREF_MAX);
    }

    #[test]
    fn test_filter_commands() {
        let ctx = context(TcOperation::Add);
        let filter = NetworkFilter {
            dst_network: Some("192.168.0.0/24".to_string()),
            dst_port: Some(80),
            ..Default::default()
        };
        assert_eq!(
            build_filter_command(&ctx, &filter, false).unwrap().to_string(),
            "tc filter add dev eth0 parent 1a1a: protocol ip prio 5 u32 match ip dst 192.168.0.0/24 match ip dport 80 0xffff flowid 1a1a:2"
        );
        assert_eq!(
            build_filter_command(&ctx, &NetworkFilter::default(), false)
                .unwrap()
                .to_string(),
            "tc filter add dev eth0 parent 1a1a: protocol ip prio 5 u32 match ip dst 0.0.0.0/0 flowid 1a1a:2"
        );
        let src_only = NetworkFilter {
            src_network: Some("10.0.0.0/8".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_filter_command(&ctx, &src_only, true).unwrap().to_string(),
            "tc filter add dev eth0 parent 1a1a: protocol ip prio 1 u32 match ip src 10.0.0.0/8 flowid 1a1a:2"
        );
        assert_eq!(
            build_mark_filter_command(&ctx, 101).unwrap().to_string(),
            "tc filter add dev eth0 parent 1a1a: protocol ip prio 5 handle 101 fw flowid 1a1a:2"
        );
    }

    #[test]
    fn test_burst_has_a_floor() {
        assert_eq!(burst_bytes(100_000), 1600);
        assert_eq!(burst_bytes(100_000_000), 125_000);
    }
}
