//! TC command builder with validation.
//!
//! Produces [`ToolCommand`] lines of the form
//! `tc <object> <operation> dev <device> [target] [handle|classid] [kind args...]`.

use std::fmt;

use tcshape_shared::errors::{TcshapeError, TcshapeResult};
use tcshape_shared::units::{format_ms, format_percent};
use tcshape_shared::{Handle, IpVersion, ShapingParams};

use crate::capture::ToolCommand;

/// Traffic control object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcObject {
    Qdisc,
    Class,
    Filter,
}

impl fmt::Display for TcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcObject::Qdisc => write!(f, "qdisc"),
            TcObject::Class => write!(f, "class"),
            TcObject::Filter => write!(f, "filter"),
        }
    }
}

/// TC command operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcOperation {
    Add,
    Change,
    Delete,
}

impl fmt::Display for TcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcOperation::Add => write!(f, "add"),
            TcOperation::Change => write!(f, "change"),
            TcOperation::Delete => write!(f, "del"),
        }
    }
}

/// Where the object is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcTarget {
    Root,
    Ingress,
    Parent(Handle),
}

impl fmt::Display for TcTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcTarget::Root => write!(f, "root"),
            TcTarget::Ingress => write!(f, "ingress"),
            TcTarget::Parent(parent) => write!(f, "parent {}", parent),
        }
    }
}

/// Qdisc or class kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QdiscType {
    Netem,
    Tbf,
    Htb,
    Prio,
    Ingress,
}

impl fmt::Display for QdiscType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdiscType::Netem => write!(f, "netem"),
            QdiscType::Tbf => write!(f, "tbf"),
            QdiscType::Htb => write!(f, "htb"),
            QdiscType::Prio => write!(f, "prio"),
            QdiscType::Ingress => write!(f, "ingress"),
        }
    }
}

/// Netem sub-options rendered for the command line.
///
/// The bandwidth rate is never part of it: htb enforces the rate in the
/// class and tbf in its own qdisc.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetemArgs(Vec<String>);

impl NetemArgs {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_args(self) -> Vec<String> {
        self.0
    }
}

impl From<&ShapingParams> for NetemArgs {
    fn from(params: &ShapingParams) -> Self {
        let mut args = Vec::new();

        if let Some(limit) = params.limit {
            args.extend(["limit".to_string(), limit.to_string()]);
        }
        if let Some(delay) = params.delay_ms {
            args.extend(["delay".to_string(), format_ms(delay)]);
            if let Some(jitter) = params.delay_jitter_ms.filter(|j| *j > 0.0) {
                args.push(format_ms(jitter));
                if let Some(distribution) = params.delay_distribution {
                    args.push("distribution".to_string());
                    args.push(distribution.to_string());
                }
            }
        }
        for (key, value) in [
            ("loss", params.loss),
            ("duplicate", params.duplicate),
            ("corrupt", params.corrupt),
            ("reorder", params.reorder),
        ] {
            if let Some(value) = value.filter(|v| *v > 0.0) {
                args.extend([key.to_string(), format_percent(value)]);
            }
        }
        NetemArgs(args)
    }
}

/// Builder for one `tc` invocation.
#[derive(Debug, Clone)]
pub struct TcCommandBuilder {
    program: String,
    object: Option<TcObject>,
    operation: TcOperation,
    device: Option<String>,
    target: Option<TcTarget>,
    handle: Option<String>,
    classid: Option<Handle>,
    protocol: Option<IpVersion>,
    pref: Option<u32>,
    kind: Option<String>,
    args: Vec<String>,
}

impl TcCommandBuilder {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            object: None,
            operation: TcOperation::Add,
            device: None,
            target: None,
            handle: None,
            classid: None,
            protocol: None,
            pref: None,
            kind: None,
            args: Vec::new(),
        }
    }

    pub fn qdisc(program: &str) -> Self {
        Self::new(program).object(TcObject::Qdisc)
    }

    pub fn class(program: &str) -> Self {
        Self::new(program).object(TcObject::Class)
    }

    pub fn filter(program: &str) -> Self {
        Self::new(program).object(TcObject::Filter)
    }

    pub fn object(mut self, object: TcObject) -> Self {
        self.object = Some(object);
        self
    }

    /// Set the TC operation
    pub fn operation(mut self, op: TcOperation) -> Self {
        self.operation = op;
        self
    }

    /// Set the target device
    pub fn device<S: Into<String>>(mut self, device: S) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn target(mut self, target: TcTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn parent(self, parent: Handle) -> Self {
        self.target(TcTarget::Parent(parent))
    }

    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle.to_string());
        self
    }

    /// Filter handles are not `major:minor` pairs (`800::800`, fw mark `101`).
    pub fn filter_handle<S: Into<String>>(mut self, handle: S) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn classid(mut self, classid: Handle) -> Self {
        self.classid = Some(classid);
        self
    }

    pub fn protocol(mut self, ip_version: IpVersion) -> Self {
        self.protocol = Some(ip_version);
        self
    }

    pub fn pref(mut self, pref: u32) -> Self {
        self.pref = Some(pref);
        self
    }

    pub fn kind<S: fmt::Display>(mut self, kind: S) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build and validate the command
    pub fn build(self) -> TcshapeResult<ToolCommand> {
        let object = self
            .object
            .ok_or_else(|| TcshapeError::invalid("tc object", "", "qdisc, class or filter must be specified"))?;
        let device = self
            .device
            .filter(|d| !d.is_empty())
            .ok_or_else(|| TcshapeError::invalid("device", "", "device interface must be specified"))?;

        if matches!(self.operation, TcOperation::Add | TcOperation::Change)
            && self.kind.is_none()
        {
            return Err(TcshapeError::invalid(
                "tc kind",
                format!("{} {}", object, self.operation),
                "a kind is required to create or change an object",
            ));
        }

        let mut command = ToolCommand::new(self.program)
            .arg(object.to_string())
            .arg(self.operation.to_string())
            .args(["dev".to_string(), device]);

        if let Some(target) = self.target {
            command = match target {
                TcTarget::Parent(parent) => command.args(["parent".to_string(), parent.to_string()]),
                other => command.arg(other.to_string()),
            };
        }
        if let Some(protocol) = self.protocol {
            command = command.args(["protocol", protocol.tc_protocol()]);
        }
        if let Some(pref) = self.pref {
            command = command.args(["prio".to_string(), pref.to_string()]);
        }
        if let Some(handle) = self.handle {
            command = command.args(["handle".to_string(), handle]);
        }
        if let Some(classid) = self.classid {
            command = command.args(["classid".to_string(), classid.to_string()]);
        }
        if let Some(kind) = self.kind {
            command = command.arg(kind);
        }
        Ok(command.args(self.args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcshape_shared::DelayDistribution;

    #[test]
    fn test_root_qdisc_command() {
        let cmd = TcCommandBuilder::qdisc("tc")
            .device("eth0")
            .target(TcTarget::Root)
            .handle(Handle::new(0x1a1a, 0))
            .kind(QdiscType::Htb)
            .args(["default", "1"])
            .build()
            .unwrap();
        assert_eq!(cmd.to_string(), "tc qdisc add dev eth0 root handle 1a1a: htb default 1");
    }

    #[test]
    fn test_filter_command() {
        let cmd = TcCommandBuilder::filter("tc")
            .device("eth0")
            .parent(Handle::new(0x1a1a, 0))
            .protocol(IpVersion::V6)
            .pref(6)
            .kind("u32")
            .args(["match", "ip6", "dst", "2001:db8::/32", "flowid", "1a1a:2"])
            .build()
            .unwrap();
        assert_eq!(
            cmd.to_string(),
            "tc filter add dev eth0 parent 1a1a: protocol ipv6 prio 6 u32 match ip6 dst 2001:db8::/32 flowid 1a1a:2"
        );
    }

    #[test]
    fn test_delete_needs_no_kind() {
        let cmd = TcCommandBuilder::qdisc("/sbin/tc")
            .operation(TcOperation::Delete)
            .device("eth0")
            .target(TcTarget::Ingress)
            .build()
            .unwrap();
        assert_eq!(cmd.to_string(), "/sbin/tc qdisc del dev eth0 ingress");
    }

    #[test]
    fn test_filter_handles() {
        let cmd = TcCommandBuilder::filter("tc")
            .operation(TcOperation::Delete)
            .device("eth0")
            .parent(Handle::new(0x1a1a, 0))
            .protocol(IpVersion::V4)
            .pref(5)
            .filter_handle("800::800")
            .kind("u32")
            .build()
            .unwrap();
        assert_eq!(
            cmd.to_string(),
            "tc filter del dev eth0 parent 1a1a: protocol ip prio 5 handle 800::800 u32"
        );

        let cmd = TcCommandBuilder::filter("tc")
            .device("eth0")
            .parent(Handle::new(0x1a1a, 0))
            .protocol(IpVersion::V4)
            .pref(5)
            .filter_handle("101")
            .kind("fw")
            .args(["flowid", "1a1a:2"])
            .build()
            .unwrap();
        assert_eq!(
            cmd.to_string(),
            "tc filter add dev eth0 parent 1a1a: protocol ip prio 5 handle 101 fw flowid 1a1a:2"
        );
    }

    #[test]
    fn test_validation() {
        assert!(TcCommandBuilder::qdisc("tc").kind("netem").build().is_err());
        assert!(TcCommandBuilder::new("tc").device("eth0").kind("netem").build().is_err());
        assert!(TcCommandBuilder::qdisc("tc").device("eth0").build().is_err());
        assert!(TcCommandBuilder::qdisc("tc").device("").kind("netem").build().is_err());
    }

    #[test]
    fn test_netem_args() {
        let params = ShapingParams {
            rate_bps: Some(1_000_000),
            delay_ms: Some(100.0),
            delay_jitter_ms: Some(10.0),
            delay_distribution: Some(DelayDistribution::Normal),
            loss: Some(0.001),
            corrupt: Some(0.0),
            reorder: Some(0.25),
            limit: Some(1000),
            ..Default::default()
        };
        let args = NetemArgs::from(&params).into_args().join(" ");
        assert_eq!(
            args,
            "limit 1000 delay 100ms 10ms distribution normal loss 0.1% reorder 25%"
        );
        assert!(NetemArgs::from(&ShapingParams::default()).is_empty());
    }
}
