//! Installation of one shaping rule.
//!
//! Everything that can be checked without an external tool is checked
//! before the first command runs. The command order is fixed:
//!
//! 1. incoming only: `modprobe ifb`, ifb link add/up, ingress qdisc and the
//!    redirect filter
//! 2. root qdisc, class or band
//! 3. netem
//! 4. rate limiter
//! 5. filter, exclusion filter
//! 6. iptables mark rule
//!
//! A chain interrupted half way is left as is; `del --all` resets it.

use tcshape_shared::errors::{TcshapeError, TcshapeResult};
use tcshape_shared::network::{is_anywhere_network, sanitize_network};
use tcshape_shared::units::format_rate;
use tcshape_shared::{
    DeviceRules, Direction, Handle, IpVersion, NetworkFilter, ShapingAlgorithm, ShapingParams, ShapingRule,
};
use tracing::{debug, info, instrument, warn};

use crate::capture::{CommandRunner, Executor, ToolCommand, check_command_installation};
use crate::commands::{NetemArgs, QdiscType, TcCommandBuilder, TcOperation, TcTarget};
use crate::config::ShaperConfig;
use crate::delete::ShapingRuleDeleter;
use crate::discovery::ShapingRuleDiscoverer;
use crate::finder::{RuleQuery, find_rule};
use crate::interfaces::{InterfaceProbe, upper_limit_rate, verify_network_interface};
use crate::iptables::{MangleController, MangleMarkEntry};
use crate::shaper::{
    INGRESS_MAJOR, ShaperContext, build_filter_command, build_mark_filter_command, ifb_device_name, qdisc_major,
    shaper_for,
};

/// How a request interacts with rules already on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetMode {
    /// Refuse when the device already carries rules in that direction.
    #[default]
    Default,
    /// Add next to existing rules.
    Add,
    /// Change the rule with the same filter, add when there is none.
    Change,
    /// Delete every rule first.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetRequest {
    pub device: String,
    pub params: ShapingParams,
    pub direction: Direction,
    pub filter: NetworkFilter,
    pub exclusion: Option<NetworkFilter>,
    pub ip_version: IpVersion,
    pub algorithm: ShapingAlgorithm,
    pub mode: SetMode,
    /// Classify outgoing traffic through iptables marks.
    pub iptables: bool,
}

impl SetRequest {
    pub fn new(device: impl Into<String>, params: ShapingParams) -> Self {
        Self {
            device: device.into(),
            params,
            direction: Direction::Outgoing,
            filter: NetworkFilter::default(),
            exclusion: None,
            ip_version: IpVersion::V4,
            algorithm: ShapingAlgorithm::Htb,
            mode: SetMode::Default,
            iptables: false,
        }
    }

    /// Parameter checks that need no external tool.
    pub fn validate(&self) -> TcshapeResult<()> {
        let params = &self.params;
        if params.is_empty() {
            return Err(TcshapeError::invalid(
                "shaping parameters",
                "",
                "at least one of --rate, --delay, --loss, --duplicate, --corrupt, --reorder or --limit is required",
            ));
        }

        for (name, value) in [
            ("loss", params.loss),
            ("duplicate", params.duplicate),
            ("corrupt", params.corrupt),
            ("reorder", params.reorder),
        ] {
            if let Some(value) = value
                && !(0.0..=1.0).contains(&value)
            {
                return Err(TcshapeError::invalid(name, value.to_string(), "must be between 0% and 100%"));
            }
        }

        for (name, value) in [("delay", params.delay_ms), ("delay-distro", params.delay_jitter_ms)] {
            if let Some(value) = value
                && (!value.is_finite() || value < 0.0)
            {
                return Err(TcshapeError::invalid(name, value.to_string(), "must not be negative"));
            }
        }

        let has_delay = params.delay_ms.is_some_and(|d| d > 0.0);
        if params.reorder.is_some_and(|r| r > 0.0) && !has_delay {
            return Err(TcshapeError::invalid(
                "reorder",
                params.reorder.map(|r| r.to_string()).unwrap_or_default(),
                "reordering requires --delay",
            ));
        }
        if params.delay_jitter_ms.is_some_and(|j| j > 0.0) && !has_delay {
            return Err(TcshapeError::invalid(
                "delay-distro",
                params.delay_jitter_ms.map(|j| j.to_string()).unwrap_or_default(),
                "jitter requires --delay",
            ));
        }
        if params.rate_bps == Some(0) {
            return Err(TcshapeError::invalid("rate", "0", "must be greater than 0"));
        }
        if params.limit == Some(0) {
            return Err(TcshapeError::invalid("limit", "0", "must be greater than 0"));
        }

        if self.direction == Direction::Incoming && self.filter.src_network.is_some() {
            warn!("--src-network is ignored for incoming traffic");
        }

        self.effective_filter()?;
        self.effective_exclusion()?;
        Ok(())
    }

    /// Fail when the rate exceeds the device's bandwidth ceiling.
    pub fn validate_rate(&self, upper_limit_bps: u64) -> TcshapeResult<()> {
        match self.params.rate_bps {
            Some(rate) if rate > upper_limit_bps => Err(TcshapeError::invalid(
                "rate",
                format_rate(rate),
                format!("exceeds the upper limit {} of {}", format_rate(upper_limit_bps), self.device),
            )),
            _ => Ok(()),
        }
    }

    /// The filter as written to tc.
    ///
    /// Networks are normalized and "anywhere" becomes unset. Incoming
    /// traffic is classified on the ifb device, where `--network` names the
    /// sender.
    pub fn effective_filter(&self) -> TcshapeResult<NetworkFilter> {
        self.effective(&self.filter)
    }

    pub fn effective_exclusion(&self) -> TcshapeResult<Option<NetworkFilter>> {
        self.exclusion.as_ref().map(|e| self.effective(e)).transpose()
    }

    fn effective(&self, filter: &NetworkFilter) -> TcshapeResult<NetworkFilter> {
        let normalize = |network: Option<&str>| -> TcshapeResult<Option<String>> {
            let Some(network) = network else {
                return Ok(None);
            };
            let network = sanitize_network(Some(network), self.ip_version)?;
            Ok((!is_anywhere_network(&network, self.ip_version)).then_some(network))
        };
        let dst_network = normalize(filter.dst_network.as_deref())?;
        let src_network = normalize(filter.src_network.as_deref())?;

        Ok(match self.direction {
            Direction::Outgoing => NetworkFilter {
                dst_network,
                src_network,
                dst_port: filter.dst_port,
                src_port: filter.src_port,
                mark: None,
            },
            Direction::Incoming => NetworkFilter {
                dst_network: None,
                src_network: dst_network,
                dst_port: filter.dst_port,
                src_port: filter.src_port,
                mark: None,
            },
        })
    }

    fn uses_marks(&self) -> bool {
        self.iptables && self.direction == Direction::Outgoing
    }
}

/// What a successful `set` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOutcome {
    pub handle: Handle,
    pub operation: TcOperation,
}

pub struct ShapingRuleSetter<'a, R: CommandRunner> {
    executor: &'a mut Executor<R>,
    probe: &'a dyn InterfaceProbe,
    config: &'a ShaperConfig,
}

impl<'a, R: CommandRunner> ShapingRuleSetter<'a, R> {
    pub fn new(executor: &'a mut Executor<R>, probe: &'a dyn InterfaceProbe, config: &'a ShaperConfig) -> Self {
        Self {
            executor,
            probe,
            config,
        }
    }

    #[instrument(skip(self, request), fields(device = %request.device, direction = %request.direction, mode = ?request.mode))]
    pub fn set(&mut self, request: &SetRequest) -> TcshapeResult<SetOutcome> {
        request.validate()?;
        let filter = request.effective_filter()?;
        let exclusion = request.effective_exclusion()?;
        let device = request.device.as_str();

        if !self.executor.is_dry_run() {
            verify_network_interface(self.probe, device)?;
            if request.uses_marks() {
                check_command_installation(&self.config.iptables_for(request.ip_version))?;
            }
        }
        let upper_limit_bps = upper_limit_rate(self.probe, device, self.config);
        request.validate_rate(upper_limit_bps)?;

        let existing = if request.mode == SetMode::Overwrite {
            ShapingRuleDeleter::new(self.executor, self.probe, self.config).delete_all_rules(device)?;
            DeviceRules::new()
        } else {
            ShapingRuleDiscoverer::new(self.executor, self.probe).discover_any_version(device, request.ip_version)?
        };
        let same_direction: DeviceRules = existing
            .iter()
            .filter(|(_, rule)| rule.direction == request.direction)
            .map(|(handle, rule)| (*handle, rule.clone()))
            .collect();

        if request.mode == SetMode::Default && !same_direction.is_empty() {
            return Err(TcshapeError::ShapingRuleExists {
                device: device.to_string(),
            });
        }

        let target = match request.direction {
            Direction::Outgoing => device.to_string(),
            Direction::Incoming => ifb_device_name(device),
        };
        let shaper = shaper_for(request.algorithm);
        let query = RuleQuery::new(request.direction, request.ip_version, &filter)?;
        let matched: Option<ShapingRule> = find_rule(&same_direction, &query).cloned();

        let (handle, operation) = match &matched {
            Some(rule) => {
                debug!("reusing handle {} of the rule with the same filter", rule.handle);
                (rule.handle, TcOperation::Change)
            }
            None => (
                shaper.compute_handle(&existing, qdisc_major(&target))?,
                TcOperation::Add,
            ),
        };

        if request.direction == Direction::Incoming && operation == TcOperation::Add && same_direction.is_empty() {
            self.setup_ifb(device, &target, handle.major, request.ip_version)?;
        }

        let ctx = ShaperContext {
            tc_program: self.config.tc_program.clone(),
            device: target,
            qdisc_major: handle.major,
            minor: handle.minor,
            ip_version: request.ip_version,
            direction: request.direction,
            operation,
            upper_limit_bps,
        };
        let params = &request.params;

        let mut commands = shaper.build_queue_commands(&ctx, params)?;

        // A changed htb rule may gain a netem child it did not have.
        let netem_ctx = match &matched {
            Some(rule) if request.algorithm == ShapingAlgorithm::Htb && NetemArgs::from(&rule.params).is_empty() => {
                ShaperContext {
                    operation: TcOperation::Add,
                    ..ctx.clone()
                }
            }
            _ => ctx.clone(),
        };
        commands.extend(shaper.build_netem_command(&netem_ctx, params)?);
        commands.extend(shaper.build_rate_commands(&ctx, params)?);

        let mut mark_entry = None;
        if operation == TcOperation::Add {
            if request.uses_marks() {
                let program = self.config.iptables_for(request.ip_version);
                let mark = MangleController::new(self.executor, program, request.ip_version, self.config.mark_base)
                    .unique_mark_id()?;
                commands.push(build_mark_filter_command(&ctx, mark)?);
                mark_entry = Some(MangleMarkEntry::for_filter(request.ip_version, request.direction, mark, &filter));
            } else {
                commands.push(build_filter_command(&ctx, &filter, false)?);
            }
            if let Some(exclusion) = &exclusion {
                commands.push(build_filter_command(&ctx, exclusion, true)?);
            }
        }

        for command in &commands {
            self.executor.run(command)?;
        }

        if let Some(entry) = mark_entry {
            let program = self.config.iptables_for(request.ip_version);
            MangleController::new(self.executor, program, request.ip_version, self.config.mark_base).add(&entry)?;
        }

        info!("{}: {} shaping rule {} ({})", device, operation, handle, request.direction);
        Ok(SetOutcome { handle, operation })
    }

    /// Redirect the ingress traffic of `device` to its ifb device.
    fn setup_ifb(&mut self, device: &str, ifb: &str, ifb_major: u16, ip_version: IpVersion) -> TcshapeResult<()> {
        let ip = self.config.ip_program.as_str();
        let mut commands = vec![
            ToolCommand::new(self.config.modprobe_program.clone()).arg("ifb"),
            ToolCommand::new(ip).args(["link", "add", ifb, "type", "ifb"]),
            ToolCommand::new(ip).args(["link", "set", "dev", ifb, "up"]),
        ];
        commands.push(
            TcCommandBuilder::qdisc(&self.config.tc_program)
                .device(device)
                .target(TcTarget::Ingress)
                .kind(QdiscType::Ingress)
                .build()?,
        );
        commands.push(
            TcCommandBuilder::filter(&self.config.tc_program)
                .device(device)
                .parent(Handle::new(INGRESS_MAJOR, 0))
                .protocol(ip_version)
                .kind("u32")
                .args(["match", "u32", "0", "0", "flowid"])
                .arg(Handle::new(ifb_major, 0).to_string())
                .args(["action", "mirred", "egress", "redirect", "dev", ifb])
                .build()?,
        );
        for command in &commands {
            self.executor.run(command)?;
        }
        Ok(())
    }
}
