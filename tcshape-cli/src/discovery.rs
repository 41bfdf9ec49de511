//! Discovery of the shaping rules installed on devices.
//!
//! Outgoing rules live on the device itself. Incoming rules live on the ifb
//! devices its ingress qdisc redirects to; they are reported under the
//! requested device. The mapping is rebuilt from scratch on every call.

use tcshape_shared::errors::{TcshapeError, TcshapeResult};
use tcshape_shared::{DeviceRules, Direction, IpVersion, RuleMapping};
use tracing::{debug, info, instrument, warn};

use crate::capture::{CommandRunner, Executor};
use crate::interfaces::{InterfaceProbe, verify_network_interface};
use crate::mapping::{BuildOutcome, MappingBuilder};
use crate::parser::{parse_redirect_devices, parse_show};

/// Outcome of a multi-device discovery.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub mapping: RuleMapping,
    /// Skipped devices and dropped orphan records.
    pub diagnostics: Vec<TcshapeError>,
}

impl DiscoveryReport {
    pub fn skipped_devices(&self) -> impl Iterator<Item = &str> {
        self.diagnostics.iter().filter_map(|d| match d {
            TcshapeError::NetworkInterfaceNotFound { device } => Some(device.as_str()),
            _ => None,
        })
    }
}

pub struct ShapingRuleDiscoverer<'a, R: CommandRunner> {
    executor: &'a mut Executor<R>,
    probe: &'a dyn InterfaceProbe,
    diagnostics: Vec<TcshapeError>,
}

impl<'a, R: CommandRunner> ShapingRuleDiscoverer<'a, R> {
    pub fn new(executor: &'a mut Executor<R>, probe: &'a dyn InterfaceProbe) -> Self {
        Self {
            executor,
            probe,
            diagnostics: Vec::new(),
        }
    }

    /// Orphan diagnostics collected by `discover` calls so far.
    pub fn take_diagnostics(&mut self) -> Vec<TcshapeError> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Rules of one device for one protocol version.
    #[instrument(skip(self), fields(dry_run = self.executor.is_dry_run()))]
    pub fn discover(&mut self, device: &str, ip_version: IpVersion) -> TcshapeResult<DeviceRules> {
        let mut rules = self.discover_any_version(device, ip_version)?;
        rules.retain(|_, rule| rule.ip_version == ip_version);
        debug!("{}: {} IPv{} rule(s)", device, rules.len(), ip_version);
        Ok(rules)
    }

    /// Rules of one device whatever their filter protocol. Rules without a
    /// filter are attributed to `ip_version`.
    pub fn discover_any_version(&mut self, device: &str, ip_version: IpVersion) -> TcshapeResult<DeviceRules> {
        if !self.executor.is_dry_run() {
            verify_network_interface(self.probe, device)?;
        }

        let mut rules = DeviceRules::new();

        let show = self.executor.capture_show(device)?;
        let outgoing = MappingBuilder::new(device, ip_version).build_records(parse_show(&show));
        self.absorb(&mut rules, outgoing);

        for ifb in self.redirect_devices(device)? {
            debug!("{}: ingress redirected to {}", device, ifb);
            let show = self.executor.capture_show(&ifb)?;
            let incoming = MappingBuilder::new(device, ip_version)
                .direction(Direction::Incoming)
                .build_records(parse_show(&show));
            self.absorb(&mut rules, incoming);
        }
        Ok(rules)
    }

    /// ifb devices receiving the ingress traffic of `device`.
    pub fn redirect_devices(&mut self, device: &str) -> TcshapeResult<Vec<String>> {
        let ingress = self.executor.capture_ingress_filters(device)?;
        Ok(parse_redirect_devices(&ingress))
    }

    /// Rules of every device. Missing interfaces are recorded and skipped;
    /// any other failure aborts.
    #[instrument(skip(self))]
    pub fn discover_all(&mut self, devices: &[String], ip_version: IpVersion) -> TcshapeResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        for device in devices {
            match self.discover(device, ip_version) {
                Ok(rules) => report.mapping.insert_device(device, rules),
                Err(e) if e.is_recoverable_per_device() => {
                    warn!("skipping {}: {}", device, e);
                    report.diagnostics.push(e);
                }
                Err(e) => return Err(e),
            }
        }
        report.diagnostics.extend(self.take_diagnostics());
        info!(
            "discovered {} rule(s) on {} device(s)",
            report.mapping.len(),
            report.mapping.devices().count()
        );
        Ok(report)
    }

    fn absorb(&mut self, rules: &mut DeviceRules, outcome: BuildOutcome) {
        rules.extend(outcome.rules);
        self.diagnostics.extend(outcome.diagnostics);
    }
}
