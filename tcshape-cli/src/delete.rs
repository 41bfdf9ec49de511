//! Removal of shaping rules.

use tcshape_shared::errors::TcshapeResult;
use tcshape_shared::{Direction, Handle, IpVersion};
use tracing::{debug, info, instrument, warn};

use crate::capture::{CommandRunner, Executor, ToolCommand, find_program};
use crate::commands::{TcCommandBuilder, TcOperation, TcTarget};
use crate::config::ShaperConfig;
use crate::discovery::ShapingRuleDiscoverer;
use crate::interfaces::{InterfaceProbe, verify_network_interface};
use crate::iptables::MangleController;
use crate::parser::{DeviceRecords, parse_show};
use crate::shaper::{INGRESS_MAJOR, ifb_device_name};

pub struct ShapingRuleDeleter<'a, R: CommandRunner> {
    executor: &'a mut Executor<R>,
    probe: &'a dyn InterfaceProbe,
    config: &'a ShaperConfig,
}

impl<'a, R: CommandRunner> ShapingRuleDeleter<'a, R> {
    pub fn new(executor: &'a mut Executor<R>, probe: &'a dyn InterfaceProbe, config: &'a ShaperConfig) -> Self {
        Self {
            executor,
            probe,
            config,
        }
    }

    fn discoverer(&mut self) -> ShapingRuleDiscoverer<'_, R> {
        ShapingRuleDiscoverer::new(self.executor, self.probe)
    }

    fn tc(&self) -> &str {
        &self.config.tc_program
    }

    /// Remove every rule of `device` in both directions, its ifb devices and
    /// the mangle marks.
    #[instrument(skip(self))]
    pub fn delete_all_rules(&mut self, device: &str) -> TcshapeResult<()> {
        if !self.executor.is_dry_run() {
            verify_network_interface(self.probe, device)?;
        }

        let mut ifb_devices = self.discoverer().redirect_devices(device)?;
        let own_ifb = ifb_device_name(device);
        if !ifb_devices.contains(&own_ifb) {
            ifb_devices.push(own_ifb);
        }

        for target in [TcTarget::Root, TcTarget::Ingress] {
            let command = TcCommandBuilder::qdisc(self.tc())
                .operation(TcOperation::Delete)
                .device(device)
                .target(target)
                .build()?;
            self.executor.run(&command)?;
        }

        for ifb in &ifb_devices {
            let command = TcCommandBuilder::qdisc(self.tc())
                .operation(TcOperation::Delete)
                .device(ifb.as_str())
                .target(TcTarget::Root)
                .build()?;
            self.executor.run(&command)?;
            let command = ToolCommand::new(self.config.ip_program.clone()).args(["link", "delete", ifb.as_str(), "type", "ifb"]);
            self.executor.run(&command)?;
        }

        self.clear_marks()?;
        info!("{}: deleted all shaping rules", device);
        Ok(())
    }

    fn clear_marks(&mut self) -> TcshapeResult<()> {
        let mut programs: Vec<(String, IpVersion)> = Vec::new();
        for ip_version in [IpVersion::V4, IpVersion::V6] {
            let program = self.config.iptables_for(ip_version);
            if programs.iter().any(|(p, _)| *p == program) {
                continue;
            }
            if find_program(&program).is_none() {
                debug!("{} not installed, no marks to clear", program);
                continue;
            }
            programs.push((program, ip_version));
        }
        for (program, ip_version) in programs {
            MangleController::new(self.executor, program, ip_version, self.config.mark_base).clear()?;
        }
        Ok(())
    }

    /// Remove one rule: its filters, the qdiscs attached to it and its class.
    /// Returns false when no such rule exists.
    #[instrument(skip(self))]
    pub fn delete_rule(&mut self, device: &str, handle: Handle) -> TcshapeResult<bool> {
        let rules = self.discoverer().discover_any_version(device, IpVersion::V4)?;
        let Some(rule) = rules.get(&handle).cloned() else {
            warn!("{}: no shaping rule with handle {}", device, handle);
            return Ok(false);
        };

        let candidates = match rule.direction {
            Direction::Outgoing => vec![device.to_string()],
            Direction::Incoming => self.discoverer().redirect_devices(device)?,
        };

        for target in candidates {
            let show = self.executor.capture_show(&target)?;
            let records: DeviceRecords = parse_show(&show).into_iter().collect();
            let owns_handle = records.classes.iter().any(|c| c.handle == handle)
                || records.qdiscs.iter().any(|q| q.handle == handle);
            if !owns_handle {
                continue;
            }
            self.delete_records(&target, handle, rule.ip_version, &records)?;
            info!("{}: deleted shaping rule {}", device, handle);
            return Ok(true);
        }

        warn!("{}: shaping rule {} vanished before deletion", device, handle);
        Ok(false)
    }

    fn delete_records(&mut self, target: &str, handle: Handle, ip_version: IpVersion, records: &DeviceRecords) -> TcshapeResult<()> {
        let mut marks = Vec::new();

        for filter in records
            .filters
            .iter()
            .filter(|f| f.flow_id == handle && f.parent.major != INGRESS_MAJOR)
        {
            let Some(filter_id) = &filter.filter_id else {
                debug!("{}: filter pref {} has no handle, left in place", target, filter.pref);
                continue;
            };
            let command = TcCommandBuilder::filter(self.tc())
                .operation(TcOperation::Delete)
                .device(target)
                .parent(filter.parent)
                .protocol(filter.ip_version().unwrap_or(ip_version))
                .pref(filter.pref)
                .filter_handle(filter_id.as_str())
                .kind(filter.kind.as_str())
                .build()?;
            self.executor.run(&command)?;
            marks.extend(filter.mark);
        }

        for qdisc in records.qdiscs.iter().filter(|q| q.parent == Some(handle)) {
            let command = TcCommandBuilder::qdisc(self.tc())
                .operation(TcOperation::Delete)
                .device(target)
                .parent(handle)
                .handle(qdisc.handle)
                .build()?;
            self.executor.run(&command)?;
        }

        if handle.is_qdisc() {
            let command = TcCommandBuilder::qdisc(self.tc())
                .operation(TcOperation::Delete)
                .device(target)
                .target(TcTarget::Root)
                .build()?;
            self.executor.run(&command)?;
        }

        // prio bands cannot be removed individually.
        for class in records
            .classes
            .iter()
            .filter(|c| c.handle == handle && c.kind == "htb")
        {
            let command = TcCommandBuilder::class(self.tc())
                .operation(TcOperation::Delete)
                .device(target)
                .parent(class.parent)
                .classid(handle)
                .build()?;
            self.executor.run(&command)?;
        }

        if !marks.is_empty() {
            let program = self.config.iptables_for(ip_version);
            let mut controller = MangleController::new(self.executor, program.clone(), ip_version, self.config.mark_base);
            let entries = controller.list()?;
            for entry in entries.iter().filter(|e| marks.contains(&e.mark_id)) {
                self.executor.run(&entry.to_delete_command(&program))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ToolOutput;
    use std::collections::HashMap;
    use std::io;

    struct FakeProbe;

    impl InterfaceProbe for FakeProbe {
        fn list_interfaces(&self) -> TcshapeResult<Vec<String>> {
            Ok(vec!["eth0".to_string()])
        }

        fn read_speed_mbps(&self, _device: &str) -> io::Result<i64> {
            Ok(-1)
        }
    }

    #[derive(Default)]
    struct ListingRunner(HashMap<String, ToolOutput>);

    impl ListingRunner {
        fn with(mut self, command: &str, output: ToolOutput) -> Self {
            self.0.insert(command.to_string(), output);
            self
        }
    }

    impl CommandRunner for ListingRunner {
        fn execute(&mut self, command: &ToolCommand) -> io::Result<ToolOutput> {
            Ok(self
                .0
                .get(&command.to_string())
                .cloned()
                .unwrap_or_else(|| ToolOutput::success("")))
        }
    }

    fn config() -> ShaperConfig {
        ShaperConfig {
            iptables_program: Some("/nonexistent/iptables".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_delete_all_is_idempotent() {
        let runner = ListingRunner::default()
            .with(
                "tc qdisc del dev eth0 root",
                ToolOutput::failure(2, "Error: Cannot delete qdisc with handle of zero.\n"),
            )
            .with(
                "tc qdisc del dev eth0 ingress",
                ToolOutput::failure(2, "Error: Cannot find specified qdisc on specified device.\n"),
            );
        let mut executor = Executor::new(runner, "tc");
        let config = config();
        ShapingRuleDeleter::new(&mut executor, &FakeProbe, &config)
            .delete_all_rules("eth0")
            .unwrap();

        let ifb = ifb_device_name("eth0");
        assert_eq!(
            executor.history(),
            &[
                "tc filter show dev eth0 ingress".to_string(),
                "tc qdisc del dev eth0 root".to_string(),
                "tc qdisc del dev eth0 ingress".to_string(),
                format!("tc qdisc del dev {} root", ifb),
                format!("ip link delete {} type ifb", ifb),
            ]
        );
    }

    #[test]
    fn test_delete_rule_removes_chain() {
        let runner = ListingRunner::default()
            .with(
                "tc qdisc show dev eth0",
                ToolOutput::success(
                    "qdisc htb 1a1a: root refcnt 2 r2q 10 default 0x1 direct_packets_stat 0\n\
                     qdisc netem 221c: parent 1a1a:2 limit 1000 delay 10ms\n",
                ),
            )
            .with(
                "tc class show dev eth0",
                ToolOutput::success(
                    "class htb 1a1a:2 root leaf 221c: prio 0 rate 1Mbit ceil 1Mbit burst 1600b cburst 1600b\n",
                ),
            )
            .with(
                "tc filter show dev eth0",
                ToolOutput::success(
                    "filter parent 1a1a: protocol ip pref 5 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 flowid 1a1a:2\n\
                     \x20 match c0a80000/ffffff00 at 16\n",
                ),
            );
        let mut executor = Executor::new(runner, "tc");
        let config = config();
        let deleted = ShapingRuleDeleter::new(&mut executor, &FakeProbe, &config)
            .delete_rule("eth0", Handle::new(0x1a1a, 2))
            .unwrap();
        assert!(deleted);

        let mutations: Vec<&String> = executor.history().iter().filter(|c| c.contains(" del ")).collect();
        assert_eq!(
            mutations,
            vec![
                "tc filter del dev eth0 parent 1a1a: protocol ip prio 5 handle 800::800 u32",
                "tc qdisc del dev eth0 parent 1a1a:2 handle 221c:",
                "tc class del dev eth0 parent 1a1a: classid 1a1a:2",
            ]
        );
    }

    #[test]
    fn test_delete_unknown_rule_is_noop() {
        let mut executor = Executor::new(ListingRunner::default(), "tc");
        let config = config();
        let deleted = ShapingRuleDeleter::new(&mut executor, &FakeProbe, &config)
            .delete_rule("eth0", Handle::new(0x1a1a, 9))
            .unwrap();
        assert!(!deleted);
        assert!(!executor.history().iter().any(|c| c.contains(" del ")));
    }
}
