//! iptables mangle MARK rules backing `fw` filters.
//!
//! When marking is enabled for outgoing traffic the tc filter matches a
//! packet mark (`handle N fw`) and the network constraints move into an
//! iptables rule in the mangle table that sets that mark.

use tcshape_shared::errors::TcshapeResult;
use tcshape_shared::network::is_anywhere_network;
use tcshape_shared::{Direction, IpVersion, NetworkFilter};
use tracing::{debug, info};

use crate::capture::{CommandRunner, Executor, ToolCommand};
use crate::parser::Tokens;

const MANGLE_TABLE: &str = "mangle";

/// One `-j MARK --set-mark` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MangleMarkEntry {
    pub ip_version: IpVersion,
    pub mark_id: u32,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub chain: String,
}

impl MangleMarkEntry {
    /// Entry for a rule's filter, picking the chain the traffic traverses.
    pub fn for_filter(ip_version: IpVersion, direction: Direction, mark_id: u32, filter: &NetworkFilter) -> Self {
        let (chain, source, destination) = match direction {
            Direction::Outgoing => match &filter.src_network {
                None => ("OUTPUT", None, filter.dst_network.clone()),
                Some(src) => ("PREROUTING", Some(src.clone()), filter.dst_network.clone()),
            },
            Direction::Incoming => ("INPUT", filter.dst_network.clone(), None),
        };
        Self {
            ip_version,
            mark_id,
            source,
            destination,
            chain: chain.to_string(),
        }
    }

    fn rule_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, network) in [("-s", &self.source), ("-d", &self.destination)] {
            if let Some(network) = network
                && !is_anywhere_network(network, self.ip_version)
            {
                args.extend([flag.to_string(), network.clone()]);
            }
        }
        args.extend([
            "-j".to_string(),
            "MARK".to_string(),
            "--set-mark".to_string(),
            self.mark_id.to_string(),
        ]);
        args
    }

    pub fn to_append_command(&self, program: &str) -> ToolCommand {
        ToolCommand::new(program)
            .args(["-t", MANGLE_TABLE, "-A", &self.chain])
            .args(self.rule_args())
    }

    pub fn to_delete_command(&self, program: &str) -> ToolCommand {
        ToolCommand::new(program)
            .args(["-t", MANGLE_TABLE, "-D", &self.chain])
            .args(self.rule_args())
    }
}

fn parse_mark(value: &str) -> Option<u32> {
    let value = value.split('/').next()?;
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Parse `iptables -t mangle -S` output into MARK entries.
pub fn parse_mangle_rules(text: &str, ip_version: IpVersion) -> Vec<MangleMarkEntry> {
    text.lines()
        .filter_map(|line| {
            let tokens = Tokens::new(line);
            let chain = tokens.value_after("-A")?;
            if tokens.value_after("-j") != Some("MARK") {
                return None;
            }
            let mark = tokens
                .value_after("--set-mark")
                .or_else(|| tokens.value_after("--set-xmark"))
                .and_then(parse_mark)?;
            Some(MangleMarkEntry {
                ip_version,
                mark_id: mark,
                source: tokens.value_after("-s").map(str::to_string),
                destination: tokens.value_after("-d").map(str::to_string),
                chain: chain.to_string(),
            })
        })
        .collect()
}

/// Reads and edits MARK rules of one protocol version.
pub struct MangleController<'a, R: CommandRunner> {
    executor: &'a mut Executor<R>,
    program: String,
    ip_version: IpVersion,
    mark_base: u32,
}

impl<'a, R: CommandRunner> MangleController<'a, R> {
    pub fn new(executor: &'a mut Executor<R>, program: impl Into<String>, ip_version: IpVersion, mark_base: u32) -> Self {
        Self {
            executor,
            program: program.into(),
            ip_version,
            mark_base,
        }
    }

    pub fn list(&mut self) -> TcshapeResult<Vec<MangleMarkEntry>> {
        let command = ToolCommand::new(self.program.clone()).args(["-t", MANGLE_TABLE, "-S"]);
        let output = self.executor.capture(&command)?;
        Ok(parse_mangle_rules(&output, self.ip_version))
    }

    /// Next mark above every mark already in use, starting at the base.
    pub fn unique_mark_id(&mut self) -> TcshapeResult<u32> {
        let used = self.list()?;
        let mark = used
            .iter()
            .map(|entry| entry.mark_id)
            .filter(|mark| *mark >= self.mark_base)
            .max()
            .map_or(self.mark_base, |max| max + 1);
        debug!("unique mark id: {}", mark);
        Ok(mark)
    }

    pub fn add(&mut self, entry: &MangleMarkEntry) -> TcshapeResult<()> {
        self.executor.run(&entry.to_append_command(&self.program))?;
        Ok(())
    }

    /// Delete every MARK rule of the mangle table. Returns how many were found.
    pub fn clear(&mut self) -> TcshapeResult<usize> {
        let entries = self.list()?;
        for entry in &entries {
            self.executor.run(&entry.to_delete_command(&self.program))?;
        }
        if !entries.is_empty() {
            info!("removed {} mangle mark rule(s)", entries.len());
        }
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ToolOutput;
    use std::io;

    const MANGLE_LISTING: &str = "\
-P PREROUTING ACCEPT
-P OUTPUT ACCEPT
-A OUTPUT -d 192.168.0.0/24 -j MARK --set-xmark 0x65/0xffffffff
-A PREROUTING -s 10.0.0.0/8 -d 192.168.1.0/24 -j MARK --set-mark 102
-A OUTPUT -d 10.1.0.0/16 -j ACCEPT
";

    struct ListingRunner(&'static str);

    impl CommandRunner for ListingRunner {
        fn execute(&mut self, command: &ToolCommand) -> io::Result<ToolOutput> {
            if command.args.iter().any(|a| a == "-S") {
                Ok(ToolOutput::success(self.0))
            } else {
                Ok(ToolOutput::success(""))
            }
        }
    }

    #[test]
    fn test_parse_mangle_rules() {
        let entries = parse_mangle_rules(MANGLE_LISTING, IpVersion::V4);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mark_id, 101);
        assert_eq!(entries[0].chain, "OUTPUT");
        assert_eq!(entries[0].destination.as_deref(), Some("192.168.0.0/24"));
        assert_eq!(entries[1].mark_id, 102);
        assert_eq!(entries[1].source.as_deref(), Some("10.0.0.0/8"));
    }

    #[test]
    fn test_chain_selection() {
        let mut filter = NetworkFilter {
            dst_network: Some("192.168.0.0/24".to_string()),
            ..Default::default()
        };
        let entry = MangleMarkEntry::for_filter(IpVersion::V4, Direction::Outgoing, 100, &filter);
        assert_eq!(entry.chain, "OUTPUT");
        assert_eq!(
            entry.to_append_command("iptables").to_string(),
            "iptables -t mangle -A OUTPUT -d 192.168.0.0/24 -j MARK --set-mark 100"
        );

        filter.src_network = Some("10.0.0.0/8".to_string());
        let entry = MangleMarkEntry::for_filter(IpVersion::V4, Direction::Outgoing, 100, &filter);
        assert_eq!(entry.chain, "PREROUTING");

        let entry = MangleMarkEntry::for_filter(IpVersion::V4, Direction::Incoming, 100, &filter);
        assert_eq!(entry.chain, "INPUT");
        assert_eq!(entry.source.as_deref(), Some("192.168.0.0/24"));
        assert_eq!(
            entry.to_delete_command("iptables").to_string(),
            "iptables -t mangle -D INPUT -s 192.168.0.0/24 -j MARK --set-mark 100"
        );
    }

    #[test]
    fn test_anywhere_networks_are_omitted() {
        let entry = MangleMarkEntry {
            ip_version: IpVersion::V6,
            mark_id: 100,
            source: None,
            destination: Some("::/0".to_string()),
            chain: "OUTPUT".to_string(),
        };
        assert_eq!(
            entry.to_append_command("ip6tables").to_string(),
            "ip6tables -t mangle -A OUTPUT -j MARK --set-mark 100"
        );
    }

    #[test]
    fn test_unique_mark_id() {
        let mut executor = Executor::new(ListingRunner(MANGLE_LISTING), "tc");
        let mut controller = MangleController::new(&mut executor, "iptables", IpVersion::V4, 100);
        assert_eq!(controller.unique_mark_id().unwrap(), 103);

        let mut executor = Executor::new(ListingRunner(""), "tc");
        let mut controller = MangleController::new(&mut executor, "iptables", IpVersion::V4, 100);
        assert_eq!(controller.unique_mark_id().unwrap(), 100);
    }

    #[test]
    fn test_clear_deletes_marks_only() {
        let mut executor = Executor::new(ListingRunner(MANGLE_LISTING), "tc");
        let removed = MangleController::new(&mut executor, "iptables", IpVersion::V4, 100)
            .clear()
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            executor.history(),
            &[
                "iptables -t mangle -S".to_string(),
                "iptables -t mangle -D OUTPUT -d 192.168.0.0/24 -j MARK --set-mark 101".to_string(),
                "iptables -t mangle -D PREROUTING -s 10.0.0.0/8 -d 192.168.1.0/24 -j MARK --set-mark 102"
                    .to_string(),
            ]
        );
    }
}
