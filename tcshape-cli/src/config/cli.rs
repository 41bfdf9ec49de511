//! CLI argument parsing for tcshape.
//!
//! Three subcommands mirror the classic tool trio: `set` installs a rule,
//! `del` removes rules and `show` prints the rules of devices as JSON.
//! Values are normalized here, so a malformed rate or percentage fails with
//! `InvalidParameter` before any external command runs.

use anyhow::Result;
use clap::{Arg, ArgAction, ArgGroup, ArgMatches, Command};
use tcshape_shared::units::{parse_fraction, parse_rate_bps, parse_time_ms};
use tcshape_shared::{DelayDistribution, Direction, Handle, IpVersion, NetworkFilter, ShapingAlgorithm, ShapingParams};

use crate::set::{SetMode, SetRequest};

/// Where executed commands go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Run the commands.
    #[default]
    Execute,
    /// Print the commands instead of running them.
    TcCommand,
    /// Write the commands to a shell script instead of running them.
    TcScript,
}

impl OutputMode {
    pub fn is_dry_run(&self) -> bool {
        *self != OutputMode::Execute
    }
}

/// What `del` removes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    All,
    Handle(Handle),
    /// The rule whose filter matches.
    Filter { direction: Direction, filter: NetworkFilter },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Show { devices: Vec<String>, color: bool },
    Set(Box<SetRequest>),
    Delete { device: String, target: DeleteTarget },
}

impl CliCommand {
    /// Device list used as the script file name suffix.
    pub fn devices(&self) -> Vec<String> {
        match self {
            CliCommand::Show { devices, .. } => devices.clone(),
            CliCommand::Set(request) => vec![request.device.clone()],
            CliCommand::Delete { device, .. } => vec![device.clone()],
        }
    }
}

/// CLI configuration structure containing all parsed command line arguments
#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub debug: bool,
    pub quiet: bool,
    pub output: OutputMode,
    pub ip_version: IpVersion,
    pub command: CliCommand,
}

impl CliConfig {
    /// Parse CLI arguments and create CliConfig
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Create CliConfig from pre-parsed ArgMatches (useful for testing)
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let debug = matches.get_flag("debug");
        let quiet = matches.get_flag("quiet");
        let output = if matches.get_flag("tc-command") {
            OutputMode::TcCommand
        } else if matches.get_flag("tc-script") {
            OutputMode::TcScript
        } else {
            OutputMode::Execute
        };
        let ip_version = if matches.get_flag("ipv6") {
            IpVersion::V6
        } else {
            IpVersion::V4
        };

        let command = match matches.subcommand() {
            Some(("show", sub)) => CliCommand::Show {
                devices: sub
                    .get_many::<String>("device")
                    .map(|vals| vals.cloned().collect())
                    .unwrap_or_default(),
                color: sub.get_flag("color"),
            },
            Some(("set", sub)) => CliCommand::Set(Box::new(Self::set_request(sub, ip_version)?)),
            Some(("del", sub)) => Self::delete_command(sub)?,
            Some((other, _)) => return Err(anyhow::anyhow!("Unknown subcommand '{}'", other)),
            None => return Err(anyhow::anyhow!("A subcommand is required")),
        };

        Ok(Self {
            debug,
            quiet,
            output,
            ip_version,
            command,
        })
    }

    fn device(matches: &ArgMatches) -> Result<String> {
        matches
            .get_one::<String>("device")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Device is required"))
    }

    fn direction(matches: &ArgMatches) -> Result<Direction> {
        Ok(match matches.get_one::<String>("direction") {
            Some(direction) => direction.parse()?,
            None => Direction::Outgoing,
        })
    }

    fn network_filter(matches: &ArgMatches, prefix: &str) -> NetworkFilter {
        let string = |name: &str| matches.get_one::<String>(&format!("{prefix}{name}")).cloned();
        let port = |name: &str| matches.get_one::<u16>(&format!("{prefix}{name}")).copied();
        NetworkFilter {
            dst_network: string("dst-network"),
            src_network: string("src-network"),
            dst_port: port("dst-port"),
            src_port: port("src-port"),
            mark: None,
        }
    }

    fn set_request(matches: &ArgMatches, ip_version: IpVersion) -> Result<SetRequest> {
        let value = |name: &str| matches.get_one::<String>(name).map(String::as_str);

        let mut params = ShapingParams {
            rate_bps: value("rate").map(parse_rate_bps).transpose()?,
            delay_ms: value("delay").map(parse_time_ms).transpose()?,
            delay_jitter_ms: value("delay-distro").map(parse_time_ms).transpose()?,
            delay_distribution: value("delay-distribution")
                .map(str::parse::<DelayDistribution>)
                .transpose()?,
            loss: value("loss").map(parse_fraction).transpose()?,
            duplicate: value("duplicate").map(parse_fraction).transpose()?,
            corrupt: value("corrupt").map(parse_fraction).transpose()?,
            reorder: value("reorder").map(parse_fraction).transpose()?,
            limit: matches.get_one::<u32>("limit").copied(),
        };
        if params.delay_jitter_ms.is_none() {
            params.delay_distribution = None;
        }

        let exclusion = Self::network_filter(matches, "exclude-");
        let mode = if matches.get_flag("add") {
            SetMode::Add
        } else if matches.get_flag("change") {
            SetMode::Change
        } else if matches.get_flag("overwrite") {
            SetMode::Overwrite
        } else {
            SetMode::Default
        };

        Ok(SetRequest {
            device: Self::device(matches)?,
            params,
            direction: Self::direction(matches)?,
            filter: Self::network_filter(matches, ""),
            exclusion: (exclusion != NetworkFilter::default()).then_some(exclusion),
            ip_version,
            algorithm: value("shaping-algo").unwrap_or("htb").parse::<ShapingAlgorithm>()?,
            mode,
            iptables: matches.get_flag("iptables"),
        })
    }

    fn delete_command(matches: &ArgMatches) -> Result<CliCommand> {
        let target = if matches.get_flag("all") {
            DeleteTarget::All
        } else if let Some(id) = matches.get_one::<String>("id") {
            DeleteTarget::Handle(id.parse::<Handle>()?)
        } else {
            DeleteTarget::Filter {
                direction: Self::direction(matches)?,
                filter: Self::network_filter(matches, ""),
            }
        };
        Ok(CliCommand::Delete {
            device: Self::device(matches)?,
            target,
        })
    }

    fn routing_args(command: Command) -> Command {
        command
            .arg(
                Arg::new("direction")
                    .long("direction")
                    .value_name("DIRECTION")
                    .value_parser(["outgoing", "incoming"])
                    .help("Direction of the traffic to shape [default: outgoing]")
                    .long_help("Direction of the traffic to shape. Incoming traffic is redirected to an \
                              ifb device and shaped there."),
            )
            .arg(
                Arg::new("dst-network")
                    .long("dst-network")
                    .visible_alias("network")
                    .value_name("NETWORK")
                    .help("Target IP address or network (e.g. 192.168.0.0/24)")
                    .long_help("Target IP address or network. For incoming traffic this is the \
                              sender's network."),
            )
            .arg(
                Arg::new("src-network")
                    .long("src-network")
                    .value_name("NETWORK")
                    .help("Source IP address or network (outgoing traffic only)"),
            )
            .arg(
                Arg::new("dst-port")
                    .long("dst-port")
                    .visible_alias("port")
                    .value_name("PORT")
                    .value_parser(clap::value_parser!(u16))
                    .help("Target port"),
            )
            .arg(
                Arg::new("src-port")
                    .long("src-port")
                    .value_name("PORT")
                    .value_parser(clap::value_parser!(u16))
                    .help("Source port"),
            )
    }

    fn exclusion_args(command: Command) -> Command {
        command
            .arg(
                Arg::new("exclude-dst-network")
                    .long("exclude-dst-network")
                    .value_name("NETWORK")
                    .help("Destination network left out of the rule"),
            )
            .arg(
                Arg::new("exclude-src-network")
                    .long("exclude-src-network")
                    .value_name("NETWORK")
                    .help("Source network left out of the rule"),
            )
            .arg(
                Arg::new("exclude-dst-port")
                    .long("exclude-dst-port")
                    .value_name("PORT")
                    .value_parser(clap::value_parser!(u16))
                    .help("Destination port left out of the rule"),
            )
            .arg(
                Arg::new("exclude-src-port")
                    .long("exclude-src-port")
                    .value_name("PORT")
                    .value_parser(clap::value_parser!(u16))
                    .help("Source port left out of the rule"),
            )
    }

    fn device_arg() -> Arg {
        Arg::new("device")
            .value_name("DEVICE")
            .required(true)
            .help("Network interface name (e.g. eth0)")
    }

    fn set_command() -> Command {
        let command = Command::new("set")
            .about("Set a traffic shaping rule on a network interface")
            .arg(Self::device_arg())
            .arg(
                Arg::new("rate")
                    .long("rate")
                    .visible_alias("bandwidth-rate")
                    .value_name("RATE")
                    .help("Bandwidth limit (e.g. 100Kbps, 1.5Mbps, 1Gbit)")
                    .long_help("Network bandwidth rate. Units: bps, Kbps, Mbps, Gbps, Tbps (bits per second) \
                              and their Kibps/Mibps binary forms. Must not exceed the interface speed."),
            )
            .arg(
                Arg::new("delay")
                    .long("delay")
                    .value_name("TIME")
                    .help("Round trip delay (e.g. 100ms, 0.1s). Bare numbers are milliseconds"),
            )
            .arg(
                Arg::new("delay-distro")
                    .long("delay-distro")
                    .value_name("TIME")
                    .help("Delay jitter, distributed per --delay-distribution"),
            )
            .arg(
                Arg::new("delay-distribution")
                    .long("delay-distribution")
                    .value_name("DISTRIBUTION")
                    .value_parser(["normal", "pareto", "paretonormal"])
                    .help("Distribution of the delay jitter [default: normal]"),
            )
            .arg(
                Arg::new("loss")
                    .long("loss")
                    .value_name("PERCENT")
                    .help("Packet loss (e.g. 0.1%, 0.001)"),
            )
            .arg(
                Arg::new("duplicate")
                    .long("duplicate")
                    .value_name("PERCENT")
                    .help("Packet duplication"),
            )
            .arg(
                Arg::new("corrupt")
                    .long("corrupt")
                    .value_name("PERCENT")
                    .help("Packet corruption (single bit error)"),
            )
            .arg(
                Arg::new("reorder")
                    .long("reorder")
                    .value_name("PERCENT")
                    .help("Packet reordering; requires --delay"),
            )
            .arg(
                Arg::new("limit")
                    .long("limit")
                    .value_name("PACKETS")
                    .value_parser(clap::value_parser!(u32))
                    .help("Queue limit of the netem qdisc in packets"),
            )
            .arg(
                Arg::new("shaping-algo")
                    .long("shaping-algo")
                    .value_name("ALGORITHM")
                    .value_parser(["htb", "tbf"])
                    .help("Queueing algorithm enforcing the rate [default: htb]"),
            )
            .arg(
                Arg::new("iptables")
                    .long("iptables")
                    .action(ArgAction::SetTrue)
                    .help("Classify outgoing traffic with iptables marks"),
            )
            .arg(
                Arg::new("add")
                    .long("add")
                    .action(ArgAction::SetTrue)
                    .help("Add a rule next to the existing ones"),
            )
            .arg(
                Arg::new("change")
                    .long("change")
                    .action(ArgAction::SetTrue)
                    .help("Change the rule with the same filter; add one when there is none"),
            )
            .arg(
                Arg::new("overwrite")
                    .long("overwrite")
                    .action(ArgAction::SetTrue)
                    .help("Delete existing rules first"),
            )
            .group(ArgGroup::new("mode").args(["add", "change", "overwrite"]));
        Self::exclusion_args(Self::routing_args(command))
    }

    fn delete_command_def() -> Command {
        let command = Command::new("del")
            .visible_alias("delete")
            .about("Delete traffic shaping rules from a network interface")
            .arg(Self::device_arg())
            .arg(
                Arg::new("all")
                    .short('a')
                    .long("all")
                    .action(ArgAction::SetTrue)
                    .help("Delete every rule of the device in both directions"),
            )
            .arg(
                Arg::new("id")
                    .long("id")
                    .value_name("HANDLE")
                    .help("Handle of the rule to delete, as printed by show (e.g. 1a1a:2)"),
            )
            .group(ArgGroup::new("selection").args(["all", "id"]));
        Self::routing_args(command)
    }

    fn show_command() -> Command {
        Command::new("show")
            .about("Show the traffic shaping rules of network interfaces")
            .arg(
                Arg::new("device")
                    .value_name("DEVICE")
                    .required(true)
                    .num_args(1..)
                    .help("Network interface names"),
            )
            .arg(
                Arg::new("color")
                    .long("color")
                    .action(ArgAction::SetTrue)
                    .help("Colorize the output"),
            )
    }

    /// Build the clap Command structure
    pub fn build_cli() -> Command {
        Command::new("tcshape")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Traffic shaping with tc: bandwidth, delay, loss, duplication, corruption, reordering")
            .long_about("A front end translating traffic shaping intent into tc and iptables commands. \
                       Rules are discovered back from the kernel, so show reflects what is installed.")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .arg(
                Arg::new("debug")
                    .long("debug")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .conflicts_with("quiet")
                    .help("Enable debug logging"),
            )
            .arg(
                Arg::new("quiet")
                    .long("quiet")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .help("Only log errors"),
            )
            .arg(
                Arg::new("ipv6")
                    .long("ipv6")
                    .short('6')
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .help("Operate on IPv6 rules (IPv4 by default)"),
            )
            .arg(
                Arg::new("tc-command")
                    .long("tc-command")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .conflicts_with("tc-script")
                    .help("Print the tc commands instead of running them"),
            )
            .arg(
                Arg::new("tc-script")
                    .long("tc-script")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .help("Write the tc commands to an executable shell script instead of running them"),
            )
            .subcommand(Self::set_command())
            .subcommand(Self::delete_command_def())
            .subcommand(Self::show_command())
    }

    /// Validate CLI configuration
    pub fn validate(&self) -> Result<()> {
        if self.debug && self.quiet {
            return Err(anyhow::anyhow!("--debug and --quiet are mutually exclusive"));
        }
        match &self.command {
            CliCommand::Show { devices, .. } if devices.is_empty() => {
                Err(anyhow::anyhow!("At least one device is required"))
            }
            CliCommand::Set(request) => {
                request.validate()?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
