//! tcshape: traffic shaping intent translated into tc and iptables commands.
//!
//! `set` installs a rule, `del` removes rules and `show` discovers what is
//! installed by parsing `tc ... show` output back into rules. All external
//! programs run through [`capture::Executor`], so every command can be
//! printed (`--tc-command`) or written to a script (`--tc-script`) instead
//! of being executed.

pub mod capture;
pub mod commands;
pub mod config;
pub mod delete;
pub mod discovery;
pub mod finder;
pub mod interfaces;
pub mod iptables;
pub mod mapping;
pub mod output;
pub mod parser;
pub mod script;
pub mod set;
pub mod shaper;

use std::io::Write;

use anyhow::Result;
use tcshape_shared::errors::TcshapeError;
use tracing::warn;

use crate::capture::{CommandRunner, Executor, check_command_installation};
use crate::config::{CliCommand, ConfigManager, DeleteTarget, OutputMode};
use crate::delete::ShapingRuleDeleter;
use crate::discovery::ShapingRuleDiscoverer;
use crate::finder::{RuleQuery, find_rule};
use crate::interfaces::InterfaceProbe;
use crate::script::{ScriptCommand, write_tc_script};
use crate::set::{SetRequest, ShapingRuleSetter};

/// Process exit status for an error returned by [`run`].
pub fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<TcshapeError>())
        .map(TcshapeError::exit_code)
        .unwrap_or(1)
}

/// Fail early when tc itself is missing. Dry runs need no tools.
pub fn ensure_tools(config: &ConfigManager) -> Result<()> {
    if config.app.output.is_dry_run() {
        return Ok(());
    }
    check_command_installation(&config.shaper.tc_program)?;
    Ok(())
}

/// Execute the parsed command line.
///
/// `argv` is only used for the `--tc-script` header. JSON and printed
/// commands go to `out`.
pub fn run<R: CommandRunner>(
    config: &ConfigManager,
    argv: &[String],
    runner: R,
    probe: &dyn InterfaceProbe,
    out: &mut dyn Write,
) -> Result<()> {
    let mode = config.app.output;
    let mut executor = Executor::new(runner, config.shaper.tc_program.clone()).dry_run(mode.is_dry_run());
    let command = &config.cli.command;

    let script_command = match command {
        CliCommand::Show { devices, color } => {
            let mapping = show(&mut executor, probe, devices, config)?;
            if mode == OutputMode::Execute {
                writeln!(out, "{}", output::render_json(&mapping, *color)?)?;
            }
            ScriptCommand::Show
        }
        CliCommand::Set(request) => {
            ShapingRuleSetter::new(&mut executor, probe, &config.shaper).set(request)?;
            ScriptCommand::Set
        }
        CliCommand::Delete { device, target } => {
            delete(&mut executor, probe, config, device, target)?;
            ScriptCommand::Delete
        }
    };

    match mode {
        OutputMode::Execute => {}
        OutputMode::TcCommand => {
            for line in executor.history() {
                writeln!(out, "{}", line)?;
            }
        }
        OutputMode::TcScript => {
            let suffix = command.devices().join("-");
            write_tc_script(
                &config.app.script_dir,
                script_command,
                argv,
                executor.history(),
                Some(suffix.as_str()),
            )?;
        }
    }
    Ok(())
}

fn show<R: CommandRunner>(
    executor: &mut Executor<R>,
    probe: &dyn InterfaceProbe,
    devices: &[String],
    config: &ConfigManager,
) -> Result<tcshape_shared::RuleMapping> {
    let ip_version = config.cli.ip_version;
    let mut discoverer = ShapingRuleDiscoverer::new(executor, probe);

    // A lone device that does not exist is an error, not an empty mapping.
    if let [device] = devices {
        let rules = discoverer.discover(device, ip_version)?;
        let mut mapping = tcshape_shared::RuleMapping::new();
        mapping.insert_device(device, rules);
        return Ok(mapping);
    }

    let report = discoverer.discover_all(devices, ip_version)?;
    for device in report.skipped_devices() {
        warn!("{}: no such network interface, skipped", device);
    }
    Ok(report.mapping)
}

fn delete<R: CommandRunner>(
    executor: &mut Executor<R>,
    probe: &dyn InterfaceProbe,
    config: &ConfigManager,
    device: &str,
    target: &DeleteTarget,
) -> Result<()> {
    let ip_version = config.cli.ip_version;
    match target {
        DeleteTarget::All => {
            ShapingRuleDeleter::new(executor, probe, &config.shaper).delete_all_rules(device)?;
        }
        DeleteTarget::Handle(handle) => {
            if !ShapingRuleDeleter::new(executor, probe, &config.shaper).delete_rule(device, *handle)? {
                warn!("{}: no rule with id {}", device, handle);
            }
        }
        DeleteTarget::Filter { direction, filter } => {
            let mut request = SetRequest::new(device, Default::default());
            request.direction = *direction;
            request.filter = filter.clone();
            request.ip_version = ip_version;
            let query = RuleQuery::new(*direction, ip_version, &request.effective_filter()?)?;

            let rules = ShapingRuleDiscoverer::new(executor, probe).discover_any_version(device, ip_version)?;
            match find_rule(&rules, &query).map(|rule| rule.handle) {
                Some(handle) => {
                    ShapingRuleDeleter::new(executor, probe, &config.shaper).delete_rule(device, handle)?;
                }
                None => warn!("{}: no {} rule matches the given filter", device, direction),
            }
        }
    }
    Ok(())
}
