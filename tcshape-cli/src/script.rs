//! Shell script output (`--tc-script`).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Local;
use tcshape_shared::errors::TcshapeResult;
use tracing::info;

/// Flag excluded from the command line quoted in the header.
pub const TC_SCRIPT_FLAG: &str = "--tc-script";

/// Subcommand a script was generated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCommand {
    Set,
    Delete,
    Show,
}

impl ScriptCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ScriptCommand::Set => "tcshape-set",
            ScriptCommand::Delete => "tcshape-del",
            ScriptCommand::Show => "tcshape-show",
        }
    }
}

/// The invoking command line without `--tc-script`.
pub fn original_command_line(argv: &[String]) -> String {
    let mut items = vec!["tcshape".to_string()];
    items.extend(argv.iter().skip(1).filter(|a| *a != TC_SCRIPT_FLAG).cloned());
    items.join(" ")
}

/// Script text: shebang, header and the command history verbatim.
pub fn render_tc_script(command: ScriptCommand, original: &str, history: &[String], created_at: &str) -> String {
    let mut lines = vec!["#!/bin/sh".to_string(), String::new()];
    if command != ScriptCommand::Show {
        lines.extend([
            "# command sequence in this script attempt to simulate the following tcshape command:".to_string(),
            "#".to_string(),
            format!("#   {}", original),
        ]);
    }
    lines.extend([
        "#".to_string(),
        format!("# the script execution result may different from '{}'", original),
        "#".to_string(),
        format!("# created by {} on {}.", command.name(), created_at),
        String::new(),
    ]);
    lines.extend(history.iter().cloned());

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// Write `<command>_<suffix>.sh` into `dir` with mode 0755.
pub fn write_tc_script(
    dir: &Path,
    command: ScriptCommand,
    argv: &[String],
    history: &[String],
    suffix: Option<&str>,
) -> TcshapeResult<PathBuf> {
    let mut name_items = vec![command.name()];
    if let Some(suffix) = suffix.filter(|s| !s.is_empty()) {
        name_items.push(suffix);
    }
    let path = dir.join(format!("{}.sh", name_items.join("_")));

    let created_at = Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string();
    let text = render_tc_script(command, &original_command_line(argv), history, &created_at);
    fs::write(&path, text)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

    info!("written a tc script to '{}'", path.display());
    Ok(path)
}
