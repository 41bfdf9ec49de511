//! Tests of the tcshape binary that need neither root nor a real tc.

use anyhow::Result;
use std::process::Command;

fn tcshape() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_tcshape"));
    command.env_remove("RUST_LOG");
    command
}

#[test]
fn test_cli_help_works() -> Result<()> {
    let output = tcshape().arg("--help").output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("tcshape"));
    assert!(stdout.contains("set"));
    assert!(stdout.contains("del"));
    assert!(stdout.contains("show"));
    assert!(stdout.contains("--tc-command"));
    Ok(())
}

#[test]
fn test_set_help_lists_shaping_options() -> Result<()> {
    let output = tcshape().args(["set", "--help"]).output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for option in ["--rate", "--delay", "--loss", "--duplicate", "--corrupt", "--reorder", "--direction"] {
        assert!(stdout.contains(option), "missing {option}");
    }
    Ok(())
}

#[test]
fn test_tc_command_prints_without_running() -> Result<()> {
    let output = tcshape()
        .args(["set", "eth0", "--rate", "1Mbps", "--delay", "10ms", "--tc-command"])
        .output()?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("tc qdisc add dev eth0 root handle"));
    assert!(stdout.contains("netem delay 10ms"));
    assert!(stdout.lines().any(|l| l.starts_with("tc filter add dev eth0")));
    Ok(())
}

#[test]
fn test_invalid_percentage_exits_with_einval() -> Result<()> {
    let output = tcshape()
        .args(["set", "eth0", "--loss", "150%", "--tc-command"])
        .output()?;
    assert_eq!(output.status.code(), Some(22));
    assert!(output.stdout.is_empty());
    Ok(())
}

#[test]
fn test_conflicting_modes_are_usage_errors() -> Result<()> {
    let output = tcshape()
        .args(["set", "eth0", "--delay", "1ms", "--add", "--change"])
        .output()?;
    assert!(!output.status.success());
    Ok(())
}
