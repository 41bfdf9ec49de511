//! External command execution and `show` output capture.
//!
//! Every `tc`, `ip` and `iptables` invocation goes through [`Executor`], which
//! records the command line for `--tc-command`/`--tc-script`, short-circuits
//! in dry-run mode and classifies failures. "Object already exists" and
//! "object not found" are idempotent successes; anything else surfaces the
//! tool's status and stderr verbatim. There is no retry.

use std::env;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use tcshape_shared::errors::{TcshapeError, TcshapeResult};
use tracing::{debug, instrument};

/// stderr fragments meaning the object we tried to create is already there.
const ALREADY_EXISTS_PATTERNS: &[&str] = &["File exists", "already exists"];

/// stderr fragments meaning the object we tried to remove is already gone.
const NOT_FOUND_PATTERNS: &[&str] = &[
    "No such file or directory",
    "Cannot find specified qdisc",
    "Cannot find device",
    "Cannot delete qdisc with handle of zero",
    "does not exist",
    "Bad rule (does a matching rule exist in that chain?)",
];

/// One external command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
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

    /// Convert to a system command
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Raw result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Process execution seam.
pub trait CommandRunner {
    fn execute(&mut self, command: &ToolCommand) -> io::Result<ToolOutput>;
}

/// Runs commands with `std::process::Command`, blocking, no timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn execute(&mut self, command: &ToolCommand) -> io::Result<ToolOutput> {
        let output = command.to_command().output()?;
        Ok(ToolOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// How a failed command was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    AlreadyExists,
    NotFound,
    Fatal,
}

/// Classify a non-zero exit by its stderr.
pub fn classify_failure(stderr: &str) -> FailureKind {
    if ALREADY_EXISTS_PATTERNS.iter().any(|p| stderr.contains(p)) {
        FailureKind::AlreadyExists
    } else if NOT_FOUND_PATTERNS.iter().any(|p| stderr.contains(p)) {
        FailureKind::NotFound
    } else {
        FailureKind::Fatal
    }
}

/// Raw text of the three `show` listings of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowOutput {
    pub qdisc: String,
    pub class: String,
    pub filter: String,
}

impl ShowOutput {
    pub fn is_empty(&self) -> bool {
        self.qdisc.trim().is_empty() && self.class.trim().is_empty() && self.filter.trim().is_empty()
    }
}

/// Command executor with history and dry-run support.
pub struct Executor<R: CommandRunner> {
    runner: R,
    dry_run: bool,
    tc_program: String,
    history: Vec<String>,
}

impl<R: CommandRunner> Executor<R> {
    pub fn new(runner: R, tc_program: impl Into<String>) -> Self {
        Self {
            runner,
            dry_run: false,
            tc_program: tc_program.into(),
            history: Vec::new(),
        }
    }

    /// Record commands without running them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Every command issued so far, in order.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run a command, treating existence errors as success.
    pub fn run(&mut self, command: &ToolCommand) -> TcshapeResult<ToolOutput> {
        let line = command.to_string();
        self.history.push(line.clone());

        if self.dry_run {
            debug!("dry-run: {}", line);
            return Ok(ToolOutput::default());
        }

        debug!("Executing: {}", line);
        let output = self.runner.execute(command).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TcshapeError::CommandNotFound {
                program: command.program.clone(),
            },
            _ => TcshapeError::Io(e),
        })?;

        if output.status == 0 {
            return Ok(output);
        }

        match classify_failure(&output.stderr) {
            FailureKind::AlreadyExists => {
                debug!("'{}' skipped: object already exists", line);
                Ok(output)
            }
            FailureKind::NotFound => {
                debug!("'{}' skipped: object not found", line);
                Ok(output)
            }
            FailureKind::Fatal => Err(TcshapeError::ExternalToolFailure {
                command: line,
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            }),
        }
    }

    /// Run a command and return its stdout.
    pub fn capture(&mut self, command: &ToolCommand) -> TcshapeResult<String> {
        self.run(command).map(|output| output.stdout)
    }

    fn show(&mut self, object: &str, device: &str) -> TcshapeResult<String> {
        let command = ToolCommand::new(self.tc_program.clone()).args([object, "show", "dev", device]);
        self.capture(&command)
    }

    /// `tc qdisc|class|filter show dev <device>`.
    #[instrument(skip(self))]
    pub fn capture_show(&mut self, device: &str) -> TcshapeResult<ShowOutput> {
        Ok(ShowOutput {
            qdisc: self.show("qdisc", device)?,
            class: self.show("class", device)?,
            filter: self.show("filter", device)?,
        })
    }

    /// `tc filter show dev <device> ingress`.
    pub fn capture_ingress_filters(&mut self, device: &str) -> TcshapeResult<String> {
        let command = ToolCommand::new(self.tc_program.clone())
            .args(["filter", "show", "dev", device, "ingress"]);
        self.capture(&command)
    }
}

/// Locate an executable on `PATH`.
pub fn find_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Fail with `CommandNotFound` unless `name` is installed.
pub fn check_command_installation(name: &str) -> TcshapeResult<()> {
    match find_program(name) {
        Some(path) => {
            debug!("found {} at {}", name, path.display());
            Ok(())
        }
        None => Err(TcshapeError::CommandNotFound {
            program: name.to_string(),
        }),
    }
}
