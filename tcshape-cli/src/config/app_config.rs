//! Application configuration: logging and where generated commands go.

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use super::cli::{CliConfig, OutputMode};

/// Log level enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing level filter string
    pub fn to_filter_string(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    /// Set when `RUST_LOG` drives the filter directly.
    pub log_filter: Option<String>,
    pub output: OutputMode,
    /// Directory `--tc-script` files are written to.
    pub script_dir: PathBuf,
}

impl AppConfig {
    /// Create application configuration from CLI config
    pub fn from_cli(cli_config: &CliConfig) -> Result<Self> {
        let rust_log = env::var("RUST_LOG").ok().filter(|v| !v.is_empty());
        let (log_level, log_filter) = if cli_config.debug {
            (LogLevel::Debug, None)
        } else if cli_config.quiet {
            (LogLevel::Error, None)
        } else {
            match rust_log {
                Some(level_str) => (Self::parse_log_level(&level_str), Some(level_str)),
                None => (LogLevel::Info, None),
            }
        };

        Ok(Self {
            log_level,
            log_filter,
            output: cli_config.output,
            script_dir: env::current_dir()?,
        })
    }

    /// Parse log level from string
    fn parse_log_level(level_str: &str) -> LogLevel {
        // Main level of a complex RUST_LOG value
        let main_level = level_str
            .split(',')
            .next()
            .unwrap_or(level_str)
            .split('=')
            .next()
            .unwrap_or(level_str)
            .to_lowercase();

        match main_level.as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn filter_directive(&self) -> String {
        self.log_filter
            .clone()
            .unwrap_or_else(|| self.log_level.to_filter_string().to_string())
    }

    /// Initialize logging based on configuration
    ///
    /// Logs go to stderr so that `show` and `--tc-command` output on stdout
    /// stays machine readable.
    pub fn init_logging(&self) -> Result<()> {
        let filter = EnvFilter::try_new(self.filter_directive())
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.to_filter_string()));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .event_format(tracing_subscriber::fmt::format().with_target(false).compact())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

        tracing::debug!("Logging initialized with level: {:?}", self.log_level);
        Ok(())
    }

    /// Validate application configuration
    pub fn validate(&self) -> Result<()> {
        if self.output == OutputMode::TcScript && !self.script_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "Script directory {} does not exist",
                self.script_dir.display()
            ));
        }
        Ok(())
    }
}
