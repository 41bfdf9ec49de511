//! Configuration management for tcshape.
//!
//! Combines the parsed command line, logging settings and the tool paths
//! used when talking to tc, ip and iptables.

pub mod app_config;
pub mod cli;
pub mod defaults;

pub use app_config::{AppConfig, LogLevel};
pub use cli::{CliCommand, CliConfig, DeleteTarget, OutputMode};
pub use defaults::ShaperConfig;

use anyhow::Result;
use clap::ArgMatches;

/// Main configuration manager that combines all configuration sources
#[derive(Debug, Clone)]
pub struct ConfigManager {
    pub cli: CliConfig,
    pub app: AppConfig,
    pub shaper: ShaperConfig,
}

impl ConfigManager {
    /// Creates a new configuration manager from CLI arguments and environment
    pub fn from_cli_and_env() -> Result<Self> {
        Self::from_cli(CliConfig::from_args()?)
    }

    /// Same as [`ConfigManager::from_cli_and_env`] for already parsed arguments.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        Self::from_cli(CliConfig::from_matches(matches)?)
    }

    fn from_cli(cli: CliConfig) -> Result<Self> {
        let app = AppConfig::from_cli(&cli)?;
        let shaper = ShaperConfig::from_env()?;
        Ok(Self { cli, app, shaper })
    }

    /// Validates the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.cli.validate()?;
        self.app.validate()?;
        if self.shaper.tc_program.is_empty() {
            return Err(anyhow::anyhow!("tc program cannot be empty"));
        }
        Ok(())
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        self.app.init_logging()
    }
}
