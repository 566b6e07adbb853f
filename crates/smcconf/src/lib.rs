//! Configuration loading for stream-my-command.
//!
//! Configuration is split into two parts:
//!
//! - **Infrastructure** (`InfraConfig`): paths, bind address, logging and
//!   stream buffering. Fixed once the process has started.
//!
//! - **Commands** (`CommandConfig`): the external programs exposed over HTTP,
//!   one per slug.
//!
//! # Usage
//!
//! ```rust,no_run
//! use smcconf::SmcConfig;
//!
//! let config = SmcConfig::load().expect("Failed to load config");
//!
//! println!("State dir: {}", config.infra.paths.state_dir.display());
//! println!("Listening on {}", config.infra.bind.addr());
//!
//! for command in &config.commands {
//!     println!("/api/v1/{} -> {}", command.slug, command.command);
//! }
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/stream-my-command/config.toml` (system)
//! 2. `~/.config/stream-my-command/config.toml` (user)
//! 3. `./stream-my-command.toml` (local override, or the `--config` path)
//! 4. Environment variables (`SMC_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! state_dir = "~/.local/share/stream-my-command"
//!
//! [bind]
//! host = "0.0.0.0"
//! http_port = 5000
//!
//! [telemetry]
//! log_level = "info"
//!
//! [stream]
//! segment_size = 10485760
//! wait_strategy = "push"
//! max_concurrent_commands = 1
//!
//! [[commands]]
//! slug = "nmap"
//! command = "nmap"
//! arguments = ["$1"]
//!
//! [commands.environment]
//! PATH = "/usr/bin:/bin"
//! ```

pub mod commands;
pub mod infra;
pub mod loader;

pub use commands::CommandConfig;
pub use infra::{BindConfig, InfraConfig, PathsConfig, StreamConfig, TelemetryConfig, WaitStrategy};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete stream-my-command configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmcConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

impl SmcConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/stream-my-command/config.toml`
    /// 3. `~/.config/stream-my-command/config.toml`
    /// 4. `./stream-my-command.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` in place of the local override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::config_from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Look up a command by slug.
    pub fn command(&self, slug: &str) -> Option<&CommandConfig> {
        self.commands.iter().find(|c| c.slug == slug)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stream = &self.infra.stream;
        if stream.segment_size == 0 {
            return Err(ConfigError::Invalid("stream.segment_size must be positive".into()));
        }
        if stream.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("stream.poll_interval_ms must be positive".into()));
        }
        if stream.max_concurrent_commands == 0 {
            return Err(ConfigError::Invalid(
                "stream.max_concurrent_commands must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for command in &self.commands {
            if command.slug.is_empty() || command.slug.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "invalid command slug '{}'",
                    command.slug
                )));
            }
            if command.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "command '{}' has no executable",
                    command.slug
                )));
            }
            if !seen.insert(command.slug.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate command slug '{}'",
                    command.slug
                )));
            }
        }
        Ok(())
    }
}
