//! Infrastructure configuration - fixed for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Filesystem paths for service state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for runtime state. Stream homes live under `streams/`.
    /// Default: ~/.local/share/stream-my-command
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/stream-my-command"))
            .unwrap_or_else(|| PathBuf::from(".local/share/stream-my-command"))
    }

    /// Directory that holds one `lb-{uuid}` home per stream.
    pub fn streams_dir(&self) -> PathBuf {
        self.state_dir.join("streams")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
        }
    }
}

/// HTTP listener address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Default: 5000
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_http_port() -> u16 {
        5000
    }

    /// `host:port`, ready for a TCP listener.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// How HTTP readers wait for bytes that have not been written yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Woken by the stream after every write.
    #[default]
    Push,
    /// Sleep a fixed interval and retry.
    Poll,
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStrategy::Push => write!(f, "push"),
            WaitStrategy::Poll => write!(f, "poll"),
        }
    }
}

impl FromStr for WaitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(WaitStrategy::Push),
            "poll" => Ok(WaitStrategy::Poll),
            other => Err(format!("unknown wait strategy '{}' (expected push or poll)", other)),
        }
    }
}

/// Stream buffering and command execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Segment capacity in bytes.
    /// Default: 10 MiB
    #[serde(default = "StreamConfig::default_segment_size")]
    pub segment_size: u64,

    /// Sleep between reads of a caught-up cursor, poll strategy only.
    /// Default: 100
    #[serde(default = "StreamConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Default: push
    #[serde(default)]
    pub wait_strategy: WaitStrategy,

    /// Commands allowed to run at once, across all slugs.
    /// Default: 1
    #[serde(default = "StreamConfig::default_max_concurrent_commands")]
    pub max_concurrent_commands: usize,
}

impl StreamConfig {
    fn default_segment_size() -> u64 {
        10 * 1024 * 1024
    }

    fn default_poll_interval_ms() -> u64 {
        100
    }

    fn default_max_concurrent_commands() -> usize {
        1
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            segment_size: Self::default_segment_size(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            wait_strategy: WaitStrategy::default(),
            max_concurrent_commands: Self::default_max_concurrent_commands(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}
