//! Configuration module for duplex-ndjson.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES};
use crate::pacing::Pacer;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Command-line arguments for the duplex demo
#[derive(Parser, Debug)]
#[command(name = "duplex-ndjson")]
#[command(author = "duplex-ndjson authors")]
#[command(version = "0.1.0")]
#[command(about = "Full-duplex NDJSON ping/pong over one HTTP exchange", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (DEBUG, INFO, WARN, ERROR)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Address the endpoint binds to (e.g., localhost:8080)
    #[arg(long)]
    pub hostport: Option<String>,

    /// Pacing of outbound frames
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Whether each ping waits for its pong
    #[arg(long, value_enum)]
    pub exchange: Option<ExchangePolicy>,

    /// Pacing interval in milliseconds (paced mode only)
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Throughput report period in seconds (0 = disabled)
    #[arg(long)]
    pub report_interval_secs: Option<u64>,

    /// Grace period for endpoint shutdown in seconds
    #[arg(long)]
    pub shutdown_grace_secs: Option<u64>,

    /// Largest frame the decoder accepts, in bytes
    #[arg(long)]
    pub max_frame_bytes: Option<usize>,

    /// Reject frames carrying fields other than Msg and Seq
    #[arg(long)]
    pub deny_unknown_fields: bool,

    /// Start a fresh exchange after the endpoint ends the previous one
    #[arg(long)]
    pub reconnect: bool,
}

/// How outbound frames are paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// One frame per interval tick.
    Paced,
    /// Send as fast as the connection accepts.
    MaxThroughput,
}

/// Relationship between the two directions of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangePolicy {
    /// Every ping is answered by exactly one pong before the next ping.
    Paired,
    /// Both sides write on their own pacer and read whatever arrives.
    Independent,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_hostport")]
    pub hostport: String,
    /// Seconds the endpoint may take to drain on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostport: default_hostport(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Exchange-related configuration, shared by both roles
#[derive(Debug, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_policy")]
    pub policy: ExchangePolicy,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub deny_unknown_fields: bool,
    #[serde(default)]
    pub reconnect: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            policy: default_policy(),
            interval_ms: default_interval_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            deny_unknown_fields: false,
            reconnect: false,
        }
    }
}

/// Throughput reporting configuration
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Report period in seconds, 0 disables the reporter
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_hostport() -> String {
    "localhost:8080".to_string()
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_mode() -> Mode {
    Mode::Paced
}

fn default_policy() -> ExchangePolicy {
    ExchangePolicy::Paired
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_report_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Per-connection exchange behavior, cloned into every task that pumps frames.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub mode: Mode,
    pub policy: ExchangePolicy,
    pub interval: Duration,
    pub max_frame_bytes: usize,
    pub deny_unknown_fields: bool,
}

impl ExchangeSettings {
    /// A fresh codec honoring the frame size and unknown-field settings.
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_bytes).deny_unknown_fields(self.deny_unknown_fields)
    }

    /// A fresh tick source for outbound frames.
    pub fn pacer(&self) -> Pacer {
        Pacer::new(self.mode, self.interval)
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            policy: default_policy(),
            interval: Duration::from_millis(default_interval_ms()),
            max_frame_bytes: default_max_frame_bytes(),
            deny_unknown_fields: false,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub hostport: String,
    pub log_level: Level,
    pub exchange: ExchangeSettings,
    pub reconnect: bool,
    /// `None` disables the throughput reporter.
    pub report_interval: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let level = cli.log_level.unwrap_or(toml_config.logging.level);
        let log_level = level
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(level))?;

        let mode = cli.mode.unwrap_or(toml_config.exchange.mode);
        let interval_ms = cli.interval_ms.unwrap_or(toml_config.exchange.interval_ms);
        if mode == Mode::Paced && interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "interval must be non-zero in paced mode",
            ));
        }

        let max_frame_bytes = cli
            .max_frame_bytes
            .unwrap_or(toml_config.exchange.max_frame_bytes);
        if max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max frame size must be non-zero"));
        }

        let report_secs = cli
            .report_interval_secs
            .unwrap_or(toml_config.metrics.report_interval_secs);

        Ok(Config {
            hostport: cli.hostport.unwrap_or(toml_config.server.hostport),
            log_level,
            exchange: ExchangeSettings {
                mode,
                policy: cli.exchange.unwrap_or(toml_config.exchange.policy),
                interval: Duration::from_millis(interval_ms),
                max_frame_bytes,
                deny_unknown_fields: cli.deny_unknown_fields
                    || toml_config.exchange.deny_unknown_fields,
            },
            reconnect: cli.reconnect || toml_config.exchange.reconnect,
            report_interval: (report_secs > 0).then(|| Duration::from_secs(report_secs)),
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace_secs
                    .unwrap_or(toml_config.server.shutdown_grace_secs),
            ),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidLogLevel(String),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidLogLevel(level) => {
                write!(f, "Unknown log level '{}'", level)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}
