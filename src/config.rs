//! Configuration module for the line-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::framing::LineEnding;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "line-echo")]
#[command(author = "line-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0 or ::1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Bounded wait for each accept attempt, in milliseconds
    #[arg(long)]
    pub accept_timeout_ms: Option<u64>,

    /// Idle read timeout per connection in milliseconds (0 = none)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Write timeout per connection in milliseconds (0 = none)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Listen backlog for pending connections
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Terminator appended to echoed lines
    #[arg(long, value_enum)]
    pub line_ending: Option<LineEnding>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accept wait in milliseconds
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            accept_timeout_ms: default_accept_timeout_ms(),
            backlog: default_backlog(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Read timeout in milliseconds (0 = none)
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds (0 = none)
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Terminator appended to echoed lines
    #[serde(default)]
    pub line_ending: LineEnding,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_io_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            line_ending: LineEnding::default(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6000
}

fn default_accept_timeout_ms() -> u64 {
    1000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub accept_timeout: Duration,
    /// `None` disables the read timeout.
    pub read_timeout: Option<Duration>,
    /// `None` disables the write timeout.
    pub write_timeout: Option<Duration>,
    pub backlog: i32,
    pub line_ending: LineEnding,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            accept_timeout: Duration::from_millis(
                cli.accept_timeout_ms
                    .unwrap_or(toml_config.server.accept_timeout_ms)
                    .max(1),
            ),
            read_timeout: millis_or_none(
                cli.read_timeout_ms
                    .unwrap_or(toml_config.connection.read_timeout_ms),
            ),
            write_timeout: millis_or_none(
                cli.write_timeout_ms
                    .unwrap_or(toml_config.connection.write_timeout_ms),
            ),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            line_ending: cli
                .line_ending
                .unwrap_or(toml_config.connection.line_ending),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
}

impl CliArgs {
    /// Arguments as if none were passed on the command line.
    fn empty() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            accept_timeout_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            backlog: None,
            line_ending: None,
            log_level: default_log_level(),
        }
    }
}

fn millis_or_none(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) => Some(e),
            ConfigError::TomlParse(_, e) => Some(e),
        }
    }
}
