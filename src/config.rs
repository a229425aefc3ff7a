//! Configuration for the server core.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::CodecKind;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "stepd")]
#[command(version = "0.1.0")]
#[command(about = "An event-driven application server core", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7700)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Wire framing for accepted connections (binary or http)
    #[arg(long)]
    pub codec: Option<String>,

    /// Connection keep-alive in seconds
    #[arg(short = 'k', long)]
    pub keep_alive: Option<u64>,

    /// Suspended request timeout in milliseconds
    #[arg(long)]
    pub cmd_timeout: Option<u64>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

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
    pub timing: TimingConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Wire framing for accepted connections
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            codec: default_codec(),
            max_connections: default_max_connections(),
        }
    }
}

/// Timeout and timer configuration
#[derive(Debug, Deserialize)]
pub struct TimingConfig {
    /// Connection keep-alive in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Suspended request timeout in milliseconds
    #[serde(default = "default_cmd_timeout_ms")]
    pub cmd_timeout_ms: u64,
    /// Timer firings a suspended request survives before teardown
    #[serde(default = "default_max_timeouts")]
    pub max_timeouts: u32,
    /// Housekeeping tick interval in seconds
    #[serde(default = "default_housekeeping_secs")]
    pub housekeeping_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            cmd_timeout_ms: default_cmd_timeout_ms(),
            max_timeouts: default_max_timeouts(),
            housekeeping_secs: default_housekeeping_secs(),
        }
    }
}

/// Buffer sizing configuration
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    /// Capacity above which idle buffers are compacted, in bytes
    #[serde(default = "default_high_water")]
    pub high_water: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            high_water: default_high_water(),
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

fn default_listen() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_codec() -> String {
    "binary".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_cmd_timeout_ms() -> u64 {
    5_000
}

fn default_max_timeouts() -> u32 {
    3
}

fn default_housekeeping_secs() -> u64 {
    60
}

fn default_high_water() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub codec: String,
    pub keep_alive_secs: u64,
    pub cmd_timeout_ms: u64,
    pub max_timeouts: u32,
    pub max_connections: usize,
    pub buffer_high_water: usize,
    pub housekeeping_secs: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            codec: cli.codec.unwrap_or(toml_config.server.codec),
            keep_alive_secs: cli
                .keep_alive
                .unwrap_or(toml_config.timing.keep_alive_secs),
            cmd_timeout_ms: cli
                .cmd_timeout
                .unwrap_or(toml_config.timing.cmd_timeout_ms),
            max_timeouts: toml_config.timing.max_timeouts,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            buffer_high_water: toml_config.buffers.high_water,
            housekeeping_secs: toml_config.timing.housekeeping_secs,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        if !matches!(config.codec.as_str(), "binary" | "http") {
            return Err(ConfigError::BadCodec(config.codec));
        }
        Ok(config)
    }

    pub fn codec_kind(&self) -> CodecKind {
        match self.codec.as_str() {
            "http" => CodecKind::Http,
            _ => CodecKind::Binary,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.cmd_timeout_ms)
    }

    pub fn housekeeping(&self) -> Duration {
        Duration::from_secs(self.housekeeping_secs)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file '{0}': {1}")]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("unknown codec '{0}' (expected binary or http)")]
    BadCodec(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7700");
        assert_eq!(config.server.codec, "binary");
        assert_eq!(config.timing.keep_alive_secs, 60);
        assert_eq!(config.timing.max_timeouts, 3);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7700"
            codec = "http"
            max_connections = 500

            [timing]
            keep_alive_secs = 15
            cmd_timeout_ms = 2000
            max_timeouts = 5

            [buffers]
            high_water = 32768

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7700");
        assert_eq!(config.server.codec, "http");
        assert_eq!(config.server.max_connections, 500);
        assert_eq!(config.timing.keep_alive_secs, 15);
        assert_eq!(config.timing.cmd_timeout_ms, 2000);
        assert_eq!(config.timing.max_timeouts, 5);
        assert_eq!(config.buffers.high_water, 32768);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_and_validation() {
        let cli = CliArgs {
            config: None,
            listen: Some("127.0.0.1:9000".to_string()),
            codec: Some("http".to_string()),
            keep_alive: Some(5),
            cmd_timeout: None,
            max_connections: None,
            log_level: "info".to_string(),
        };
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.codec_kind(), CodecKind::Http);
        assert_eq!(config.keep_alive(), Duration::from_secs(5));
        assert_eq!(config.cmd_timeout(), Duration::from_millis(5000));

        let cli = CliArgs {
            config: None,
            listen: None,
            codec: Some("protobuf".to_string()),
            keep_alive: None,
            cmd_timeout: None,
            max_connections: None,
            log_level: "info".to_string(),
        };
        assert!(matches!(
            Config::resolve(cli),
            Err(ConfigError::BadCodec(_))
        ));
    }
}
