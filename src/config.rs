//! Configuration module for the chat relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the chat server
#[derive(Parser, Debug, Default)]
#[command(name = "chat-relay")]
#[command(author = "chat-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-user line-oriented TCP chat relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of concurrently connected clients
    #[arg(short = 'm', long)]
    pub max_clients: Option<usize>,

    /// Outbound lines buffered per client before it is dropped as too slow
    #[arg(long)]
    pub send_queue: Option<usize>,

    /// Number of runtime worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Registry capacity
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Per-session outbound queue length
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// How long shutdown waits for handlers to flush, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_clients: default_max_clients(),
            send_queue: default_send_queue(),
            workers: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
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
    8888
}

fn default_max_clients() -> usize {
    10
}

fn default_send_queue() -> usize {
    256
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub max_clients: usize,
    pub send_queue: usize,
    pub workers: Option<usize>,
    pub shutdown_grace_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;
        let config = Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            max_clients: cli.max_clients.unwrap_or(server.max_clients),
            send_queue: cli.send_queue.unwrap_or(server.send_queue),
            workers: cli.workers.or(server.workers),
            shutdown_grace_ms: server.shutdown_grace_ms,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1"));
        }
        if self.send_queue == 0 {
            return Err(ConfigError::Invalid("send_queue must be at least 1"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        Ok(())
    }

    /// Address string handed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .path.display(), .source)]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {}", .path.display(), .source)]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
impl Config {
    /// Loopback configuration on an ephemeral port.
    pub fn for_tests(max_clients: usize) -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_clients,
            send_queue: 64,
            workers: None,
            shutdown_grace_ms: 1000,
            log_level: "debug".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:8888");
        assert_eq!(config.max_clients, 10);
        assert_eq!(config.send_queue, 256);
        assert_eq!(config.workers, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            max_clients = 3
            workers = 2
            shutdown_grace_ms = 50

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_clients, 3);
        assert_eq!(config.server.send_queue, 256);
        assert_eq!(config.server.workers, Some(2));
        assert_eq!(config.server.shutdown_grace_ms, 50);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str("[server]\nport = 9000\nmax_clients = 3\n").unwrap();
        let cli = CliArgs {
            port: Some(7000),
            log_level: Some("trace".to_string()),
            ..CliArgs::default()
        };

        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_clients, 3);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let cli = CliArgs {
            max_clients: Some(0),
            ..CliArgs::default()
        };
        let err = Config::merge(cli, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
