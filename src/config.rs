//! Configuration for the linewire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::runtime::DEFAULT_BACKLOG;
use crate::server::DEFAULT_POOL_CAPACITY;

/// Command-line arguments for the line server
#[derive(Parser, Debug)]
#[command(name = "linewire")]
#[command(author = "linewire authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9090)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Seconds a connection may wait for its next message (0 = unbounded)
    #[arg(short = 'r', long)]
    pub read_timeout: Option<u64>,

    /// Seconds granted to active connections on shutdown
    #[arg(short = 's', long)]
    pub shutdown_timeout: Option<u64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Number of idle contexts kept for reuse
    #[arg(long)]
    pub pool_capacity: Option<usize>,

    /// PEM certificate chain, enables TLS along with --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

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
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Read timeout in seconds, 0 disables it
    #[serde(default)]
    pub read_timeout: u64,
    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            read_timeout: 0,
            shutdown_timeout: default_shutdown_timeout(),
            backlog: default_backlog(),
            pool_capacity: default_pool_capacity(),
        }
    }
}

/// TLS configuration, both files or none
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
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
    "127.0.0.1:9090".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Certificate chain and private key of a TLS listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub read_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub backlog: u32,
    pub pool_capacity: usize,
    pub tls: Option<TlsFiles>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Config {
            listen: server.listen,
            read_timeout: None,
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout),
            backlog: server.backlog,
            pool_capacity: server.pool_capacity,
            tls: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Config::from_args(CliArgs::parse())
    }

    /// Resolves already parsed arguments, reading the TOML file they name.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Config::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let read_timeout = cli
            .read_timeout
            .unwrap_or(toml_config.server.read_timeout);
        let shutdown_timeout = cli
            .shutdown_timeout
            .unwrap_or(toml_config.server.shutdown_timeout);

        let tls = match (
            cli.tls_cert.or(toml_config.tls.cert),
            cli.tls_key.or(toml_config.tls.key),
        ) {
            (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            read_timeout: (read_timeout > 0).then(|| Duration::from_secs(read_timeout)),
            shutdown_timeout: Duration::from_secs(shutdown_timeout),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            pool_capacity: cli
                .pool_capacity
                .unwrap_or(toml_config.server.pool_capacity),
            tls,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("TLS needs both a certificate and a private key")]
    IncompleteTls,
}
