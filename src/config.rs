//! Configuration module for the metrics ingestion server.
//!
//! Supports command-line arguments, environment variables and a TOML
//! configuration file. CLI arguments take precedence over environment
//! variables, which take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::websocket::frame::DEFAULT_MAX_MESSAGE_SIZE;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "metrics-ingest")]
#[command(version)]
#[command(about = "A WebSocket metrics ingestion endpoint", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Path of the metrics log file
    #[arg(short = 'o', long, env = "LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key; enables TLS together with --tls-cert
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Largest accepted message in bytes
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

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
    pub tls: TlsConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// TLS certificate and key, both or neither
#[derive(Debug, Deserialize, Default)]
pub struct TlsConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Metrics log file configuration
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
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
    9090
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_log_path() -> PathBuf {
    PathBuf::from("metrics.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Certificate and key paths for the TLS listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_path: PathBuf,
    pub tls: Option<TlsPaths>,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        Self {
            host: toml_config.server.host,
            port: toml_config.server.port,
            log_path: toml_config.log.path,
            tls: None,
            max_connections: toml_config.server.max_connections,
            max_message_size: toml_config.server.max_message_size,
            log_level: toml_config.logging.level,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, environment and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI/env values over TOML values.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let cert = cli.tls_cert.or(toml_config.tls.cert);
        let key = cli.tls_key.or(toml_config.tls.key);
        let tls = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::IncompleteTls("key")),
            (None, Some(_)) => return Err(ConfigError::IncompleteTls("certificate")),
        };

        let max_message_size = cli
            .max_message_size
            .unwrap_or(toml_config.server.max_message_size);
        if max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size must be positive"));
        }

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            log_path: cli.log_path.unwrap_or(toml_config.log.path),
            tls,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections)
                .max(1),
            max_message_size,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// URL clients should connect to.
    pub fn listen_url(&self) -> String {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("TLS {0} missing: certificate and key must be given together")]
    IncompleteTls(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9090);
        assert_eq!(config.log_path, PathBuf::from("metrics.log"));
        assert_eq!(config.tls, None);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.listen_url(), "ws://0.0.0.0:9090");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 8443
            max_connections = 64

            [tls]
            cert = "/etc/metrics/cert.pem"
            key = "/etc/metrics/key.pem"

            [log]
            path = "/var/log/metrics.log"

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::resolve(CliArgs::default(), toml_config).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8443);
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.log_path, PathBuf::from("/var/log/metrics.log"));
        assert_eq!(
            config.tls,
            Some(TlsPaths {
                cert: PathBuf::from("/etc/metrics/cert.pem"),
                key: PathBuf::from("/etc/metrics/key.pem"),
            })
        );
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.listen_url(), "wss://127.0.0.1:8443");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 7000

            [log]
            path = "from-file.log"
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            port: Some(7001),
            log_path: Some(PathBuf::from("from-cli.log")),
            log_level: Some("warn".to_string()),
            ..Default::default()
        };

        let config = Config::resolve(cli, toml_config).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.log_path, PathBuf::from("from-cli.log"));
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_cli_arguments() {
        let cli = CliArgs::try_parse_from([
            "metrics-ingest",
            "--host",
            "127.0.0.1",
            "--port",
            "9999",
            "--log-path",
            "/tmp/m.log",
            "--tls-cert",
            "c.pem",
            "--tls-key",
            "k.pem",
        ])
        .unwrap();

        let config = Config::resolve(cli, TomlConfig::default()).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9999);
        assert_eq!(config.log_path, PathBuf::from("/tmp/m.log"));
        assert!(config.tls.is_some());
    }

    #[test]
    fn test_incomplete_tls() {
        let cli = CliArgs {
            tls_cert: Some(PathBuf::from("cert.pem")),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(cli, TomlConfig::default()),
            Err(ConfigError::IncompleteTls("key"))
        ));

        let toml_config: TomlConfig = toml::from_str("[tls]\nkey = \"key.pem\"").unwrap();
        assert!(matches!(
            Config::resolve(CliArgs::default(), toml_config),
            Err(ConfigError::IncompleteTls("certificate"))
        ));
    }

    #[test]
    fn test_zero_message_size_rejected() {
        let cli = CliArgs {
            max_message_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
