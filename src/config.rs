//! Configuration module for the aesd socket server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the socket server
#[derive(Parser, Debug, Default)]
#[command(name = "aesd-socket")]
#[command(author = "aesd-socket authors")]
#[command(version = "0.1.0")]
#[command(about = "Appends client lines to a shared log and echoes the log back", long_about = None)]
pub struct CliArgs {
    /// Run detached from the controlling terminal
    #[arg(short, long)]
    pub daemon: bool,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000 or [::]:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Backing file for the shared log
    #[arg(short = 'f', long)]
    pub data_file: Option<PathBuf>,

    /// Seconds between timestamp records (0 = disabled)
    #[arg(short = 't', long)]
    pub timestamp_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append log output to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ticker: TickerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// listen(2) backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Upper bound on any blocking wait, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Run detached
    #[serde(default)]
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            poll_interval_ms: default_poll_interval_ms(),
            daemon: false,
        }
    }
}

/// Backing store configuration
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_file")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_data_file(),
        }
    }
}

/// Timestamp ticker configuration
#[derive(Debug, Deserialize)]
pub struct TickerConfig {
    /// Seconds between records (0 = disabled)
    #[serde(default = "default_timestamp_interval")]
    pub interval_secs: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_timestamp_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file; stdout when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_timestamp_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub poll_interval: Duration,
    pub data_file: PathBuf,
    /// `None` disables the timestamp ticker.
    pub timestamp_interval: Option<Duration>,
    pub daemon: bool,
    pub log_level: String,
    /// `None` logs to stdout.
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;

        if toml_config.server.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        let interval_secs = cli
            .timestamp_interval
            .unwrap_or(toml_config.ticker.interval_secs);

        Ok(Config {
            listen,
            backlog: toml_config.server.backlog,
            poll_interval: Duration::from_millis(toml_config.server.poll_interval_ms),
            data_file: cli.data_file.unwrap_or(toml_config.store.path),
            timestamp_interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
            daemon: cli.daemon || toml_config.server.daemon,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        })
    }

    /// Open the log file for appending, if one is configured.
    ///
    /// Opened before daemonizing, so a relative path resolves against the
    /// starting directory and the handle survives the later `chdir`.
    pub fn open_log_file(&self) -> Result<Option<File>, ConfigError> {
        self.log_file
            .as_ref()
            .map(|path| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| ConfigError::LogFile(path.clone(), e))
            })
            .transpose()
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, std::net::AddrParseError),
    InvalidPollInterval,
    LogFile(PathBuf, std::io::Error),
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
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
            ConfigError::InvalidPollInterval => {
                write!(f, "server.poll_interval_ms must be greater than zero")
            }
            ConfigError::LogFile(path, e) => {
                write!(f, "Failed to open log file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) | ConfigError::LogFile(_, e) => Some(e),
            ConfigError::TomlParse(_, e) => Some(e),
            ConfigError::InvalidListen(_, e) => Some(e),
            ConfigError::InvalidPollInterval => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliArgs {
        CliArgs::default()
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.backlog, 10);
        assert_eq!(config.data_file, PathBuf::from("/var/tmp/aesdsocketdata"));
        assert_eq!(config.timestamp_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(!config.daemon);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_file, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "[::]:9100"
            backlog = 32
            poll_interval_ms = 250
            daemon = true

            [store]
            path = "/tmp/log"

            [ticker]
            interval_secs = 5

            [logging]
            level = "debug"
            file = "/var/log/aesd.log"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "[::]:9100");
        assert_eq!(config.server.backlog, 32);
        assert_eq!(config.store.path, PathBuf::from("/tmp/log"));
        assert_eq!(config.ticker.interval_secs, 5);
        assert_eq!(config.logging.level, "debug");

        let config = Config::merge(cli(), config).unwrap();
        assert!(config.daemon);
        assert!(config.listen.is_ipv6());
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/aesd.log")));
    }

    #[test]
    fn test_cli_overrides_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:1234"
            [ticker]
            interval_secs = 5
            "#,
        )
        .unwrap();

        let args = CliArgs {
            listen: Some("127.0.0.1:4321".to_string()),
            timestamp_interval: Some(0),
            data_file: Some(PathBuf::from("/tmp/other")),
            daemon: true,
            ..cli()
        };

        let config = Config::merge(args, toml_config).unwrap();
        assert_eq!(config.listen.port(), 4321);
        assert_eq!(config.timestamp_interval, None);
        assert_eq!(config.data_file, PathBuf::from("/tmp/other"));
        assert!(config.daemon);
    }

    #[test]
    fn test_cli_log_settings_override_file() {
        let toml_config = || -> TomlConfig {
            toml::from_str(
                r#"
                [logging]
                level = "debug"
                file = "/var/log/aesd.log"
                "#,
            )
            .unwrap()
        };

        // An explicit level equal to the default still wins.
        let args = CliArgs {
            log_level: Some("info".to_string()),
            log_file: Some(PathBuf::from("/tmp/aesd.log")),
            ..cli()
        };
        let config = Config::merge(args, toml_config()).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/aesd.log")));

        let config = Config::merge(cli(), toml_config()).unwrap();
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aesd.log");
        std::fs::write(&path, b"earlier run\n").unwrap();

        let args = CliArgs {
            log_file: Some(path.clone()),
            ..cli()
        };
        let config = Config::merge(args, TomlConfig::default()).unwrap();
        let mut file = config.open_log_file().unwrap().unwrap();
        std::io::Write::write_all(&mut file, b"this run\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"earlier run\nthis run\n");

        let stdout_only = Config::merge(cli(), TomlConfig::default()).unwrap();
        assert!(stdout_only.open_log_file().unwrap().is_none());

        let args = CliArgs {
            log_file: Some(dir.path().join("missing").join("aesd.log")),
            ..cli()
        };
        let config = Config::merge(args, TomlConfig::default()).unwrap();
        assert!(matches!(
            config.open_log_file(),
            Err(ConfigError::LogFile(..))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let args = CliArgs {
            listen: Some("not-an-address".to_string()),
            ..cli()
        };
        assert!(matches!(
            Config::merge(args, TomlConfig::default()),
            Err(ConfigError::InvalidListen(..))
        ));

        let toml_config: TomlConfig = toml::from_str("[server]\npoll_interval_ms = 0").unwrap();
        assert!(matches!(
            Config::merge(cli(), toml_config),
            Err(ConfigError::InvalidPollInterval)
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let args = CliArgs {
            config: Some(PathBuf::from("/nonexistent/aesd.toml")),
            ..cli()
        };
        assert!(matches!(
            Config::from_cli(args),
            Err(ConfigError::FileRead(..))
        ));
    }
}
