//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/remark/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/remark/` (~/.config/remark/)
//! - Data: `$XDG_DATA_HOME/remark/` (~/.local/share/remark/)
//! - State/Logs: `$XDG_STATE_HOME/remark/` (~/.local/state/remark/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// View-log watcher configuration
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Actor identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Collector delivery configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Cross-process relay configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Status display configuration
    #[serde(default)]
    pub status: StatusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// View-log watcher configuration
#[derive(Debug, Deserialize)]
pub struct WatcherConfig {
    /// Directories scanned for view logs (`*.jsonl`)
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Seconds between discovery passes for newly appeared view logs
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            roots: vec![],
            rescan_interval_secs: default_rescan_interval(),
        }
    }
}

fn default_rescan_interval() -> u64 {
    15
}

/// Actor identity configuration
///
/// A pinned identity acts as the final detection fallback when no probe
/// finds one in the observed documents.
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    /// Pinned actor display name (optional)
    pub name: Option<String>,

    /// Pinned actor profile locator (optional)
    pub profile_url: Option<String>,

    /// Seconds between re-poll attempts while the identity is unresolved
    #[serde(default = "default_identity_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: None,
            profile_url: None,
            poll_interval_secs: default_identity_poll_interval(),
        }
    }
}

fn default_identity_poll_interval() -> u64 {
    30
}

/// Collector delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Collector base URL (e.g. `https://collector.example.com`)
    pub endpoint_url: Option<String>,

    /// Bearer token attached to collector requests (optional; absence
    /// means unauthenticated requests are sent as-is)
    pub bearer_token: Option<String>,

    /// First retry delay after a failed delivery, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Retry delay cap, in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Periodic outbox flush interval, in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            bearer_token: None,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            flush_interval_secs: default_flush_interval(),
            timeout_secs: default_timeout(),
        }
    }
}

impl DeliveryConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        match self.endpoint_url.as_deref() {
            None | Some("") => Err(Error::Config(
                "delivery.endpoint_url is required".to_string(),
            )),
            Some(_) => {
                if self.initial_delay_ms == 0 {
                    return Err(Error::Config(
                        "delivery.initial_delay_ms must be greater than 0".to_string(),
                    ));
                }
                if self.max_delay_secs == 0 {
                    return Err(Error::Config(
                        "delivery.max_delay_secs must be greater than 0".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_max_delay_secs() -> u64 {
    300
}

fn default_flush_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    30
}

/// Cross-process relay configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Unix socket path for the relay; defaults to the state directory
    pub socket_path: Option<PathBuf>,

    /// IANA timezone name used for daily count queries
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            timezone: default_timezone(),
        }
    }
}

impl RelayConfig {
    /// Effective relay socket path
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| Config::state_dir().join("relay.sock"))
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Status display configuration
#[derive(Debug, Deserialize)]
pub struct StatusConfig {
    /// Daily comment goal shown by the status display
    #[serde(default = "default_goal")]
    pub goal: u32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            goal: default_goal(),
        }
    }
}

fn default_goal() -> u32 {
    5
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/remark/config.toml` (~/.config/remark/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("remark").join("config.toml")
    }

    /// Returns the data directory path (for the outbox database)
    ///
    /// `$XDG_DATA_HOME/remark/` (~/.local/share/remark/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("remark")
    }

    /// Returns the state directory path (for logs and the relay socket)
    ///
    /// `$XDG_STATE_HOME/remark/` (~/.local/state/remark/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("remark")
    }

    /// Returns the outbox database file path
    ///
    /// `$XDG_DATA_HOME/remark/outbox.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("outbox.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/remark/remark.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("remark.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path
    /// behavior before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
