//! # Configuration Management Module
//!
//! This module handles all configuration aspects of the bridge: which CLI binary
//! to run and how to reach the radio, session timing, watchdog policy, the HTTP
//! listener, storage locations and logging.
//!
//! ## Configuration Structure
//!
//! - [`BridgeConfig`] - Device identity and the meshcore-cli config directory
//! - [`CliConfig`] - External CLI binary, transport and Init Script
//! - [`SessionConfig`] - Quiet period, command timeout and start/stop timing
//! - [`WatchdogConfig`] - Liveness probe interval and restart backoff policy
//! - [`HttpConfig`] - Listen address for the HTTP API
//! - [`StorageConfig`] - Advert event log location and in-memory window
//! - [`LoggingConfig`] - Logging level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshcore_bridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("CLI binary: {}", config.cli.binary);
//!     println!("Quiet period: {:?}", config.session.quiet_period());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [bridge]
//! device_name = "MeshCore"
//! config_dir = "/root/.config/meshcore"
//!
//! [cli]
//! binary = "meshcore-cli"
//! serial_port = "/dev/ttyUSB0"
//! init_commands = ["msgs_subscribe", "set json_log_rx on", "set print_adverts on"]
//!
//! [session]
//! quiet_period_ms = 300
//! command_timeout_ms = 10000
//!
//! [watchdog]
//! interval_ms = 5000
//! max_attempts = 10
//! ```
//!
//! ## Environment Integration
//!
//! The container deployment configures the bridge through environment variables.
//! Precedence is: CLI args > Environment > Config file > Defaults. See
//! [`Config::apply_env_overrides`] for the recognised variables.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Where [`Config::load_or_default`] found its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Defaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Device name; also the stem of the `.msgs` file written by meshcore-cli.
    pub device_name: String,
    /// meshcore-cli configuration directory (holds `<device>.msgs` and UI settings).
    pub config_dir: String,
    /// Default inactivity threshold for `POST /api/contacts/cleanup`.
    #[serde(default = "default_inactive_hours")]
    pub inactive_hours: u32,
}

fn default_inactive_hours() -> u32 {
    48
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub binary: String,
    /// Serial device path. Empty disables the `-s` argument and the device existence check.
    #[serde(default)]
    pub serial_port: String,
    /// When set, the CLI connects over TCP (e.g. meshcore-proxy) instead of serial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_host: Option<String>,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Verbatim argument vector. Overrides the transport-derived arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Base Init Script, replayed on every session start before the contact-approval mode.
    #[serde(default = "default_init_commands")]
    pub init_commands: Vec<String>,
    /// JSON fields inspected to recognise an advert line.
    #[serde(default = "default_advert_marker_fields")]
    pub advert_marker_fields: Vec<String>,
    /// Marker values that identify advert events.
    #[serde(default = "default_advert_event_types")]
    pub advert_event_types: Vec<String>,
}

fn default_tcp_port() -> u16 {
    5000
}

fn default_init_commands() -> Vec<String> {
    vec![
        "msgs_subscribe".to_string(),
        "set json_log_rx on".to_string(),
        "set print_adverts on".to_string(),
    ]
}

fn default_advert_marker_fields() -> Vec<String> {
    vec!["type".to_string(), "event".to_string()]
}

fn default_advert_event_types() -> Vec<String> {
    ["ADVERTISEMENT", "NEW_ADVERT", "NEW_CONTACT", "advert"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl CliConfig {
    /// Argument vector passed to the CLI binary.
    pub fn command_args(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }
        match self.tcp_host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => vec![
                "-t".to_string(),
                host.to_string(),
                "-p".to_string(),
                self.tcp_port.to_string(),
            ],
            _ if !self.serial_port.trim().is_empty() => {
                vec!["-s".to_string(), self.serial_port.trim().to_string()]
            }
            _ => Vec::new(),
        }
    }

    /// Serial device that must exist before a session is spawned, if any.
    pub fn required_device(&self) -> Option<&Path> {
        let tcp = self
            .tcp_host
            .as_deref()
            .map(|h| !h.trim().is_empty())
            .unwrap_or(false);
        if self.args.is_some() || tcp || self.serial_port.trim().is_empty() {
            None
        } else {
            Some(Path::new(self.serial_port.trim()))
        }
    }

    pub fn uses_tcp(&self) -> bool {
        self.tcp_host
            .as_deref()
            .map(|h| !h.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Silence after the last output line that marks a response complete.
    pub quiet_period_ms: u64,
    /// Default `execute_command` timeout.
    pub command_timeout_ms: u64,
    /// Time allowed for Init Script responses to drain before the session is published.
    #[serde(default = "default_init_settle_ms")]
    pub init_settle_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_init_settle_ms() -> u64 {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

impl SessionConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms.max(1))
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }
    pub fn init_settle(&self) -> Duration {
        Duration::from_millis(self.init_settle_ms)
    }
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Watchdog probe cadence and supervised-restart policy.
///
/// Restarts back off exponentially from `initial_backoff_ms`, capped at
/// `max_backoff_ms`. After `max_attempts` consecutive failed restarts the
/// watchdog gives up and reports it through `/health`; `0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    #[serde(default = "default_adverts_file")]
    pub adverts_file: String,
    /// Number of advert events kept in memory for `/adverts`.
    #[serde(default = "default_recent_adverts")]
    pub recent_adverts: usize,
}

fn default_adverts_file() -> String {
    "adverts.jsonl".to_string()
}

fn default_recent_adverts() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub cli: CliConfig,
    pub session: SessionConfig,
    pub watchdog: WatchdogConfig,
    pub http: HttpConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Load a config file if present, otherwise start from defaults, then apply
    /// environment overrides. A file that exists but does not parse is an error.
    ///
    /// Nothing is logged here: this runs before logging is configured, so the
    /// caller reports [`ConfigSource::Defaults`] once its logger is up.
    pub async fn load_or_default(path: &str) -> Result<(Self, ConfigSource)> {
        let (mut config, source) = if Path::new(path).exists() {
            (Self::load(path).await?, ConfigSource::File)
        } else {
            (Config::default(), ConfigSource::Defaults)
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok((config, source))
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply deployment environment variables.
    ///
    /// Recognised: `MC_SERIAL_PORT`, `MC_DEVICE_NAME`, `MC_CONFIG_DIR`,
    /// `MC_TCP_HOST`, `MC_TCP_PORT`, `MC_LOG_LEVEL`, `MC_BRIDGE_BIND`.
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MC_SERIAL_PORT") {
            self.cli.serial_port = v;
        }
        if let Some(v) = lookup("MC_DEVICE_NAME") {
            self.bridge.device_name = v;
        }
        if let Some(v) = lookup("MC_CONFIG_DIR") {
            self.bridge.config_dir = v;
        }
        if let Some(v) = lookup("MC_TCP_HOST") {
            self.cli.tcp_host = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("MC_TCP_PORT") {
            match v.trim().parse::<u16>() {
                Ok(port) => self.cli.tcp_port = port,
                Err(_) => warn!("Ignoring invalid MC_TCP_PORT '{}'", v),
            }
        }
        if let Some(v) = lookup("MC_LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        if let Some(v) = lookup("MC_BRIDGE_BIND") {
            self.http.bind = v;
        }
    }

    /// `<config_dir>/<device_name>.msgs`
    pub fn msgs_file_path(&self) -> PathBuf {
        Path::new(&self.bridge.config_dir).join(format!("{}.msgs", self.bridge.device_name))
    }

    /// Persisted UI/device settings file.
    pub fn settings_file_path(&self) -> PathBuf {
        Path::new(&self.bridge.config_dir).join(".webui_settings.json")
    }

    pub fn adverts_file_path(&self) -> PathBuf {
        Path::new(&self.storage.data_dir).join(&self.storage.adverts_file)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bridge: BridgeConfig {
                device_name: "MeshCore".to_string(),
                config_dir: "/root/.config/meshcore".to_string(),
                inactive_hours: default_inactive_hours(),
            },
            cli: CliConfig {
                binary: "meshcore-cli".to_string(),
                serial_port: "/dev/ttyUSB0".to_string(),
                tcp_host: None,
                tcp_port: default_tcp_port(),
                args: None,
                init_commands: default_init_commands(),
                advert_marker_fields: default_advert_marker_fields(),
                advert_event_types: default_advert_event_types(),
            },
            session: SessionConfig {
                quiet_period_ms: 300,
                command_timeout_ms: 10_000,
                init_settle_ms: default_init_settle_ms(),
                stop_timeout_ms: default_stop_timeout_ms(),
            },
            watchdog: WatchdogConfig {
                interval_ms: 5000,
                initial_backoff_ms: 1000,
                max_backoff_ms: 60_000,
                max_attempts: 10,
            },
            http: HttpConfig {
                bind: "0.0.0.0:5001".to_string(),
            },
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                adverts_file: default_adverts_file(),
                recent_adverts: default_recent_adverts(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
            },
        }
    }
}
