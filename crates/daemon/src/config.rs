//! Configuration management for the Nomacode daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/nomacode/config.toml`.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{BackendPreference, SessionSettings, DEFAULT_BUFFER_CAPACITY};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 0 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("buffer_capacity must be between 1 and 67108864 bytes, got {value}")]
    InvalidBufferCapacity { value: usize },

    #[error("terminal size must be non-zero, got {cols}x{rows}")]
    InvalidTerminalSize { cols: u16, rows: u16 },

    #[error("grace_period_secs must be between 0 and 300, got {0}")]
    InvalidGracePeriod(u64),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound on the per-session replay buffer.
const MAX_BUFFER_CAPACITY: usize = 64 * 1024 * 1024;

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 3000;

/// Main configuration structure for the Nomacode daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Viewer gateway listener.
    pub gateway: GatewayConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Process-wide shutdown behaviour.
    pub shutdown: ShutdownConfig,

    /// Tool detection.
    pub tools: ToolsConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data such as log files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write daily-rotated log files under `data_dir/logs`.
    pub log_to_file: bool,
}

/// Viewer gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to listen on. Localhost only by default.
    pub bind: IpAddr,

    /// TCP port to listen on.
    pub port: u16,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Command for the `shell` tool; `$SHELL` or `/bin/sh` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_shell: Option<String>,

    /// Process backend: auto, pty, script or pipe.
    pub backend: BackendPreference,

    /// Maximum number of running sessions (0 = unlimited).
    pub max_sessions: usize,

    /// Output bytes kept per session for replay on attach.
    pub buffer_capacity: usize,

    /// Terminal columns for sessions created without a size.
    pub cols: u16,

    /// Terminal rows for sessions created without a size.
    pub rows: u16,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds sessions get to exit after a termination request before
    /// they are killed.
    pub grace_period_secs: u64,
}

/// Tool detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Seconds a detection result stays valid.
    pub cache_ttl_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
        }
    }
}

impl GatewayConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let settings = SessionSettings::default();
        Self {
            default_shell: None,
            backend: BackendPreference::Auto,
            max_sessions: settings.max_sessions,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            cols: settings.default_cols,
            rows: settings.default_rows,
        }
    }
}

impl SessionConfig {
    /// Registry limits and defaults derived from this section.
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            max_sessions: self.max_sessions,
            buffer_capacity: self.buffer_capacity,
            default_cols: self.cols,
            default_rows: self.rows,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 3,
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

impl ToolsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nomacode")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nomacode")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Empty values are ignored, and so are values that do not parse.
    /// Supported variables:
    /// - NOMACODE_PORT: gateway port
    /// - NOMACODE_BIND: gateway bind address
    /// - NOMACODE_LOG_LEVEL: log level (trace, debug, info, warn, error)
    /// - NOMACODE_BACKEND: process backend (auto, pty, script, pipe)
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_override("NOMACODE_PORT") {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(e) => tracing::warn!("Ignoring NOMACODE_PORT={}: {}", port, e),
            }
        }

        if let Some(bind) = env_override("NOMACODE_BIND") {
            match bind.parse() {
                Ok(addr) => self.gateway.bind = addr,
                Err(e) => tracing::warn!("Ignoring NOMACODE_BIND={}: {}", bind, e),
            }
        }

        if let Some(level) = env_override("NOMACODE_LOG_LEVEL") {
            self.daemon.log_level = level;
        }

        if let Some(backend) = env_override("NOMACODE_BACKEND") {
            match backend.parse() {
                Ok(preference) => self.session.backend = preference,
                Err(e) => tracing::warn!("Ignoring NOMACODE_BACKEND: {}", e),
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.buffer_capacity == 0 || self.session.buffer_capacity > MAX_BUFFER_CAPACITY
        {
            return Err(ConfigError::InvalidBufferCapacity {
                value: self.session.buffer_capacity,
            });
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                cols: self.session.cols,
                rows: self.session.rows,
            });
        }

        if self.shutdown.grace_period_secs > 300 {
            return Err(ConfigError::InvalidGracePeriod(
                self.shutdown.grace_period_secs,
            ));
        }

        if let Some(shell) = &self.session.default_shell {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Directory for rotated log files.
    pub fn log_dir(&self) -> PathBuf {
        self.daemon.data_dir.join("logs")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from `~/.config/nomacode/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_override(name: &str) -> Option<String> {
    let value = std::env::var(name).ok().filter(|v| !v.is_empty())?;
    tracing::info!("Overriding configuration from environment: {}={}", name, value);
    Some(value)
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
