//! Configuration management for the termgate gateway.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termgate/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sanitize::OutputMode;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen must be a socket address like 127.0.0.1:8000, got {0}")]
    InvalidListenAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("max_sessions must be between 1 and 10000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("default terminal size must be non-zero, got {rows}x{cols}")]
    InvalidDimensions { rows: u16, cols: u16 },

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("container runtime not found in PATH: {0}")]
    InvalidContainerRuntime(String),

    #[error("container image must not be empty")]
    EmptyContainerImage,

    #[error("reaper interval_secs must be greater than 0")]
    InvalidReaperInterval,

    #[error("reaper idle_timeout_secs must be greater than 0")]
    InvalidIdleTimeout,

    #[error("reaper grace_period_secs must be between 0 and 300, got {0}")]
    InvalidGracePeriod(u64),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default listen address for the websocket server.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8000";

/// Main configuration structure for the termgate gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging configuration.
    pub server: ServerConfig,

    /// What gets spawned for each session.
    pub session: SessionConfig,

    /// Idle session reclamation.
    pub reaper: ReaperConfig,

    /// Output forwarding and diagnostics.
    pub output: OutputConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the websocket server binds to.
    pub listen: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; logs rotate daily when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Which kind of process backs a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// A shell on the gateway host.
    #[default]
    Local,
    /// An interpreter inside a resource-capped container.
    Container,
}

/// Session spawn configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Local shell or container.
    pub backend: SessionBackend,

    /// Shell to run for the local backend.
    pub shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Extra environment variables for every session.
    pub env: BTreeMap<String, String>,

    /// Working directory for local sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Initial terminal rows.
    pub rows: u16,

    /// Initial terminal columns.
    pub cols: u16,

    /// Container backend settings.
    pub container: ContainerConfig,
}

/// Container backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary (docker, podman).
    pub runtime: String,

    /// Image to run.
    pub image: String,

    /// Command started inside the container.
    pub command: String,

    /// Arguments for the command.
    pub args: Vec<String>,

    /// CPU cap passed to `--cpus`.
    pub cpus: String,

    /// Memory cap passed to `--memory`.
    pub memory: String,

    /// Process cap passed to `--pids-limit`.
    pub pids_limit: u32,

    /// Network mode passed to `--network`.
    pub network: String,
}

/// Idle reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaperConfig {
    /// How often the registry is scanned, in seconds.
    pub interval_secs: u64,

    /// Inactivity after which a session is reclaimed, in seconds.
    pub idle_timeout_secs: u64,

    /// Time between the graceful signal and the forced kill, in seconds.
    pub grace_period_secs: u64,
}

/// Output forwarding configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// Whether clients receive raw PTY output or sanitized text.
    pub forward: OutputMode,

    /// Log sanitized session output at trace level.
    pub log_output: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Local,
            shell: default_shell(),
            shell_args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            max_sessions: 100,
            rows: protocol::DEFAULT_ROWS,
            cols: protocol::DEFAULT_COLS,
            container: ContainerConfig::default(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            command: "python3".to_string(),
            args: Vec::new(),
            cpus: "0.5".to_string(),
            memory: "256m".to_string(),
            pids_limit: 128,
            network: "none".to_string(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_timeout_secs: 15 * 60,
            grace_period_secs: 5,
        }
    }
}

impl ReaperConfig {
    /// Scan interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Idle threshold.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Grace period before a forced kill.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Checks that a program exists, either as an absolute path or on PATH.
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(program).is_ok()
    }
}

/// A setting taken from an environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverride {
    /// Variable name.
    pub variable: &'static str,
    /// Value it supplied.
    pub value: String,
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMGATE_LISTEN: Override the listen address
    /// - TERMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the overrides applied. Configuration is loaded before logging
    /// is set up, so reporting them is left to the caller.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut applied = Vec::new();

        if let Ok(listen) = std::env::var("TERMGATE_LISTEN") {
            if !listen.is_empty() {
                self.server.listen = listen.clone();
                applied.push(EnvOverride {
                    variable: "TERMGATE_LISTEN",
                    value: listen,
                });
            }
        }

        if let Ok(level) = std::env::var("TERMGATE_LOG_LEVEL") {
            if !level.is_empty() {
                self.server.log_level = level.clone();
                applied.push(EnvOverride {
                    variable: "TERMGATE_LOG_LEVEL",
                    value: level,
                });
            }
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddress(self.server.listen.clone()));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if self.session.max_sessions < 1 || self.session.max_sessions > 10_000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.rows == 0 || self.session.cols == 0 {
            return Err(ConfigError::InvalidDimensions {
                rows: self.session.rows,
                cols: self.session.cols,
            });
        }

        match self.session.backend {
            SessionBackend::Local => {
                if !program_exists(&self.session.shell) {
                    return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
                }
            }
            SessionBackend::Container => {
                let container = &self.session.container;
                if container.image.trim().is_empty() {
                    return Err(ConfigError::EmptyContainerImage);
                }
                if !program_exists(&container.runtime) {
                    return Err(ConfigError::InvalidContainerRuntime(
                        container.runtime.clone(),
                    ));
                }
            }
        }

        if self.reaper.interval_secs == 0 {
            return Err(ConfigError::InvalidReaperInterval);
        }
        if self.reaper.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }
        if self.reaper.grace_period_secs > 300 {
            return Err(ConfigError::InvalidGracePeriod(self.reaper.grace_period_secs));
        }

        Ok(())
    }

    /// Returns the parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))
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

    /// Load configuration from the default path.
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
