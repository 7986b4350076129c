//! Configuration management for the FileShell client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/fileshell/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{PublicKey, MAX_PLAINTEXT_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::DEFAULT_CHUNK_SIZE;

/// Largest chunk that still fits one encrypted frame with envelope overhead.
pub const MAX_CHUNK_SIZE: usize = MAX_PLAINTEXT_SIZE - 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("connect_timeout must be between 1 and 300 seconds, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("server_key is not a valid public key: {0}")]
    InvalidServerKey(String),

    #[error("chunk_size must be between 1 and {max}, got {got}")]
    InvalidChunkSize { got: usize, max: usize },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the FileShell client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Where to connect and whom to trust.
    pub server: ServerConfig,

    /// Local identity and logging.
    pub client: ClientConfig,

    /// File transfer settings.
    pub transfer: TransferConfig,
}

/// Server address and trust settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or address of the server.
    pub host: String,

    /// TCP port of the server.
    pub port: u16,

    /// Hex-encoded static public key of the server. When unset the key is
    /// not checked and its fingerprint is printed after the handshake.
    pub server_key: Option<String>,

    /// Seconds to wait for the TCP connection and handshake.
    pub connect_timeout: u64,
}

/// Local identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// File holding the client's static keypair.
    pub identity_path: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

/// File transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per upload chunk and per digest read.
    pub chunk_size: usize,

    /// Directory downloads are written to. Defaults to the current directory.
    pub download_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5150,
            server_key: None,
            connect_timeout: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            identity_path: default_identity_path(),
            log_level: "warn".to_string(),
            log_file: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            download_dir: PathBuf::from("."),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fileshell")
        .join("config.toml")
}

/// Returns the default identity key path.
/// One environment variable seen by [`Config::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOverride {
    /// The value replaced the configured one.
    Applied { var: &'static str, value: String },
    /// The value could not be parsed and was skipped.
    Ignored { var: &'static str, value: String },
}

impl EnvOverride {
    /// Logs the override at `info`, or at `warn` when it was ignored.
    pub fn log(&self) {
        match self {
            EnvOverride::Applied { var, value } => {
                tracing::info!("Overriding configuration from {}: {}", var, value)
            }
            EnvOverride::Ignored { var, value } => {
                tracing::warn!("Ignoring invalid {}: {}", var, value)
            }
        }
    }
}

fn default_identity_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fileshell")
        .join("identity.key")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FILESHELL_HOST: Override server host
    /// - FILESHELL_PORT: Override server port
    /// - FILESHELL_SERVER_KEY: Override pinned server key
    /// - FILESHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Nothing is logged here; each returned [`EnvOverride`] is logged with
    /// [`EnvOverride::log`] once the subscriber is installed.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut applied = Vec::new();

        if let Some(host) = env_value("FILESHELL_HOST") {
            self.server.host = host.clone();
            applied.push(EnvOverride::Applied {
                var: "FILESHELL_HOST",
                value: host,
            });
        }

        if let Some(port) = env_value("FILESHELL_PORT") {
            match port.parse() {
                Ok(parsed) => {
                    self.server.port = parsed;
                    applied.push(EnvOverride::Applied {
                        var: "FILESHELL_PORT",
                        value: port,
                    });
                }
                Err(_) => applied.push(EnvOverride::Ignored {
                    var: "FILESHELL_PORT",
                    value: port,
                }),
            }
        }

        if let Some(key) = env_value("FILESHELL_SERVER_KEY") {
            self.server.server_key = Some(key.clone());
            applied.push(EnvOverride::Applied {
                var: "FILESHELL_SERVER_KEY",
                value: key,
            });
        }

        if let Some(level) = env_value("FILESHELL_LOG_LEVEL") {
            self.client.log_level = level.clone();
            applied.push(EnvOverride::Applied {
                var: "FILESHELL_LOG_LEVEL",
                value: level,
            });
        }

        applied
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        if !(1..=300).contains(&self.server.connect_timeout) {
            return Err(ConfigError::InvalidConnectTimeout(self.server.connect_timeout));
        }

        self.pinned_server_key()?;

        if !(1..=MAX_CHUNK_SIZE).contains(&self.transfer.chunk_size) {
            return Err(ConfigError::InvalidChunkSize {
                got: self.transfer.chunk_size,
                max: MAX_CHUNK_SIZE,
            });
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        Ok(())
    }

    /// The pinned server key, if one is configured.
    pub fn pinned_server_key(&self) -> Result<Option<PublicKey>, ConfigError> {
        self.server
            .server_key
            .as_deref()
            .map(|hex| {
                PublicKey::from_hex(hex).map_err(|e| ConfigError::InvalidServerKey(e.to_string()))
            })
            .transpose()
    }

    /// `host:port` for the TCP connection.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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

    /// Save configuration to a file, creating parent directories.
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

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
