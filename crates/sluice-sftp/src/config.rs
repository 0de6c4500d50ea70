//! Configuration for SFTP sessions and the stdio host

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest accepted message size: a 32 KiB read plus the Data header fits
pub const MIN_MESSAGE_SIZE: usize = 34000;

/// Per-session protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest frame accepted from the client, and the cap for Data responses
    pub max_message_size: usize,

    /// Entries returned per READDIR response
    pub page_size: usize,

    /// User name passed to the handler at init
    pub user: String,

    /// Argument order expected in SYMLINK requests
    pub symlink_order: SymlinkOrder,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            page_size: default_page_size(),
            user: default_user(),
            symlink_order: SymlinkOrder::default(),
        }
    }
}

impl SessionConfig {
    /// Validate session settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(crate::Error::Config(format!(
                "max_message_size must be at least {} bytes",
                MIN_MESSAGE_SIZE
            )));
        }

        if self.page_size == 0 {
            return Err(crate::Error::Config(
                "page_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Order of the two paths in an SSH_FXP_SYMLINK request
///
/// The draft names the link path first; OpenSSH (and clients built against
/// it, such as WinSCP and Cyberduck) send the target first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymlinkOrder {
    /// Target path, then link path
    #[default]
    Openssh,
    /// Link path, then target path
    Rfc,
}

/// Stdio host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory exposed to the client as "/"
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Protocol settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
///
/// stdout carries the protocol, so logs go to stderr unless a file is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an EnvFilter string)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path, rotated daily
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !self.root_dir.exists() {
            return Err(crate::Error::Config(format!(
                "Root directory does not exist: {:?}",
                self.root_dir
            )));
        }

        if !self.root_dir.is_dir() {
            return Err(crate::Error::Config(format!(
                "Root path is not a directory: {:?}",
                self.root_dir
            )));
        }

        self.session.validate()
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_message_size() -> usize {
    256 * 1024
}

fn default_page_size() -> usize {
    100
}

fn default_user() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "sftp".to_string())
}
