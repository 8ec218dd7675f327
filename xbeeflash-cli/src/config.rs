//! Configuration file support for xbeeflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (XBEEFLASH_*)
//! 3. Local config file (./xbeeflash.toml)
//! 4. Global config file (~/.config/xbeeflash/config.toml)
//!
//! Files that cannot be read or parsed are reported with a warning and skipped.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xbeeflash::{RecoveryConfig, UploadMethod};

/// Local configuration file name.
pub const LOCAL_CONFIG_FILE: &str = "xbeeflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Candidate baud rates, tried in order.
    pub baud_rates: Option<Vec<u32>>,
}

/// Recovery tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoverySection {
    /// Upper bound on recovery attempts.
    pub max_attempts: Option<u32>,
    /// Pause between failed attempts, in seconds.
    pub backoff_secs: Option<u64>,
    /// How long to wait for the device path to appear, in seconds.
    pub gate_timeout_secs: Option<u64>,
}

/// Transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Upload method: "xmodem" or "raw".
    pub method: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Recovery settings.
    #[serde(default)]
    pub recovery: RecoverySection,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "xbeeflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud_rates.is_some() {
            self.connection.baud_rates = other.connection.baud_rates;
        }

        if other.recovery.max_attempts.is_some() {
            self.recovery.max_attempts = other.recovery.max_attempts;
        }
        if other.recovery.backoff_secs.is_some() {
            self.recovery.backoff_secs = other.recovery.backoff_secs;
        }
        if other.recovery.gate_timeout_secs.is_some() {
            self.recovery.gate_timeout_secs = other.recovery.gate_timeout_secs;
        }

        if other.transfer.method.is_some() {
            self.transfer.method = other.transfer.method;
        }
    }

    /// Recovery settings from this file layered over the library defaults.
    pub fn recovery_config(&self) -> RecoveryConfig {
        let mut recovery = RecoveryConfig::default();
        if let Some(bauds) = &self.connection.baud_rates {
            recovery.candidate_baud_rates.clone_from(bauds);
        }
        if let Some(max) = self.recovery.max_attempts {
            recovery.max_attempts = max;
        }
        if let Some(secs) = self.recovery.backoff_secs {
            recovery.backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = self.recovery.gate_timeout_secs {
            recovery.gate_timeout = Duration::from_secs(secs);
        }
        recovery
    }

    /// Configured upload method, if any and valid.
    pub fn upload_method(&self) -> Option<UploadMethod> {
        let method = self.transfer.method.as_deref()?;
        match method.parse() {
            Ok(method) => Some(method),
            Err(e) => {
                warn!("Ignoring [transfer] method: {e}");
                None
            },
        }
    }
}
