//! Host configuration management

use crate::usb::{QueueSettings, SessionSettings};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log levels accepted in `[logging] level`
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Control transfer behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Per-transfer timeout in milliseconds
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Short packet policy for requests built by the CLI
    #[serde(default = "TransferSettings::default_accept_short_packet")]
    pub accept_short_packet: bool,
    /// Jobs buffered per device before submitters block
    #[serde(default = "TransferSettings::default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            accept_short_packet: Self::default_accept_short_packet(),
            queue_depth: Self::default_queue_depth(),
        }
    }
}

impl TransferSettings {
    fn default_timeout_ms() -> u64 {
        5000
    }

    fn default_accept_short_packet() -> bool {
        true
    }

    fn default_queue_depth() -> usize {
        256
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Detach kernel drivers when claiming (the CLI's default `force`)
    #[serde(default)]
    pub detach_kernel_driver: bool,
    #[serde(default = "SessionConfig::default_cache_strings")]
    pub cache_strings: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detach_kernel_driver: false,
            cache_strings: Self::default_cache_strings(),
        }
    }
}

impl SessionConfig {
    fn default_cache_strings() -> bool {
        true
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = [Self::default_path(), PathBuf::from("/etc/usbctl/host.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbctl").join("host.toml")
        } else {
            PathBuf::from(".config/usbctl/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }
        if self.transfer.timeout_ms == 0 {
            return Err(anyhow!("transfer.timeout_ms must be greater than zero"));
        }
        if self.transfer.queue_depth == 0 {
            return Err(anyhow!("transfer.queue_depth must be greater than zero"));
        }
        Ok(())
    }

    /// Session settings for every device opened under this configuration
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            queue: QueueSettings {
                timeout: self.transfer.timeout(),
                depth: self.transfer.queue_depth,
            },
            cache_strings: self.session.cache_strings,
        }
    }
}
