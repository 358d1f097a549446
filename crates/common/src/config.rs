//! Host configuration file
//!
//! ```toml
//! [host]
//! log_level = "info"
//! poll_period_ms = 750
//! transfer_timeout_ms = 10000
//! interrupt_timeout_ms = 1000
//! descriptor_retries = 4
//! locale = "en_US"
//!
//! [filters]
//! vendor_id = "0x04b4"
//! product_id = "0x8613"
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "usb-host";
const FILE_NAME: &str = "usb.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbConfig {
    #[serde(default)]
    pub host: HostSettings,
    /// Pre-open vendor/product match filters
    #[serde(default)]
    pub filters: FilterSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
    /// Watcher sleep between quiet scan cycles
    #[serde(default = "HostSettings::default_poll_period")]
    pub poll_period_ms: u64,
    /// Per-call deadline for control and bulk transfers
    #[serde(default = "HostSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    #[serde(default = "HostSettings::default_interrupt_timeout")]
    pub interrupt_timeout_ms: u64,
    /// Extra attempts for the device descriptor fetch at open
    #[serde(default = "HostSettings::default_descriptor_retries")]
    pub descriptor_retries: u32,
    /// Locale for string descriptors, e.g. `de_DE`; the environment if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            poll_period_ms: Self::default_poll_period(),
            transfer_timeout_ms: Self::default_transfer_timeout(),
            interrupt_timeout_ms: Self::default_interrupt_timeout(),
            descriptor_retries: Self::default_descriptor_retries(),
            locale: None,
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_poll_period() -> u64 {
        750
    }

    fn default_transfer_timeout() -> u64 {
        10_000
    }

    fn default_interrupt_timeout() -> u64 {
        1_000
    }

    fn default_descriptor_retries() -> u32 {
        4
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
}

impl FilterSettings {
    /// Parsed vendor filter
    pub fn vendor_id(&self) -> Result<Option<u16>> {
        self.vendor_id
            .as_deref()
            .map(|id| parse_hex_id(id, "vendor_id"))
            .transpose()
    }

    /// Parsed product filter
    pub fn product_id(&self) -> Result<Option<u16>> {
        self.product_id
            .as_deref()
            .map(|id| parse_hex_id(id, "product_id"))
            .transpose()
    }
}

impl UsbConfig {
    /// Load configuration from `path`, or from the first standard location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand(&p),
            None => Self::candidates()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::Config("No configuration file found".to_string()))?,
        };

        let content = fs::read_to_string(&config_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let config = Self::load_from_str(&content)?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Parse and validate TOML text
    pub fn load_from_str(content: &str) -> Result<Self> {
        let config: UsbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand(path);
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration file path
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join(APP_DIR).join(FILE_NAME),
            None => PathBuf::from(".config").join(APP_DIR).join(FILE_NAME),
        }
    }

    fn candidates() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc").join(APP_DIR).join(FILE_NAME),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.host.poll_period_ms == 0 {
            return Err(Error::Config("poll_period_ms must be greater than 0".into()));
        }
        if self.host.transfer_timeout_ms == 0 || self.host.interrupt_timeout_ms == 0 {
            return Err(Error::Config("transfer timeouts must be greater than 0".into()));
        }

        self.filters.vendor_id()?;
        self.filters.product_id()?;
        Ok(())
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

/// Parse a `0x`-prefixed 16-bit hex id
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            Error::Config(format!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name, id
            ))
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(Error::Config(format!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name, id
        )));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| Error::Config(format!("Invalid {} '{}', not a valid hex number", name, id)))
}
