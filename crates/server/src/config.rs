//! Server configuration management

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::usb::DeviceFilter;

/// The registered USB/IP port
const DEFAULT_PORT: u16 = 3240;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the TCP acceptor binds to
    pub bind_addr: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Restrict export to one device, "0x1234:0x5678" form. With no filter
    /// the first non-hub device is exported.
    #[serde(default)]
    pub device_filter: Option<String>,
    /// Cap on concurrently in-flight URBs; SUBMITs beyond it are refused
    /// with -ENOMEM
    #[serde(default = "UsbSettings::default_max_inflight")]
    pub max_inflight_urbs: usize,
}

impl UsbSettings {
    fn default_max_inflight() -> usize {
        32
    }

    /// Parse the configured filter, if any.
    pub fn parsed_filter(&self) -> Result<Option<DeviceFilter>> {
        self.device_filter
            .as_deref()
            .map(parse_device_filter)
            .transpose()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
                log_level: "info".to_string(),
            },
            usb: UsbSettings {
                device_filter: None,
                max_inflight_urbs: UsbSettings::default_max_inflight(),
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from the specified path, or from the standard
    /// locations when none is given.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/rust-usbip/server.toml"),
            ];
            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ServerConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("rust-usbip").join("server.toml")
        } else {
            PathBuf::from(".config/rust-usbip/server.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.usb.max_inflight_urbs == 0 {
            return Err(anyhow!("max_inflight_urbs must be at least 1"));
        }

        if let Some(filter) = &self.usb.device_filter {
            parse_device_filter(filter)?;
        }

        Ok(())
    }
}

/// Parse a "0xVVVV:0xPPPP" device filter.
pub fn parse_device_filter(filter: &str) -> Result<DeviceFilter> {
    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678')",
            filter
        ));
    }

    Ok(DeviceFilter {
        vendor_id: parse_hex_id(parts[0], "VID")?,
        product_id: parse_hex_id(parts[1], "PID")?,
    })
}

fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}
