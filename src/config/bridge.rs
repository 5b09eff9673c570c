use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceMatcher, DriverFamily, ManualOverride};
use crate::serial::stream::reader::{DEFAULT_BUFFER_SIZE, DEFAULT_READ_TIMEOUT};
use crate::serial::stream::StreamOptions;
use crate::serial::SerialConfig;

// Target device identity (A80 reader, CDC-ACM without a standard driver match)
pub const DEFAULT_VENDOR_ID: u16 = 12216;
pub const DEFAULT_PRODUCT_ID: u16 = 8661;
pub const DEFAULT_PRODUCT_NAME: &str = "A80";
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Baud rate must be greater than zero")]
    InvalidBaudRate,

    #[error("Unsupported data bits: {0} (expected 5-8)")]
    UnsupportedDataBits(u8),

    #[error("Read buffer size must be greater than zero")]
    ZeroBufferSize,

    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("Legacy name matching enabled but no product name configured")]
    MissingProductName,
}

/// Which device `connect` targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Product name for legacy matching; only used when `match_by_name` is set
    pub product_name: Option<String>,
    pub match_by_name: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            vendor_id: DEFAULT_VENDOR_ID,
            product_id: DEFAULT_PRODUCT_ID,
            product_name: Some(DEFAULT_PRODUCT_NAME.to_string()),
            match_by_name: false,
        }
    }
}

impl TargetConfig {
    pub fn matcher(&self) -> DeviceMatcher {
        match (&self.product_name, self.match_by_name) {
            (Some(name), true) => DeviceMatcher::ProductName(name.clone()),
            _ => DeviceMatcher::Identity { vendor_id: self.vendor_id, product_id: self.product_id },
        }
    }
}

/// Bridge configuration, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub target: TargetConfig,
    pub serial: SerialConfig,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_buffer_size: usize,
    pub manual_overrides: Vec<ManualOverride>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            target: TargetConfig::default(),
            serial: SerialConfig::default(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT.as_millis() as u64,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            manual_overrides: vec![ManualOverride {
                vendor_id: DEFAULT_VENDOR_ID,
                product_id: DEFAULT_PRODUCT_ID,
                driver: DriverFamily::CdcAcm,
            }],
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: BridgeConfig = toml::from_str(contents).context("Failed to parse bridge config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::InvalidBaudRate);
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ConfigError::UnsupportedDataBits(self.serial.data_bits));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("Read"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("Write"));
        }
        if self.target.match_by_name && self.target.product_name.is_none() {
            return Err(ConfigError::MissingProductName);
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions { buffer_size: self.read_buffer_size, read_timeout: self.read_timeout() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::Parity;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_bridge() {
        let config = BridgeConfig::default();
        assert_eq!(config.target.matcher(), DeviceMatcher::Identity { vendor_id: 12216, product_id: 8661 });
        assert_eq!(config.serial, SerialConfig::default());
        assert_eq!(config.read_timeout_ms, 2000);
        assert_eq!(config.write_timeout_ms, 2000);
        assert_eq!(config.read_buffer_size, 8192);
        assert_eq!(config.manual_overrides.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            read_timeout_ms = 500

            [serial]
            baud_rate = 115200
            parity = "odd"
            "#,
        )
        .unwrap();
        assert_eq!(config.read_timeout_ms, 500);
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.serial.parity, Parity::Odd);
        assert_eq!(config.serial.data_bits, 8);
        assert_eq!(config.target.vendor_id, DEFAULT_VENDOR_ID);
    }

    #[test]
    fn legacy_name_matching_is_opt_in() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [target]
            product_name = "A80"
            match_by_name = true
            "#,
        )
        .unwrap();
        assert_eq!(config.target.matcher(), DeviceMatcher::ProductName("A80".into()));
    }

    #[test]
    fn manual_overrides_parse() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [[manual_overrides]]
            vendor_id = 1155
            product_id = 22336
            driver = "cdc_acm"
            "#,
        )
        .unwrap();
        assert_eq!(config.manual_overrides, vec![ManualOverride { vendor_id: 1155, product_id: 22336, driver: DriverFamily::CdcAcm }]);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.serial.data_bits = 9;
        assert_eq!(config.validate(), Err(ConfigError::UnsupportedDataBits(9)));

        let mut config = BridgeConfig::default();
        config.read_buffer_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBufferSize));

        assert!(BridgeConfig::from_toml_str("[serial]\nbaud_rate = 0").is_err());
    }

    #[test]
    fn load_from_file_and_missing_file_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "write_timeout_ms = 750").unwrap();
        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.write_timeout(), Duration::from_millis(750));

        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }
}
