//! Diagnostic stack configuration
//!
//! Plain serde structs consumed at construction time. Every field has a
//! default, so an empty TOML document is a valid configuration:
//!
//! ```toml
//! [uds]
//! request_id = 0x7E0
//! response_id = 0x7E8
//!
//! [flash]
//! block_size = 254
//! security_key = "a5a5"
//!
//! [[flash.regions]]
//! name = "application"
//! start_address = 0x8000
//! end_address = 0xFFFF
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::can::MAX_SEGMENTED_PAYLOAD;
use crate::flash::FlashRegion;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the whole stack
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagConfig {
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub uds: UdsConfig,
    #[serde(default)]
    pub obd: ObdConfig,
    #[serde(default)]
    pub flash: FlashConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl DiagConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: DiagConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.can.max_payload == 0 || self.can.max_payload > MAX_SEGMENTED_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "can.max_payload must be between 1 and {}",
                MAX_SEGMENTED_PAYLOAD
            )));
        }
        if self.flash.block_size == 0 {
            return Err(ConfigError::Invalid(
                "flash.block_size must be non-zero".to_string(),
            ));
        }
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid(
                "pool.workers must be non-zero".to_string(),
            ));
        }
        self.flash.security_key_bytes()?;
        for region in &self.flash.regions {
            if region.start_address > region.end_address {
                return Err(ConfigError::Invalid(format!(
                    "flash region '{}' ends before it starts",
                    region.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// CAN Channel
// =============================================================================

/// CAN channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanConfig {
    /// Bus bit rate
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Largest payload a single send may carry; above 8 the channel is
    /// expected to segment (ISO 15765-2)
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Frames buffered per subscriber before the slowest one lags
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Simulated delivery latency (mock transport only)
    #[serde(default)]
    pub latency_ms: u64,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            max_payload: default_max_payload(),
            channel_capacity: default_channel_capacity(),
            latency_ms: 0,
        }
    }
}

fn default_bitrate() -> u32 {
    500000
}

fn default_max_payload() -> usize {
    MAX_SEGMENTED_PAYLOAD
}

fn default_channel_capacity() -> usize {
    256
}

// =============================================================================
// UDS
// =============================================================================

/// UDS client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsConfig {
    /// Tester -> ECU identifier
    #[serde(default = "default_uds_request_id")]
    pub request_id: u32,
    /// ECU -> tester identifier
    #[serde(default = "default_uds_response_id")]
    pub response_id: u32,
    #[serde(default)]
    pub extended_ids: bool,
    /// Wait for a response
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// P2 server response time
    #[serde(default = "default_p2_ms")]
    pub p2_ms: u64,
    /// P2* extended response time after a response-pending NRC
    #[serde(default = "default_p2_star_ms")]
    pub p2_star_ms: u64,
}

impl UdsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn p2_star(&self) -> Duration {
        Duration::from_millis(self.p2_star_ms)
    }
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            request_id: default_uds_request_id(),
            response_id: default_uds_response_id(),
            extended_ids: false,
            timeout_ms: default_timeout_ms(),
            p2_ms: default_p2_ms(),
            p2_star_ms: default_p2_star_ms(),
        }
    }
}

fn default_uds_request_id() -> u32 {
    0x7E0
}

fn default_uds_response_id() -> u32 {
    0x7E8
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_p2_ms() -> u64 {
    50
}

fn default_p2_star_ms() -> u64 {
    5000
}

// =============================================================================
// OBD-II
// =============================================================================

/// OBD-II client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObdConfig {
    /// Functional broadcast identifier
    #[serde(default = "default_obd_request_id")]
    pub request_id: u32,
    #[serde(default = "default_obd_response_id")]
    pub response_id: u32,
    /// Additional ECU response identifiers accepted on a broadcast request
    #[serde(default = "default_ecu_ids")]
    pub ecu_ids: Vec<u32>,
    #[serde(default)]
    pub extended_ids: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ObdConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            request_id: default_obd_request_id(),
            response_id: default_obd_response_id(),
            ecu_ids: default_ecu_ids(),
            extended_ids: false,
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_obd_request_id() -> u32 {
    0x7DF
}

fn default_obd_response_id() -> u32 {
    0x7E8
}

fn default_ecu_ids() -> Vec<u32> {
    (0x7E8..=0x7EF).collect()
}

// =============================================================================
// Flash
// =============================================================================

/// Flash programming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Bytes per TransferData request
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Upper bound for the whole programming run
    #[serde(default = "default_flash_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub verify_after_write: bool,
    #[serde(default)]
    pub erase_before_write: bool,
    /// SecurityAccess seed sub-function
    #[serde(default = "default_security_level")]
    pub security_level: u8,
    /// Hex-encoded key; security access is skipped when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_key: Option<String>,
    /// First TransferData block sequence counter
    #[serde(default = "default_block_counter_start")]
    pub block_counter_start: u8,
    /// Counter value used after 0xFF
    #[serde(default)]
    pub block_counter_wrap: u8,
    /// Known memory layout; empty means any address is accepted
    #[serde(default)]
    pub regions: Vec<FlashRegion>,
}

impl FlashConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Decoded security key, empty when none is configured
    pub fn security_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        match &self.security_key {
            Some(key) => hex::decode(key.trim()).map_err(|e| {
                ConfigError::Invalid(format!("flash.security_key is not valid hex: {}", e))
            }),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            timeout_ms: default_flash_timeout_ms(),
            verify_after_write: default_true(),
            erase_before_write: false,
            security_level: default_security_level(),
            security_key: None,
            block_counter_start: default_block_counter_start(),
            block_counter_wrap: 0,
            regions: Vec::new(),
        }
    }
}

fn default_block_size() -> usize {
    256
}

fn default_flash_timeout_ms() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

fn default_security_level() -> u8 {
    0x01
}

fn default_block_counter_start() -> u8 {
    1
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs that may wait for a free worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DiagConfig::from_toml_str("").unwrap();
        assert_eq!(config.uds.request_id, 0x7E0);
        assert_eq!(config.uds.response_id, 0x7E8);
        assert_eq!(config.uds.timeout(), Duration::from_millis(1000));
        assert_eq!(config.obd.request_id, 0x7DF);
        assert_eq!(config.obd.ecu_ids.len(), 8);
        assert_eq!(config.flash.block_size, 256);
        assert!(config.flash.verify_after_write);
        assert_eq!(config.flash.block_counter_start, 1);
        assert_eq!(config.can.bitrate, 500000);
    }

    #[test]
    fn test_parse_full_document() {
        let config = DiagConfig::from_toml_str(
            r#"
            [uds]
            request_id = 0x18DA00F1
            response_id = 0x18DAF100
            extended_ids = true
            timeout_ms = 250

            [flash]
            block_size = 254
            security_level = 3
            security_key = "A5a5"
            erase_before_write = true

            [[flash.regions]]
            name = "boot"
            start_address = 0x0000
            end_address = 0x7FFF
            block_size = 256
            protected = true

            [[flash.regions]]
            name = "application"
            start_address = 0x8000
            end_address = 0xFFFF
            "#,
        )
        .unwrap();

        assert!(config.uds.extended_ids);
        assert_eq!(config.uds.request_id, 0x18DA_00F1);
        assert_eq!(config.flash.security_key_bytes().unwrap(), vec![0xA5, 0xA5]);
        assert_eq!(config.flash.regions.len(), 2);
        assert!(config.flash.regions[0].protected);
        assert!(!config.flash.regions[1].protected);
        assert_eq!(config.flash.regions[1].end_address, 0xFFFF);
    }

    #[test]
    fn test_invalid_security_key_rejected() {
        let err = DiagConfig::from_toml_str("[flash]\nsecurity_key = \"xyz\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let err = DiagConfig::from_toml_str("[flash]\nblock_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[obd]\necu_ids = [0x7E8, 0x7E9]").unwrap();

        let config = DiagConfig::load(file.path()).unwrap();
        assert_eq!(config.obd.ecu_ids, vec![0x7E8, 0x7E9]);
    }
}
