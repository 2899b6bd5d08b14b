//! Engine configuration
//!
//! Plain data carried into the stacks at construction time. Both structs
//! deserialize from JSON so an embedding application can keep station
//! parameters in its own configuration files.

use serde::{Deserialize, Serialize};

use crate::constants::{BROADCAST_ADDRESS, DEFAULT_RESPONSE_TIMEOUT_MS, MAX_UNICAST_ADDRESS};
use crate::error::{Result, RtuError};

/// Slave station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveConfig {
    /// Own station address (1..=247)
    pub address: u8,
    /// Highest register address served, inclusive
    #[serde(default = "default_last_register")]
    pub last_register: u16,
}

fn default_last_register() -> u16 {
    u16::MAX
}

impl SlaveConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check address legality
    pub fn validate(&self) -> Result<()> {
        if self.address == BROADCAST_ADDRESS || self.address > MAX_UNICAST_ADDRESS {
            return Err(RtuError::config(format!(
                "station address {} outside 1..={}",
                self.address, MAX_UNICAST_ADDRESS
            )));
        }
        Ok(())
    }
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            address: 1,
            last_register: default_last_register(),
        }
    }
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Answer timeout in milliseconds, measured from receiver arming
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

impl MasterConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == 0 {
            return Err(RtuError::config("response timeout must be nonzero"));
        }
        Ok(())
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slave_config_default_values() {
        let config = SlaveConfig::default();
        assert_eq!(config.address, 1);
        assert_eq!(config.last_register, u16::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slave_config_from_json_minimal() {
        let config = SlaveConfig::from_json(r#"{"address": 17}"#).unwrap();
        assert_eq!(config.address, 17);
        assert_eq!(config.last_register, u16::MAX);
    }

    #[test]
    fn test_slave_config_from_json_full() {
        let config = SlaveConfig::from_json(r#"{"address": 3, "last_register": 15}"#).unwrap();
        assert_eq!(config.address, 3);
        assert_eq!(config.last_register, 0x000F);
    }

    #[test]
    fn test_slave_config_rejects_broadcast_and_reserved() {
        assert!(SlaveConfig::from_json(r#"{"address": 0}"#).is_err());
        assert!(SlaveConfig::from_json(r#"{"address": 248}"#).is_err());
        assert!(SlaveConfig::from_json(r#"{"address": 247}"#).is_ok());
    }

    #[test]
    fn test_master_config_default_timeout() {
        let config = MasterConfig::default();
        assert_eq!(config.response_timeout_ms, 100);

        let config = MasterConfig::from_json("{}").unwrap();
        assert_eq!(config.response_timeout_ms, 100);
    }

    #[test]
    fn test_master_config_rejects_zero_timeout() {
        assert!(MasterConfig::from_json(r#"{"response_timeout_ms": 0}"#).is_err());
        let config = MasterConfig::from_json(r#"{"response_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.response_timeout_ms, 250);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let original = SlaveConfig {
            address: 42,
            last_register: 0x0100,
        };
        let json = serde_json::to_string(&original).unwrap();
        let restored = SlaveConfig::from_json(&json).unwrap();
        assert_eq!(restored.address, original.address);
        assert_eq!(restored.last_register, original.last_register);
    }
}
