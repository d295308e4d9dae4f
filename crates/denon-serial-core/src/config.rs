//! Device configuration
//!
//! Describes one receiver: where it is attached, how it identifies itself,
//! and which inputs it exposes. Stored as JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::protocol::{ProtocolError, Result, SerialConfig, DEFAULT_BAUD_RATE, DEFAULT_PORT};

fn default_path() -> String {
    DEFAULT_PORT.to_string()
}

fn default_manufacturer() -> String {
    "Denon".to_string()
}

fn default_unknown() -> String {
    "Unknown".to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

/// A selectable source on the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Display name (e.g., "Apple TV")
    pub name: String,

    /// Input source type as understood by the hub (0 = other)
    #[serde(rename = "type", default)]
    pub input_type: u8,

    /// Receiver input code sent after `SI` (e.g., "DVD", "SAT/CBL")
    pub input: String,
}

/// Receiver identity and connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Name shown to the user
    pub name: String,

    /// Serial device path
    #[serde(default = "default_path")]
    pub path: String,

    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Manufacturer reported to the hub
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,

    /// Model name reported to the hub
    #[serde(default = "default_unknown")]
    pub model: String,

    /// Serial number reported to the hub
    #[serde(default = "default_unknown")]
    pub serial: String,

    /// Inputs in display order; the index is the input identifier
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

impl DeviceConfig {
    /// Minimal configuration for a receiver on the default port
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: default_path(),
            baud_rate: DEFAULT_BAUD_RATE,
            manufacturer: default_manufacturer(),
            model: default_unknown(),
            serial: default_unknown(),
            inputs: Vec::new(),
        }
    }

    /// Parse and validate a JSON device description
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON device description from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Serial settings for this device
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            port_name: self.path.clone(),
            baud_rate: self.baud_rate,
        }
    }

    /// Index of the input with the given receiver code
    pub fn input_index(&self, code: &str) -> Option<usize> {
        self.inputs.iter().position(|i| i.input == code)
    }

    /// Index of the input with the given display name (case-insensitive)
    pub fn input_by_name(&self, name: &str) -> Option<usize> {
        self.inputs
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProtocolError::Config("device name is empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(ProtocolError::Config("baud rate must be positive".to_string()));
        }
        for (i, input) in self.inputs.iter().enumerate() {
            if input.input.trim().is_empty() {
                return Err(ProtocolError::Config(format!(
                    "input {} ('{}') has no input code",
                    i, input.name
                )));
            }
        }
        Ok(())
    }
}
