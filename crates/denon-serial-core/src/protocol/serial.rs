//! Serial port handling
//!
//! Opens the receiver's RS-232 port with the fixed framing Denon uses:
//! 8 data bits, no parity, 1 stop bit, no flow control.

use serde::{Deserialize, Serialize};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::{ProtocolError, Result, DEFAULT_BAUD_RATE, DEFAULT_PORT};

/// Serial connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SerialConfig {
    /// Device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port_name: String,

    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl SerialConfig {
    /// Settings for the given device path at the default baud rate
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }
}

/// Open the serial port described by `config`.
///
/// Must be called from within a tokio runtime.
pub fn open_port(config: &SerialConfig) -> Result<SerialStream> {
    tracing::debug!(
        port = %config.port_name,
        baud_rate = config.baud_rate,
        "Opening serial port"
    );

    tokio_serial::new(&config.port_name, config.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| {
            tracing::error!(port = %config.port_name, error = %e, "Failed to open serial port");
            ProtocolError::ConnectionFailed {
                path: config.port_name.clone(),
                reason: e.to_string(),
            }
        })
}
