//! # denon-serial Core Library
//!
//! Serial control for Denon A/V receivers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A `\r`-framed line transport over a serial port or any tokio stream
//! - A command queue that keeps one command on the wire at a time and
//!   matches each response line to the caller that sent it
//! - Typed power, input, mute and volume controls
//! - JSON device configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use denon_serial_core::prelude::*;
//!
//! let transport = Transport::open(&SerialConfig::new("/dev/ttyUSB0"))?;
//! let queue = CommandQueue::spawn(transport, QueueConfig::default());
//!
//! // Ask for the power state
//! let line = queue.request("PW?\r").await?;
//! println!("Power: {line}");
//! ```

pub mod config;
pub mod protocol;
pub mod receiver;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DeviceConfig, InputConfig};
    pub use crate::protocol::{
        CommandQueue, PendingResponse, ProtocolError, QueueConfig, SerialConfig, Transport,
    };
    pub use crate::receiver::{Receiver, VolumeStep};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
