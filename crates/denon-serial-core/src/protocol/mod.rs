//! Serial Protocol Communication
//!
//! Implements the line-oriented Denon serial protocol: commands are ASCII
//! strings terminated by a carriage return, and the receiver answers each one
//! with a single `\r`-terminated line.
//!
//! Only one command is ever in flight. [`CommandQueue`] serializes requests
//! onto a [`Transport`] and hands each received line to the caller that is
//! waiting for it.

mod error;
mod framing;
pub mod queue;
pub mod serial;
pub mod transport;

pub use error::{ProtocolError, Result};
pub use framing::LineBuffer;
pub use queue::{CommandQueue, PendingResponse, QueueConfig};
pub use serial::{open_port, SerialConfig};
pub use transport::Transport;

/// Default serial device
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Default baud rate for Denon receivers
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time to wait for a response line, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Line terminator used in both directions
pub const LINE_TERMINATOR: u8 = b'\r';

/// Maximum length of a single line before the buffer is discarded
pub const MAX_LINE_LEN: usize = 8192;
