//! Receiver controls
//!
//! Typed power, input, mute and volume operations on top of a
//! [`CommandQueue`]. Each operation sends one command and interprets the
//! single line the queue hands back. Lines that do not answer the command
//! (zone or sound-mode status, for example) are reported as
//! [`ProtocolError::UnexpectedResponse`]; retrying is up to the caller.

use crate::config::DeviceConfig;
use crate::protocol::{CommandQueue, ProtocolError, QueueConfig, Result, Transport};

const POWER_QUERY: &str = "PW?\r";
const POWER_ON: &str = "PWON\r";
const POWER_STANDBY: &str = "PWSTANDBY\r";
const INPUT_QUERY: &str = "SI?\r";
const MUTE_ON: &str = "MUON\r";
const MUTE_OFF: &str = "MUOFF\r";
const VOLUME_UP: &str = "MVUP\r";
const VOLUME_DOWN: &str = "MVDOWN\r";

/// Relative volume change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStep {
    /// One step louder (`MVUP`)
    Up,
    /// One step quieter (`MVDOWN`)
    Down,
}

/// A Denon receiver on one serial connection
pub struct Receiver {
    queue: CommandQueue,
    device: DeviceConfig,
}

impl Receiver {
    /// Open the device's serial port and start its command queue.
    pub fn open(device: DeviceConfig, config: QueueConfig) -> Result<Self> {
        let transport = Transport::open(&device.serial_config())?;
        Ok(Self::new(CommandQueue::spawn(transport, config), device))
    }

    /// Wrap an already running command queue.
    pub fn new(queue: CommandQueue, device: DeviceConfig) -> Self {
        Self { queue, device }
    }

    /// Configuration this receiver was created with
    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    /// The underlying command queue, for raw commands
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Whether the receiver is on (`true`) or in standby.
    pub async fn power(&self) -> Result<bool> {
        tracing::debug!(device = %self.device.name, "Getting power state");
        let line = self.queue.request(POWER_QUERY).await?;
        if line.contains("PWSTANDBY") {
            Ok(false)
        } else if line.contains("PWON") {
            Ok(true)
        } else {
            Err(unexpected(POWER_QUERY, line))
        }
    }

    /// Turn the receiver on or put it in standby.
    ///
    /// The current state is read first; nothing is sent if it already
    /// matches.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        if self.power().await? == on {
            return Ok(());
        }
        let command = if on { POWER_ON } else { POWER_STANDBY };
        self.expect_echo(command, command.trim()).await?;
        tracing::debug!(device = %self.device.name, on, "Set power");
        Ok(())
    }

    /// Index of the active input in the configured input list.
    pub async fn input(&self) -> Result<usize> {
        tracing::debug!(device = %self.device.name, "Getting input state");
        let line = self.queue.request(INPUT_QUERY).await?;
        let Some(code) = line.strip_prefix("SI") else {
            return Err(unexpected(INPUT_QUERY, line));
        };
        self.device
            .input_index(code)
            .ok_or_else(|| ProtocolError::UnknownInput(code.to_string()))
    }

    /// Switch to the configured input at `index`.
    pub async fn set_input(&self, index: usize) -> Result<()> {
        let input = self
            .device
            .inputs
            .get(index)
            .ok_or(ProtocolError::InvalidInput(index))?;
        let expected = format!("SI{}", input.input);
        let command = format!("{expected}\r");
        self.expect_echo(&command, &expected).await?;
        tracing::debug!(device = %self.device.name, input = %input.name, "Set input");
        Ok(())
    }

    /// Mute (`true`) or unmute the main zone.
    pub async fn set_mute(&self, on: bool) -> Result<()> {
        let command = if on { MUTE_ON } else { MUTE_OFF };
        self.expect_echo(command, command.trim()).await
    }

    /// Step the master volume up or down.
    pub async fn volume(&self, step: VolumeStep) -> Result<()> {
        let command = match step {
            VolumeStep::Up => VOLUME_UP,
            VolumeStep::Down => VOLUME_DOWN,
        };
        // The receiver answers with the new level (e.g. "MV45"), not an echo.
        self.expect_echo(command, "MV").await
    }

    /// Stop the command queue and close the connection.
    pub async fn shutdown(self) {
        self.queue.shutdown().await;
    }

    async fn expect_echo(&self, command: &str, expected: &str) -> Result<()> {
        let line = self.queue.request(command).await?;
        if line.contains(expected) {
            tracing::debug!(command = %command.trim(), line = %line, "Received success");
            Ok(())
        } else {
            Err(unexpected(command, line))
        }
    }
}

fn unexpected(command: &str, response: String) -> ProtocolError {
    let err = ProtocolError::UnexpectedResponse {
        command: command.trim().to_string(),
        response,
    };
    tracing::error!(error = %err, "Receiver returned unexpected response");
    err
}
