//! denon-serial command line tool
//!
//! Sends one operation to a receiver and prints the result, or watches the
//! port for status lines the receiver sends on its own.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use denon_serial_core::config::DeviceConfig;
use denon_serial_core::protocol::{QueueConfig, DEFAULT_TIMEOUT_MS};
use denon_serial_core::receiver::{Receiver, VolumeStep};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "denon-serial", version, about = "Control a Denon receiver over RS-232")]
struct Cli {
    /// Serial device path (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Response timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// JSON device configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a raw command and print the response line
    Raw { command: String },
    /// Show the power state, or switch it
    Power { state: Option<Switch> },
    /// Show the active input, or select one by name
    Input { name: Option<String> },
    /// Mute or unmute
    Mute { state: Switch },
    /// Step the master volume
    Volume { direction: Direction },
    /// Print unsolicited status lines until interrupted
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Direction {
    Up,
    Down,
}

impl From<Direction> for VolumeStep {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Up => VolumeStep::Up,
            Direction::Down => VolumeStep::Down,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let device = load_device(&cli)?;
    let config = QueueConfig {
        response_timeout: Duration::from_millis(cli.timeout_ms),
        ..QueueConfig::default()
    };

    let receiver = Receiver::open(device, config).context("Failed to connect to receiver")?;
    let result = run(cli.command, &receiver).await;
    receiver.shutdown().await;
    result
}

fn load_device(cli: &Cli) -> Result<DeviceConfig> {
    let mut device = match &cli.config {
        Some(path) => DeviceConfig::from_file(path)
            .with_context(|| format!("Failed to load device config {}", path.display()))?,
        None => DeviceConfig::new("Receiver"),
    };
    if let Some(port) = &cli.port {
        device.path = port.clone();
    }
    if let Some(baud) = cli.baud {
        device.baud_rate = baud;
    }
    Ok(device)
}

async fn run(command: Command, receiver: &Receiver) -> Result<()> {
    match command {
        Command::Raw { command } => {
            let line = receiver.queue().request(terminated(&command)).await?;
            println!("{line}");
        }
        Command::Power { state: None } => {
            let on = receiver.power().await?;
            println!("{}", if on { "on" } else { "standby" });
        }
        Command::Power { state: Some(state) } => {
            receiver.set_power(state == Switch::On).await?;
        }
        Command::Input { name: None } => {
            let index = receiver.input().await?;
            println!("{}", receiver.device().inputs[index].name);
        }
        Command::Input { name: Some(name) } => {
            let Some(index) = receiver.device().input_by_name(&name) else {
                bail!("No input named '{name}' in the device config");
            };
            receiver.set_input(index).await?;
        }
        Command::Mute { state } => receiver.set_mute(state == Switch::On).await?,
        Command::Volume { direction } => receiver.volume(direction.into()).await?,
        Command::Monitor => monitor(receiver).await?,
    }
    Ok(())
}

async fn monitor(receiver: &Receiver) -> Result<()> {
    let mut lines = receiver.queue().subscribe_unsolicited();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            line = lines.recv() => match line {
                Ok(line) => println!("{line}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Monitor fell behind, lines dropped");
                }
                Err(RecvError::Closed) => bail!("Connection closed"),
            },
        }
    }
}

/// Append the `\r` terminator if the user left it off.
fn terminated(command: &str) -> String {
    let command = command.trim_end_matches(['\r', '\n']);
    format!("{command}\r")
}
