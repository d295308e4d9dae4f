//! Line-oriented transport
//!
//! A [`Transport`] owns the connection to the receiver. A background reader
//! task frames incoming bytes into lines and hands them, in arrival order, to
//! the single owner of the transport. Writes go straight to the connection.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::serial::{open_port, SerialConfig};
use super::{LineBuffer, ProtocolError, Result};

/// Lines buffered between the reader task and the consumer
const LINE_CHANNEL_CAPACITY: usize = 64;

/// How long `close` waits for the write half to shut down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection to the receiver, framed into `\r`-terminated lines.
pub struct Transport {
    /// Port name or label, for logging
    name: String,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    lines: mpsc::Receiver<std::io::Result<String>>,
    reader: JoinHandle<()>,
    closed: bool,
}

impl Transport {
    /// Open the serial device described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let stream = open_port(config)?;
        tracing::info!(
            port = %config.port_name,
            baud_rate = config.baud_rate,
            "Initialized serial port"
        );
        Ok(Self::from_stream(stream, config.port_name.clone()))
    }

    /// Build a transport over any bidirectional byte stream.
    pub fn from_stream<S>(stream: S, name: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer, name)
    }

    /// Build a transport from separate read and write halves.
    pub fn from_parts<R, W>(reader: R, writer: W, name: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_lines(reader, tx, name.clone()));
        Self {
            name,
            writer: Box::new(writer),
            lines: rx,
            reader,
            closed: false,
        }
    }

    /// Port name or label this transport was created with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write raw command text. No acknowledgement is awaited.
    pub async fn write(&mut self, text: &str) -> Result<()> {
        if self.closed {
            return Err(ProtocolError::WriteFailed("connection closed".to_string()));
        }
        self.writer
            .write_all(text.as_bytes())
            .await
            .map_err(|e| ProtocolError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ProtocolError::WriteFailed(e.to_string()))
    }

    /// Wait for the next received line.
    ///
    /// Returns `None` once the connection has ended. A read error is
    /// reported once, after which the stream ends.
    pub async fn next_line(&mut self) -> Option<Result<String>> {
        self.lines
            .recv()
            .await
            .map(|line| line.map_err(ProtocolError::from))
    }

    /// Stop reading and shut down the write half.
    ///
    /// Gives up on the write half after [`SHUTDOWN_TIMEOUT`] if it is stuck.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader.abort();
        self.lines.close();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(port = %self.name, error = %e, "Error shutting down writer");
            }
            Err(_) => tracing::warn!(port = %self.name, "Writer shutdown timed out"),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_lines<R>(
    mut reader: R,
    tx: mpsc::Sender<std::io::Result<String>>,
    name: String,
) where
    R: AsyncRead + Unpin,
{
    let mut framing = LineBuffer::new();
    let mut buf = [0u8; 256];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(port = %name, "Connection reached end of stream");
                return;
            }
            Ok(n) => {
                framing.extend(&buf[..n]);
                while let Some(line) = framing.next_line() {
                    if tx.send(Ok(line)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(port = %name, error = %e, "Read from connection failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}
