//! Shared fake receiver for integration tests

#![allow(dead_code)]

use std::time::Duration;

use denon_serial_core::protocol::{CommandQueue, QueueConfig, Transport};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

/// The receiver end of an in-memory serial link
pub struct FakeReceiver {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeReceiver {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Read one `\r`-terminated command, terminator included.
    pub async fn read_command(&mut self) -> String {
        let mut buf = Vec::new();
        self.reader.read_until(b'\r', &mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    /// Send one response line.
    pub async fn reply(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r").as_bytes())
            .await
            .unwrap();
    }

    /// Assert that nothing is written to the receiver for a short while.
    pub async fn assert_silent(&mut self) {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(
            Duration::from_millis(50),
            self.reader.read_until(b'\r', &mut buf),
        )
        .await;
        assert!(
            read.is_err(),
            "unexpected write: {:?}",
            String::from_utf8_lossy(&buf)
        );
    }
}

/// A command queue wired to a fake receiver
pub fn connect(config: QueueConfig) -> (CommandQueue, FakeReceiver) {
    let (local, remote) = tokio::io::duplex(1024);
    let queue = CommandQueue::spawn(Transport::from_stream(local, "fake"), config);
    (queue, FakeReceiver::new(remote))
}

/// Install a test log subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
