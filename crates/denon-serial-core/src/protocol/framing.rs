//! Line framing
//!
//! Splits the raw byte stream from the receiver into `\r`-terminated lines.

use super::{LINE_TERMINATOR, MAX_LINE_LEN};

/// Accumulates received bytes and yields complete lines in arrival order.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Dropping the rest of an oversized line, up to its terminator
    discarding: bool,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    ///
    /// If the pending partial line grows past [`MAX_LINE_LEN`] without a
    /// terminator it is discarded, along with everything up to and
    /// including its eventual terminator.
    pub fn extend(&mut self, mut data: &[u8]) {
        if self.discarding {
            let Some(pos) = data.iter().position(|&b| b == LINE_TERMINATOR) else {
                return;
            };
            self.discarding = false;
            data = &data[pos + 1..];
        }
        self.buf.extend_from_slice(data);

        let line_start = self
            .buf
            .iter()
            .rposition(|&b| b == LINE_TERMINATOR)
            .map_or(0, |pos| pos + 1);
        if self.buf.len() - line_start > MAX_LINE_LEN {
            tracing::warn!(
                len = self.buf.len() - line_start,
                "line buffer overflow, discarding"
            );
            self.buf.truncate(line_start);
            self.discarding = true;
        }
    }

    /// Take the next complete line, without its terminator.
    ///
    /// Empty lines (back-to-back terminators) are skipped.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.buf.iter().position(|&b| b == LINE_TERMINATOR) {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &raw[..raw.len() - 1];
            if line.is_empty() {
                continue;
            }
            return Some(String::from_utf8_lossy(line).into_owned());
        }
        None
    }

    /// Number of buffered bytes not yet part of a complete line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
