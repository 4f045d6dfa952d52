//! Newline-delimited JSON-RPC stream on the bridge's own stdio.
//!
//! One UTF-8 JSON object per LF-terminated line. Blank lines are
//! tolerated, a trailing CR is stripped, and EOF is a clean end of the
//! conversation rather than an error.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::TransportError;

/// Upper bound on one inbound line. Anything longer is discarded
/// without being buffered whole.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

pub struct NorthReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> NorthReader<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// The next message payload, without its terminator. `None` on EOF.
    ///
    /// An oversized line yields [`TransportError::LineTooLong`] after
    /// the remainder of the line has been drained, so the stream stays
    /// usable for the next message.
    pub async fn read_message(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let Some(mut line) = self.read_line_bounded().await? else {
                return Ok(None);
            };
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            return Ok(Some(line));
        }
    }

    async fn read_line_bounded(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                // EOF; a final unterminated line still counts.
                return Ok(if line.is_empty() { None } else { Some(line) });
            }
            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                let overflow = line.len() + pos > MAX_LINE_BYTES;
                if !overflow {
                    line.extend_from_slice(&available[..pos]);
                }
                self.inner.consume(pos + 1);
                if overflow {
                    return Err(TransportError::LineTooLong(line.len() + pos));
                }
                return Ok(Some(line));
            }
            let chunk = available.len();
            if line.len() + chunk > MAX_LINE_BYTES {
                let total = line.len() + chunk;
                self.inner.consume(chunk);
                drop(line);
                let discarded = self.discard_line().await?;
                return Err(TransportError::LineTooLong(total + discarded));
            }
            line.extend_from_slice(available);
            self.inner.consume(chunk);
        }
    }

    /// Consume through the next LF (or EOF), counting what was skipped.
    async fn discard_line(&mut self) -> io::Result<usize> {
        let mut skipped = 0;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(skipped);
            }
            if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                self.inner.consume(pos + 1);
                return Ok(skipped + pos);
            }
            let chunk = available.len();
            skipped += chunk;
            self.inner.consume(chunk);
        }
    }
}

/// Outbound half. Writes from concurrent tasks stay atomic at the
/// message boundary: the lock is held across payload and terminator.
pub struct NorthWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> NorthWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub async fn write_message(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(payload).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    }
}
