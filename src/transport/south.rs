//! Content-Length framing for the child language-server pipes.
//!
//! Headers are CRLF-terminated and end at a blank line; only
//! `Content-Length` is consumed, anything else (Content-Type) is read
//! and ignored. The reader is meant to sit on a [`tokio::io::BufReader`]
//! whose buffer carries read-ahead bytes from the header scan into the
//! body read.

use std::io::{self, ErrorKind};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Frames above this size are rejected from the header alone, before
/// any body allocation.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Read-ahead buffer size for the framed reader.
pub const READ_BUFFER_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "Content-Length:";

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
    )
}

pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub const fn new(inner: R) -> Self {
        Self { inner }
    }

    /// The next frame body, or `None` once the peer is gone (EOF or a
    /// torn-down pipe, at any point in the frame).
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        loop {
            line.clear();
            let read = match self.inner.read_line(&mut line).await {
                Ok(read) => read,
                Err(e) if is_disconnect(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                return Ok(None);
            }
            let header = line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                break;
            }
            if let Some(value) = header.strip_prefix(CONTENT_LENGTH) {
                let value = value.trim();
                let length = value
                    .parse()
                    .map_err(|_| TransportError::InvalidContentLength(value.to_string()))?;
                content_length = Some(length);
            }
        }

        let length = content_length.ok_or(TransportError::MissingContentLength)?;
        if length == 0 {
            return Err(TransportError::EmptyFrame);
        }
        if length > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(length));
        }

        let mut body = vec![0u8; length];
        match self.inner.read_exact(&mut body).await {
            Ok(_) => Ok(Some(body)),
            Err(e) if is_disconnect(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Outbound half. Callers guarantee single-threaded write access; the
/// LSP client holds this behind its own lock.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, body: &[u8]) -> io::Result<()> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(body).await?;
        self.inner.flush().await
    }
}
