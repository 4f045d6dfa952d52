//! Framed message streams: newline-delimited JSON on the north side,
//! Content-Length framing on the south side.

pub mod north;
pub mod south;

pub use north::{NorthReader, NorthWriter};
pub use south::{FrameReader, FrameWriter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message line of {0} bytes exceeds the {max} byte limit", max = north::MAX_LINE_BYTES)]
    LineTooLong(usize),
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = south::MAX_FRAME_BYTES)]
    FrameTooLarge(usize),
    #[error("frame declares an empty body")]
    EmptyFrame,
    #[error("frame is missing a Content-Length header")]
    MissingContentLength,
    #[error("malformed Content-Length header: {0:?}")]
    InvalidContentLength(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
