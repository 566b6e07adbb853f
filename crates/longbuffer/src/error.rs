//! Errors for stream operations.

use std::io;
use thiserror::Error;

/// Errors returned by [`Stream`](crate::Stream) and [`Cursor`](crate::Cursor).
///
/// "No data yet" is not an error: a caught-up cursor gets
/// [`ReadStatus::Pending`](crate::ReadStatus::Pending).
#[derive(Debug, Error)]
pub enum StreamError {
    /// Write called after close.
    #[error("stream closed")]
    Closed,

    /// A cursor asked for bytes past the end of a closed stream.
    #[error("offset {offset} is beyond the end of the closed stream ({len} bytes)")]
    OutOfRange { offset: u64, len: u64 },

    /// Write or close called while another write or close is in progress.
    #[error("stream already has an active producer")]
    ConcurrentProducer,

    #[error("invalid segment size: {0}")]
    InvalidSegmentSize(u64),

    /// A subscriber loop was stopped through its cancellation token.
    #[error("subscription cancelled")]
    Cancelled,

    #[error("subscriber task failed: {0}")]
    Subscriber(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            StreamError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            StreamError::OutOfRange { .. } => io::Error::new(io::ErrorKind::InvalidInput, err),
            other => io::Error::other(other),
        }
    }
}
