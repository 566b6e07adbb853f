//! Cursors: independent read positions over a stream.

use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Result, StreamError};
use crate::stream::Stream;
use crate::COPY_BUFFER_SIZE;

/// Outcome of a single [`Cursor::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were copied into the buffer and the cursor advanced.
    Data(usize),
    /// Caught up with an open stream. Try again later.
    Pending,
    /// Every byte of a closed stream has been read.
    Eof,
    /// The cursor sits past the end of a closed stream.
    OutOfRange { len: u64 },
}

/// A read position over a [`Stream`].
///
/// Cursors never block: a cursor that has caught up gets
/// [`ReadStatus::Pending`] and decides itself how to wait.
#[derive(Debug, Clone)]
pub struct Cursor {
    stream: Stream,
    offset: u64,
}

impl Cursor {
    pub(crate) fn new(stream: Stream, offset: u64) -> Self {
        Self { stream, offset }
    }

    /// Next absolute offset this cursor will read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Copy up to `buf.len()` bytes at the current offset.
    ///
    /// A single read never spans two segments. Out of range is reported as an
    /// error, with the stream length attached.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus> {
        match self.stream.read_at(self.offset, buf)? {
            ReadStatus::Data(n) => {
                self.offset += n as u64;
                Ok(ReadStatus::Data(n))
            }
            ReadStatus::OutOfRange { len } => Err(StreamError::OutOfRange {
                offset: self.offset,
                len,
            }),
            status => Ok(status),
        }
    }

    /// Drain into `sink` until end of stream, sleeping `interval` whenever
    /// the cursor is caught up.
    pub fn copy_to<W: Write>(&mut self, sink: &mut W, interval: Duration) -> Result<u64> {
        self.copy_until(sink, interval, &CancellationToken::new())
    }

    /// [`copy_to`](Self::copy_to) that stops with [`StreamError::Cancelled`]
    /// once `cancel` fires, checked before every read.
    pub fn copy_until<W: Write>(
        &mut self,
        sink: &mut W,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            match self.read(&mut buf)? {
                ReadStatus::Data(n) => {
                    sink.write_all(&buf[..n])?;
                    copied += n as u64;
                }
                ReadStatus::Pending => {
                    trace!(stream.id = %self.stream.id(), offset = self.offset, "cursor waiting");
                    thread::sleep(interval);
                }
                ReadStatus::Eof | ReadStatus::OutOfRange { .. } => {
                    sink.flush()?;
                    return Ok(copied);
                }
            }
        }
    }
}

/// Blocking [`io::Read`] adapter: waits on `Pending` with the default poll
/// interval and reports end of stream as `Ok(0)`.
impl io::Read for Cursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match Cursor::read(self, buf).map_err(io::Error::from)? {
                ReadStatus::Data(n) => return Ok(n),
                ReadStatus::Eof => return Ok(0),
                ReadStatus::Pending => thread::sleep(crate::DEFAULT_POLL_INTERVAL),
                ReadStatus::OutOfRange { len } => {
                    return Err(StreamError::OutOfRange {
                        offset: self.offset,
                        len,
                    }
                    .into())
                }
            }
        }
    }
}
