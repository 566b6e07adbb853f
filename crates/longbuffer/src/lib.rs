//! Long buffers: segmented, disk-backed byte streams for stream-my-command.
//!
//! A [`Stream`] has exactly one producer appending bytes and any number of
//! consumers reading them back, including consumers that attach while the
//! producer is still running and consumers that are slower than it.
//!
//! - **producer**: calls [`Stream::write`] repeatedly, then [`Stream::close`]
//! - **consumers**: each owns a [`Cursor`] at its own offset, or subscribes
//!   with [`Stream::subscribe`] to be woken on every write
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use longbuffer::{Stream, DEFAULT_SEGMENT_SIZE};
//!
//! let stream = Stream::create("/tmp", DEFAULT_SEGMENT_SIZE).unwrap();
//! stream.write(b"Je mange des carottes").unwrap();
//! stream.close().unwrap();
//!
//! let mut out = Vec::new();
//! stream.copy(0, &mut out).unwrap();
//! assert_eq!(out, b"Je mange des carottes");
//! println!("etag: {}", stream.hash());
//! ```
//!
//! # Layout
//!
//! ```text
//! {base}/
//! └── lb-{uuid}/
//!     ├── bucket_1   # read-only once full
//!     ├── bucket_2
//!     └── bucket_3   # active segment, mirrored in memory
//! ```
//!
//! Only the active segment is held in memory, so resident size is bounded by
//! the segment size no matter how long the stream grows. Files are never
//! deleted by this crate; the stream's [`Stream::home`] belongs to the caller.

pub mod cursor;
pub mod error;
pub mod hash;
pub mod pubsub;
pub mod segment;
pub mod stream;

// Re-exports for convenience
pub use cursor::{Cursor, ReadStatus};
pub use error::{Result, StreamError};
pub use hash::{HashError, StreamHash};
pub use pubsub::{run_blocking, Subscription};
pub use stream::Stream;

use std::time::Duration;

/// Segment capacity used when the caller has no opinion (10 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;

/// How long [`Stream::copy`] sleeps when a cursor has caught up with the producer.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Size of the scratch buffer used by copy loops.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;
