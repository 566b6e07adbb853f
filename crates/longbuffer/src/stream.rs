//! Stream: a segmented append log with one producer and many readers.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::cursor::{Cursor, ReadStatus};
use crate::error::{Result, StreamError};
use crate::hash::StreamHash;
use crate::pubsub::Subscribers;
use crate::segment::{self, SegmentStore};
use crate::DEFAULT_POLL_INTERVAL;

/// Mutable stream state. Every access goes through the stream's lock.
#[derive(Debug)]
struct StreamState {
    segments: SegmentStore,
    hasher: Sha256,
    len: u64,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    id: Uuid,
    home: PathBuf,
    segment_size: u64,
    state: RwLock<StreamState>,
    /// Held for the whole of a write or close.
    producer: Mutex<()>,
    subscribers: Mutex<Subscribers>,
}

/// Handle to a stream. Cloning is cheap and every clone sees the same bytes.
#[derive(Debug, Clone)]
pub struct Stream {
    inner: Arc<Inner>,
}

/// What a cursor read resolves to after one snapshot of the stream.
enum Target {
    Done(ReadStatus),
    Segment { index: u64, local: u64 },
}

impl Stream {
    /// Create a stream in a fresh `lb-{uuid}` directory under `base`.
    ///
    /// `base` must exist. Segment 1 is opened immediately.
    pub fn create(base: impl AsRef<Path>, segment_size: u64) -> Result<Self> {
        let cache_size = usize::try_from(segment_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(StreamError::InvalidSegmentSize(segment_size))?;

        let id = Uuid::new_v4();
        let home = base.as_ref().join(format!("lb-{}", id));

        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&home)?;

        let segments = SegmentStore::create(home.clone(), cache_size)?;

        debug!(stream.id = %id, home = %home.display(), segment_size, "stream created");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                home,
                segment_size,
                state: RwLock::new(StreamState {
                    segments,
                    hasher: Sha256::new(),
                    len: 0,
                    closed: false,
                }),
                producer: Mutex::new(()),
                subscribers: Mutex::new(Subscribers::default()),
            }),
        })
    }

    /// Stable identifier, usable as a correlation token.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Directory holding this stream's segments.
    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    pub fn segment_size(&self) -> u64 {
        self.inner.segment_size
    }

    /// Segments opened so far (1-based, never 0).
    pub fn segment_count(&self) -> u64 {
        self.read_state().segments.count()
    }

    /// Bytes written so far. Exact at any moment, open or closed.
    pub fn len(&self) -> u64 {
        self.read_state().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.read_state().closed
    }

    /// SHA-256 of everything written so far.
    ///
    /// Only a full content hash once the stream is closed.
    pub fn hash(&self) -> StreamHash {
        StreamHash::snapshot(&self.read_state().hasher)
    }

    /// Append bytes, rotating segments as they fill up.
    ///
    /// Each slice lands in file, cache and hash under one exclusive lock, so
    /// readers never observe a torn append. A segment that is exactly full is
    /// only rotated when the next byte arrives.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let _producer = self.producer_guard()?;

        if self.read_state().closed {
            return Err(StreamError::Closed);
        }

        let mut written = 0;
        while written < data.len() {
            let mut state = self.write_state();
            if state.closed {
                return Err(StreamError::Closed);
            }
            if state.segments.free_capacity() == 0 {
                state.segments.rotate()?;
            }

            let take = state.segments.free_capacity().min(data.len() - written);
            let slice = &data[written..written + take];
            state.segments.append(slice)?;
            state.hasher.update(slice);
            state.len += take as u64;
            written += take;
        }

        if written > 0 {
            self.notify_subscribers();
        }
        Ok(written)
    }

    /// Finalize the active segment and mark the stream closed.
    ///
    /// Cursors can reach end of stream only after this. Closing twice is fine;
    /// closing while a write is in flight is rejected.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let _producer = self.producer_guard()?;

        {
            let mut state = self.write_state();
            if state.closed {
                return Ok(());
            }
            state.segments.finalize()?;
            state.closed = true;
            debug!(
                stream.id = %self.inner.id,
                len = state.len,
                segments = state.segments.count(),
                "stream closed"
            );
        }

        self.notify_subscribers();
        Ok(())
    }

    /// A new cursor at `offset`. The offset may be past the current length.
    pub fn reader(&self, offset: u64) -> Cursor {
        Cursor::new(self.clone(), offset)
    }

    /// Copy everything from `offset` to the end of the stream into `sink`,
    /// waiting for the producer when caught up.
    ///
    /// Returns once the stream is closed and fully copied.
    pub fn copy<W: Write>(&self, offset: u64, sink: &mut W) -> Result<u64> {
        self.reader(offset).copy_to(sink, DEFAULT_POLL_INTERVAL)
    }

    /// [`copy`](Self::copy) with a custom poll interval.
    pub fn copy_with_interval<W: Write>(
        &self,
        offset: u64,
        sink: &mut W,
        interval: Duration,
    ) -> Result<u64> {
        self.reader(offset).copy_to(sink, interval)
    }

    /// [`copy_with_interval`](Self::copy_with_interval) that gives up with
    /// [`StreamError::Cancelled`] once `cancel` fires.
    pub fn copy_until<W: Write>(
        &self,
        offset: u64,
        sink: &mut W,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.reader(offset).copy_until(sink, interval, cancel)
    }

    /// The read primitive behind [`Cursor::read`].
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<ReadStatus> {
        if buf.is_empty() {
            return Ok(ReadStatus::Data(0));
        }

        let (index, local) = match self.locate(offset, buf) {
            Target::Done(status) => return Ok(status),
            Target::Segment { index, local } => (index, local),
        };

        // Finalized segments are immutable, no lock needed.
        let path = segment::segment_path(&self.inner.home, index);
        match segment::read_finalized(&path, local, buf)? {
            0 => Ok(ReadStatus::Pending),
            n => Ok(ReadStatus::Data(n)),
        }
    }

    /// Resolve a read under one shared-lock snapshot. Reads that fall in the
    /// active segment are served from its cache right here.
    fn locate(&self, offset: u64, buf: &mut [u8]) -> Target {
        let state = self.read_state();
        let len = state.len;

        if offset >= len {
            return Target::Done(match (state.closed, offset == len) {
                (true, true) => ReadStatus::Eof,
                (true, false) => ReadStatus::OutOfRange { len },
                (false, _) => ReadStatus::Pending,
            });
        }

        let size = self.inner.segment_size;
        let index = offset / size + 1;
        let local = offset - (index - 1) * size;

        if state.segments.active_index() == Some(index) {
            // local < segment_size, which fits in usize
            let n = state.segments.read_cache(local as usize, buf);
            return Target::Done(if n == 0 {
                ReadStatus::Pending
            } else {
                ReadStatus::Data(n)
            });
        }

        Target::Segment { index, local }
    }

    pub(crate) fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_subscribers(&self) {
        let notified = self.subscribers().notify_all();
        if notified > 0 {
            debug!(stream.id = %self.inner.id, subscribers = notified, "subscribers signalled");
        }
    }

    fn producer_guard(&self) -> Result<MutexGuard<'_, ()>> {
        match self.inner.producer.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(StreamError::ConcurrentProducer),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StreamState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StreamState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
