//! Segments: fixed-capacity chunk files under a stream's home directory.
//!
//! Segments are numbered from 1 and named `bucket_{n}`. Exactly one segment is
//! active at a time; its bytes are mirrored in memory so tailing readers never
//! touch the file that is still being appended. When the active segment is
//! full and more bytes arrive it is finalized (flushed, made read-only,
//! closed) and the next one is opened.
//!
//! Finalized segments never change again, which is what lets cursors read them
//! without holding the stream lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Path of segment `index` (1-based) under `home`.
pub fn segment_path(home: &Path, index: u64) -> PathBuf {
    home.join(format!("bucket_{}", index))
}

/// The segment currently receiving writes.
#[derive(Debug)]
struct ActiveSegment {
    index: u64,
    path: PathBuf,
    file: File,
    /// Bytes written to this segment since it was opened.
    cache: Vec<u8>,
}

impl ActiveSegment {
    fn open(home: &Path, index: u64, capacity: usize) -> io::Result<Self> {
        let path = segment_path(home, index);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;

        Ok(Self {
            index,
            path,
            file,
            cache: Vec::with_capacity(capacity),
        })
    }

    /// Flush, drop write permissions and close.
    fn finalize(mut self) -> io::Result<()> {
        self.file.flush()?;
        let mut permissions = self.file.metadata()?.permissions();
        permissions.set_readonly(true);
        self.file.set_permissions(permissions)?;
        debug!(segment = self.index, path = %self.path.display(), bytes = self.cache.len(), "segment finalized");
        Ok(())
    }
}

/// The on-disk segments of one stream plus the in-memory copy of the active one.
///
/// Not synchronized: the owning stream serializes access.
#[derive(Debug)]
pub(crate) struct SegmentStore {
    home: PathBuf,
    segment_size: usize,
    /// Segments opened so far.
    count: u64,
    /// `None` once the store has been finalized.
    active: Option<ActiveSegment>,
}

impl SegmentStore {
    /// Open segment 1 under an existing home directory.
    pub(crate) fn create(home: PathBuf, segment_size: usize) -> io::Result<Self> {
        let active = ActiveSegment::open(&home, 1, segment_size)?;
        Ok(Self {
            home,
            segment_size,
            count: 1,
            active: Some(active),
        })
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    /// Index of the active segment, `None` once finalized.
    pub(crate) fn active_index(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.index)
    }

    /// Bytes that still fit in the active segment.
    pub(crate) fn free_capacity(&self) -> usize {
        self.active
            .as_ref()
            .map(|a| self.segment_size - a.cache.len())
            .unwrap_or(0)
    }

    /// Append a slice that fits in the active segment, to file and cache.
    pub(crate) fn append(&mut self, chunk: &[u8]) -> io::Result<()> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| io::Error::other("segment store already finalized"))?;
        debug_assert!(chunk.len() <= self.segment_size - active.cache.len());

        active.file.write_all(chunk)?;
        active.cache.extend_from_slice(chunk);
        Ok(())
    }

    /// Finalize the active segment and open the next one.
    pub(crate) fn rotate(&mut self) -> io::Result<()> {
        if let Some(active) = self.active.take() {
            active.finalize()?;
        }
        let next = self.count + 1;
        self.active = Some(ActiveSegment::open(&self.home, next, self.segment_size)?);
        self.count = next;
        debug!(segment = next, home = %self.home.display(), "segment opened");
        Ok(())
    }

    /// Finalize the active segment without opening another. Idempotent.
    pub(crate) fn finalize(&mut self) -> io::Result<()> {
        match self.active.take() {
            Some(active) => active.finalize(),
            None => Ok(()),
        }
    }

    /// Copy cached bytes of the active segment starting at `local` into `buf`.
    ///
    /// Returns 0 when nothing is available yet at that position.
    pub(crate) fn read_cache(&self, local: usize, buf: &mut [u8]) -> usize {
        let Some(active) = self.active.as_ref() else {
            return 0;
        };
        if local >= active.cache.len() {
            return 0;
        }
        let available = &active.cache[local..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        n
    }
}

/// Read from a finalized segment file at a local offset.
///
/// The handle is released before returning. Reading at or past the end of the
/// file yields 0 rather than an error.
pub(crate) fn read_finalized(path: &Path, local: u64, buf: &mut [u8]) -> io::Result<usize> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(local))?;

    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
