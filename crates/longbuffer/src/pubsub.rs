//! Push delivery: subscribers are woken after every write instead of polling.
//!
//! Each subscriber owns a cursor and a capacity-1 signal channel. The stream
//! signals with `try_send`, so any number of writes that land while a
//! subscriber is busy collapse into one wake-up, and a slow sink never stalls
//! the producer.

use std::collections::HashMap;
use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cursor::{Cursor, ReadStatus};
use crate::error::{Result, StreamError};
use crate::stream::Stream;
use crate::COPY_BUFFER_SIZE;

/// Registry of live subscribers, keyed by id.
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    next_id: u64,
    signals: HashMap<u64, mpsc::Sender<()>>,
}

impl Subscribers {
    fn register(&mut self) -> (u64, mpsc::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(1);
        // Initial kick so bytes already written get delivered.
        let _ = tx.try_send(());
        self.signals.insert(id, tx);
        (id, rx)
    }

    fn remove(&mut self, id: u64) -> bool {
        self.signals.remove(&id).is_some()
    }

    /// Signal every subscriber. Returns how many were signalled.
    pub(crate) fn notify_all(&mut self) -> usize {
        // A full channel already holds a pending wake-up.
        self.signals.values().for_each(|tx| {
            let _ = tx.try_send(());
        });
        self.signals.len()
    }

    fn len(&self) -> usize {
        self.signals.len()
    }
}

/// Handle to a running subscriber task.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    handle: JoinHandle<Result<u64>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the subscriber to finish and return how many bytes it delivered.
    pub async fn wait(self) -> Result<u64> {
        self.handle
            .await
            .map_err(|e| StreamError::Subscriber(e.to_string()))?
    }
}

impl Stream {
    /// Deliver bytes from `offset` to `sink` as they are written.
    ///
    /// Spawns a task on the current tokio runtime. The sink is shut down after
    /// the last byte of a closed stream. Cancelling `cancel` stops delivery
    /// early with [`StreamError::Cancelled`]. Subscribing to a stream that is
    /// already closed delivers everything from `offset` and finishes.
    pub fn subscribe<W>(&self, offset: u64, sink: W, cancel: CancellationToken) -> Subscription
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (id, signal) = self.subscribers().register();
        debug!(stream.id = %self.id(), subscriber = id, offset, "subscriber attached");

        let stream = self.clone();
        let cursor = self.reader(offset);
        let handle = tokio::spawn(async move {
            let result = deliver(cursor, sink, signal, cancel).await;
            stream.unsubscribe(id);
            match &result {
                Ok(bytes) => {
                    debug!(stream.id = %stream.id(), subscriber = id, bytes, "subscriber finished")
                }
                Err(StreamError::Cancelled) => {
                    debug!(stream.id = %stream.id(), subscriber = id, "subscriber cancelled")
                }
                Err(StreamError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(stream.id = %stream.id(), subscriber = id, "subscriber sink went away")
                }
                Err(e) => {
                    warn!(stream.id = %stream.id(), subscriber = id, error = %e, "subscriber failed")
                }
            }
            result
        });

        Subscription { id, handle }
    }

    /// Drop a subscriber from the registry. Returns whether it was registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers().remove(id)
    }

    /// Subscribers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

/// Run blocking stream I/O (segment reads, writes that may rotate) from async code.
///
/// On a multi-threaded runtime the worker hands its queued tasks to another
/// thread first. A current-thread runtime has nowhere to hand them, so `f`
/// runs inline there.
pub fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            task::block_in_place(f)
        }
        _ => f(),
    }
}

async fn deliver<W>(
    mut cursor: Cursor,
    mut sink: W,
    mut signal: mpsc::Receiver<()>,
    cancel: CancellationToken,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut delivered = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            woken = signal.recv() => {
                if woken.is_none() {
                    return Err(StreamError::Subscriber("unsubscribed".to_string()));
                }
            }
        }

        // Drain until caught up; the next write signals again.
        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }
            match run_blocking(|| cursor.read(&mut buf))? {
                ReadStatus::Data(n) => {
                    sink.write_all(&buf[..n]).await?;
                    delivered += n as u64;
                }
                ReadStatus::Pending => break,
                ReadStatus::Eof | ReadStatus::OutOfRange { .. } => {
                    sink.flush().await?;
                    sink.shutdown().await?;
                    return Ok(delivered);
                }
            }
        }
        sink.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_register_kicks_and_coalesces() {
        let mut subscribers = Subscribers::default();
        let (id, mut rx) = subscribers.register();
        assert_eq!(id, 0);
        assert_eq!(subscribers.len(), 1);

        // The kick plus two notifications collapse into one pending signal.
        assert_eq!(subscribers.notify_all(), 1);
        assert_eq!(subscribers.notify_all(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        assert!(subscribers.remove(id));
        assert!(!subscribers.remove(id));
        assert_eq!(subscribers.notify_all(), 0);
    }

    #[test]
    fn test_run_blocking_outside_runtime() {
        assert_eq!(run_blocking(|| 7), 7);
    }

    #[tokio::test]
    async fn test_run_blocking_current_thread() {
        assert_eq!(run_blocking(|| "inline"), "inline");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_multi_thread() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 4)?;
        let written = run_blocking(|| stream.write(b"rotates twice"))?;
        assert_eq!(written, 13);
        assert_eq!(stream.segment_count(), 4);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscriber_receives_everything() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 1024)?;
        let data = payload(10 * 1024 + 7);

        let (client, server) = tokio::io::duplex(4096);
        let sub = stream.subscribe(0, server, CancellationToken::new());
        assert_eq!(stream.subscriber_count(), 1);

        let reader = tokio::spawn(async move {
            let mut client = client;
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.map(|_| out)
        });

        for chunk in data.chunks(1000) {
            stream.write(chunk)?;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        stream.close()?;

        assert_eq!(sub.wait().await?, data.len() as u64);
        assert_eq!(reader.await??, data);
        assert_eq!(stream.subscriber_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_subscribe_after_close_delivers_tail() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 6)?;
        stream.write(b"Je mange des carottes")?;
        stream.close()?;

        let (mut client, server) = tokio::io::duplex(64);
        let sub = stream.subscribe(9, server, CancellationToken::new());
        assert_eq!(sub.wait().await?, 12);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await?;
        assert_eq!(out, b"des carottes");
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stops_subscriber() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 6)?;
        stream.write(b"open")?;

        let cancel = CancellationToken::new();
        let (_client, server) = tokio::io::duplex(64);
        let sub = stream.subscribe(0, server, cancel.clone());

        cancel.cancel();
        assert!(matches!(sub.wait().await, Err(StreamError::Cancelled)));
        assert_eq!(stream.subscriber_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_subscribe_past_end_of_closed_stream_fails() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let stream = Stream::create(temp_dir.path(), 6)?;
        stream.write(b"abc")?;
        stream.close()?;

        let (_client, server) = tokio::io::duplex(64);
        let sub = stream.subscribe(10, server, CancellationToken::new());
        assert!(matches!(
            sub.wait().await,
            Err(StreamError::OutOfRange { offset: 10, len: 3 })
        ));
        Ok(())
    }
}
