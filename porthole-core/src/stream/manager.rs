//! Logical streams multiplexed over a session
//!
//! Each stream is a bounded inbound queue plus a one-shot closure signal.
//! The manager owns the sender side; the [`Stream`] handle returned by
//! [`StreamManager::open`] carries the receiver and is consumed by the relay
//! pump. Ids are session-scoped, start at 1, grow monotonically and are
//! never recycled; exhausting the id space is an error, not a wrap.

use bytes::Bytes;
use dashmap::DashMap;
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use porthole_common::{Result, TunnelError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capacity of each stream's inbound queue, in payloads. A full queue blocks
/// the session reader, which is the backpressure path back to the peer.
const INBOUND_QUEUE_CAPACITY: usize = 16;

struct StreamEntry {
    tx: AsyncSender<Bytes>,
    closed: CancellationToken,
}

/// One end of a logical stream: the inbound payload queue plus the closure
/// signal. Handed out once per stream by [`StreamManager::open`].
pub struct Stream {
    id: u32,
    rx: AsyncReceiver<Bytes>,
    closed: CancellationToken,
}

impl Stream {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Next inbound payload, in FIFO order. Drains anything queued before
    /// the stream was closed, then yields `None`.
    pub async fn recv(&self) -> Option<Bytes> {
        self.rx.recv().await.ok()
    }

    /// Closure signal, observable by pumps that block on something other
    /// than the queue (e.g. a socket read).
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Table of live streams for one session.
#[derive(Clone)]
pub struct StreamManager {
    streams: Arc<DashMap<u32, StreamEntry>>,
    next_id: Arc<AtomicU32>,
}

impl StreamManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Allocate the next id and register a fresh stream.
    pub fn open(&self) -> Result<Stream> {
        let id = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map_err(|_| TunnelError::InvalidState("stream id space exhausted".into()))?;

        let (tx, rx) = bounded_async(INBOUND_QUEUE_CAPACITY);
        let closed = CancellationToken::new();
        self.streams.insert(
            id,
            StreamEntry {
                tx,
                closed: closed.clone(),
            },
        );

        Ok(Stream { id, rx, closed })
    }

    /// Enqueue an inbound payload, waiting while the queue is full. Returns
    /// `false` when the id is unknown or the stream already closed.
    pub async fn push(&self, id: u32, payload: Bytes) -> bool {
        // Clone the sender out of the map; the guard must not be held
        // across the await.
        let Some(tx) = self.streams.get(&id).map(|entry| entry.tx.clone()) else {
            return false;
        };
        tx.send(payload).await.is_ok()
    }

    /// Close and evict a stream. Idempotent: the closure signal transitions
    /// exactly once, and the queue drains to its receiver before it reports
    /// end-of-stream.
    pub fn close(&self, id: u32) {
        if let Some((_, entry)) = self.streams.remove(&id) {
            entry.closed.cancel();
        }
    }

    /// Close every stream. Used during session teardown.
    pub fn close_all(&self) {
        self.streams.retain(|_, entry| {
            entry.closed.cancel();
            false
        });
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("len", &self.streams.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ids_are_strictly_increasing_and_never_recycled() {
        let manager = StreamManager::new();

        let s1 = manager.open().unwrap();
        let s2 = manager.open().unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 2);

        manager.close(s1.id());
        manager.close(s2.id());

        let s3 = manager.open().unwrap();
        assert_eq!(s3.id(), 3);
    }

    #[tokio::test]
    async fn open_get_close() {
        let manager = StreamManager::new();
        let stream = manager.open().unwrap();

        assert!(manager.contains(stream.id()));
        assert!(manager.push(stream.id(), Bytes::from_static(b"hi")).await);
        assert_eq!(stream.recv().await.unwrap(), Bytes::from_static(b"hi"));

        manager.close(stream.id());
        assert!(!manager.contains(stream.id()));
        assert!(!manager.push(stream.id(), Bytes::from_static(b"late")).await);
    }

    #[tokio::test]
    async fn queue_drains_fifo_after_close() {
        let manager = StreamManager::new();
        let stream = manager.open().unwrap();

        for i in 0u8..4 {
            assert!(manager.push(stream.id(), Bytes::from(vec![i])).await);
        }
        manager.close(stream.id());

        // Payloads queued before the close are still delivered in order.
        for i in 0u8..4 {
            assert_eq!(stream.recv().await.unwrap(), Bytes::from(vec![i]));
        }
        assert!(stream.recv().await.is_none());
        assert!(stream.closed().is_cancelled());
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let manager = StreamManager::new();
        let stream = manager.open().unwrap();

        for _ in 0..INBOUND_QUEUE_CAPACITY {
            assert!(manager.push(stream.id(), Bytes::from_static(b"x")).await);
        }

        // The seventeenth push must block until the receiver drains one.
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            manager.push(stream.id(), Bytes::from_static(b"y")),
        )
        .await;
        assert!(blocked.is_err());

        let _ = stream.recv().await;
        let pushed = tokio::time::timeout(
            Duration::from_millis(500),
            manager.push(stream.id(), Bytes::from_static(b"y")),
        )
        .await
        .unwrap();
        assert!(pushed);
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let manager = StreamManager::new();
        let a = manager.open().unwrap();
        let b = manager.open().unwrap();

        manager.close_all();
        assert!(manager.is_empty());
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(a.closed().is_cancelled());
        assert!(b.closed().is_cancelled());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let manager = StreamManager::new();
        let stream = manager.open().unwrap();
        manager.close(stream.id());
        manager.close(stream.id());
        assert!(stream.closed().is_cancelled());
    }
}
