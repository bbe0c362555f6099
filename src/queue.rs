//! Bounded queues connecting pipeline stages.
//!
//! Every queue is a bounded multi-producer multi-consumer FIFO. Sends never
//! block unconditionally: they race the pipeline's cancellation token, or use
//! `try_send` when the caller wants an immediate answer.
//!
//! A queue has exactly one logical closer. Closing is explicit through
//! [`QueueSender::close`]; any send attempted after that is recorded on the
//! queue's [`QueueProbe`] as an illegal send. A correctly wired pipeline never
//! records one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Instrumentation shared by all queues of a run.
#[derive(Debug, Default)]
pub struct QueueProbe {
    closes: AtomicU64,
    illegal_sends: AtomicU64,
}

impl QueueProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of explicit closes performed
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }

    /// Sends attempted on a queue after its owner closed it
    pub fn illegal_sends(&self) -> u64 {
        self.illegal_sends.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    closed_by_owner: AtomicBool,
    probe: Arc<QueueProbe>,
}

/// Why a send did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The cancellation token fired while waiting for space
    #[error("send cancelled")]
    Cancelled,
    /// The wait budget ran out while the queue stayed full
    #[error("queue stayed full for {0:?}")]
    Elapsed(Duration),
    /// The owner closed the queue
    #[error("send on closed queue")]
    Closed,
    /// Every receiver is gone
    #[error("all receivers dropped")]
    Disconnected,
}

/// Result of a non-blocking send; the item is handed back on failure.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum TrySendError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("queue is closed")]
    Closed(T),
}

/// Create a bounded queue with its own probe.
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    bounded_probed(capacity, QueueProbe::new())
}

/// Create a bounded queue reporting to a shared probe.
///
/// A capacity of zero is raised to one.
pub fn bounded_probed<T>(
    capacity: usize,
    probe: Arc<QueueProbe>,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = async_channel::bounded(capacity);
    let shared = Arc::new(Shared {
        capacity,
        closed_by_owner: AtomicBool::new(false),
        probe,
    });
    (
        QueueSender {
            inner: tx,
            shared: shared.clone(),
        },
        QueueReceiver { inner: rx, shared },
    )
}

/// Sending half of a queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    inner: async_channel::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Send an item, waiting for space until `cancel` fires.
    pub async fn send(&self, item: T, cancel: &CancellationToken) -> Result<(), SendError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SendError::Cancelled),
            sent = self.inner.send(item) => sent.map_err(|_| self.refused()),
        }
    }

    /// Send an item, waiting at most `wait` for space.
    pub async fn send_timeout(
        &self,
        item: T,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(wait, self.send(item, cancel)).await {
            Ok(sent) => sent,
            Err(_) => Err(SendError::Elapsed(wait)),
        }
    }

    /// Send without waiting.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.inner.try_send(item).map_err(|e| match e {
            async_channel::TrySendError::Full(item) => TrySendError::Full(item),
            async_channel::TrySendError::Closed(item) => {
                self.refused();
                TrySendError::Closed(item)
            }
        })
    }

    /// Close the queue for every sender.
    ///
    /// Only the component that owns all writers may call this, after they have
    /// stopped. Returns `true` if this call closed the queue.
    pub fn close(&self) -> bool {
        if self.shared.closed_by_owner.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.probe.closes.fetch_add(1, Ordering::Relaxed);
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn probe(&self) -> &Arc<QueueProbe> {
        &self.shared.probe
    }

    fn refused(&self) -> SendError {
        if self.shared.closed_by_owner.load(Ordering::Acquire) {
            self.shared.probe.illegal_sends.fetch_add(1, Ordering::Relaxed);
            SendError::Closed
        } else {
            SendError::Disconnected
        }
    }
}

/// Receiving half of a queue. Clones share the same items (fan-out).
#[derive(Debug)]
pub struct QueueReceiver<T> {
    inner: async_channel::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Receive the next item; `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.inner.recv().await.ok()
    }

    /// Receive the next item unless `cancel` fires first.
    pub async fn recv_or_cancel(&self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = self.inner.recv() => item.ok(),
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.inner.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Consume the receiver as a stream ending when the queue closes.
    pub fn into_stream(self) -> impl Stream<Item = T> {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_fifo_order() {
        let cancel = CancellationToken::new();
        let (tx, rx) = bounded(4);
        for i in 0..4 {
            tx.send(i, &cancel).await.unwrap();
        }
        tx.close();

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            seen.push(item);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_try_send_full_returns_item() {
        let (tx, _rx) = bounded(1);
        tx.try_send(1).unwrap();
        assert_eq!(tx.try_send(2), Err(TrySendError::Full(2)));
    }

    #[tokio::test]
    async fn test_send_on_full_queue_observes_cancellation() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = bounded(1);
        tx.send(1, &cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        assert_eq!(tx.send(2, &cancel).await, Err(SendError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_send_timeout_elapses() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = bounded(1);
        tx.try_send(1).unwrap();

        let wait = Duration::from_millis(10);
        assert_eq!(
            tx.send_timeout(2, wait, &cancel).await,
            Err(SendError::Elapsed(wait))
        );
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let (tx, rx) = bounded::<u8>(2);
        let other = tx.clone();
        assert!(tx.close());
        assert!(!other.close());
        assert_eq!(tx.probe().closes(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_is_recorded() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = bounded(2);
        tx.close();

        assert_eq!(tx.send(1, &cancel).await, Err(SendError::Closed));
        assert!(matches!(tx.try_send(2), Err(TrySendError::Closed(2))));
        assert_eq!(tx.probe().illegal_sends(), 2);
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_not_illegal_sends() {
        let cancel = CancellationToken::new();
        let (tx, rx) = bounded(2);
        drop(rx);

        assert_eq!(tx.send(1, &cancel).await, Err(SendError::Disconnected));
        assert_eq!(tx.probe().illegal_sends(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_raised() {
        let (tx, _rx) = bounded::<u8>(0);
        assert_eq!(tx.capacity(), 1);
        tx.try_send(1).unwrap();
    }

    #[tokio::test]
    async fn test_recv_or_cancel() {
        let cancel = CancellationToken::new();
        let (_tx, rx) = bounded::<u8>(1);
        cancel.cancel();
        assert_eq!(rx.recv_or_cancel(&cancel).await, None);
    }
}
