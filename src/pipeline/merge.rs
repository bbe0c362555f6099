//! Fan-in of several queues into one.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::queue::{bounded_probed, QueueProbe, QueueReceiver};

/// Forward every item of `sources` into a single bounded queue.
///
/// One reader task runs per source and the merged queue is closed once all
/// of them have finished, so it closes exactly when every source is closed
/// and drained (or `cancel` fires). Items from one source keep their order;
/// there is no ordering across sources. All tasks are registered on
/// `tracker`.
///
/// ```rust
/// use fanweld::pipeline::merge;
/// use fanweld::queue::bounded;
/// use tokio_util::sync::CancellationToken;
/// use tokio_util::task::TaskTracker;
///
/// # #[tokio::main]
/// # async fn main() {
/// let cancel = CancellationToken::new();
/// let tracker = TaskTracker::new();
/// let (a_tx, a_rx) = bounded(4);
/// let (b_tx, b_rx) = bounded(4);
/// let merged = merge(vec![a_rx, b_rx], 8, &cancel, &tracker);
///
/// a_tx.send(1, &cancel).await.unwrap();
/// b_tx.send(2, &cancel).await.unwrap();
/// a_tx.close();
/// b_tx.close();
///
/// let mut total = 0;
/// while let Some(value) = merged.recv().await {
///     total += value;
/// }
/// assert_eq!(total, 3);
/// # }
/// ```
pub fn merge<T: Send + 'static>(
    sources: Vec<QueueReceiver<T>>,
    capacity: usize,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> QueueReceiver<T> {
    merge_probed(sources, capacity, QueueProbe::new(), cancel, tracker)
}

pub(crate) fn merge_probed<T: Send + 'static>(
    sources: Vec<QueueReceiver<T>>,
    capacity: usize,
    probe: Arc<QueueProbe>,
    cancel: &CancellationToken,
    tracker: &TaskTracker,
) -> QueueReceiver<T> {
    let (tx, rx) = bounded_probed(capacity, probe);
    if sources.is_empty() {
        tx.close();
        return rx;
    }

    let readers = TaskTracker::new();
    for (index, source) in sources.into_iter().enumerate() {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tracker.spawn(readers.track_future(async move {
            let mut forwarded = 0u64;
            while let Some(item) = source.recv_or_cancel(&cancel).await {
                if tx.send(item, &cancel).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            tracing::trace!(source = index, forwarded, "merge reader finished");
        }));
    }
    readers.close();

    tracker.spawn(async move {
        readers.wait().await;
        tx.close();
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_per_source_order_is_preserved() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut senders = Vec::new();
        let mut sources = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = bounded(2);
            senders.push(tx);
            sources.push(rx);
        }
        let merged = merge(sources, 4, &cancel, &tracker);

        for (source, tx) in senders.into_iter().enumerate() {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for seq in 0..50u32 {
                    tx.send((source, seq), &cancel).await.unwrap();
                }
                tx.close();
            });
        }

        let mut last: HashMap<usize, u32> = HashMap::new();
        let mut count = 0;
        while let Some((source, seq)) = merged.recv().await {
            if let Some(previous) = last.insert(source, seq) {
                assert!(seq > previous, "source {} went backwards", source);
            }
            count += 1;
        }
        assert_eq!(count, 150);

        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_empty_sources_yield_closed_queue() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let merged = merge::<u8>(Vec::new(), 1, &cancel, &tracker);
        assert!(merged.is_closed());
        assert!(merged.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_readers() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (_tx, rx) = bounded::<u8>(1);
        let merged = merge(vec![rx], 1, &cancel, &tracker);

        cancel.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .unwrap();
        assert!(merged.recv().await.is_none());
    }
}
