//! Result sinks for the end of a pipeline.
//!
//! The collector hands every [`ItemResult`] to exactly one sink. These are
//! the common ones; implement [`ResultSink`] for anything else.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

use crate::core::{ItemResult, ResultSink};
use crate::error::Result;

/// A sink that drops every result. Statistics are still kept.
pub struct DiscardSink<T> {
    _phantom: PhantomData<fn(T)>,
}

impl<T> DiscardSink<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for DiscardSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> ResultSink<T> for DiscardSink<T> {
    async fn write(&mut self, _result: ItemResult<T>) -> Result<()> {
        Ok(())
    }
}

/// A sink that collects results into a vector.
///
/// Clones share the same vector, so keep one clone to read the results after
/// the run.
pub struct CollectSink<T> {
    items: Arc<TokioMutex<Vec<ItemResult<T>>>>,
}

impl<T: Send + 'static> CollectSink<T> {
    /// Create a new collect sink
    pub fn new() -> Self {
        Self {
            items: Arc::new(TokioMutex::new(Vec::new())),
        }
    }

    /// Take the collected results
    pub async fn into_items(self) -> Vec<ItemResult<T>> {
        std::mem::take(&mut *self.items.lock().await)
    }

    /// Get a clone of the items Arc for external access
    pub fn items(&self) -> Arc<TokioMutex<Vec<ItemResult<T>>>> {
        self.items.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[async_trait]
impl<T: Send + 'static> ResultSink<T> for CollectSink<T> {
    async fn write(&mut self, result: ItemResult<T>) -> Result<()> {
        self.items.lock().await.push(result);
        Ok(())
    }
}

impl<T: Send + 'static> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Counts {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// A sink that only counts successes and failures
pub struct CountSink<T> {
    counts: Arc<Counts>,
    _phantom: PhantomData<fn(T)>,
}

impl<T> CountSink<T> {
    /// Create a new count sink
    pub fn new() -> Self {
        Self {
            counts: Arc::new(Counts::default()),
            _phantom: PhantomData,
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.counts.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.counts.failed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.succeeded() + self.failed()
    }
}

#[async_trait]
impl<T: Send + 'static> ResultSink<T> for CountSink<T> {
    async fn write(&mut self, result: ItemResult<T>) -> Result<()> {
        let counter = if result.succeeded() {
            &self.counts.succeeded
        } else {
            &self.counts.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<T> Default for CountSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CountSink<T> {
    fn clone(&self) -> Self {
        Self {
            counts: self.counts.clone(),
            _phantom: PhantomData,
        }
    }
}

/// Helper function to create a sink from an async function
pub fn sink_from_fn<F, Fut, T>(f: F) -> FnSink<F, Fut, T>
where
    F: FnMut(ItemResult<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    FnSink {
        f,
        _phantom: PhantomData,
    }
}

/// A sink created from a function
pub struct FnSink<F, Fut, T> {
    f: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

#[async_trait]
impl<F, Fut, T> ResultSink<T> for FnSink<F, Fut, T>
where
    F: FnMut(ItemResult<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    async fn write(&mut self, result: ItemResult<T>) -> Result<()> {
        (self.f)(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Envelope, FailureKind, ItemFailure, ItemId, WorkItem, WorkerId};

    fn ok(id: u64) -> ItemResult<u64> {
        ItemResult::from(Envelope::submitted(WorkItem::new(id, id)))
    }

    fn failed(id: u64) -> ItemResult<u64> {
        let failure = ItemFailure::new(Arc::from("check"), FailureKind::Rejected, "nope");
        ItemResult::from(Envelope::failed(
            ItemId(id),
            None,
            WorkerId::new(Arc::from("check"), None, 0),
            failure,
        ))
    }

    #[tokio::test]
    async fn test_collect_sink_shares_results() {
        let sink = CollectSink::new();
        let mut writer = sink.clone();
        writer.write(ok(1)).await.unwrap();
        writer.write(failed(2)).await.unwrap();

        assert_eq!(sink.len().await, 2);
        let items = sink.into_items().await;
        assert_eq!(items[0].value(), Some(&1));
        assert!(!items[1].succeeded());
    }

    #[tokio::test]
    async fn test_count_sink() {
        let sink = CountSink::new();
        let mut writer = sink.clone();
        for id in 0..3 {
            writer.write(ok(id)).await.unwrap();
        }
        writer.write(failed(9)).await.unwrap();

        assert_eq!(sink.succeeded(), 3);
        assert_eq!(sink.failed(), 1);
        assert_eq!(sink.total(), 4);
    }

    #[tokio::test]
    async fn test_fn_sink() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let mut sink = sink_from_fn(move |result: ItemResult<u64>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(result.item_id().0, Ordering::SeqCst);
                Ok(())
            }
        });
        sink.write(ok(2)).await.unwrap();
        sink.write(ok(5)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
