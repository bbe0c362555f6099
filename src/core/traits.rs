//! Core traits for the worker pipeline.
//!
//! A [`Stage`] is the per-item transformation run by every worker of a pool;
//! a [`ResultSink`] receives the final results fanned in by the collector.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::item::{ItemId, ItemResult, WorkerId};
use crate::error::{Result, StageResult};

/// Per-item information handed to [`Stage::process`].
#[derive(Debug, Clone)]
pub struct ItemContext {
    item_id: ItemId,
    priority: Option<i32>,
    worker: WorkerId,
    cancel: CancellationToken,
}

impl ItemContext {
    pub(crate) fn new(
        item_id: ItemId,
        priority: Option<i32>,
        worker: WorkerId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            item_id,
            priority,
            worker,
            cancel,
        }
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// The worker running this item
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// The pipeline's shutdown signal.
    ///
    /// Workers already drop the `process` future when the pipeline is
    /// cancelled; stages that hand work to other tasks can watch this token
    /// to stop them as well.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A processing unit run concurrently by every worker of a pool.
///
/// One instance is shared by all workers of the stage, so `process` takes
/// `&self`. Keep per-item state local; anything shared has to be behind an
/// atomic or a lock.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use fanweld::core::{ItemContext, Stage};
/// use fanweld::error::{StageError, StageResult};
///
/// struct Square;
///
/// #[async_trait]
/// impl Stage for Square {
///     type Input = i64;
///     type Output = i64;
///
///     async fn process(&self, value: i64, _ctx: &ItemContext) -> StageResult<i64> {
///         if value < 0 {
///             return Err(StageError::rejected(format!("negative value {}", value)));
///         }
///         Ok(value * value)
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// The type of items this stage accepts
    type Input: Send + 'static;
    /// The type of items this stage produces
    type Output: Send + 'static;

    /// Process one item.
    ///
    /// An `Err` does not stop the worker: the item continues downstream as a
    /// failed result and the worker moves on to the next one.
    async fn process(&self, input: Self::Input, ctx: &ItemContext) -> StageResult<Self::Output>;
}

#[async_trait]
impl<S: Stage> Stage for std::sync::Arc<S> {
    type Input = S::Input;
    type Output = S::Output;

    async fn process(&self, input: Self::Input, ctx: &ItemContext) -> StageResult<Self::Output> {
        (**self).process(input, ctx).await
    }
}

/// Receives every result fanned in at the end of the pipeline.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use fanweld::core::{ItemResult, ResultSink};
/// use fanweld::Result;
///
/// struct LogSink;
///
/// #[async_trait]
/// impl ResultSink<String> for LogSink {
///     async fn write(&mut self, result: ItemResult<String>) -> Result<()> {
///         println!("{} -> {:?}", result.item_id(), result.value());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ResultSink<T: Send + 'static>: Send + 'static {
    /// Accept a single result.
    ///
    /// Errors are reported to the error sink; the result still counts as
    /// processed.
    async fn write(&mut self, result: ItemResult<T>) -> Result<()>;

    /// Called once after the last result of a completed run.
    ///
    /// Not called when the run is cancelled.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
