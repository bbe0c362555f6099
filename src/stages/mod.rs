//! Ready-made stages and stage adapters.
//!
//! - [`stage_fn`] turns an async closure into a stage.
//! - [`MapStage`] wraps a synchronous closure.
//! - [`RetryStage`] retries faults of another stage with backoff.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::core::{ItemContext, Stage};
use crate::error::{StageError, StageResult};
use crate::util::RetryPolicy;

/// Create a stage from an async closure.
///
/// The closure receives the input and an owned [`ItemContext`].
///
/// ```rust
/// use fanweld::stages::stage_fn;
/// use fanweld::error::StageError;
///
/// let lookup = stage_fn(|id: u32, _ctx| async move {
///     if id == 0 {
///         return Err(StageError::rejected("id 0 is reserved"));
///     }
///     Ok(format!("user-{}", id))
/// });
/// # let _ = lookup;
/// ```
pub fn stage_fn<F, Fut, In, Out>(f: F) -> FnStage<F, Fut, In, Out>
where
    F: Fn(In, ItemContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageResult<Out>> + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    FnStage {
        f,
        _phantom: PhantomData,
    }
}

/// A stage created from an async closure
pub struct FnStage<F, Fut, In, Out> {
    f: F,
    _phantom: PhantomData<fn(In) -> (Fut, Out)>,
}

#[async_trait]
impl<F, Fut, In, Out> Stage for FnStage<F, Fut, In, Out>
where
    F: Fn(In, ItemContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageResult<Out>> + Send + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    type Input = In;
    type Output = Out;

    async fn process(&self, input: In, ctx: &ItemContext) -> StageResult<Out> {
        (self.f)(input, ctx.clone()).await
    }
}

/// A stage that applies a synchronous function.
///
/// Keep the function cheap; it runs on the worker task.
pub struct MapStage<F, In, Out> {
    f: F,
    _phantom: PhantomData<fn(In) -> Out>,
}

impl<F, In, Out> MapStage<F, In, Out>
where
    F: Fn(In) -> StageResult<Out> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, In, Out> Stage for MapStage<F, In, Out>
where
    F: Fn(In) -> StageResult<Out> + Send + Sync + 'static,
    In: Send + 'static,
    Out: Send + 'static,
{
    type Input = In;
    type Output = Out;

    async fn process(&self, input: In, _ctx: &ItemContext) -> StageResult<Out> {
        (self.f)(input)
    }
}

/// Retries [`StageError::Fault`] outcomes of the wrapped stage.
///
/// Rejections are returned immediately. Backoff sleeps end early when the
/// pipeline is cancelled. All attempts share the per-item timeout of the
/// stage they run in.
pub struct RetryStage<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Stage> RetryStage<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S> Stage for RetryStage<S>
where
    S: Stage,
    S::Input: Clone + Sync,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn process(&self, input: S::Input, ctx: &ItemContext) -> StageResult<S::Output> {
        self.policy
            .execute(ctx.cancellation(), StageError::is_fault, || {
                self.inner.process(input.clone(), ctx)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ItemId, WorkerId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx(cancel: CancellationToken) -> ItemContext {
        ItemContext::new(
            ItemId(1),
            None,
            WorkerId::new(Arc::from("test"), None, 0),
            cancel,
        )
    }

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl Stage for Flaky {
        type Input = u32;
        type Output = u32;

        async fn process(&self, input: u32, _ctx: &ItemContext) -> StageResult<u32> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if input == 0 {
                return Err(StageError::rejected("zero"));
            }
            if call < self.failures {
                return Err(StageError::fault(format!("attempt {} failed", call + 1)));
            }
            Ok(input + 1)
        }
    }

    fn fast_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(attempts)
            .with_initial_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_map_stage() {
        let stage = MapStage::new(|n: i32| {
            if n < 0 {
                Err(StageError::rejected("negative"))
            } else {
                Ok(n * n)
            }
        });
        let ctx = ctx(CancellationToken::new());
        assert_eq!(stage.process(4, &ctx).await, Ok(16));
        assert!(stage.process(-1, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_stage_fn_sees_context() {
        let stage = stage_fn(|n: u64, ctx: ItemContext| async move { Ok((ctx.item_id(), n)) });
        let ctx = ctx(CancellationToken::new());
        assert_eq!(stage.process(9, &ctx).await, Ok((ItemId(1), 9)));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_faults() {
        let stage = RetryStage::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures: 2,
            },
            fast_policy(3),
        );
        let ctx = ctx(CancellationToken::new());
        assert_eq!(stage.process(1, &ctx).await, Ok(2));
        assert_eq!(stage.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let stage = RetryStage::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures: 10,
            },
            fast_policy(2),
        );
        let ctx = ctx(CancellationToken::new());
        assert_eq!(
            stage.process(1, &ctx).await,
            Err(StageError::fault("attempt 2 failed"))
        );
    }

    #[tokio::test]
    async fn test_rejections_are_not_retried() {
        let stage = RetryStage::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures: 0,
            },
            fast_policy(5),
        );
        let ctx = ctx(CancellationToken::new());
        assert!(stage.process(0, &ctx).await.is_err());
        assert_eq!(stage.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_cuts_backoff_short() {
        let stage = RetryStage::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures: 10,
            },
            RetryPolicy::new()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = ctx(cancel);

        let outcome = tokio::time::timeout(Duration::from_secs(1), stage.process(1, &ctx))
            .await
            .unwrap();
        assert!(outcome.unwrap_err().is_fault());
        assert_eq!(stage.inner.calls.load(Ordering::SeqCst), 1);
    }
}
