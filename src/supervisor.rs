//! Bounded execution of a whole run.

use std::time::{Duration, Instant};

use crate::core::WorkItem;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::stats::RunStats;

/// Drives a started pipeline through one run under a single time budget.
///
/// Submission and completion share the budget: items that could not be
/// submitted before it ran out are skipped, and whatever time is left goes to
/// [`Pipeline::wait`]. The total run time is bounded by the budget plus
/// [`SHUTDOWN_GRACE`](crate::pipeline::SHUTDOWN_GRACE).
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    run_timeout: Duration,
}

impl Supervisor {
    pub fn new(run_timeout: Duration) -> Self {
        Self { run_timeout }
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    /// Submit `items` and wait for the run to finish.
    ///
    /// The pipeline is already running when it is handed over, so every
    /// submission has workers behind it.
    pub async fn run<I, It>(&self, pipeline: Pipeline<I>, items: It) -> Result<RunStats>
    where
        I: Send + 'static,
        It: IntoIterator<Item = WorkItem<I>>,
    {
        let deadline = Instant::now() + self.run_timeout;
        let mut submitted = 0u64;
        let mut skipped = 0u64;

        for item in items {
            let id = item.id();
            let attempt = tokio::time::timeout_at(
                tokio::time::Instant::from_std(deadline),
                pipeline.submit_wait(item),
            )
            .await;

            match attempt {
                Ok(Ok(())) => submitted += 1,
                Ok(Err(Error::DuplicateItem(_))) => {
                    tracing::warn!(item_id = %id, "duplicate item id, skipping");
                    skipped += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(item_id = %id, error = %e, "submission stopped");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        item_id = %id,
                        submitted,
                        "run budget exhausted while submitting"
                    );
                    break;
                }
            }
        }

        tracing::debug!(submitted, skipped, "submission finished");

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = pipeline.wait(Some(remaining)).await;

        match &outcome {
            Ok(stats) => tracing::info!(%stats, "run completed"),
            Err(e) => match e.stats() {
                Some(stats) => tracing::info!(%stats, error = %e, "run ended with errors"),
                None => tracing::info!(error = %e, "run ended"),
            },
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBuilder;
    use crate::stages::{stage_fn, MapStage};

    #[tokio::test]
    async fn test_run_completes_within_budget() {
        let pipeline = PipelineBuilder::new()
            .workers(2)
            .stage("inc", MapStage::new(|n: u64| Ok(n + 1)))
            .start()
            .unwrap();

        let items = (0..20u64).map(|id| WorkItem::new(id, id));
        let stats = Supervisor::new(Duration::from_secs(5))
            .run(pipeline, items)
            .await
            .unwrap();

        assert_eq!(stats.accepted, 20);
        assert_eq!(stats.processed, 20);
        assert!(stats.complete);
    }

    #[tokio::test]
    async fn test_duplicates_are_skipped() {
        let pipeline = PipelineBuilder::new()
            .stage("inc", MapStage::new(|n: u64| Ok(n + 1)))
            .start()
            .unwrap();

        let items = vec![
            WorkItem::new(1u64, 1),
            WorkItem::new(1u64, 2),
            WorkItem::new(2u64, 3),
        ];
        let stats = Supervisor::new(Duration::from_secs(5))
            .run(pipeline, items)
            .await
            .unwrap();
        assert_eq!(stats.accepted, 2);
    }

    #[tokio::test]
    async fn test_budget_bounds_a_stuck_run() {
        let pipeline = PipelineBuilder::new()
            .queue_capacity(1)
            .stage(
                "slow",
                stage_fn(|n: u64, _ctx| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(n)
                }),
            )
            .start()
            .unwrap();

        let started = Instant::now();
        let items = (0..10u64).map(|id| WorkItem::new(id, id));
        let result = Supervisor::new(Duration::from_millis(200))
            .run(pipeline, items)
            .await;

        assert!(result.as_ref().is_err_and(Error::is_timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        let stats = result.unwrap_err().stats().copied().unwrap();
        assert!(!stats.complete);
        assert!(stats.accepted >= 1);
    }
}
