//! Worker pools: N concurrent workers draining one queue into the next.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;

use crate::core::{Envelope, FailureKind, ItemContext, ItemFailure, ItemId, Stage, WorkerId};
use crate::diagnostics::{ErrorKind, ErrorRecord};
use crate::error::StageError;
use crate::pipeline::RunContext;
use crate::queue::{QueueReceiver, QueueSender};

/// Everything needed to start one pool.
pub(crate) struct PoolSpec<S> {
    pub name: Arc<str>,
    pub stage: Arc<S>,
    pub workers: usize,
    pub per_item_timeout: Option<Duration>,
    pub shard: Option<usize>,
}

/// Start the workers of a stage.
///
/// The pool owns `output`: once every worker has exited, a closer task closes
/// it exactly once. Every task is also registered on the run tracker.
pub(crate) fn spawn<S: Stage>(
    spec: PoolSpec<S>,
    input: QueueReceiver<Envelope<S::Input>>,
    output: QueueSender<Envelope<S::Output>>,
    run: &RunContext,
) {
    let pool = TaskTracker::new();

    for index in 0..spec.workers.max(1) {
        let worker = Worker {
            id: WorkerId::new(spec.name.clone(), spec.shard, index),
            stage: spec.stage.clone(),
            per_item_timeout: spec.per_item_timeout,
            input: input.clone(),
            output: output.clone(),
            run: run.clone(),
        };
        run.tracker.spawn(pool.track_future(worker.run()));
    }
    pool.close();

    let name = spec.name;
    let shard = spec.shard;
    run.tracker.spawn(async move {
        pool.wait().await;
        output.close();
        tracing::debug!(stage = %name, ?shard, "stage drained, output queue closed");
    });
}

struct Worker<S: Stage> {
    id: WorkerId,
    stage: Arc<S>,
    per_item_timeout: Option<Duration>,
    input: QueueReceiver<Envelope<S::Input>>,
    output: QueueSender<Envelope<S::Output>>,
    run: RunContext,
}

impl<S: Stage> Worker<S> {
    async fn run(self) {
        tracing::debug!(worker = %self.id, "worker started");
        let cancel = self.run.cancel.clone();
        let mut handled = 0u64;

        while let Some(envelope) = self.input.recv_or_cancel(&cancel).await {
            let Some(next) = self.handle(envelope).await else {
                break;
            };
            if let Err(e) = self.output.send(next, &cancel).await {
                tracing::debug!(worker = %self.id, error = %e, "downstream send failed");
                break;
            }
            handled += 1;
        }

        tracing::debug!(worker = %self.id, handled, "worker stopped");
    }

    /// Run one envelope through the stage. `None` means the run was cancelled
    /// while the item was in flight.
    async fn handle(&self, envelope: Envelope<S::Input>) -> Option<Envelope<S::Output>> {
        let Envelope {
            item_id,
            priority,
            outcome,
            ..
        } = envelope;

        // Upstream failures pass through untouched.
        let input = match outcome {
            Ok(input) => input,
            Err(failure) => {
                return Some(Envelope::failed(item_id, priority, self.id.clone(), failure));
            }
        };

        let ctx = ItemContext::new(item_id, priority, self.id.clone(), self.run.cancel.clone());
        let outcome = tokio::select! {
            biased;
            _ = self.run.cancel.cancelled() => return None,
            outcome = within(self.per_item_timeout, self.stage.process(input, &ctx)) => outcome,
        };

        let failure = match outcome {
            Some(Ok(value)) => {
                return Some(Envelope {
                    item_id,
                    priority,
                    produced_by: self.id.clone(),
                    outcome: Ok(value),
                });
            }
            Some(Err(StageError::Rejected(detail))) => {
                tracing::debug!(worker = %self.id, %item_id, %detail, "item rejected");
                self.failure(FailureKind::Rejected, detail)
            }
            Some(Err(StageError::Fault(detail))) => {
                tracing::warn!(worker = %self.id, %item_id, %detail, "stage fault");
                self.report(item_id, ErrorKind::Fault, &detail);
                self.failure(FailureKind::Fault, detail)
            }
            None => {
                let detail = format!(
                    "no result within {:?}",
                    self.per_item_timeout.unwrap_or_default()
                );
                tracing::warn!(worker = %self.id, %item_id, %detail, "item stuck, worker moving on");
                self.run.stats.record_stuck();
                self.report(item_id, ErrorKind::Stuck, &detail);
                self.failure(FailureKind::Stuck, detail)
            }
        };

        Some(Envelope::failed(item_id, priority, self.id.clone(), failure))
    }

    fn failure(&self, kind: FailureKind, detail: String) -> ItemFailure {
        ItemFailure::new(self.id.stage_name(), kind, detail)
    }

    fn report(&self, item_id: ItemId, kind: ErrorKind, detail: &str) {
        self.run.errors.report(ErrorRecord {
            item_id,
            stage: self.id.stage_name(),
            kind,
            detail: detail.to_string(),
        });
    }
}

/// Await `fut`, giving up after `budget` if one is set. `None` means the
/// budget ran out.
async fn within<F: Future>(budget: Option<Duration>, fut: F) -> Option<F::Output> {
    match budget {
        Some(budget) => tokio::time::timeout(budget, fut).await.ok(),
        None => Some(fut.await),
    }
}
