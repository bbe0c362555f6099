//! Pipeline construction, submission and shutdown.
//!
//! A pipeline is built from a chain of typed stages and started in one step:
//! [`PipelineBuilder::sink`] spawns every worker pool, the collector and the
//! optional monitor before it returns, so a [`Pipeline`] value always has
//! listeners on its entry queue.
//!
//! Queue `0` is the entry queue and queue `k + 1` is the output of stage `k`.
//! The pipeline owns the entry queue, each pool owns its output queue and
//! the merger (when sharding) owns the merged queue. Every queue is closed by
//! its owner only, after all of its writers have finished.
//!
//! Shutdown is level-triggered: one [`CancellationToken`] is raced against
//! every blocking point, and [`Pipeline::wait`] joins every spawned task
//! through a single [`TaskTracker`].

mod collector;
mod merge;
mod pool;

pub use merge::merge;

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{PipelineConfig, StageOptions};
use crate::core::{Envelope, ItemId, ResultSink, Stage, WorkItem};
use crate::diagnostics::{ErrorSink, ErrorStream};
use crate::error::{Error, Result};
use crate::queue::{
    bounded_probed, QueueProbe, QueueReceiver, QueueSender, SendError, TrySendError,
};
use crate::sinks::DiscardSink;
use crate::stats::{Monitor, RunStats, StatsCell};

use self::pool::PoolSpec;

/// How long tasks get to observe cancellation after a deadline expires.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Shared state of one running pipeline.
#[derive(Debug, Clone)]
pub(crate) struct RunContext {
    pub config: Arc<PipelineConfig>,
    pub cancel: CancellationToken,
    /// Fired when the collector drained the last queue; child of `cancel`
    pub finished: CancellationToken,
    pub tracker: TaskTracker,
    pub stats: Arc<StatsCell>,
    pub errors: ErrorSink,
    pub probe: Arc<QueueProbe>,
}

impl RunContext {
    fn new(config: PipelineConfig) -> (Self, ErrorStream) {
        let stats = StatsCell::new();
        let (errors, stream) = ErrorSink::new(config.error_capacity, stats.clone());
        let cancel = CancellationToken::new();
        let run = Self {
            config: Arc::new(config),
            finished: cancel.child_token(),
            cancel,
            tracker: TaskTracker::new(),
            stats,
            errors,
            probe: QueueProbe::new(),
        };
        (run, stream)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(error_capacity: usize) -> (Self, ErrorStream) {
        Self::new(PipelineConfig {
            error_capacity,
            ..Default::default()
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The submission gate in front of the entry queues.
///
/// Closing the gate drops the pipeline's senders; each entry queue then
/// closes when the last in-flight submission releases its clone, so no
/// submission can ever race a close.
struct Entry<I> {
    senders: Mutex<Option<Vec<QueueSender<Envelope<I>>>>>,
    seen: Mutex<HashSet<ItemId>>,
}

impl<I> Entry<I> {
    /// Pick the entry queue for `id` and reserve the id.
    fn claim(&self, id: ItemId) -> Result<Claim<'_, I>> {
        let sender = {
            let senders = lock(&self.senders);
            let senders = senders.as_ref().ok_or(Error::PipelineClosed)?;
            let shard = (id.0 % senders.len() as u64) as usize;
            senders[shard].clone()
        };
        if !lock(&self.seen).insert(id) {
            return Err(Error::DuplicateItem(id));
        }
        Ok(Claim {
            entry: self,
            id,
            sender,
            accepted: false,
        })
    }

    fn close(&self) -> bool {
        lock(&self.senders).take().is_some()
    }
}

/// A reserved item id on its way into an entry queue.
///
/// Dropping the claim before [`accept`](Claim::accept) gives the id back,
/// including when a pending submission future is dropped mid-send.
struct Claim<'a, I> {
    entry: &'a Entry<I>,
    id: ItemId,
    sender: QueueSender<Envelope<I>>,
    accepted: bool,
}

impl<I> Claim<'_, I> {
    fn accept(mut self) {
        self.accepted = true;
    }
}

impl<I> Drop for Claim<'_, I> {
    fn drop(&mut self) {
        if !self.accepted {
            lock(&self.entry.seen).remove(&self.id);
        }
    }
}

/// Cloneable handle for submitting items from several tasks.
pub struct Submitter<I> {
    entry: Arc<Entry<I>>,
    cancel: CancellationToken,
    stats: Arc<StatsCell>,
}

impl<I> Clone for Submitter<I> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            cancel: self.cancel.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<I: Send + 'static> Submitter<I> {
    /// Submit without waiting.
    ///
    /// Fails with [`Error::Backpressure`] when the entry queue is full.
    pub fn submit(&self, item: WorkItem<I>) -> Result<()> {
        let claim = self.claim(item.id())?;
        match claim.sender.try_send(Envelope::submitted(item)) {
            Ok(()) => {
                self.accept(claim);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(self.backpressure(&claim.sender)),
            Err(TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    /// Submit, waiting at most `wait` for space in the entry queue.
    ///
    /// A zero `wait` behaves like [`submit`](Self::submit).
    pub async fn submit_timeout(&self, item: WorkItem<I>, wait: Duration) -> Result<()> {
        if wait.is_zero() {
            return self.submit(item);
        }
        let claim = self.claim(item.id())?;
        let sent = claim
            .sender
            .send_timeout(Envelope::submitted(item), wait, &self.cancel)
            .await;
        self.settle(claim, sent)
    }

    /// Submit, waiting for space until the pipeline is cancelled.
    ///
    /// Dropping the returned future before it completes leaves the item
    /// unsubmitted and its id free for another attempt.
    pub async fn submit_wait(&self, item: WorkItem<I>) -> Result<()> {
        let claim = self.claim(item.id())?;
        let sent = claim
            .sender
            .send(Envelope::submitted(item), &self.cancel)
            .await;
        self.settle(claim, sent)
    }

    fn claim(&self, id: ItemId) -> Result<Claim<'_, I>> {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        self.entry.claim(id)
    }

    fn accept(&self, claim: Claim<'_, I>) {
        claim.accept();
        self.stats.record_accepted();
    }

    fn settle(&self, claim: Claim<'_, I>, sent: std::result::Result<(), SendError>) -> Result<()> {
        match sent {
            Ok(()) => {
                self.accept(claim);
                Ok(())
            }
            Err(SendError::Elapsed(_)) => Err(self.backpressure(&claim.sender)),
            Err(SendError::Cancelled) => Err(Error::Shutdown),
            Err(SendError::Closed | SendError::Disconnected) => Err(self.closed()),
        }
    }

    fn backpressure(&self, sender: &QueueSender<Envelope<I>>) -> Error {
        #[cfg(feature = "metrics")]
        crate::metrics::submit_backpressure();
        Error::Backpressure {
            capacity: sender.capacity(),
        }
    }

    /// Entry receivers only disappear once the run is torn down.
    fn closed(&self) -> Error {
        if self.cancel.is_cancelled() {
            Error::Shutdown
        } else {
            Error::PipelineClosed
        }
    }
}

type Chain<I, O> = Arc<
    dyn Fn(&RunContext, Option<usize>, QueueReceiver<Envelope<I>>) -> QueueReceiver<Envelope<O>>
        + Send
        + Sync,
>;

/// Builder for a typed chain of stages.
///
/// `I` is the type submitted to the pipeline and `O` the output type of the
/// last stage added so far.
///
/// ```rust
/// use fanweld::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> fanweld::Result<()> {
/// let sink = CollectSink::new();
/// let pipeline = PipelineBuilder::new()
///     .workers(2)
///     .stage("parse", MapStage::new(|s: String| {
///         s.trim().parse::<i64>().map_err(|e| StageError::rejected(e.to_string()))
///     }))
///     .stage("square", MapStage::new(|n: i64| Ok(n * n)))
///     .sink(sink.clone())?;
///
/// pipeline.submit(WorkItem::new(1u64, " 12 ".to_string()))?;
/// let stats = pipeline.wait(None).await?;
///
/// assert_eq!(stats.processed, 1);
/// assert_eq!(sink.into_items().await[0].value(), Some(&144));
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder<I, O> {
    name: Arc<str>,
    config: PipelineConfig,
    stages: Vec<(Arc<str>, StageOptions)>,
    chain: Chain<I, O>,
}

impl<I: Send + 'static> PipelineBuilder<I, I> {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            name: Arc::from("pipeline"),
            config,
            stages: Vec::new(),
            chain: Arc::new(
                |_: &RunContext, _: Option<usize>, input: QueueReceiver<Envelope<I>>| input,
            ),
        }
    }
}

impl<I: Send + 'static> Default for PipelineBuilder<I, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> PipelineBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Name used in log lines
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a stage using the pipeline-wide settings.
    pub fn stage<S>(self, name: impl Into<Arc<str>>, stage: S) -> PipelineBuilder<I, S::Output>
    where
        S: Stage<Input = O>,
    {
        self.stage_with(name, stage, StageOptions::default())
    }

    /// Append a stage with its own pool size, output capacity or timeout.
    pub fn stage_with<S>(
        self,
        name: impl Into<Arc<str>>,
        stage: S,
        options: StageOptions,
    ) -> PipelineBuilder<I, S::Output>
    where
        S: Stage<Input = O>,
    {
        let name: Arc<str> = name.into();
        let index = self.stages.len();
        let stage = Arc::new(stage);
        let upstream = self.chain;
        let stage_name = name.clone();

        let chain: Chain<I, S::Output> = Arc::new(
            move |run: &RunContext, shard: Option<usize>, input: QueueReceiver<Envelope<I>>| {
                let input = upstream(run, shard, input);
                let capacity = options
                    .capacity
                    .unwrap_or_else(|| run.config.capacity_for(index + 1));
                let (tx, rx) = bounded_probed(capacity, run.probe.clone());
                let spec = PoolSpec {
                    name: stage_name.clone(),
                    stage: stage.clone(),
                    workers: options
                        .workers
                        .unwrap_or_else(|| run.config.workers_for(index)),
                    per_item_timeout: options.per_item_timeout.or(run.config.per_item_timeout),
                    shard,
                };
                pool::spawn(spec, input, tx, run);
                rx
            },
        );

        let mut stages = self.stages;
        stages.push((name, options));
        PipelineBuilder {
            name: self.name,
            config: self.config,
            stages,
            chain,
        }
    }

    /// Pool size for every stage without an explicit override
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers_per_stage = vec![workers];
        self
    }

    /// Capacity for every queue without an explicit override
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = vec![capacity];
        self
    }

    pub fn per_item_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_item_timeout = Some(timeout);
        self
    }

    pub fn global_timeout(mut self, timeout: Duration) -> Self {
        self.config.global_timeout = Some(timeout);
        self
    }

    pub fn error_capacity(mut self, capacity: usize) -> Self {
        self.config.error_capacity = capacity;
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.config.monitor_interval = Some(interval);
        self
    }

    /// Run `shards` parallel copies of the stage chain
    pub fn shards(mut self, shards: usize) -> Self {
        self.config.shards = shards;
        self
    }

    /// Start the pipeline, discarding results.
    pub fn start(self) -> Result<Pipeline<I>> {
        self.sink(DiscardSink::new())
    }

    /// Start the pipeline, delivering every result to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn sink<K>(self, sink: K) -> Result<Pipeline<I>>
    where
        K: ResultSink<O>,
    {
        self.config.validate(self.stages.len())?;
        for (name, options) in &self.stages {
            options.validate(name)?;
        }

        let (run, errors) = RunContext::new(self.config);
        let config = run.config.clone();

        let mut senders = Vec::with_capacity(config.shards);
        let mut tails = Vec::with_capacity(config.shards);
        for shard in 0..config.shards {
            let (tx, rx) = bounded_probed(config.capacity_for(0), run.probe.clone());
            let label = (config.shards > 1).then_some(shard);
            tails.push((self.chain)(&run, label, rx));
            senders.push(tx);
        }

        let results = match <[_; 1]>::try_from(tails) {
            Ok([tail]) => tail,
            Err(tails) => merge::merge_probed(
                tails,
                config.capacity_for(self.stages.len()),
                run.probe.clone(),
                &run.cancel,
                &run.tracker,
            ),
        };

        run.tracker.spawn(collector::collect(results, sink, run.clone()));

        if let Some(period) = config.monitor_interval {
            let monitor = Monitor::new(self.name.clone(), run.stats.clone(), period);
            run.tracker.spawn(monitor.run(run.finished.clone()));
        }

        let stage_names: Vec<&str> = self.stages.iter().map(|(name, _)| &**name).collect();
        tracing::info!(
            pipeline = %self.name,
            stages = ?stage_names,
            shards = config.shards,
            "pipeline started"
        );

        Ok(Pipeline {
            name: self.name,
            entry: Arc::new(Entry {
                senders: Mutex::new(Some(senders)),
                seen: Mutex::new(HashSet::new()),
            }),
            run,
            errors: Some(errors),
        })
    }
}

impl<I, O> fmt::Debug for PipelineBuilder<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// A running pipeline accepting items of type `I`.
///
/// Obtained from [`PipelineBuilder::sink`] or [`PipelineBuilder::start`];
/// consumed by [`wait`](Self::wait).
pub struct Pipeline<I> {
    name: Arc<str>,
    entry: Arc<Entry<I>>,
    run: RunContext,
    errors: Option<ErrorStream>,
}

impl<I: Send + 'static> Pipeline<I> {
    /// Submit without waiting.
    ///
    /// # Errors
    /// - [`Error::Backpressure`] if the entry queue is full
    /// - [`Error::PipelineClosed`] after [`close_input`](Self::close_input)
    /// - [`Error::DuplicateItem`] if the id was already accepted
    /// - [`Error::Shutdown`] if the pipeline was cancelled
    pub fn submit(&self, item: WorkItem<I>) -> Result<()> {
        self.submitter().submit(item)
    }

    /// Submit, waiting at most `wait` for space.
    pub async fn submit_timeout(&self, item: WorkItem<I>, wait: Duration) -> Result<()> {
        self.submitter().submit_timeout(item, wait).await
    }

    /// Submit, waiting for space until the pipeline is cancelled.
    pub async fn submit_wait(&self, item: WorkItem<I>) -> Result<()> {
        self.submitter().submit_wait(item).await
    }

    /// A handle for submitting from other tasks.
    pub fn submitter(&self) -> Submitter<I> {
        Submitter {
            entry: self.entry.clone(),
            cancel: self.run.cancel.clone(),
            stats: self.run.stats.clone(),
        }
    }

    /// Stop accepting items. Returns `true` on the call that closed input.
    pub fn close_input(&self) -> bool {
        let closed = self.entry.close();
        if closed {
            tracing::debug!(pipeline = %self.name, "input closed");
        }
        closed
    }

    /// Current statistics; safe to call at any time.
    pub fn stats(&self) -> RunStats {
        self.run.stats.snapshot()
    }

    /// Take the stream of error records. Returns `None` after the first call.
    pub fn errors(&mut self) -> Option<ErrorStream> {
        self.errors.take()
    }

    /// Cancel the run. In-flight items are abandoned.
    pub fn cancel(&self) {
        self.run.cancel.cancel();
    }

    /// The token every task of this run races against.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.run.cancel.clone()
    }

    /// The tracker holding every task of this run.
    pub fn task_tracker(&self) -> TaskTracker {
        self.run.tracker.clone()
    }

    pub fn queue_probe(&self) -> Arc<QueueProbe> {
        self.run.probe.clone()
    }

    /// The configuration the pipeline runs with.
    pub fn config(&self) -> &PipelineConfig {
        &self.run.config
    }

    /// Close input and wait for the run to finish.
    ///
    /// The wait ends at the earlier of `timeout` (from now) and the global
    /// deadline (from start). If that passes first, the run is cancelled,
    /// tasks get [`SHUTDOWN_GRACE`] to exit and [`Error::Timeout`] is
    /// returned with the statistics gathered so far.
    ///
    /// # Errors
    /// - [`Error::Timeout`] when a deadline expired
    /// - [`Error::PartialFailure`] when every item finished but some failed
    /// - [`Error::Cancelled`] when the run was cancelled before it finished
    pub async fn wait(self, timeout: Option<Duration>) -> Result<RunStats> {
        self.close_input();
        self.run.tracker.close();

        let started = self.run.stats.started_at();
        let global = self.run.config.global_timeout.map(|limit| started + limit);
        let local = timeout.map(|limit| Instant::now() + limit);
        let deadline = match (global, local) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let finished = match deadline {
            Some(deadline) => tokio::time::timeout_at(
                tokio::time::Instant::from_std(deadline),
                self.run.tracker.wait(),
            )
            .await
            .is_ok(),
            None => {
                self.run.tracker.wait().await;
                true
            }
        };

        if !finished {
            return Err(self.abort(started).await);
        }

        let stats = self.run.stats.snapshot();
        tracing::info!(pipeline = %self.name, %stats, "pipeline finished");
        if !stats.complete {
            Err(Error::Cancelled { stats })
        } else if stats.failed > 0 {
            Err(Error::PartialFailure { stats })
        } else {
            Ok(stats)
        }
    }

    async fn abort(&self, started: Instant) -> Error {
        let elapsed = started.elapsed();
        tracing::warn!(
            pipeline = %self.name,
            elapsed_ms = elapsed.as_millis() as u64,
            "deadline expired, cancelling run"
        );
        self.run.cancel.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, self.run.tracker.wait())
            .await
            .is_err()
        {
            tracing::error!(
                pipeline = %self.name,
                remaining = self.run.tracker.len(),
                "tasks still running after shutdown grace period"
            );
        }

        self.run.stats.finish(false);
        Error::Timeout {
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            stats: self.run.stats.snapshot(),
        }
    }
}

impl<I> fmt::Debug for Pipeline<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stats", &self.run.stats.snapshot())
            .field("cancelled", &self.run.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::MapStage;

    fn identity() -> PipelineBuilder<u64, u64> {
        PipelineBuilder::new().stage("id", MapStage::new(|n: u64| Ok(n)))
    }

    #[tokio::test]
    async fn test_start_requires_a_stage() {
        let result = PipelineBuilder::<u64, u64>::new().start();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stage_count_mismatch_is_rejected() {
        let config = PipelineConfig {
            stage_count: Some(2),
            ..Default::default()
        };
        let result = PipelineBuilder::with_config(config)
            .stage("id", MapStage::new(|n: u64| Ok(n)))
            .start();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected() {
        let pipeline = identity().start().unwrap();
        pipeline.submit(WorkItem::new(1u64, 1)).unwrap();
        assert!(matches!(
            pipeline.submit(WorkItem::new(1u64, 2)),
            Err(Error::DuplicateItem(ItemId(1)))
        ));
        let stats = pipeline.wait(None).await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn test_dropped_claim_frees_the_id() {
        let pipeline = identity().start().unwrap();
        let submitter = pipeline.submitter();

        let claim = submitter.claim(ItemId(5)).unwrap();
        assert!(matches!(
            submitter.claim(ItemId(5)),
            Err(Error::DuplicateItem(ItemId(5)))
        ));
        drop(claim);

        pipeline.submit(WorkItem::new(5u64, 5)).unwrap();
        assert!(matches!(
            pipeline.submit(WorkItem::new(5u64, 5)),
            Err(Error::DuplicateItem(ItemId(5)))
        ));
        let stats = pipeline.wait(None).await.unwrap();
        assert_eq!(stats.accepted, 1);
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let pipeline = identity().start().unwrap();
        assert!(pipeline.close_input());
        assert!(!pipeline.close_input());
        assert!(matches!(
            pipeline.submit(WorkItem::new(1u64, 1)),
            Err(Error::PipelineClosed)
        ));
        let stats = pipeline.wait(None).await.unwrap();
        assert_eq!(stats.processed, 0);
        assert!(stats.complete);
    }

    #[tokio::test]
    async fn test_errors_stream_taken_once() {
        let mut pipeline = identity().start().unwrap();
        assert!(pipeline.errors().is_some());
        assert!(pipeline.errors().is_none());
        pipeline.wait(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_partial_stats() {
        let pipeline = identity().start().unwrap();
        pipeline.submit(WorkItem::new(1u64, 1)).unwrap();
        pipeline.cancel();
        assert!(matches!(
            pipeline.submit(WorkItem::new(2u64, 2)),
            Err(Error::Shutdown)
        ));
        let tracker = pipeline.task_tracker();
        let err = pipeline.wait(None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        let stats = err.stats().copied().unwrap();
        assert_eq!(stats.accepted, 1);
        assert!(!stats.complete);
        assert!(tracker.is_empty());
    }
}
