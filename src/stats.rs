//! Run statistics and the periodic progress monitor.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Snapshot of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RunStats {
    /// Items accepted at the entry queue
    pub accepted: u64,
    /// Results that reached the collector, failed ones included
    pub processed: u64,
    /// Results that reached the collector as failures
    pub failed: u64,
    /// Items that exceeded the per-item timeout in some stage
    pub stuck: u64,
    /// Error records dropped because the error sink was full
    pub errors_dropped: u64,
    /// Time since start, frozen once the run finishes
    pub elapsed: Duration,
    /// Whether every accepted item reached the collector
    pub complete: bool,
}

impl RunStats {
    pub fn succeeded(&self) -> u64 {
        self.processed.saturating_sub(self.failed)
    }

    pub fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.elapsed.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Items accepted but not (yet) seen by the collector
    pub fn in_flight(&self) -> u64 {
        self.accepted.saturating_sub(self.processed)
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Items: {} accepted, {} processed ({} ok, {} failed) | Stuck: {} | \
             Dropped errors: {} | Elapsed: {:.3}s{}",
            self.accepted,
            self.processed,
            self.succeeded(),
            self.failed,
            self.stuck,
            self.errors_dropped,
            self.elapsed.as_secs_f64(),
            if self.complete { "" } else { " (incomplete)" },
        )
    }
}

#[derive(Debug)]
struct Counts {
    accepted: u64,
    processed: u64,
    failed: u64,
    stuck: u64,
    errors_dropped: u64,
    started_at: Instant,
    finished_at: Option<Instant>,
    complete: bool,
}

/// The shared counters of one run.
///
/// Every update and every snapshot takes the same lock for a few field
/// accesses, so a snapshot never mixes values from different moments.
#[derive(Debug)]
pub(crate) struct StatsCell {
    counts: Mutex<Counts>,
}

impl StatsCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(Counts {
                accepted: 0,
                processed: 0,
                failed: 0,
                stuck: 0,
                errors_dropped: 0,
                started_at: Instant::now(),
                finished_at: None,
                complete: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn started_at(&self) -> Instant {
        self.lock().started_at
    }

    pub fn record_accepted(&self) {
        self.lock().accepted += 1;
        #[cfg(feature = "metrics")]
        crate::metrics::item_accepted();
    }

    pub fn record_result(&self, succeeded: bool) {
        {
            let mut counts = self.lock();
            counts.processed += 1;
            if !succeeded {
                counts.failed += 1;
            }
        }
        #[cfg(feature = "metrics")]
        crate::metrics::item_processed(succeeded);
    }

    pub fn record_stuck(&self) {
        self.lock().stuck += 1;
        #[cfg(feature = "metrics")]
        crate::metrics::item_stuck();
    }

    pub fn record_error_dropped(&self) {
        self.lock().errors_dropped += 1;
        #[cfg(feature = "metrics")]
        crate::metrics::error_record_dropped();
    }

    /// Freeze the elapsed time. Only the first call has an effect.
    pub fn finish(&self, complete: bool) {
        let mut counts = self.lock();
        if counts.finished_at.is_none() {
            counts.finished_at = Some(Instant::now());
            counts.complete = complete;
        }
    }

    pub fn snapshot(&self) -> RunStats {
        let counts = self.lock();
        let end = counts.finished_at.unwrap_or_else(Instant::now);
        RunStats {
            accepted: counts.accepted,
            processed: counts.processed,
            failed: counts.failed,
            stuck: counts.stuck,
            errors_dropped: counts.errors_dropped,
            elapsed: end.saturating_duration_since(counts.started_at),
            complete: counts.complete,
        }
    }
}

/// Periodic progress reporter.
///
/// Runs on its own low-frequency ticker and only reads the shared counters,
/// so it never slows down the workers.
pub(crate) struct Monitor {
    name: Arc<str>,
    stats: Arc<StatsCell>,
    period: Duration,
}

impl Monitor {
    pub fn new(name: Arc<str>, stats: Arc<StatsCell>, period: Duration) -> Self {
        Self {
            name,
            stats,
            period,
        }
    }

    /// Report until `stop` fires.
    pub async fn run(self, stop: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.stats.snapshot();
                    tracing::info!(
                        pipeline = %self.name,
                        in_flight = snapshot.in_flight(),
                        "{}",
                        snapshot
                    );
                }
            }
        }

        tracing::debug!(pipeline = %self.name, "monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = StatsCell::new();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_result(true);
        stats.record_result(false);
        stats.record_stuck();
        stats.record_error_dropped();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.succeeded(), 1);
        assert_eq!(snapshot.stuck, 1);
        assert_eq!(snapshot.errors_dropped, 1);
        assert!(!snapshot.complete);
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let stats = StatsCell::new();
        stats.finish(true);
        let first = stats.snapshot();
        std::thread::sleep(Duration::from_millis(5));
        stats.finish(false);
        let second = stats.snapshot();

        assert!(first.complete);
        assert_eq!(first.elapsed, second.elapsed);
        assert!(second.complete);
    }

    #[test]
    fn test_display() {
        let snapshot = RunStats {
            accepted: 10,
            processed: 10,
            failed: 1,
            stuck: 0,
            errors_dropped: 0,
            elapsed: Duration::from_millis(1500),
            complete: true,
        };
        let display = snapshot.to_string();
        assert!(display.contains("10 processed (9 ok, 1 failed)"));
        assert!(!display.contains("incomplete"));
    }

    #[tokio::test]
    async fn test_monitor_stops_on_signal() {
        let stats = StatsCell::new();
        let stop = CancellationToken::new();
        let monitor = Monitor::new(Arc::from("test"), stats, Duration::from_millis(5));
        let handle = tokio::spawn(monitor.run(stop.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
