//! Error records produced while a pipeline runs.
//!
//! Faults, stuck items and sink failures are reported on a bounded channel.
//! Reporting never waits. Records buffer up to the configured capacity
//! whether or not the stream has been taken; once the buffer is full, or the
//! taken stream was dropped, new records are discarded and counted in
//! [`RunStats::errors_dropped`](crate::stats::RunStats::errors_dropped).

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::core::ItemId;
use crate::stats::StatsCell;

/// What kind of problem an [`ErrorRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// A stage returned a fault
    Fault,
    /// An item exceeded the per-item timeout
    Stuck,
    /// The result sink refused a result
    Sink,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Fault => "fault",
            ErrorKind::Stuck => "stuck",
            ErrorKind::Sink => "sink",
        };
        f.write_str(name)
    }
}

/// A single reported problem.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ErrorRecord {
    pub item_id: ItemId,
    /// Stage name, or `"sink"` for result-sink failures
    pub stage: Arc<str>,
    pub kind: ErrorKind,
    pub detail: String,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] item {} in {}: {}",
            self.kind, self.item_id, self.stage, self.detail
        )
    }
}

/// Reporting half, cloned into every worker and the collector.
#[derive(Debug, Clone)]
pub(crate) struct ErrorSink {
    tx: mpsc::Sender<ErrorRecord>,
    stats: Arc<StatsCell>,
}

impl ErrorSink {
    pub fn new(capacity: usize, stats: Arc<StatsCell>) -> (Self, ErrorStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, ErrorStream { rx })
    }

    /// Record a problem without waiting; returns `false` if it was dropped.
    pub fn report(&self, record: ErrorRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(e) => {
                let record = match e {
                    mpsc::error::TrySendError::Full(record)
                    | mpsc::error::TrySendError::Closed(record) => record,
                };
                tracing::trace!(
                    item_id = %record.item_id,
                    kind = %record.kind,
                    "error record dropped"
                );
                self.stats.record_error_dropped();
                false
            }
        }
    }
}

/// Stream of [`ErrorRecord`]s, taken once through
/// [`Pipeline::errors`](crate::pipeline::Pipeline::errors).
///
/// The stream ends once the run is over and the pipeline handle is gone.
#[derive(Debug)]
pub struct ErrorStream {
    rx: mpsc::Receiver<ErrorRecord>,
}

impl ErrorStream {
    /// Receive the next record.
    pub async fn recv(&mut self) -> Option<ErrorRecord> {
        self.rx.recv().await
    }

    /// Take every record that is already buffered.
    pub fn drain(&mut self) -> Vec<ErrorRecord> {
        let mut records = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            records.push(record);
        }
        records
    }
}

impl Stream for ErrorStream {
    type Item = ErrorRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
