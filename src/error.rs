//! Error types for pipeline submission, completion and stage logic.

use std::sync::Arc;

use thiserror::Error;

use crate::core::ItemId;
use crate::stats::RunStats;

/// The main error type for the pipeline engine.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The entry queue is full and the caller gave no (or not enough) wait budget
    #[error("entry queue is full (capacity {capacity})")]
    Backpressure { capacity: usize },

    /// Input was closed; the pipeline accepts no more items
    #[error("pipeline is no longer accepting items")]
    PipelineClosed,

    /// An item with the same id was already accepted in this run
    #[error("item {0} was already submitted")]
    DuplicateItem(ItemId),

    /// The pipeline was cancelled; the submission was not accepted
    #[error("pipeline was shut down")]
    Shutdown,

    /// The run was cancelled before every item came back
    #[error(
        "run was cancelled ({} of {} items finished)",
        .stats.processed,
        .stats.accepted
    )]
    Cancelled { stats: RunStats },

    /// The run deadline expired; `stats` holds whatever had accumulated
    #[error(
        "run timed out after {duration_ms}ms ({} of {} items finished)",
        .stats.processed,
        .stats.accepted
    )]
    Timeout { duration_ms: u64, stats: RunStats },

    /// Every item finished but some of them failed
    #[error("{} of {} items failed", .stats.failed, .stats.processed)]
    PartialFailure { stats: RunStats },

    /// The pipeline configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A result sink failed to accept a result
    #[error("sink error: {0}")]
    Sink(Arc<dyn std::error::Error + Send + Sync>),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a sink error from any error type
    pub fn sink<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Sink(Arc::new(error))
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Statistics attached to completion errors.
    ///
    /// `Timeout`, `Cancelled` and `PartialFailure` carry the run statistics
    /// so callers can report partial progress without matching on the variant.
    pub fn stats(&self) -> Option<&RunStats> {
        match self {
            Error::Timeout { stats, .. }
            | Error::Cancelled { stats }
            | Error::PartialFailure { stats } => Some(stats),
            _ => None,
        }
    }

    /// Whether this error was produced by the run deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Failure returned by [`Stage::process`](crate::core::Stage::process).
///
/// Both variants turn into a failed [`ItemResult`](crate::core::ItemResult);
/// the pipeline keeps running either way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The input is invalid for this stage (empty order, negative value, ...)
    #[error("rejected: {0}")]
    Rejected(String),

    /// A non-recoverable condition; also reported to the error sink
    #[error("fault: {0}")]
    Fault(String),
}

impl StageError {
    /// Reject the current item
    pub fn rejected<S: Into<String>>(message: S) -> Self {
        StageError::Rejected(message.into())
    }

    /// Report a fault for the current item
    pub fn fault<S: Into<String>>(message: S) -> Self {
        StageError::Fault(message.into())
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, StageError::Fault(_))
    }
}

/// Convenience alias for stage outcomes
pub type StageResult<T> = std::result::Result<T, StageError>;
