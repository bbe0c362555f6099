//! # Bounded, cancellable worker pipelines
//!
//! This crate runs items through a chain of stages, each backed by a pool of
//! concurrent workers, and fans the results back in to a single collector.
//! Every queue is bounded, every blocking point observes one cancellation
//! token, and every spawned task is joined before a run reports its result.
//!
//! ## Core Concepts
//!
//! - **Stage**: per-item async transformation shared by the workers of a pool
//! - **Worker pool**: N workers draining a stage's input queue (fan-out)
//! - **Merger**: fan-in of several queues into one
//! - **Pipeline**: typed chain of stages with an entry queue and a collector
//! - **Supervisor**: runs a pipeline under a single time budget
//!
//! Failed items are not dropped: each accepted item produces exactly one
//! [`ItemResult`](core::ItemResult), carrying either the value or the failure.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use fanweld::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let results = CountSink::new();
//!     let pipeline = PipelineBuilder::new()
//!         .workers(4)
//!         .queue_capacity(16)
//!         .per_item_timeout(Duration::from_secs(1))
//!         .stage("validate", MapStage::new(|n: i64| {
//!             if n < 0 {
//!                 Err(StageError::rejected("negative"))
//!             } else {
//!                 Ok(n)
//!             }
//!         }))
//!         .stage("square", MapStage::new(|n: i64| Ok(n * n)))
//!         .sink(results.clone())?;
//!
//!     for id in 0..100u64 {
//!         pipeline.submit_wait(WorkItem::new(id, id as i64)).await?;
//!     }
//!
//!     let stats = pipeline.wait(Some(Duration::from_secs(5))).await?;
//!     assert_eq!(stats.processed, 100);
//!     assert_eq!(results.succeeded(), 100);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod sinks;
pub mod stages;
pub mod stats;
pub mod supervisor;
pub mod util;

// Re-export commonly used items
pub mod prelude {
    pub use crate::config::{PipelineConfig, StageOptions};
    pub use crate::core::{
        FailureKind, ItemContext, ItemFailure, ItemId, ItemResult, ResultSink, Stage, WorkItem,
        WorkerId,
    };
    pub use crate::diagnostics::{ErrorKind, ErrorRecord, ErrorStream};
    pub use crate::error::{Error, Result, StageError, StageResult};
    pub use crate::pipeline::{Pipeline, PipelineBuilder, Submitter};
    pub use crate::sinks::{sink_from_fn, CollectSink, CountSink, DiscardSink};
    pub use crate::stages::{stage_fn, MapStage, RetryStage};
    pub use crate::stats::RunStats;
    pub use crate::supervisor::Supervisor;
    pub use crate::util::RetryPolicy;
}

// Re-export main error type
pub use error::{Error, Result};

// Feature flags for optional dependencies
#[cfg(feature = "metrics")]
pub mod metrics;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
