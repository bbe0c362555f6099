//! Core traits and types for the fanweld library.
//!
//! This module contains the item model and the traits that define how
//! stages and result sinks plug into a pipeline.

pub mod item;
pub mod traits;

// Re-export core items
pub use item::{FailureKind, ItemFailure, ItemId, ItemResult, WorkItem, WorkerId};
pub use traits::{ItemContext, ResultSink, Stage};

pub(crate) use item::Envelope;
