//! Work items, results and worker identities.

use std::fmt;
use std::sync::Arc;

/// Identifier of a work item, unique within one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        ItemId(id)
    }
}

/// A unit of work submitted to a pipeline.
///
/// Items are immutable once created; stages receive the payload by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    id: ItemId,
    payload: T,
    priority: Option<i32>,
}

impl<T> WorkItem<T> {
    /// Create a new work item
    pub fn new(id: impl Into<ItemId>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
            priority: None,
        }
    }

    /// Attach an ordering hint. The engine carries it through to stages and
    /// results but does not schedule by it.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Identity of a single worker inside a stage's pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    stage: Arc<str>,
    shard: Option<usize>,
    index: usize,
}

impl WorkerId {
    pub(crate) fn new(stage: Arc<str>, shard: Option<usize>, index: usize) -> Self {
        Self {
            stage,
            shard,
            index,
        }
    }

    /// Placeholder identity for items that have not reached a worker yet.
    pub(crate) fn entry() -> Self {
        Self::new(Arc::from("entry"), None, 0)
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub(crate) fn stage_name(&self) -> Arc<str> {
        self.stage.clone()
    }

    pub fn shard(&self) -> Option<usize> {
        self.shard
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shard {
            Some(shard) => write!(f, "{}.{}-{}", self.stage, shard, self.index),
            None => write!(f, "{}-{}", self.stage, self.index),
        }
    }
}

/// Why an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureKind {
    /// The stage rejected the input
    Rejected,
    /// The stage hit a non-recoverable condition
    Fault,
    /// Processing exceeded the per-item timeout
    Stuck,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Rejected => "rejected",
            FailureKind::Fault => "fault",
            FailureKind::Stuck => "stuck",
        };
        f.write_str(name)
    }
}

/// Failure detail carried by an unsuccessful [`ItemResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub stage: Arc<str>,
    pub kind: FailureKind,
    pub detail: String,
}

impl ItemFailure {
    pub(crate) fn new(stage: Arc<str>, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in stage {}: {}", self.kind, self.stage, self.detail)
    }
}

/// The outcome of one work item after the last stage.
///
/// A failed item still produces exactly one result; the failure is carried in
/// the outcome rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult<T> {
    item_id: ItemId,
    priority: Option<i32>,
    produced_by: WorkerId,
    outcome: Result<T, ItemFailure>,
}

impl<T> ItemResult<T> {
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// The worker of the last stage that handled the item.
    pub fn produced_by(&self) -> &WorkerId {
        &self.produced_by
    }

    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// Present iff the item failed.
    pub fn error_detail(&self) -> Option<&ItemFailure> {
        self.outcome.as_ref().err()
    }

    pub fn into_outcome(self) -> Result<T, ItemFailure> {
        self.outcome
    }
}

/// What travels through the queues between stages.
#[derive(Debug)]
pub(crate) struct Envelope<T> {
    pub item_id: ItemId,
    pub priority: Option<i32>,
    pub produced_by: WorkerId,
    pub outcome: Result<T, ItemFailure>,
}

impl<T> Envelope<T> {
    pub fn submitted(item: WorkItem<T>) -> Self {
        Self {
            item_id: item.id,
            priority: item.priority,
            produced_by: WorkerId::entry(),
            outcome: Ok(item.payload),
        }
    }

    pub fn failed(
        item_id: ItemId,
        priority: Option<i32>,
        worker: WorkerId,
        failure: ItemFailure,
    ) -> Self {
        Self {
            item_id,
            priority,
            produced_by: worker,
            outcome: Err(failure),
        }
    }
}

impl<T> From<Envelope<T>> for ItemResult<T> {
    fn from(envelope: Envelope<T>) -> Self {
        Self {
            item_id: envelope.item_id,
            priority: envelope.priority,
            produced_by: envelope.produced_by,
            outcome: envelope.outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_display() {
        let plain = WorkerId::new(Arc::from("validate"), None, 2);
        let sharded = WorkerId::new(Arc::from("validate"), Some(1), 0);
        assert_eq!(plain.to_string(), "validate-2");
        assert_eq!(sharded.to_string(), "validate.1-0");
    }

    #[test]
    fn test_failed_result_carries_detail() {
        let envelope: Envelope<i32> = Envelope {
            item_id: ItemId(7),
            priority: Some(3),
            produced_by: WorkerId::new(Arc::from("ship"), None, 0),
            outcome: Err(ItemFailure::new(Arc::from("validate"), FailureKind::Rejected, "no items")),
        };
        let result = ItemResult::from(envelope);

        assert!(!result.succeeded());
        assert_eq!(result.value(), None);
        let failure = result.error_detail().unwrap();
        assert_eq!(failure.kind, FailureKind::Rejected);
        assert_eq!(&*failure.stage, "validate");
        assert_eq!(failure.to_string(), "rejected in stage validate: no items");
    }

    #[test]
    fn test_submitted_envelope_keeps_priority() {
        let item = WorkItem::new(4u64, "payload").with_priority(5);
        let envelope = Envelope::submitted(item);
        assert_eq!(envelope.item_id, ItemId(4));
        assert_eq!(envelope.priority, Some(5));
        assert_eq!(envelope.outcome, Ok("payload"));
    }
}
