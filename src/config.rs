//! Pipeline configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Pool size used when no worker count is configured
pub const DEFAULT_WORKERS: usize = 1;

/// Queue capacity used when none is configured
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Error-record buffer used when none is configured
pub const DEFAULT_ERROR_CAPACITY: usize = 256;

/// Configuration for a pipeline run.
///
/// Queue `k` is the input of stage `k`: queue 0 is the entry queue and the
/// queue after the last stage feeds the collector. For both
/// `workers_per_stage` and `queue_capacity`, positions past the end of the
/// list repeat its last value; an empty list means the defaults.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    /// Expected number of stages; checked when the pipeline starts
    pub stage_count: Option<usize>,
    /// Pool size per stage
    pub workers_per_stage: Vec<usize>,
    /// Capacity per queue
    pub queue_capacity: Vec<usize>,
    /// Budget for processing a single item in a single stage
    pub per_item_timeout: Option<Duration>,
    /// Hard deadline for the whole run, measured from start
    pub global_timeout: Option<Duration>,
    /// Buffered error records before new ones are dropped
    pub error_capacity: usize,
    /// Period of the progress monitor; `None` disables it
    pub monitor_interval: Option<Duration>,
    /// Number of parallel copies of the stage chain
    pub shards: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_count: None,
            workers_per_stage: Vec::new(),
            queue_capacity: Vec::new(),
            per_item_timeout: None,
            global_timeout: None,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            monitor_interval: None,
            shards: 1,
        }
    }
}

impl PipelineConfig {
    /// Pool size for stage `index`
    pub fn workers_for(&self, index: usize) -> usize {
        lookup(&self.workers_per_stage, index).unwrap_or(DEFAULT_WORKERS)
    }

    /// Capacity of queue `index`
    pub fn capacity_for(&self, index: usize) -> usize {
        lookup(&self.queue_capacity, index).unwrap_or(DEFAULT_QUEUE_CAPACITY)
    }

    /// Check the configuration against the number of stages actually built.
    pub fn validate(&self, stages: usize) -> Result<()> {
        if stages == 0 {
            return Err(Error::config("a pipeline needs at least one stage"));
        }
        if let Some(expected) = self.stage_count {
            if expected != stages {
                return Err(Error::config(format!(
                    "stage_count is {} but {} stages were added",
                    expected, stages
                )));
            }
        }
        if !self.workers_per_stage.is_empty() && self.workers_per_stage.len() > stages {
            return Err(Error::config(format!(
                "workers_per_stage has {} entries for {} stages",
                self.workers_per_stage.len(),
                stages
            )));
        }
        if self.queue_capacity.len() > stages + 1 {
            return Err(Error::config(format!(
                "queue_capacity has {} entries for {} queues",
                self.queue_capacity.len(),
                stages + 1
            )));
        }
        if self.workers_per_stage.contains(&0) {
            return Err(Error::config("worker counts must be at least 1"));
        }
        if self.queue_capacity.contains(&0) {
            return Err(Error::config("queue capacities must be at least 1"));
        }
        if self.error_capacity == 0 {
            return Err(Error::config("error_capacity must be at least 1"));
        }
        if self.shards == 0 {
            return Err(Error::config("shards must be at least 1"));
        }
        if matches!(self.per_item_timeout, Some(d) if d.is_zero()) {
            return Err(Error::config("per_item_timeout must be non-zero"));
        }
        if matches!(self.monitor_interval, Some(d) if d.is_zero()) {
            return Err(Error::config("monitor_interval must be non-zero"));
        }
        Ok(())
    }
}

fn lookup(values: &[usize], index: usize) -> Option<usize> {
    values.get(index).or_else(|| values.last()).copied()
}

/// Per-stage overrides of the pipeline configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StageOptions {
    /// Pool size for this stage
    pub workers: Option<usize>,
    /// Capacity of this stage's output queue
    pub capacity: Option<usize>,
    /// Per-item budget for this stage
    pub per_item_timeout: Option<Duration>,
}

impl StageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn per_item_timeout(mut self, timeout: Duration) -> Self {
        self.per_item_timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self, stage: &str) -> Result<()> {
        if self.workers == Some(0) {
            return Err(Error::config(format!("stage {} has zero workers", stage)));
        }
        if self.capacity == Some(0) {
            return Err(Error::config(format!(
                "stage {} has a zero-capacity output queue",
                stage
            )));
        }
        if matches!(self.per_item_timeout, Some(d) if d.is_zero()) {
            return Err(Error::config(format!(
                "stage {} has a zero per-item timeout",
                stage
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = PipelineConfig::default();
        assert_eq!(config.workers_for(3), DEFAULT_WORKERS);
        assert_eq!(config.capacity_for(0), DEFAULT_QUEUE_CAPACITY);
        assert!(config.validate(1).is_ok());
    }

    #[test]
    fn test_trailing_entries_repeat_last_value() {
        let config = PipelineConfig {
            workers_per_stage: vec![2, 4],
            queue_capacity: vec![8, 2],
            ..Default::default()
        };
        assert_eq!(config.workers_for(0), 2);
        assert_eq!(config.workers_for(1), 4);
        assert_eq!(config.workers_for(2), 4);
        assert_eq!(config.capacity_for(3), 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let no_stages = PipelineConfig::default().validate(0);
        assert!(matches!(no_stages, Err(Error::Config(_))));

        let mismatch = PipelineConfig {
            stage_count: Some(3),
            ..Default::default()
        };
        assert!(mismatch.validate(2).is_err());
        assert!(mismatch.validate(3).is_ok());

        let zero_workers = PipelineConfig {
            workers_per_stage: vec![1, 0],
            ..Default::default()
        };
        assert!(zero_workers.validate(2).is_err());

        let zero_shards = PipelineConfig {
            shards: 0,
            ..Default::default()
        };
        assert!(zero_shards.validate(1).is_err());
    }

    #[test]
    fn test_stage_options_validation() {
        assert!(StageOptions::new().workers(0).validate("s").is_err());
        assert!(StageOptions::new().capacity(0).validate("s").is_err());
        assert!(StageOptions::new().workers(3).capacity(1).validate("s").is_ok());
    }
}
