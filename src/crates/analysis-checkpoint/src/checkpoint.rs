//! Checkpoint data structures for resuming interrupted analyses
//!
//! A [`Checkpoint`] is an immutable, named recovery point written by the step
//! executor while an analysis runs. It carries:
//!
//! - **Identity** - a [`CheckpointId`] plus the owning `task_id`
//! - **Position** - the `checkpoint_name` (a step tag or sub-step marker) and
//!   the `progress_percent` reached when it was written
//! - **Recoverable data** - per-step JSON snapshots sufficient to rebuild the
//!   step results of the analysis state on resume
//! - **Database state** - a [`DatabaseState`] descriptor listing which
//!   persisted side-effects have already been committed, so a resumed run
//!   does not write them twice
//!
//! Checkpoints are never updated in place. A later checkpoint for the same task
//! supersedes earlier ones, and stores always return the newest by
//! `created_at` when asked for the latest.
//!
//! # Example
//!
//! ```rust
//! use analysis_checkpoint::Checkpoint;
//! use serde_json::json;
//!
//! let checkpoint = Checkpoint::new("task-42", "extract_text", 35)
//!     .with_data("extract_text", json!({"text": "Vendor: ..."}))
//!     .with_committed_write("analysis_states/task-42");
//!
//! assert_eq!(checkpoint.progress_percent, 35);
//! assert!(checkpoint.database_state.is_committed("analysis_states/task-42"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptor of persisted side-effects that already committed
///
/// Keys are free-form but conventionally `collection/id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseState {
    pub committed: BTreeSet<String>,
}

impl DatabaseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: impl Into<String>) {
        self.committed.insert(key.into());
    }

    pub fn is_committed(&self, key: &str) -> bool {
        self.committed.contains(key)
    }
}

/// A persisted, resumable snapshot of a task's partial progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,

    /// Task the checkpoint belongs to
    pub task_id: String,

    /// Step tag or sub-step marker this checkpoint was taken at
    pub checkpoint_name: String,

    /// Progress reached when the checkpoint was written (0-100)
    pub progress_percent: u8,

    pub created_at: DateTime<Utc>,

    /// Step tag -> serialized step output
    #[serde(default)]
    pub recoverable_data: BTreeMap<String, Value>,

    #[serde(default)]
    pub database_state: DatabaseState,
}

impl Checkpoint {
    /// Create a checkpoint stamped with the current time
    pub fn new(task_id: impl Into<String>, checkpoint_name: impl Into<String>, progress_percent: u8) -> Self {
        Self {
            id: CheckpointId::generate(),
            task_id: task_id.into(),
            checkpoint_name: checkpoint_name.into(),
            progress_percent: progress_percent.min(100),
            created_at: Utc::now(),
            recoverable_data: BTreeMap::new(),
            database_state: DatabaseState::new(),
        }
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach the serialized output of one step
    pub fn with_data(mut self, step: impl Into<String>, data: Value) -> Self {
        self.recoverable_data.insert(step.into(), data);
        self
    }

    /// Replace all recoverable data at once
    pub fn with_recoverable_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.recoverable_data = data;
        self
    }

    pub fn with_committed_write(mut self, key: impl Into<String>) -> Self {
        self.database_state.record(key);
        self
    }

    pub fn with_database_state(mut self, state: DatabaseState) -> Self {
        self.database_state = state;
        self
    }

    /// Whether the checkpoint carries a snapshot for `step`
    pub fn has_data_for(&self, step: &str) -> bool {
        self.recoverable_data
            .get(step)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_builder() {
        let checkpoint = Checkpoint::new("task-1", "assess_risk", 85)
            .with_data("extract_text", json!({"text": "abc"}))
            .with_committed_write("analysis_states/task-1");

        assert_eq!(checkpoint.task_id, "task-1");
        assert_eq!(checkpoint.checkpoint_name, "assess_risk");
        assert!(checkpoint.has_data_for("extract_text"));
        assert!(!checkpoint.has_data_for("assess_risk"));
        assert!(checkpoint.database_state.is_committed("analysis_states/task-1"));
    }

    #[test]
    fn test_progress_is_clamped() {
        let checkpoint = Checkpoint::new("task-1", "compile_report", 140);
        assert_eq!(checkpoint.progress_percent, 100);
    }

    #[test]
    fn test_null_snapshot_is_not_data() {
        let checkpoint = Checkpoint::new("task-1", "extract_text", 35).with_data("extract_text", Value::Null);
        assert!(!checkpoint.has_data_for("extract_text"));
    }

    #[test]
    fn test_checkpoint_json_shape() {
        let checkpoint = Checkpoint::new("task-1", "extract_text", 35);
        let value = serde_json::to_value(&checkpoint).unwrap();

        assert_eq!(value["task_id"], "task-1");
        assert!(value["id"].is_string());
        assert!(value["database_state"]["committed"].is_array());
    }
}
