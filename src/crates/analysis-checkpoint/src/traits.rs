//! Storage traits for checkpoints and the task registry
//!
//! These two traits are the only state shared between concurrently running
//! analyses. Every mutation is keyed by `task_id` and is either an append
//! (checkpoints) or an atomic read-modify-write (registry), so two recovery
//! trigger paths racing on the same task cannot lose each other's updates.
//!
//! Backends shipped with this crate:
//!
//! - [`InMemoryCheckpointStore`](crate::InMemoryCheckpointStore) /
//!   [`InMemoryTaskRegistry`](crate::InMemoryTaskRegistry) for tests and
//!   single-process use
//! - [`FileCheckpointStore`](crate::FileCheckpointStore) /
//!   [`FileTaskRegistry`](crate::FileTaskRegistry) for the command line tool,
//!   which needs state to survive between invocations
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! #[async_trait]
//! impl CheckpointStore for PostgresCheckpointStore {
//!     async fn put(&self, checkpoint: Checkpoint) -> Result<CheckpointId> {
//!         sqlx::query("INSERT INTO checkpoints (id, task_id, created_at, body) VALUES ($1, $2, $3, $4)")
//!             .bind(checkpoint.id.as_str())
//!             .bind(&checkpoint.task_id)
//!             .bind(checkpoint.created_at)
//!             .bind(serde_json::to_value(&checkpoint)?)
//!             .execute(&self.pool)
//!             .await?;
//!         Ok(checkpoint.id)
//!     }
//!
//!     async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
//!         // SELECT body FROM checkpoints WHERE task_id = $1 ORDER BY created_at DESC LIMIT 1
//!     }
//!     // ...
//! }
//! ```

use crate::checkpoint::{Checkpoint, CheckpointId};
use crate::error::{CheckpointError, Result};
use crate::registry::{Creation, TaskRegistryEntry, TaskState, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

/// Stream of checkpoints returned by [`CheckpointStore::list`]
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<Checkpoint>> + Send>>;

/// Persistence backend for checkpoints, indexed by `(task_id, created_at)`
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint; earlier checkpoints of the task are superseded, not removed
    async fn put(&self, checkpoint: Checkpoint) -> Result<CheckpointId>;

    /// Newest checkpoint of a task by `created_at`
    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>>;

    /// Checkpoints of a task, newest first
    async fn list(&self, task_id: &str, limit: Option<usize>) -> Result<CheckpointStream>;

    /// Remove every checkpoint of a task
    async fn delete_task(&self, task_id: &str) -> Result<usize>;

    /// Remove checkpoints created before `cutoff`
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Persistence backend for task lifecycle records
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Insert a new entry; fails with [`CheckpointError::AlreadyExists`] on duplicates
    async fn create(&self, entry: TaskRegistryEntry) -> Result<TaskRegistryEntry>;

    /// Insert `entry` unless a live entry shares its idempotency key
    ///
    /// The check and the insert happen under one lock, so concurrent
    /// submissions of the same document yield exactly one `Created`.
    async fn create_unless_live(&self, entry: TaskRegistryEntry) -> Result<Creation>;

    async fn get(&self, task_id: &str) -> Result<Option<TaskRegistryEntry>>;

    /// Atomically apply `apply` to the stored entry and return the result
    async fn update(
        &self,
        task_id: &str,
        apply: &(dyn for<'a> Fn(&'a mut TaskRegistryEntry) + Send + Sync),
    ) -> Result<TaskRegistryEntry>;

    /// Compare-and-set: move to `next` only if the current state is in `expected`
    async fn transition(&self, task_id: &str, expected: &[TaskState], next: TaskState) -> Result<Transition>;

    /// Entries whose state is one of `states` (all entries when empty)
    async fn list(&self, states: &[TaskState]) -> Result<Vec<TaskRegistryEntry>>;

    /// Entries sharing an idempotency key
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Vec<TaskRegistryEntry>>;

    /// Delete completed/failed entries last updated before `cutoff`
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Record liveness, the active step and progress
    async fn heartbeat(&self, task_id: &str, step: &str, progress_percent: u8) -> Result<TaskRegistryEntry> {
        self.update(task_id, &|entry: &mut TaskRegistryEntry| {
            entry.touch(Some(step), progress_percent);
        })
        .await
    }

    /// Fetch an entry or fail with [`CheckpointError::NotFound`]
    async fn require(&self, task_id: &str) -> Result<TaskRegistryEntry> {
        self.get(task_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(format!("task {}", task_id)))
    }
}

/// Reject task ids that cannot be used as a storage key
pub(crate) fn validate_task_id(task_id: &str) -> Result<()> {
    let valid = !task_id.is_empty()
        && task_id.len() <= 128
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && task_id != "."
        && task_id != "..";

    if valid {
        Ok(())
    } else {
        Err(CheckpointError::Invalid(format!("task id {:?} is not a valid key", task_id)))
    }
}

/// Apply a compare-and-set transition to an entry in place
pub(crate) fn apply_transition(entry: &mut TaskRegistryEntry, expected: &[TaskState], next: TaskState) -> Transition {
    if !expected.contains(&entry.state) {
        return Transition::Rejected { current: entry.state };
    }
    let now = Utc::now();
    entry.state = next;
    entry.updated_at = now;
    if next.is_active() {
        entry.last_heartbeat = now;
    }
    Transition::Applied(entry.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_validation() {
        assert!(validate_task_id("task-1_a.b").is_ok());
        assert!(validate_task_id("").is_err());
        assert!(validate_task_id("../etc").is_err());
        assert!(validate_task_id("..").is_err());
        assert!(validate_task_id("a/b").is_err());
    }

    #[test]
    fn test_apply_transition() {
        let mut entry = TaskRegistryEntry::new("t", "k", "d", "r").with_state(TaskState::Failed);

        let rejected = apply_transition(&mut entry, &[TaskState::Processing], TaskState::Recovering);
        assert_eq!(rejected, Transition::Rejected { current: TaskState::Failed });

        let applied = apply_transition(&mut entry, &[TaskState::Failed], TaskState::Recovering);
        assert!(applied.is_applied());
        assert_eq!(entry.state, TaskState::Recovering);
    }
}
