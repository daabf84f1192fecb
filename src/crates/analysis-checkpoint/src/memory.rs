//! In-memory checkpoint store and task registry
//!
//! Reference implementations of [`CheckpointStore`] and [`TaskRegistry`] backed
//! by `Arc<RwLock<HashMap>>`. They are used by the test-suite and by embedders
//! that run the pipeline inside a single process.
//!
//! # Layout
//!
//! ```text
//! InMemoryCheckpointStore
//!   task_id: "task-1"
//!     ├─ (created_at t1, seq 0) Checkpoint "validate_input"
//!     ├─ (created_at t2, seq 3) Checkpoint "extract_text"
//!     └─ (created_at t3, seq 7) Checkpoint "assess_risk"   ◄── latest
//!
//! InMemoryTaskRegistry
//!   task_id -> TaskRegistryEntry
//! ```
//!
//! Checkpoints are ordered by `(created_at, insertion sequence)`, so two
//! checkpoints carrying the same timestamp still resolve deterministically to
//! the one written last.

use crate::{
    checkpoint::{Checkpoint, CheckpointId},
    error::{CheckpointError, Result},
    registry::{Creation, TaskRegistryEntry, TaskState, Transition},
    traits::{apply_transition, CheckpointStore, CheckpointStream, TaskRegistry},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

type CheckpointIndex = BTreeMap<(DateTime<Utc>, u64), Checkpoint>;

/// Thread-safe in-memory checkpoint storage
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: Arc<RwLock<HashMap<String, CheckpointIndex>>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks with at least one checkpoint
    pub async fn task_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of checkpoints across all tasks
    pub async fn checkpoint_count(&self) -> usize {
        self.storage.read().await.values().map(|index| index.len()).sum()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<CheckpointId> {
        if checkpoint.task_id.is_empty() {
            return Err(CheckpointError::Invalid("task_id is required".to_string()));
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = checkpoint.id.clone();
        let mut storage = self.storage.write().await;
        storage
            .entry(checkpoint.task_id.clone())
            .or_default()
            .insert((checkpoint.created_at, seq), checkpoint);

        Ok(id)
    }

    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(task_id)
            .and_then(|index| index.values().next_back())
            .cloned())
    }

    async fn list(&self, task_id: &str, limit: Option<usize>) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;
        let results: Vec<Result<Checkpoint>> = storage
            .get(task_id)
            .map(|index| {
                index
                    .values()
                    .rev()
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .map(Ok)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::pin(stream::iter(results)))
    }

    async fn delete_task(&self, task_id: &str) -> Result<usize> {
        let mut storage = self.storage.write().await;
        Ok(storage.remove(task_id).map(|index| index.len()).unwrap_or(0))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut storage = self.storage.write().await;
        let mut removed = 0;
        for index in storage.values_mut() {
            let before = index.len();
            index.retain(|(created_at, _), _| *created_at >= cutoff);
            removed += before - index.len();
        }
        storage.retain(|_, index| !index.is_empty());
        Ok(removed)
    }
}

/// Thread-safe in-memory task registry
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRegistry {
    entries: Arc<RwLock<HashMap<String, TaskRegistryEntry>>>,
}

impl InMemoryTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl TaskRegistry for InMemoryTaskRegistry {
    async fn create(&self, entry: TaskRegistryEntry) -> Result<TaskRegistryEntry> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.task_id) {
            return Err(CheckpointError::AlreadyExists(entry.task_id));
        }
        entries.insert(entry.task_id.clone(), entry.clone());
        Ok(entry)
    }

    async fn create_unless_live(&self, entry: TaskRegistryEntry) -> Result<Creation> {
        let mut entries = self.entries.write().await;
        let live = entries
            .values()
            .filter(|e| e.idempotency_key == entry.idempotency_key && e.state.is_live())
            .min_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(existing) = live {
            return Ok(Creation::Existing(existing.clone()));
        }
        if entries.contains_key(&entry.task_id) {
            return Err(CheckpointError::AlreadyExists(entry.task_id));
        }
        entries.insert(entry.task_id.clone(), entry.clone());
        Ok(Creation::Created(entry))
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRegistryEntry>> {
        Ok(self.entries.read().await.get(task_id).cloned())
    }

    async fn update(
        &self,
        task_id: &str,
        apply: &(dyn for<'a> Fn(&'a mut TaskRegistryEntry) + Send + Sync),
    ) -> Result<TaskRegistryEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(task_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("task {}", task_id)))?;
        apply(entry);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn transition(&self, task_id: &str, expected: &[TaskState], next: TaskState) -> Result<Transition> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(task_id)
            .ok_or_else(|| CheckpointError::NotFound(format!("task {}", task_id)))?;
        Ok(apply_transition(entry, expected, next))
    }

    async fn list(&self, states: &[TaskState]) -> Result<Vec<TaskRegistryEntry>> {
        let entries = self.entries.read().await;
        let mut matching: Vec<_> = entries
            .values()
            .filter(|e| states.is_empty() || states.contains(&e.state))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(matching)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Vec<TaskRegistryEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|e| e.idempotency_key == key)
            .cloned()
            .collect())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| {
            let terminal = matches!(e.state, TaskState::Completed | TaskState::Failed);
            !(terminal && e.updated_at < cutoff)
        });
        Ok(before - entries.len())
    }
}
