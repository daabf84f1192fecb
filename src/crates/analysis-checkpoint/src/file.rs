//! File-backed checkpoint store and task registry
//!
//! Directory layout under the configured root:
//!
//! ```text
//! <root>/
//!   registry/
//!     <task_id>.json
//!   checkpoints/
//!     <task_id>/
//!       <created_at_micros>-<seq>-<checkpoint_id>.json
//! ```
//!
//! Checkpoint file names sort by creation time, which gives the
//! `(task_id, created_at)` index for free. Registry records are replaced by
//! writing a temporary file and renaming it over the old one. Read-modify-write
//! cycles are serialized by a process-wide lock; the backend is meant for a
//! single orchestrator process, not for several processes sharing a directory.

use crate::{
    checkpoint::{Checkpoint, CheckpointId},
    error::{CheckpointError, Result},
    registry::{Creation, TaskRegistryEntry, TaskState, Transition},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::{apply_transition, validate_task_id, CheckpointStore, CheckpointStream, TaskRegistry},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn sorted_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Checkpoint store writing one file per checkpoint
#[derive(Debug, Clone)]
pub struct FileCheckpointStore<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
    sequence: Arc<AtomicU64>,
}

impl FileCheckpointStore<JsonSerializer> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, JsonSerializer)
    }
}

impl<S: SerializerProtocol> FileCheckpointStore<S> {
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Self {
        Self {
            root: root.into().join("checkpoints"),
            serializer,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        validate_task_id(task_id)?;
        Ok(self.root.join(task_id))
    }

    async fn read_task(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.task_dir(task_id)?;
        let mut checkpoints = Vec::new();
        for path in sorted_files(&dir, self.serializer.extension()).await? {
            let bytes = fs::read(&path).await?;
            checkpoints.push(self.serializer.loads(&bytes)?);
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointStore for FileCheckpointStore<S> {
    async fn put(&self, checkpoint: Checkpoint) -> Result<CheckpointId> {
        let dir = self.task_dir(&checkpoint.task_id)?;
        fs::create_dir_all(&dir).await?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let file_name = format!(
            "{:020}-{:010}-{}.{}",
            checkpoint.created_at.timestamp_micros().max(0),
            seq,
            checkpoint.id,
            self.serializer.extension()
        );
        let bytes = self.serializer.dumps(&checkpoint)?;
        write_atomic(&dir.join(file_name), &bytes).await?;

        tracing::debug!(task_id = %checkpoint.task_id, checkpoint = %checkpoint.checkpoint_name, "checkpoint written");
        Ok(checkpoint.id)
    }

    async fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.read_task(task_id).await?.pop())
    }

    async fn list(&self, task_id: &str, limit: Option<usize>) -> Result<CheckpointStream> {
        let results: Vec<Result<Checkpoint>> = self
            .read_task(task_id)
            .await?
            .into_iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(results)))
    }

    async fn delete_task(&self, task_id: &str) -> Result<usize> {
        let dir = self.task_dir(task_id)?;
        let count = sorted_files(&dir, self.serializer.extension()).await?.len();
        if count > 0 {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(count)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        let mut tasks = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(task_dir) = tasks.next_entry().await? {
            for path in sorted_files(&task_dir.path(), self.serializer.extension()).await? {
                let checkpoint: Checkpoint = self.serializer.loads(&fs::read(&path).await?)?;
                if checkpoint.created_at < cutoff {
                    fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Task registry writing one file per task
#[derive(Debug, Clone)]
pub struct FileTaskRegistry<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
    lock: Arc<Mutex<()>>,
}

impl FileTaskRegistry<JsonSerializer> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, JsonSerializer)
    }
}

impl<S: SerializerProtocol> FileTaskRegistry<S> {
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Self {
        Self {
            root: root.into().join("registry"),
            serializer,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn entry_path(&self, task_id: &str) -> Result<PathBuf> {
        validate_task_id(task_id)?;
        Ok(self.root.join(format!("{}.{}", task_id, self.serializer.extension())))
    }

    async fn read_entry(&self, task_id: &str) -> Result<Option<TaskRegistryEntry>> {
        let path = self.entry_path(task_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(self.serializer.loads(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entry(&self, entry: &TaskRegistryEntry) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let bytes = self.serializer.dumps(entry)?;
        write_atomic(&self.entry_path(&entry.task_id)?, &bytes).await
    }

    async fn read_all(&self) -> Result<Vec<TaskRegistryEntry>> {
        let mut entries = Vec::new();
        for path in sorted_files(&self.root, self.serializer.extension()).await? {
            entries.push(self.serializer.loads::<TaskRegistryEntry>(&fs::read(&path).await?)?);
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(entries)
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> TaskRegistry for FileTaskRegistry<S> {
    async fn create(&self, entry: TaskRegistryEntry) -> Result<TaskRegistryEntry> {
        let _guard = self.lock.lock().await;
        if self.read_entry(&entry.task_id).await?.is_some() {
            return Err(CheckpointError::AlreadyExists(entry.task_id));
        }
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    async fn create_unless_live(&self, entry: TaskRegistryEntry) -> Result<Creation> {
        let _guard = self.lock.lock().await;
        let live = self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| e.idempotency_key == entry.idempotency_key && e.state.is_live())
            .min_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(existing) = live {
            return Ok(Creation::Existing(existing));
        }
        if self.read_entry(&entry.task_id).await?.is_some() {
            return Err(CheckpointError::AlreadyExists(entry.task_id));
        }
        self.write_entry(&entry).await?;
        Ok(Creation::Created(entry))
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRegistryEntry>> {
        self.read_entry(task_id).await
    }

    async fn update(
        &self,
        task_id: &str,
        apply: &(dyn for<'a> Fn(&'a mut TaskRegistryEntry) + Send + Sync),
    ) -> Result<TaskRegistryEntry> {
        let _guard = self.lock.lock().await;
        let mut entry = self
            .read_entry(task_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(format!("task {}", task_id)))?;
        apply(&mut entry);
        entry.updated_at = Utc::now();
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    async fn transition(&self, task_id: &str, expected: &[TaskState], next: TaskState) -> Result<Transition> {
        let _guard = self.lock.lock().await;
        let mut entry = self
            .read_entry(task_id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(format!("task {}", task_id)))?;
        let outcome = apply_transition(&mut entry, expected, next);
        if outcome.is_applied() {
            self.write_entry(&entry).await?;
        }
        Ok(outcome)
    }

    async fn list(&self, states: &[TaskState]) -> Result<Vec<TaskRegistryEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| states.is_empty() || states.contains(&e.state))
            .collect())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Vec<TaskRegistryEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| e.idempotency_key == key)
            .collect())
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut removed = 0;
        for entry in self.read_all().await? {
            let terminal = matches!(entry.state, TaskState::Completed | TaskState::Failed);
            if terminal && entry.updated_at < cutoff {
                fs::remove_file(self.entry_path(&entry.task_id)?).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::PrettyJsonSerializer;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_checkpoint_latest_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let t1 = Utc::now();

        {
            let store = FileCheckpointStore::new(dir.path());
            store
                .put(Checkpoint::new("task-1", "extract_text", 35).with_created_at(t1))
                .await
                .unwrap();
            store
                .put(Checkpoint::new("task-1", "assess_risk", 85).with_created_at(t1 + Duration::seconds(1)))
                .await
                .unwrap();
        }

        let reopened = FileCheckpointStore::new(dir.path());
        let latest = reopened.latest("task-1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_name, "assess_risk");
        assert!(reopened.latest("task-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_checkpoint_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let err = store.put(Checkpoint::new("../escape", "a", 1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_file_checkpoint_delete_and_purge() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::with_serializer(dir.path(), PrettyJsonSerializer);
        let now = Utc::now();
        store
            .put(Checkpoint::new("task-1", "a", 5).with_created_at(now - Duration::days(10)))
            .await
            .unwrap();
        store.put(Checkpoint::new("task-1", "b", 35).with_created_at(now)).await.unwrap();
        store.put(Checkpoint::new("task-2", "a", 5).with_created_at(now)).await.unwrap();

        assert_eq!(store.purge_before(now - Duration::days(1)).await.unwrap(), 1);
        assert_eq!(store.delete_task("task-2").await.unwrap(), 1);
        assert_eq!(store.latest("task-1").await.unwrap().unwrap().checkpoint_name, "b");
    }

    #[tokio::test]
    async fn test_file_registry_roundtrip_and_cas() {
        let dir = TempDir::new().unwrap();
        let registry = FileTaskRegistry::new(dir.path());
        registry
            .create(TaskRegistryEntry::new("task-1", "key", "doc://1", "alice"))
            .await
            .unwrap();

        let applied = registry
            .transition("task-1", &[TaskState::Queued], TaskState::Processing)
            .await
            .unwrap();
        assert!(applied.is_applied());

        let rejected = registry
            .transition("task-1", &[TaskState::Queued], TaskState::Processing)
            .await
            .unwrap();
        assert_eq!(rejected, Transition::Rejected { current: TaskState::Processing });

        let reopened = FileTaskRegistry::new(dir.path());
        let entry = reopened.require("task-1").await.unwrap();
        assert_eq!(entry.state, TaskState::Processing);
        assert_eq!(reopened.find_by_idempotency_key("key").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_registry_update_persists_closure_changes() {
        let dir = TempDir::new().unwrap();
        let registry = FileTaskRegistry::new(dir.path());
        registry
            .create(TaskRegistryEntry::new("task-1", "key", "doc://1", "alice"))
            .await
            .unwrap();

        let priority = 7;
        registry
            .update("task-1", &|entry| entry.recovery_priority = priority)
            .await
            .unwrap();

        let reopened = FileTaskRegistry::new(dir.path());
        assert_eq!(reopened.require("task-1").await.unwrap().recovery_priority, 7);
    }

    #[tokio::test]
    async fn test_file_registry_concurrent_creates_yield_one_task() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(FileTaskRegistry::new(dir.path()));
        let barrier = Arc::new(tokio::sync::Barrier::new(6));

        let mut handles = Vec::new();
        for i in 0..6 {
            let registry = registry.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let entry = TaskRegistryEntry::new(format!("task-{}", i), "same", "doc://1", "alice");
                match registry.create_unless_live(entry).await.unwrap() {
                    Creation::Created(e) | Creation::Existing(e) => e.task_id,
                }
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.find_by_idempotency_key("same").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_registry_update_missing_task() {
        let dir = TempDir::new().unwrap();
        let registry = FileTaskRegistry::new(dir.path());
        let result = registry.heartbeat("missing", "extract_text", 35).await;
        assert!(matches!(result, Err(CheckpointError::NotFound(_))));
    }
}
