//! # analysis-checkpoint - Recovery State for the Contract-Analysis Pipeline
//!
//! **Trait-based persistence for checkpoints and task lifecycle records.** The
//! orchestrator in `analysis-workflow` writes both while an analysis runs and
//! reads them back when an interrupted or failed analysis has to be resumed.
//!
//! ## Core Concepts
//!
//! ### 1. Checkpoint Store
//!
//! A [`Checkpoint`] is an immutable recovery point: the step it was taken at,
//! the progress reached, per-step recoverable data and a [`DatabaseState`]
//! describing which persisted side-effects already committed. The
//! [`CheckpointStore`] trait provides:
//!
//! - **`put()`** - append a checkpoint (earlier ones are superseded, not removed)
//! - **`latest()`** - newest checkpoint of a task by `created_at`
//! - **`list()`** - checkpoint history, newest first
//! - **`purge_before()`** - retention
//!
//! ### 2. Task Registry
//!
//! A [`TaskRegistryEntry`] tracks the lifecycle state of one analysis
//! ([`TaskState`]), its heartbeat, retry budget, recovery priority and
//! idempotency key. The [`TaskRegistry`] trait exposes atomic updates and a
//! compare-and-set [`TaskRegistry::transition`] so that two recovery trigger
//! paths can never both claim the same task.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use analysis_checkpoint::{
//!     Checkpoint, CheckpointStore, InMemoryCheckpointStore, InMemoryTaskRegistry,
//!     TaskRegistry, TaskRegistryEntry, TaskState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = InMemoryTaskRegistry::new();
//!     let checkpoints = InMemoryCheckpointStore::new();
//!
//!     registry
//!         .create(TaskRegistryEntry::new("task-1", "idem-key", "doc://contract.pdf", "alice"))
//!         .await?;
//!     registry
//!         .transition("task-1", &[TaskState::Queued], TaskState::Processing)
//!         .await?;
//!
//!     checkpoints
//!         .put(Checkpoint::new("task-1", "extract_text", 35))
//!         .await?;
//!
//!     let latest = checkpoints.latest("task-1").await?;
//!     println!("resume point: {:?}", latest.map(|c| c.checkpoint_name));
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! - [`InMemoryCheckpointStore`] / [`InMemoryTaskRegistry`] - tests, embedding
//! - [`FileCheckpointStore`] / [`FileTaskRegistry`] - single-process deployments
//!   and the command line tool; records are encoded through a
//!   [`SerializerProtocol`]
//!
//! Other backends (PostgreSQL, Redis, ...) implement the two traits; see
//! [`traits`] for an outline.

pub mod checkpoint;
pub mod error;
pub mod file;
pub mod memory;
pub mod registry;
pub mod serializer;
pub mod traits;

// Re-export main types
pub use checkpoint::{Checkpoint, CheckpointId, DatabaseState};
pub use error::{CheckpointError, Result};
pub use file::{FileCheckpointStore, FileTaskRegistry};
pub use memory::{InMemoryCheckpointStore, InMemoryTaskRegistry};
pub use registry::{Creation, ErrorSummary, TaskRegistryEntry, TaskState, Transition};
pub use serializer::{JsonSerializer, PrettyJsonSerializer, SerializerProtocol};
pub use traits::{CheckpointStore, CheckpointStream, TaskRegistry};
