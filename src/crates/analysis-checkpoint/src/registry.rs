//! Task registry records
//!
//! Every long-running analysis has exactly one [`TaskRegistryEntry`]. The entry
//! is created when a task is accepted and then moved through its lifecycle by
//! two writers only: the step executor (heartbeats, progress, terminal states)
//! and the recovery coordinator (recovery transitions).
//!
//! ```text
//!  queued ──► processing ──► completed
//!     │          │  ▲  │
//!     │          │  │  └──► checkpoint / partial ──┐
//!     │          ▼  │                              │
//!     │       failed│◄─────────────────────────────┤
//!     │          │  │                              │
//!     └──────────┴─►recovering ◄── orphaned ◄──────┘
//! ```
//!
//! `completed` and `failed` (once retries are exhausted) end the active
//! lifecycle; the record itself is kept until a retention purge removes it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an analysis task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, waiting for dispatch
    Queued,
    /// A worker is executing steps
    Processing,
    /// Execution paused after writing a checkpoint
    Checkpoint,
    /// Cancelled or interrupted mid-run with partial results
    Partial,
    /// Finished successfully
    Completed,
    /// Failed; may still be recovered while retries remain
    Failed,
    /// Owner stopped heartbeating
    Orphaned,
    /// Claimed by the recovery coordinator
    Recovering,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Queued,
        TaskState::Processing,
        TaskState::Checkpoint,
        TaskState::Partial,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Orphaned,
        TaskState::Recovering,
    ];

    /// States in which a worker is expected to be heartbeating
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Processing | TaskState::Recovering)
    }

    /// States in which a submission still owns its idempotency key
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TaskState::Queued | TaskState::Processing | TaskState::Checkpoint | TaskState::Recovering
        )
    }

    /// States left behind by an interrupted execution
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            TaskState::Processing | TaskState::Checkpoint | TaskState::Partial | TaskState::Orphaned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Processing => "processing",
            TaskState::Checkpoint => "checkpoint",
            TaskState::Partial => "partial",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Orphaned => "orphaned",
            TaskState::Recovering => "recovering",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent error recorded against a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: String,
    pub message: String,
    pub recoverable: bool,
}

/// Registry record tracking one analysis task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRegistryEntry {
    pub task_id: String,
    pub state: TaskState,
    pub idempotency_key: String,
    pub document_ref: String,
    pub requester: String,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub progress_percent: u8,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub auto_recovery_enabled: bool,
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
    /// Higher values are recovered first
    #[serde(default)]
    pub recovery_priority: i32,
    #[serde(default)]
    pub last_error: Option<ErrorSummary>,
}

impl TaskRegistryEntry {
    /// Create a queued entry with auto recovery enabled and three retries
    pub fn new(
        task_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        document_ref: impl Into<String>,
        requester: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            state: TaskState::Queued,
            idempotency_key: idempotency_key.into(),
            document_ref: document_ref.into(),
            requester: requester.into(),
            current_step: None,
            progress_percent: 0,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
            auto_recovery_enabled: true,
            max_retries: 3,
            retry_count: 0,
            recovery_priority: 0,
            last_error: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery_enabled = enabled;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.recovery_priority = priority;
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = at;
        self
    }

    /// Time elapsed since the last heartbeat
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_heartbeat)
    }

    pub fn is_heartbeat_fresh(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        self.heartbeat_age(now) < staleness
    }

    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Whether the coordinator may still pick this task up on its own
    pub fn eligible_for_auto_recovery(&self) -> bool {
        self.auto_recovery_enabled
            && self.retry_count < self.max_retries
            && self.state != TaskState::Completed
    }

    /// Stamp a heartbeat with step and progress
    pub fn touch(&mut self, step: Option<&str>, progress_percent: u8) {
        let now = Utc::now();
        if let Some(step) = step {
            self.current_step = Some(step.to_string());
        }
        self.progress_percent = progress_percent;
        self.last_heartbeat = now;
        self.updated_at = now;
    }
}

/// Result of a compare-and-set transition
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The entry was in an expected state and now holds the new one
    Applied(TaskRegistryEntry),
    /// The entry was in some other state; nothing changed
    Rejected { current: TaskState },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Result of [`TaskRegistry::create_unless_live`](crate::TaskRegistry::create_unless_live)
#[derive(Debug, Clone, PartialEq)]
pub enum Creation {
    Created(TaskRegistryEntry),
    /// A live entry with the same idempotency key already existed; nothing was written
    Existing(TaskRegistryEntry),
}
