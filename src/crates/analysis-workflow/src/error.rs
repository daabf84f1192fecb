//! Error taxonomy for the analysis pipeline
//!
//! Every failure that can happen while building or running the workflow is a
//! [`PipelineError`]. Each variant maps to exactly one [`ErrorKind`], and the
//! kind alone decides how the failure is handled:
//!
//! ```text
//! ErrorKind
//! ├── MissingArtifact        fatal for the step, CleanRestart candidate
//! ├── InsufficientContent    recoverable through a fallback extraction strategy
//! ├── TransientStore         retried locally with backoff, then recoverable
//! ├── TransientProvider      retried locally with backoff, then recoverable
//! ├── CrossContextResource   fatal for the attempt, recoverable for the task
//! ├── Timeout                hard step timeout, recoverable
//! ├── StepRetriesExhausted   step kept asking to be re-run, recoverable
//! ├── Checkpoint             checkpoint/registry backend failure
//! ├── Configuration          graph-build time only, fatal
//! ├── Validation             malformed input, fatal
//! ├── RetryBudgetExhausted   Abort strategy chosen, terminal
//! ├── Cancelled              cancelled by the requester
//! ├── Serialization          snapshot encoding failure, fatal
//! └── Internal               worker crashed or panicked
//! ```
//!
//! The retry policy table in [`crate::retry`] is keyed by [`ErrorKind`], so
//! backoff parameters are defined once per kind instead of per call site.

use analysis_checkpoint::{CheckpointError, ErrorSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Classification of a [`PipelineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingArtifact,
    InsufficientContent,
    TransientStore,
    TransientProvider,
    CrossContextResource,
    Timeout,
    StepRetriesExhausted,
    Checkpoint,
    Configuration,
    Validation,
    RetryBudgetExhausted,
    Cancelled,
    Serialization,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingArtifact => "missing_artifact",
            ErrorKind::InsufficientContent => "insufficient_content",
            ErrorKind::TransientStore => "transient_store",
            ErrorKind::TransientProvider => "transient_provider",
            ErrorKind::CrossContextResource => "cross_context_resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::StepRetriesExhausted => "step_retries_exhausted",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::RetryBudgetExhausted => "retry_budget_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parse the snake_case name produced by [`ErrorKind::as_str`]
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }

    /// Whether the task may be re-entered after a failure of this kind
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::MissingArtifact
                | ErrorKind::InsufficientContent
                | ErrorKind::TransientStore
                | ErrorKind::TransientProvider
                | ErrorKind::CrossContextResource
                | ErrorKind::Timeout
                | ErrorKind::StepRetriesExhausted
                | ErrorKind::Checkpoint
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider's failure inside a fallback chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub message: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.message)
    }
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised while building or running the analysis workflow
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A prerequisite step result is absent or too small
    #[error("Step '{step}' is missing required artifact '{artifact}': {reason}")]
    MissingArtifact {
        step: String,
        artifact: String,
        reason: String,
    },

    /// Extraction produced too little usable text
    #[error("Extraction with strategy '{strategy}' produced {chars} characters, minimum is {minimum}")]
    InsufficientContent {
        chars: usize,
        minimum: usize,
        strategy: String,
    },

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// Every provider of a fallback chain failed
    #[error("All generation providers failed: {}", join_failures(.failures))]
    ProvidersExhausted { failures: Vec<ProviderFailure> },

    /// A resource bound to one isolation context was used from another
    #[error("Resource '{resource}' belongs to context {owner} but was used from {current}")]
    CrossContextResource {
        resource: String,
        owner: String,
        current: String,
    },

    #[error("Step '{step}' exceeded its hard timeout after {elapsed_ms}ms")]
    Timeout { step: String, elapsed_ms: u64 },

    #[error("Step '{step}' requested a re-run {attempts} times: {reason}")]
    StepRetriesExhausted {
        step: String,
        attempts: u32,
        reason: String,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Task '{task_id}' exhausted its retry budget ({retry_count}/{max_retries})")]
    RetryBudgetExhausted {
        task_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Task '{task_id}' was cancelled")]
    Cancelled { task_id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Error reported by an isolated worker process, kind preserved
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MissingArtifact { .. } => ErrorKind::MissingArtifact,
            PipelineError::InsufficientContent { .. } => ErrorKind::InsufficientContent,
            PipelineError::TransientStore(_) => ErrorKind::TransientStore,
            PipelineError::TransientProvider(_) | PipelineError::ProvidersExhausted { .. } => {
                ErrorKind::TransientProvider
            }
            PipelineError::CrossContextResource { .. } => ErrorKind::CrossContextResource,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::StepRetriesExhausted { .. } => ErrorKind::StepRetriesExhausted,
            PipelineError::Checkpoint(_) => ErrorKind::Checkpoint,
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::RetryBudgetExhausted { .. } => ErrorKind::RetryBudgetExhausted,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
            PipelineError::Serialization(_) => ErrorKind::Serialization,
            PipelineError::Internal(_) => ErrorKind::Internal,
            PipelineError::Remote { kind, .. } => *kind,
        }
    }

    /// Whether the task may be re-entered after this failure
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Only backend hiccups are worth another attempt
            PipelineError::Checkpoint(e) => e.is_transient(),
            other => other.kind().is_recoverable(),
        }
    }

    /// Structured record for `AnalysisState::errors`
    pub fn to_record(&self, step: Option<&str>) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            step: step.map(str::to_string),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
            at: Utc::now(),
        }
    }

    /// Rebuild an error from a record produced by another process
    pub fn from_record(record: &ErrorRecord) -> Self {
        PipelineError::Remote {
            kind: record.kind,
            message: record.message.clone(),
        }
    }

    /// Registry-friendly summary
    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind().as_str().to_string(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
        }
    }
}

/// Structured error or warning recorded in the analysis state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    #[serde(default)]
    pub step: Option<String>,
    pub message: String,
    pub recoverable: bool,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Warning record (always recoverable)
    pub fn warning(kind: ErrorKind, step: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: Some(step.to_string()),
            message: message.into(),
            recoverable: true,
            at: Utc::now(),
        }
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind.as_str().to_string(),
            message: self.message.clone(),
            recoverable: self.recoverable,
        }
    }
}
