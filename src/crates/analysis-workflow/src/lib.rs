//! # analysis-workflow - Recoverable Contract-Analysis Orchestration
//!
//! **A step graph over a shared analysis state, with checkpoints, recovery and
//! per-task isolation.** Each contract analysis walks
//! `validate_input → extract_text → (analyze_diagrams) → check_compliance →
//! assess_risk → generate_recommendations → compile_report`; when a run is
//! interrupted or fails, the recovery coordinator decides how to re-enter it.
//!
//! ## Core Concepts
//!
//! ### 1. Steps and the Step Executor
//!
//! A [`Step`] holds business logic only. The [`StepExecutor`] wrapping it
//! checks cancellation and prerequisite artifacts, enforces soft and hard
//! timeouts, retries transient errors through the [`RetryPolicyTable`],
//! records the typed [`StepOutput`], emits progress and writes checkpoints on
//! cadence.
//!
//! ### 2. Workflow Graph
//!
//! [`WorkflowGraph`] collects steps, direct edges, routed edges and restart
//! edges. [`WorkflowGraph::compile`] validates the whole graph up front
//! (missing routes, cycles, unreachable steps, non-monotone progress) and
//! yields a [`CompiledWorkflow`] with `run` and `run_from`.
//!
//! ### 3. Recovery
//!
//! The [`RecoveryCoordinator`] picks one of ValidateOnly, ResumeFromCheckpoint,
//! CleanRestart or Abort for a task, claiming it with a compare-and-set on the
//! task registry first. `scan()` finds stale and recoverable tasks.
//!
//! ### 4. Isolation
//!
//! [`IsolationBoundary`] runs each task in its own context: on the ambient
//! runtime, on a dedicated worker thread, or in a child process. Resources
//! pooled through [`IsolationContext::pool`] cannot leak between tasks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use analysis_workflow::{
//!     AnalysisEngine, DocumentInput, InMemoryDocumentStore, NullSink, PipelineConfig,
//!     PipelineDeps, ProgressNotifier, StartRequest, TemplateRenderer, WorkflowServices,
//! };
//! use analysis_checkpoint::{InMemoryCheckpointStore, InMemoryTaskRegistry};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     extraction: Arc<dyn analysis_workflow::ExtractionService>,
//! #     generator: Arc<dyn analysis_workflow::GenerationProvider>,
//! # ) -> analysis_workflow::Result<()> {
//! let config = PipelineConfig::default();
//! let store = Arc::new(InMemoryDocumentStore::new());
//! let services = WorkflowServices::new(
//!     Arc::new(InMemoryTaskRegistry::new()),
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     store.clone(),
//!     ProgressNotifier::spawn(Arc::new(NullSink), config.notifier.clone()),
//! );
//! let deps = PipelineDeps {
//!     extraction,
//!     generator,
//!     renderer: Arc::new(TemplateRenderer),
//!     store,
//! };
//!
//! let engine = AnalysisEngine::contract_analysis(deps, services, &config)?;
//! let accepted = engine
//!     .start(StartRequest::new(DocumentInput::new("doc://contract.pdf", "alice", "sha256:ab12")))
//!     .await?;
//! engine.wait(&accepted.task_id).await?;
//! println!("{:?}", engine.status(&accepted.task_id).await?.state);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`state`], [`error`] - analysis state, step outputs, error taxonomy
//! - [`step`], [`graph`] - executor and graph
//! - [`recovery`], [`isolation`], [`progress`] - coordinator, boundary, notifier
//! - [`collaborators`], [`store`] - interfaces to extraction, generation,
//!   persistence and notification transport
//! - [`pipeline`], [`engine`] - the contract analysis workflow and its trigger surface
//! - [`config`], [`retry`] - YAML configuration and the retry policy table

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod isolation;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod step;
pub mod store;

// Re-export main types
pub use collaborators::{
    require_min_content, ExtractionService, FallbackGenerator, GenerationProvider, NotificationSink, NullSink,
    PromptRenderer, TemplateRenderer,
};
pub use config::{
    CheckpointSettings, ExtractionSettings, GenerationSettings, IsolationSettings, PipelineConfig,
    RecoverySettings, StepLimits, StepSettings,
};
pub use engine::{AnalysisEngine, RetryResponse, StartAccepted, StartRequest, StatusSummary};
pub use error::{ErrorKind, ErrorRecord, PipelineError, ProviderFailure, Result};
pub use graph::{CompiledWorkflow, Router, RunFailure, RunResult, StartPoint, WorkflowGraph};
pub use isolation::{
    CancelToken, ContextId, IsolationBoundary, IsolationContext, IsolationTier, ProcessWorker, ScopedPool,
    WorkerRequest, WorkerResponse,
};
pub use pipeline::{contract_analysis_graph, PipelineDeps};
pub use progress::{NotifierSettings, ProgressEvent, ProgressNotifier};
pub use recovery::{
    decide_strategy, AbortReason, RecoveryCoordinator, RecoveryOutcome, RecoveryPolicy, RecoveryReport,
    RecoveryStrategy, RecoveryTrigger, ResumePoint,
};
pub use retry::{retry_with_backoff, RetryPolicy, RetryPolicyTable};
pub use state::{
    steps, AnalysisState, ComplianceOutput, DiagramOutput, DocumentInput, ExtractionOutput, PageResult,
    RecommendationsOutput, ReportOutput, RiskLevel, RiskOutput, StepOutput, StepTag, ValidationOutput,
};
pub use step::{Step, StepAction, StepConfig, StepContext, StepExecutor, StepOutcome, WorkflowServices};
pub use store::{
    collections, ContextPooledStore, DocumentStore, FileDocumentStore, InMemoryDocumentStore, RetryingStore,
    StoreFilter,
};
