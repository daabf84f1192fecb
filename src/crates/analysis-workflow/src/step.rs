//! Steps and the step executor
//!
//! A [`Step`] holds business logic only: it reads the state and returns a
//! [`StepAction`]. Everything around it is the executor's job:
//!
//! ```text
//! StepExecutor::execute(state)
//!   │
//!   ├─ 1. cancelled?                     → Fail(Cancelled)
//!   ├─ 2. required artifacts present?    → Fail(MissingArtifact)   step never runs
//!   ├─ 3. registry: processing + heartbeat
//!   ├─ 4. run step
//!   │      ├─ soft timeout               → warning, keep waiting
//!   │      ├─ hard timeout               → Timeout error
//!   │      ├─ cancellation               → Fail(Cancelled)
//!   │      └─ recoverable error          → local retry with backoff (policy by kind)
//!   ├─ 5. write result, set progress, heartbeat
//!   ├─ 6. notify progress (non-blocking)
//!   └─ 7. checkpoint if the step is checkpoint-worthy or the cadence is due
//! ```
//!
//! The executor returns the state together with a [`StepOutcome`]; routing is
//! left to the graph.

use crate::error::{ErrorKind, ErrorRecord, PipelineError, Result};
use crate::isolation::{CancelToken, IsolationContext};
use crate::progress::ProgressNotifier;
use crate::retry::{retry_with_backoff, RetryPolicyTable};
use crate::state::{AnalysisState, StepOutput, StepTag};
use crate::store::DocumentStore;
use analysis_checkpoint::{Checkpoint, CheckpointStore, DatabaseState, TaskRegistry, TaskRegistryEntry, TaskState};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Prerequisite result a step needs before it may run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequirement {
    pub step: StepTag,
    /// Minimum [`StepOutput::content_len`]; zero still means non-empty
    pub min_content_len: usize,
}

/// Static configuration of one registered step
#[derive(Debug, Clone, PartialEq)]
pub struct StepConfig {
    pub tag: StepTag,
    /// Progress once the step completes
    pub target_percent: u8,
    pub checkpoint_worthy: bool,
    pub requires: Vec<ArtifactRequirement>,
    pub soft_timeout: Option<Duration>,
    pub hard_timeout: Option<Duration>,
    /// How often the step may ask to be re-run
    pub max_local_retries: u32,
    /// Routing labels the step may return on completion
    pub labels: Vec<String>,
}

impl StepConfig {
    pub fn new(tag: impl Into<StepTag>, target_percent: u8) -> Self {
        Self {
            tag: tag.into(),
            target_percent,
            checkpoint_worthy: false,
            requires: Vec::new(),
            soft_timeout: None,
            hard_timeout: None,
            max_local_retries: 2,
            labels: Vec::new(),
        }
    }

    pub fn requires(mut self, step: impl Into<StepTag>, min_content_len: usize) -> Self {
        self.requires.push(ArtifactRequirement {
            step: step.into(),
            min_content_len,
        });
        self
    }

    pub fn checkpoint_worthy(mut self) -> Self {
        self.checkpoint_worthy = true;
        self
    }

    pub fn with_timeouts(mut self, soft: Option<Duration>, hard: Option<Duration>) -> Self {
        self.soft_timeout = soft;
        self.hard_timeout = hard;
        self
    }

    pub fn with_max_local_retries(mut self, retries: u32) -> Self {
        self.max_local_retries = retries;
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

/// What a step decided
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Complete {
        output: StepOutput,
        /// Label for a conditional edge
        route: Option<String>,
        warnings: Vec<String>,
        /// External writes performed, keyed `collection/id`
        committed: Vec<String>,
    },
    /// Run this step again
    Retry { reason: String },
}

impl StepAction {
    pub fn complete(output: StepOutput) -> Self {
        StepAction::Complete {
            output,
            route: None,
            warnings: Vec::new(),
            committed: Vec::new(),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        StepAction::Retry { reason: reason.into() }
    }

    pub fn with_route(mut self, label: impl Into<String>) -> Self {
        if let StepAction::Complete { route, .. } = &mut self {
            *route = Some(label.into());
        }
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        if let StepAction::Complete { warnings, .. } = &mut self {
            warnings.push(warning.into());
        }
        self
    }

    pub fn with_committed(mut self, key: impl Into<String>) -> Self {
        if let StepAction::Complete { committed, .. } = &mut self {
            committed.push(key.into());
        }
        self
    }
}

/// Result of executing one step, interpreted by the graph
#[derive(Debug)]
pub enum StepOutcome {
    /// Follow the outgoing edge, with an optional routing label
    Advance(Option<String>),
    RetrySameStep(String),
    Fail(PipelineError),
}

/// Per-execution context handed to a step
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task_id: String,
    pub step: StepTag,
    /// Zero-based local attempt
    pub attempt: u32,
    pub generation: u32,
    cancel: CancelToken,
    isolation: Option<IsolationContext>,
}

impl StepContext {
    pub fn new(task_id: impl Into<String>, step: impl Into<StepTag>) -> Self {
        Self {
            task_id: task_id.into(),
            step: step.into(),
            attempt: 0,
            generation: 0,
            cancel: CancelToken::never(),
            isolation: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn isolation(&self) -> Option<&IsolationContext> {
        self.isolation.as_ref()
    }
}

/// Business logic of one step
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, ctx: &StepContext, state: &AnalysisState) -> Result<StepAction>;
}

/// Boxed future returned by closure steps
pub type StepFuture = Pin<Box<dyn Future<Output = Result<StepAction>> + Send>>;

/// Step backed by a closure
pub struct FnStep<F> {
    f: F,
}

/// Wrap a closure as a [`Step`]
///
/// ```rust
/// use analysis_workflow::step::{step_fn, StepAction};
/// use analysis_workflow::StepOutput;
///
/// let step = step_fn(|_ctx, _state| {
///     Box::pin(async move { Ok(StepAction::complete(StepOutput::Custom("done".into()))) })
/// });
/// ```
pub fn step_fn<F>(f: F) -> FnStep<F>
where
    F: Fn(StepContext, AnalysisState) -> StepFuture + Send + Sync,
{
    FnStep { f }
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(StepContext, AnalysisState) -> StepFuture + Send + Sync,
{
    async fn run(&self, ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        (self.f)(ctx.clone(), state.clone()).await
    }
}

/// Shared collaborators of every executor in a compiled workflow
#[derive(Clone)]
pub struct WorkflowServices {
    pub registry: Arc<dyn TaskRegistry>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub store: Arc<dyn DocumentStore>,
    pub notifier: ProgressNotifier,
    pub retry: RetryPolicyTable,
    /// Checkpoint at least every this many percentage points
    pub checkpoint_frequency: u8,
}

impl WorkflowServices {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        store: Arc<dyn DocumentStore>,
        notifier: ProgressNotifier,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            store,
            notifier,
            retry: RetryPolicyTable::default(),
            checkpoint_frequency: 20,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicyTable) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpoint_frequency(mut self, percent: u8) -> Self {
        self.checkpoint_frequency = percent;
        self
    }
}

enum Supervised {
    Finished {
        result: Result<StepAction>,
        soft_exceeded: bool,
    },
    HardTimeout(Duration),
    Cancelled,
}

/// Run `future` under soft/hard timeouts and cancellation
async fn supervise<F>(
    future: F,
    step: &str,
    soft: Option<Duration>,
    hard: Option<Duration>,
    cancel: &CancelToken,
) -> Supervised
where
    F: Future<Output = Result<StepAction>>,
{
    let started = Instant::now();
    let far = Duration::from_secs(365 * 24 * 3600);
    let soft_sleep = tokio::time::sleep(soft.unwrap_or(far));
    let hard_sleep = tokio::time::sleep(hard.unwrap_or(far));
    tokio::pin!(future, soft_sleep, hard_sleep);

    let mut soft_exceeded = false;
    loop {
        tokio::select! {
            result = &mut future => return Supervised::Finished { result, soft_exceeded },
            _ = &mut soft_sleep, if soft.is_some() && !soft_exceeded => {
                soft_exceeded = true;
                warn!(
                    step,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Step exceeded its soft timeout"
                );
            }
            _ = &mut hard_sleep, if hard.is_some() => return Supervised::HardTimeout(started.elapsed()),
            _ = cancel.cancelled() => return Supervised::Cancelled,
        }
    }
}

/// Runs one registered step with its cross-cutting concerns
pub struct StepExecutor {
    config: StepConfig,
    step: Arc<dyn Step>,
}

impl StepExecutor {
    pub fn new(config: StepConfig, step: Arc<dyn Step>) -> Self {
        Self { config, step }
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    /// First unmet artifact requirement, if any
    pub fn check_prerequisites(&self, state: &AnalysisState) -> Result<()> {
        for req in &self.config.requires {
            let reason = match state.result(&req.step) {
                None => "absent".to_string(),
                Some(out) if out.content_len() < req.min_content_len.max(1) => format!(
                    "content length {} is below the minimum of {}",
                    out.content_len(),
                    req.min_content_len.max(1)
                ),
                Some(_) => continue,
            };
            return Err(PipelineError::MissingArtifact {
                step: self.config.tag.clone(),
                artifact: req.step.clone(),
                reason,
            });
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, services, state), fields(task_id = %state.task_id, step = %self.config.tag))]
    pub async fn execute(&self, services: &WorkflowServices, mut state: AnalysisState) -> (AnalysisState, StepOutcome) {
        let tag = self.config.tag.clone();
        let isolation = IsolationContext::try_current();
        let cancel = isolation.as_ref().map(|c| c.cancel_token()).unwrap_or_else(CancelToken::never);

        if cancel.is_cancelled() {
            let err = PipelineError::Cancelled { task_id: state.task_id.clone() };
            return (state, StepOutcome::Fail(err));
        }

        if let Err(e) = self.check_prerequisites(&state) {
            warn!(task_id = %state.task_id, step = %tag, error = %e, "Prerequisite check failed");
            return (state, StepOutcome::Fail(e));
        }

        let starting_percent = state.progress_percent;
        let step_ref = tag.clone();
        let mark_processing = move |entry: &mut TaskRegistryEntry| {
            entry.state = TaskState::Processing;
            entry.touch(Some(&step_ref), starting_percent);
        };
        if let Err(e) = services.registry.update(&state.task_id, &mark_processing).await {
            warn!(task_id = %state.task_id, error = %e, "Heartbeat before step failed");
        }

        debug!(task_id = %state.task_id, step = %tag, "Executing step");
        let mut attempt: u32 = 0;
        let action = loop {
            let ctx = StepContext {
                task_id: state.task_id.clone(),
                step: tag.clone(),
                attempt,
                generation: state.generation,
                cancel: cancel.clone(),
                isolation: isolation.clone(),
            };

            let supervised = supervise(
                self.step.run(&ctx, &state),
                &tag,
                self.config.soft_timeout,
                self.config.hard_timeout,
                &cancel,
            )
            .await;

            let error = match supervised {
                Supervised::Finished { result, soft_exceeded } => {
                    if soft_exceeded {
                        state.push_warning(ErrorRecord::warning(
                            ErrorKind::Timeout,
                            &tag,
                            "step exceeded its soft timeout",
                        ));
                    }
                    match result {
                        Ok(action) => break action,
                        Err(e) => e,
                    }
                }
                Supervised::HardTimeout(elapsed) => PipelineError::Timeout {
                    step: tag.clone(),
                    elapsed_ms: elapsed.as_millis() as u64,
                },
                Supervised::Cancelled => {
                    info!(task_id = %state.task_id, step = %tag, "Step cancelled");
                    let err = PipelineError::Cancelled { task_id: state.task_id.clone() };
                    return (state, StepOutcome::Fail(err));
                }
            };

            attempt += 1;
            if !services.retry.should_retry(&error, attempt as usize) {
                warn!(
                    task_id = %state.task_id,
                    step = %tag,
                    attempts = attempt,
                    kind = %error.kind(),
                    error = %error,
                    "Step failed"
                );
                return (state, StepOutcome::Fail(error));
            }

            let delay = services.retry.policy_for(error.kind()).calculate_delay(attempt as usize - 1);
            warn!(
                task_id = %state.task_id,
                step = %tag,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying step after transient error"
            );
            tokio::time::sleep(delay).await;
        };

        let (output, route, warnings, committed) = match action {
            StepAction::Retry { reason } => {
                debug!(task_id = %state.task_id, step = %tag, reason = %reason, "Step asked to run again");
                return (state, StepOutcome::RetrySameStep(reason));
            }
            StepAction::Complete {
                output,
                route,
                warnings,
                committed,
            } => (output, route, warnings, committed),
        };

        state.record_result(&tag, output);
        state.progress_percent = self.config.target_percent;
        state.committed_writes.extend(committed);
        for warning in warnings {
            state.push_warning(ErrorRecord::warning(ErrorKind::Validation, &tag, warning));
        }

        let percent = state.progress_percent;
        if let Err(e) = services.registry.heartbeat(&state.task_id, &tag, percent).await {
            warn!(task_id = %state.task_id, error = %e, "Heartbeat after step failed");
        }

        services.notifier.notify_generation(
            &state.task_id,
            &tag,
            percent,
            format!("{} complete", tag),
            state.generation,
        );

        if self.checkpoint_due(services, &state) {
            self.write_checkpoint(services, &mut state).await;
        }

        info!(task_id = %state.task_id, step = %tag, progress = percent, "Step completed");
        (state, StepOutcome::Advance(route))
    }

    fn checkpoint_due(&self, services: &WorkflowServices, state: &AnalysisState) -> bool {
        if self.config.checkpoint_worthy {
            return true;
        }
        let last = state.last_checkpoint_percent.unwrap_or(0);
        state.progress_percent.saturating_sub(last) >= services.checkpoint_frequency.max(1)
    }

    /// Failures are recorded as warnings; the run goes on without this checkpoint
    async fn write_checkpoint(&self, services: &WorkflowServices, state: &mut AnalysisState) {
        let data = match state.recoverable_data() {
            Ok(data) => data,
            Err(e) => {
                warn!(task_id = %state.task_id, error = %e, "Cannot encode checkpoint data");
                state.push_warning(e.to_record(Some(&self.config.tag)));
                return;
            }
        };

        let mut db_state = DatabaseState::new();
        for key in &state.committed_writes {
            db_state.record(key.clone());
        }
        let checkpoint = Checkpoint::new(&state.task_id, &self.config.tag, state.progress_percent)
            .with_recoverable_data(data)
            .with_database_state(db_state);

        let result = retry_with_backoff(&services.retry, "checkpoint.put", || {
            let checkpoint = checkpoint.clone();
            async move { services.checkpoints.put(checkpoint).await.map_err(PipelineError::from) }
        })
        .await;

        match result {
            Ok(id) => {
                state.last_checkpoint_percent = Some(state.progress_percent);
                let mark_checkpoint = |entry: &mut TaskRegistryEntry| {
                    entry.state = TaskState::Checkpoint;
                };
                if let Err(e) = services.registry.update(&state.task_id, &mark_checkpoint).await {
                    warn!(task_id = %state.task_id, error = %e, "Registry update after checkpoint failed");
                }
                debug!(task_id = %state.task_id, checkpoint = %id, progress = state.progress_percent, "Checkpoint written");
            }
            Err(e) => {
                warn!(task_id = %state.task_id, error = %e, "Checkpoint write failed");
                state.push_warning(e.to_record(Some(&self.config.tag)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullSink;
    use crate::progress::NotifierSettings;
    use crate::retry::RetryPolicy;
    use crate::state::DocumentInput;
    use crate::store::InMemoryDocumentStore;
    use analysis_checkpoint::{InMemoryCheckpointStore, InMemoryTaskRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn services(registry: Arc<InMemoryTaskRegistry>, checkpoints: Arc<InMemoryCheckpointStore>) -> WorkflowServices {
        WorkflowServices {
            registry,
            checkpoints,
            store: Arc::new(InMemoryDocumentStore::new()),
            notifier: ProgressNotifier::spawn(Arc::new(NullSink), NotifierSettings::default()),
            retry: RetryPolicyTable::default()
                .with_policy(
                    ErrorKind::TransientProvider,
                    RetryPolicy::new(3).with_initial_interval(0.001),
                )
                .without_jitter(),
            checkpoint_frequency: 20,
        }
    }

    async fn setup() -> (WorkflowServices, Arc<InMemoryCheckpointStore>, AnalysisState) {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let state = AnalysisState::new("task-1", DocumentInput::new("doc", "alice", "fp"));
        registry
            .create(TaskRegistryEntry::new("task-1", &state.idempotency_key, "doc", "alice"))
            .await
            .unwrap();
        (services(registry, checkpoints.clone()), checkpoints, state)
    }

    fn custom(value: serde_json::Value) -> StepOutput {
        StepOutput::Custom(value)
    }

    #[tokio::test]
    async fn test_missing_artifact_prevents_execution() {
        let (services, _, state) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = StepExecutor::new(
            StepConfig::new("compile_report", 100).requires("extract_text", 200),
            Arc::new(step_fn(move |_ctx, _state| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(StepAction::complete(StepOutput::Custom(json!("report")))) })
            })),
        );

        let (_state, outcome) = executor.execute(&services, state).await;

        assert!(matches!(
            outcome,
            StepOutcome::Fail(PipelineError::MissingArtifact { ref artifact, .. }) if artifact == "extract_text"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_short_artifact_counts_as_missing() {
        let (_, _, mut state) = setup().await;
        state.record_result("extract_text", custom(json!("x".repeat(50))));
        let executor = StepExecutor::new(
            StepConfig::new("check_compliance", 70).requires("extract_text", 200),
            Arc::new(step_fn(|_ctx, _state| {
                Box::pin(async { Ok(StepAction::complete(StepOutput::Custom(json!("ok")))) })
            })),
        );

        let err = executor.check_prerequisites(&state).unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[tokio::test]
    async fn test_success_records_result_progress_and_checkpoint() {
        let (services, checkpoints, state) = setup().await;
        let executor = StepExecutor::new(
            StepConfig::new("extract_text", 35).checkpoint_worthy(),
            Arc::new(step_fn(|_ctx, _state| {
                Box::pin(async {
                    Ok(StepAction::complete(StepOutput::Custom(json!("contract text"))).with_warning("low confidence"))
                })
            })),
        );

        let (state, outcome) = executor.execute(&services, state).await;

        assert!(matches!(outcome, StepOutcome::Advance(None)));
        assert_eq!(state.progress_percent, 35);
        assert!(state.result("extract_text").is_some());
        assert_eq!(state.warnings.len(), 1);
        assert_eq!(state.last_checkpoint_percent, Some(35));

        let checkpoint = checkpoints.latest("task-1").await.unwrap().unwrap();
        assert_eq!(checkpoint.checkpoint_name, "extract_text");
        assert!(checkpoint.has_data_for("extract_text"));

        let entry = services.registry.require("task-1").await.unwrap();
        assert_eq!(entry.progress_percent, 35);
        assert_eq!(entry.state, TaskState::Checkpoint);
    }

    #[tokio::test]
    async fn test_checkpoint_cadence() {
        let (services, checkpoints, mut state) = setup().await;
        state.last_checkpoint_percent = Some(35);
        state.progress_percent = 35;
        let executor = StepExecutor::new(
            StepConfig::new("analyze_diagrams", 50),
            Arc::new(step_fn(|_ctx, _state| {
                Box::pin(async { Ok(StepAction::complete(StepOutput::Custom(json!("d")))) })
            })),
        );

        let (state, _) = executor.execute(&services, state).await;
        assert_eq!(checkpoints.checkpoint_count().await, 0);
        assert_eq!(state.last_checkpoint_percent, Some(35));

        let executor = StepExecutor::new(
            StepConfig::new("check_compliance", 70),
            Arc::new(step_fn(|_ctx, _state| {
                Box::pin(async { Ok(StepAction::complete(StepOutput::Custom(json!("c")))) })
            })),
        );
        let (state, _) = executor.execute(&services, state).await;
        assert_eq!(checkpoints.checkpoint_count().await, 1);
        assert_eq!(state.last_checkpoint_percent, Some(70));
    }

    #[tokio::test]
    async fn test_transient_error_retried_locally() {
        let (services, _, state) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = StepExecutor::new(
            StepConfig::new("assess_risk", 85),
            Arc::new(step_fn(move |_ctx, _state| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n < 2 {
                        Err(PipelineError::TransientProvider("503".into()))
                    } else {
                        Ok(StepAction::complete(StepOutput::Custom(json!("risk"))))
                    }
                })
            })),
        );

        let (_, outcome) = executor.execute(&services, state).await;
        assert!(matches!(outcome, StepOutcome::Advance(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let (services, _, state) = setup().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = StepExecutor::new(
            StepConfig::new("validate_input", 5),
            Arc::new(step_fn(move |_ctx, _state| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(PipelineError::Validation("empty document".into())) })
            })),
        );

        let (_, outcome) = executor.execute(&services, state).await;
        assert!(matches!(outcome, StepOutcome::Fail(PipelineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_timeout_fails_step() {
        let (services, _, state) = setup().await;
        let executor = StepExecutor::new(
            StepConfig::new("extract_text", 35)
                .with_timeouts(Some(Duration::from_secs(1)), Some(Duration::from_secs(5))),
            Arc::new(step_fn(|_ctx, _state| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(StepAction::complete(StepOutput::Custom(json!("late"))))
                })
            })),
        );

        let (_, outcome) = executor.execute(&services, state).await;
        assert!(matches!(outcome, StepOutcome::Fail(PipelineError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_timeout_only_warns() {
        let (services, _, state) = setup().await;
        let executor = StepExecutor::new(
            StepConfig::new("extract_text", 35)
                .with_timeouts(Some(Duration::from_secs(1)), Some(Duration::from_secs(30))),
            Arc::new(step_fn(|_ctx, _state| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok(StepAction::complete(StepOutput::Custom(json!("slow but fine"))))
                })
            })),
        );

        let (state, outcome) = executor.execute(&services, state).await;
        assert!(matches!(outcome, StepOutcome::Advance(_)));
        assert!(state.warnings.iter().any(|w| w.kind == ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_retry_action_and_route_pass_through() {
        let (services, _, state) = setup().await;
        let executor = StepExecutor::new(
            StepConfig::new("extract_text", 35),
            Arc::new(step_fn(|ctx, _state| {
                Box::pin(async move {
                    if ctx.attempt == 0 {
                        Ok(StepAction::retry("page cache warming"))
                    } else {
                        Ok(StepAction::complete(StepOutput::Custom(json!("t"))))
                    }
                })
            })),
        );
        let (state, outcome) = executor.execute(&services, state).await;
        assert!(matches!(outcome, StepOutcome::RetrySameStep(_)));

        let executor = StepExecutor::new(
            StepConfig::new("extract_text", 35).with_labels(["diagrams"]),
            Arc::new(step_fn(|_ctx, _state| {
                Box::pin(async { Ok(StepAction::complete(StepOutput::Custom(json!("t"))).with_route("diagrams")) })
            })),
        );
        let (_, outcome) = executor.execute(&services, state).await;
        assert!(matches!(outcome, StepOutcome::Advance(Some(ref l)) if l == "diagrams"));
    }
}
