//! Retry and recovery coordination
//!
//! Interrupted or failed tasks are re-entered through one of four strategies,
//! chosen by [`decide_strategy`] from the registry entry, the last persisted
//! state and the latest checkpoint:
//!
//! ```text
//! retry budget spent / auto recovery off ─────────────► Abort
//! last error fatal ───────────────────────────────────► Abort
//! insufficient content ─┬─ fallback strategy left ────► CleanRestart (next strategy)
//!                       └─ none left ─────────────────► Abort
//! missing artifact ───────────────────────────────────► CleanRestart
//! progress >= validate-only threshold ────────────────► ValidateOnly
//! checkpoint above resume threshold, artifacts ok ────► ResumeFromCheckpoint
//! otherwise ──────────────────────────────────────────► CleanRestart
//! ```
//!
//! Every re-entry counts against the task's retry budget. A task is claimed
//! with a compare-and-set into `recovering` before anything else happens, so a
//! scan and a manual retry can never recover the same task twice.

use crate::config::PipelineConfig;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::graph::{CompiledWorkflow, RunFailure, StartPoint};
use crate::isolation::IsolationBoundary;
use crate::state::{AnalysisState, DocumentInput, StepTag};
use crate::store::{collections, load_state};
use analysis_checkpoint::{Checkpoint, TaskRegistryEntry, TaskState, Transition};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// States a task may be claimed for recovery from
const CLAIMABLE: &[TaskState] = &[
    TaskState::Queued,
    TaskState::Processing,
    TaskState::Checkpoint,
    TaskState::Partial,
    TaskState::Orphaned,
    TaskState::Failed,
];

/// Who asked for the recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    /// Explicit retry request; ignores the auto recovery flag
    Manual,
    /// Periodic or startup scan
    Scan,
}

/// Why a task will not be re-entered
#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    RetryBudgetExhausted { retry_count: u32, max_retries: u32 },
    AutoRecoveryDisabled { retry_count: u32, max_retries: u32 },
    FatalError { kind: ErrorKind, message: String },
    NoFallbackStrategy { tried: usize },
}

impl AbortReason {
    fn into_error(self, task_id: &str) -> PipelineError {
        match self {
            AbortReason::RetryBudgetExhausted { retry_count, max_retries }
            | AbortReason::AutoRecoveryDisabled { retry_count, max_retries } => {
                PipelineError::RetryBudgetExhausted {
                    task_id: task_id.to_string(),
                    retry_count,
                    max_retries,
                }
            }
            AbortReason::FatalError { kind, message } => PipelineError::Remote { kind, message },
            AbortReason::NoFallbackStrategy { tried } => PipelineError::Validation(format!(
                "document yields insufficient text with all {} extraction strategies",
                tried
            )),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::RetryBudgetExhausted { retry_count, max_retries } => {
                write!(f, "retry budget exhausted ({}/{})", retry_count, max_retries)
            }
            AbortReason::AutoRecoveryDisabled { .. } => f.write_str("auto recovery is disabled"),
            AbortReason::FatalError { kind, .. } => write!(f, "last error ({}) is fatal", kind),
            AbortReason::NoFallbackStrategy { tried } => {
                write!(f, "no extraction strategy left after {}", tried)
            }
        }
    }
}

/// How a task is re-entered
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStrategy {
    /// Only confirm the final results were persisted
    ValidateOnly,
    ResumeFromCheckpoint {
        checkpoint: Box<Checkpoint>,
        resume_at: StepTag,
    },
    CleanRestart {
        reason: String,
        /// Move to the next extraction strategy
        advance_extraction: bool,
    },
    Abort { reason: AbortReason },
}

impl RecoveryStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryStrategy::ValidateOnly => "validate_only",
            RecoveryStrategy::ResumeFromCheckpoint { .. } => "resume_from_checkpoint",
            RecoveryStrategy::CleanRestart { .. } => "clean_restart",
            RecoveryStrategy::Abort { .. } => "abort",
        }
    }

    pub fn clean_restart(reason: impl Into<String>) -> Self {
        RecoveryStrategy::CleanRestart {
            reason: reason.into(),
            advance_extraction: false,
        }
    }
}

/// Thresholds driving strategy selection and stale-task discovery
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub resume_threshold_percent: u8,
    pub validate_only_threshold_percent: u8,
    /// Number of configured extraction strategies
    pub extraction_strategies: usize,
    pub heartbeat_staleness: chrono::Duration,
    pub queued_staleness: chrono::Duration,
}

impl RecoveryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            resume_threshold_percent: config.checkpoint.resume_threshold_percent,
            validate_only_threshold_percent: config.checkpoint.validate_only_threshold_percent,
            extraction_strategies: config.extraction.strategies.len(),
            heartbeat_staleness: config.recovery.heartbeat_staleness(),
            queued_staleness: config.recovery.queued_staleness(),
        }
    }

    fn has_fallback_after(&self, index: usize) -> bool {
        index + 1 < self.extraction_strategies
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Kind and recoverability of the most recent failure
fn last_failure(entry: &TaskRegistryEntry, state: &AnalysisState) -> Option<(ErrorKind, bool, String)> {
    state
        .last_error()
        .map(|r| (r.kind, r.recoverable, r.message.clone()))
        .or_else(|| {
            entry.last_error.as_ref().and_then(|s| {
                ErrorKind::parse(&s.kind).map(|kind| (kind, s.recoverable, s.message.clone()))
            })
        })
}

/// Choose how to re-enter a task
///
/// Pure: reads its inputs and touches nothing.
pub fn decide_strategy(
    entry: &TaskRegistryEntry,
    state: &AnalysisState,
    checkpoint: Option<&Checkpoint>,
    graph: &CompiledWorkflow,
    policy: &RecoveryPolicy,
    trigger: RecoveryTrigger,
) -> RecoveryStrategy {
    let retry_count = entry.retry_count.max(state.retry_count);
    let max_retries = entry.max_retries;

    if !entry.auto_recovery_enabled && trigger != RecoveryTrigger::Manual {
        return RecoveryStrategy::Abort {
            reason: AbortReason::AutoRecoveryDisabled { retry_count, max_retries },
        };
    }
    if retry_count >= max_retries {
        return RecoveryStrategy::Abort {
            reason: AbortReason::RetryBudgetExhausted { retry_count, max_retries },
        };
    }

    if let Some((kind, recoverable, message)) = last_failure(entry, state) {
        match kind {
            ErrorKind::InsufficientContent => {
                return if policy.has_fallback_after(state.extraction_strategy) {
                    RecoveryStrategy::CleanRestart {
                        reason: "insufficient content, trying the next extraction strategy".to_string(),
                        advance_extraction: true,
                    }
                } else {
                    RecoveryStrategy::Abort {
                        reason: AbortReason::NoFallbackStrategy {
                            tried: state.extraction_strategy + 1,
                        },
                    }
                };
            }
            ErrorKind::MissingArtifact => {
                return RecoveryStrategy::clean_restart(format!("missing artifact: {}", message));
            }
            ErrorKind::Cancelled => {}
            _ if !recoverable => {
                return RecoveryStrategy::Abort {
                    reason: AbortReason::FatalError { kind, message },
                };
            }
            _ => {}
        }
    }

    if state.progress_percent >= policy.validate_only_threshold_percent {
        return RecoveryStrategy::ValidateOnly;
    }

    let Some(checkpoint) = checkpoint else {
        return RecoveryStrategy::clean_restart("no checkpoint");
    };
    if state.progress_percent <= policy.resume_threshold_percent
        || checkpoint.progress_percent <= policy.resume_threshold_percent
    {
        return RecoveryStrategy::clean_restart(format!(
            "progress {}% / checkpoint {}% not above the resume threshold of {}%",
            state.progress_percent, checkpoint.progress_percent, policy.resume_threshold_percent
        ));
    }
    if !graph.contains(&checkpoint.checkpoint_name) {
        return RecoveryStrategy::clean_restart(format!(
            "checkpoint names unknown step '{}'",
            checkpoint.checkpoint_name
        ));
    }

    let mut merged = state.clone();
    if let Err(e) = merged.load_recoverable_data(&checkpoint.recoverable_data) {
        return RecoveryStrategy::clean_restart(format!("checkpoint unreadable: {}", e));
    }

    // Re-run the checkpointed step when the successor depends on a step-chosen label
    let resume_at = match graph.next_step(&checkpoint.checkpoint_name, None, &merged) {
        Ok(Some(next)) => next,
        _ => checkpoint.checkpoint_name.clone(),
    };

    let missing = graph.missing_artifacts(&resume_at, &merged);
    if let Some(req) = missing.first() {
        return RecoveryStrategy::clean_restart(format!(
            "checkpoint lacks artifact '{}' required by '{}'",
            req.step, resume_at
        ));
    }

    RecoveryStrategy::ResumeFromCheckpoint {
        checkpoint: Box::new(checkpoint.clone()),
        resume_at,
    }
}

/// Where a recovered task continues
#[derive(Debug)]
pub enum ResumePoint {
    /// Final results already persisted; nothing to run
    AlreadyComplete,
    Run(StartPoint),
    Aborted(PipelineError),
}

/// What a recovery attempt did
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Nothing was touched
    Skipped { reason: String },
    Aborted { error: PipelineError },
    /// Validation found the final results; marked completed without a re-run
    AlreadyComplete,
    Completed { state: Box<AnalysisState> },
    Failed { failure: RunFailure },
}

#[derive(Debug)]
pub struct RecoveryReport {
    pub task_id: String,
    pub strategy: Option<&'static str>,
    pub outcome: RecoveryOutcome,
}

impl RecoveryReport {
    fn skipped(task_id: &str, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            strategy: None,
            outcome: RecoveryOutcome::Skipped { reason: reason.into() },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self.outcome,
            RecoveryOutcome::Completed { .. } | RecoveryOutcome::AlreadyComplete
        )
    }
}

/// Finds interrupted tasks and re-enters them
pub struct RecoveryCoordinator {
    graph: Arc<CompiledWorkflow>,
    boundary: IsolationBoundary,
    policy: RecoveryPolicy,
}

impl RecoveryCoordinator {
    pub fn new(graph: Arc<CompiledWorkflow>, boundary: IsolationBoundary, policy: RecoveryPolicy) -> Self {
        Self { graph, boundary, policy }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Claim, decide, apply and run
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self, task_id: &str, trigger: RecoveryTrigger) -> Result<RecoveryReport> {
        let services = self.graph.services();
        let entry = services.registry.require(task_id).await?;

        if entry.state == TaskState::Completed {
            return Ok(RecoveryReport::skipped(task_id, "already completed"));
        }
        if let Some(other) = self.find_live_duplicate(&entry).await? {
            info!(task_id, duplicate_of = %other, "Skipping recovery, an identical task is running");
            return Ok(RecoveryReport::skipped(task_id, format!("duplicate of running task {}", other)));
        }

        let previous = entry.state;
        let entry = match services.registry.transition(task_id, CLAIMABLE, TaskState::Recovering).await? {
            Transition::Applied(entry) => entry,
            Transition::Rejected { current } => {
                debug!(task_id, state = %current.as_str(), "Recovery claim rejected");
                return Ok(RecoveryReport::skipped(task_id, format!("task is {}", current.as_str())));
            }
        };

        let state = match self.load_or_rebuild(&entry).await {
            Ok(state) => state,
            Err(e) => {
                self.release(task_id, previous).await;
                return Err(e);
            }
        };

        let checkpoint = match services.checkpoints.latest(task_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(task_id, error = %e, "Cannot read latest checkpoint, deciding without it");
                None
            }
        };

        let strategy = decide_strategy(&entry, &state, checkpoint.as_ref(), &self.graph, &self.policy, trigger);
        let strategy_name = strategy.name();
        info!(
            task_id,
            strategy = strategy_name,
            retry_count = state.retry_count,
            progress = state.progress_percent,
            ?trigger,
            "Recovery strategy selected"
        );

        let (state, point) = match self.apply_strategy(strategy, state).await {
            Ok(applied) => applied,
            Err(e) => {
                self.release(task_id, previous).await;
                return Err(e);
            }
        };

        let outcome = match point {
            ResumePoint::Aborted(error) => {
                let failure = self.graph.record_failure(state, error).await;
                RecoveryOutcome::Aborted { error: failure.error }
            }
            ResumePoint::AlreadyComplete => {
                self.mark_validated(state).await?;
                RecoveryOutcome::AlreadyComplete
            }
            ResumePoint::Run(start) => self.rerun(state, start).await,
        };

        Ok(RecoveryReport {
            task_id: task_id.to_string(),
            strategy: Some(strategy_name),
            outcome,
        })
    }

    /// Turn a strategy into a resume point, updating `state` for the re-entry
    pub async fn apply_strategy(
        &self,
        strategy: RecoveryStrategy,
        mut state: AnalysisState,
    ) -> Result<(AnalysisState, ResumePoint)> {
        match strategy {
            RecoveryStrategy::Abort { reason } => {
                warn!(task_id = %state.task_id, reason = %reason, "Recovery aborted");
                let error = reason.into_error(&state.task_id);
                Ok((state, ResumePoint::Aborted(error)))
            }
            RecoveryStrategy::ValidateOnly => {
                let results = self
                    .graph
                    .services()
                    .store
                    .get(collections::ANALYSIS_RESULTS, &state.task_id)
                    .await?;
                if results.is_some() {
                    return Ok((state, ResumePoint::AlreadyComplete));
                }
                info!(task_id = %state.task_id, "Final results missing, restarting");
                Ok(self.clean_restart(state, false))
            }
            RecoveryStrategy::ResumeFromCheckpoint { checkpoint, resume_at } => {
                state.retry_count += 1;
                state.load_recoverable_data(&checkpoint.recoverable_data)?;
                state
                    .committed_writes
                    .extend(checkpoint.database_state.committed.iter().cloned());
                state.progress_percent = checkpoint.progress_percent;
                state.last_checkpoint_percent = Some(checkpoint.progress_percent);
                state.current_step = resume_at.clone();
                Ok((state, ResumePoint::Run(StartPoint::At(resume_at))))
            }
            RecoveryStrategy::CleanRestart {
                reason,
                advance_extraction,
            } => {
                debug!(task_id = %state.task_id, reason = %reason, "Clean restart");
                Ok(self.clean_restart(state, advance_extraction))
            }
        }
    }

    fn clean_restart(&self, mut state: AnalysisState, advance_extraction: bool) -> (AnalysisState, ResumePoint) {
        state.retry_count += 1;
        if advance_extraction {
            state.extraction_strategy += 1;
        }

        let entry = self.graph.entry().to_string();
        let target = self
            .graph
            .restart_target(&state.current_step)
            .filter(|target| self.graph.missing_artifacts(target, &state).is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| entry.clone());
        let percent = self
            .graph
            .step_config(&target)
            .map(|c| c.target_percent)
            .unwrap_or(0);

        state.reset_for_restart(&target, percent);
        let start = if target == entry {
            StartPoint::Entry
        } else {
            StartPoint::At(target)
        };
        (state, ResumePoint::Run(start))
    }

    async fn rerun(&self, state: AnalysisState, start: StartPoint) -> RecoveryOutcome {
        let services = self.graph.services();
        let retry_count = state.retry_count;
        let step = state.current_step.clone();
        let percent = state.progress_percent;
        let sync = move |entry: &mut TaskRegistryEntry| {
            entry.retry_count = retry_count;
            entry.last_error = None;
            entry.touch(Some(&step), percent);
        };
        if let Err(e) = services.registry.update(&state.task_id, &sync).await {
            warn!(task_id = %state.task_id, error = %e, "Failed to record retry count");
        }
        if let Err(e) = self.graph.persist_state(&state).await {
            warn!(task_id = %state.task_id, error = %e, "Failed to persist state before re-entry");
        }

        let fallback = state.clone();
        match self.boundary.run_workflow(self.graph.clone(), state, start, None).await {
            Ok(Ok(state)) => RecoveryOutcome::Completed { state: Box::new(state) },
            Ok(Err(failure)) => RecoveryOutcome::Failed { failure },
            Err(e) => RecoveryOutcome::Failed {
                failure: self.graph.record_failure(fallback, e).await,
            },
        }
    }

    async fn mark_validated(&self, mut state: AnalysisState) -> Result<()> {
        state.progress_percent = 100;
        let step = state.current_step.clone();
        let complete = move |entry: &mut TaskRegistryEntry| {
            entry.state = TaskState::Completed;
            entry.last_error = None;
            entry.touch(Some(&step), 100);
        };
        self.graph
            .services()
            .registry
            .update(&state.task_id, &complete)
            .await?;
        self.graph.persist_state(&state).await?;
        info!(task_id = %state.task_id, "Final results verified, task completed");
        Ok(())
    }

    async fn release(&self, task_id: &str, previous: TaskState) {
        let registry = &self.graph.services().registry;
        if let Err(e) = registry.transition(task_id, &[TaskState::Recovering], previous).await {
            warn!(task_id, error = %e, "Failed to release recovery claim");
        }
    }

    async fn find_live_duplicate(&self, entry: &TaskRegistryEntry) -> Result<Option<String>> {
        let now = Utc::now();
        let siblings = self
            .graph
            .services()
            .registry
            .find_by_idempotency_key(&entry.idempotency_key)
            .await?;
        Ok(siblings
            .into_iter()
            .find(|other| {
                other.task_id != entry.task_id
                    && matches!(
                        other.state,
                        TaskState::Processing | TaskState::Checkpoint | TaskState::Recovering
                    )
                    && other.is_heartbeat_fresh(now, self.policy.heartbeat_staleness)
            })
            .map(|other| other.task_id))
    }

    /// Latest snapshot, or a minimal state rebuilt from the registry entry
    async fn load_or_rebuild(&self, entry: &TaskRegistryEntry) -> Result<AnalysisState> {
        let store = self.graph.services().store.clone();
        if let Some(mut state) = load_state(store.as_ref(), &entry.task_id).await? {
            state.retry_count = state.retry_count.max(entry.retry_count);
            return Ok(state);
        }

        warn!(task_id = %entry.task_id, "No state snapshot, rebuilding from the registry");
        let input = DocumentInput::new(&entry.document_ref, &entry.requester, "");
        let mut state = AnalysisState::new(&entry.task_id, input);
        state.idempotency_key = entry.idempotency_key.clone();
        state.retry_count = entry.retry_count;
        state.progress_percent = entry.progress_percent;
        state.current_step = entry
            .current_step
            .clone()
            .unwrap_or_else(|| self.graph.entry().to_string());
        Ok(state)
    }

    /// Entries that need recovery, highest priority first, then oldest heartbeat
    ///
    /// Stale `processing`, `checkpoint` and `recovering` entries are marked
    /// `orphaned` on the way.
    pub async fn scan(&self) -> Result<Vec<TaskRegistryEntry>> {
        let registry = &self.graph.services().registry;
        let now = Utc::now();
        let mut candidates = Vec::new();

        for entry in registry.list(&[]).await? {
            let stale = !entry.is_heartbeat_fresh(now, self.policy.heartbeat_staleness);
            let cancelled = entry
                .last_error
                .as_ref()
                .map(|e| e.kind == ErrorKind::Cancelled.as_str())
                .unwrap_or(false);
            let pick = match entry.state {
                TaskState::Processing | TaskState::Checkpoint | TaskState::Recovering | TaskState::Orphaned => stale,
                TaskState::Partial => stale && !cancelled,
                TaskState::Queued => now.signed_duration_since(entry.created_at) >= self.policy.queued_staleness,
                TaskState::Failed => {
                    entry.eligible_for_auto_recovery()
                        && entry.last_error.as_ref().map(|e| e.recoverable).unwrap_or(false)
                }
                TaskState::Completed => false,
            };
            if !pick {
                continue;
            }

            let entry = if matches!(
                entry.state,
                TaskState::Processing | TaskState::Checkpoint | TaskState::Recovering
            ) {
                match registry
                    .transition(
                        &entry.task_id,
                        &[TaskState::Processing, TaskState::Checkpoint, TaskState::Recovering],
                        TaskState::Orphaned,
                    )
                    .await?
                {
                    Transition::Applied(orphaned) => {
                        warn!(
                            task_id = %orphaned.task_id,
                            last_heartbeat = %orphaned.last_heartbeat,
                            "Marked stale task orphaned"
                        );
                        orphaned
                    }
                    Transition::Rejected { .. } => continue,
                }
            } else {
                entry
            };
            candidates.push(entry);
        }

        candidates.sort_by(|a, b| {
            b.recovery_priority
                .cmp(&a.recovery_priority)
                .then(a.last_heartbeat.cmp(&b.last_heartbeat))
        });
        Ok(candidates)
    }

    /// Scan and recover every candidate, one at a time
    pub async fn recover_stale(&self) -> Result<Vec<RecoveryReport>> {
        let candidates = self.scan().await?;
        if !candidates.is_empty() {
            info!(candidates = candidates.len(), "Recovering stale tasks");
        }

        let mut reports = Vec::with_capacity(candidates.len());
        for entry in candidates {
            match self.recover(&entry.task_id, RecoveryTrigger::Scan).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(task_id = %entry.task_id, error = %e, "Recovery attempt failed"),
            }
        }
        Ok(reports)
    }

    /// Run [`recover_stale`](Self::recover_stale) every `interval`
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.recover_stale().await {
                    Ok(reports) if !reports.is_empty() => {
                        let completed = reports.iter().filter(|r| r.is_completed()).count();
                        info!(recovered = reports.len(), completed, "Recovery scan finished");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Recovery scan failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullSink;
    use crate::graph::WorkflowGraph;
    use crate::isolation::IsolationTier;
    use crate::progress::{NotifierSettings, ProgressNotifier};
    use crate::state::StepOutput;
    use crate::step::{step_fn, Step, StepAction, StepConfig, WorkflowServices};
    use crate::store::InMemoryDocumentStore;
    use analysis_checkpoint::{ErrorSummary, InMemoryCheckpointStore, InMemoryTaskRegistry};
    use serde_json::json;

    fn echo(text: &'static str) -> Arc<dyn Step> {
        Arc::new(step_fn(move |_ctx, _state| {
            Box::pin(async move { Ok(StepAction::complete(StepOutput::Custom(json!(text)))) })
        }))
    }

    fn workflow() -> Arc<CompiledWorkflow> {
        let services = WorkflowServices::new(
            Arc::new(InMemoryTaskRegistry::new()),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryDocumentStore::new()),
            ProgressNotifier::spawn(Arc::new(NullSink), NotifierSettings::default()),
        );
        let mut graph = WorkflowGraph::new();
        graph
            .register_step(StepConfig::new("validate", 5), echo("ok"))
            .register_step(StepConfig::new("extract", 35).requires("validate", 1), echo("text"))
            .register_step(StepConfig::new("analyze", 70).requires("extract", 1), echo("analysis"))
            .register_step(StepConfig::new("report", 100).requires("analyze", 1), echo("report"))
            .add_edge("validate", "extract")
            .add_edge("extract", "analyze")
            .add_edge("analyze", "report")
            .add_restart_edge("extract", "validate")
            .set_entry("validate")
            .set_finish("report");
        Arc::new(graph.compile(services).unwrap())
    }

    fn entry() -> TaskRegistryEntry {
        TaskRegistryEntry::new("t1", "key", "doc", "alice")
    }

    fn state_at(progress: u8, step: &str) -> AnalysisState {
        let mut state = AnalysisState::new("t1", DocumentInput::new("doc", "alice", "fp"));
        state.progress_percent = progress;
        state.current_step = step.to_string();
        state
    }

    fn checkpoint_after(step: &str, pct: u8, results: &[&str]) -> Checkpoint {
        let mut cp = Checkpoint::new("t1", step, pct);
        for tag in results {
            cp = cp.with_data(*tag, serde_json::to_value(StepOutput::Custom(json!("x"))).unwrap());
        }
        cp
    }

    fn decide(entry: &TaskRegistryEntry, state: &AnalysisState, cp: Option<&Checkpoint>) -> RecoveryStrategy {
        decide_strategy(entry, state, cp, &workflow(), &RecoveryPolicy::default(), RecoveryTrigger::Scan)
    }

    #[tokio::test]
    async fn test_budget_exhausted_aborts_first() {
        let mut e = entry();
        e.retry_count = 3;
        let strategy = decide(&e, &state_at(99, "report"), None);
        assert!(matches!(
            strategy,
            RecoveryStrategy::Abort { reason: AbortReason::RetryBudgetExhausted { retry_count: 3, max_retries: 3 } }
        ));
    }

    #[tokio::test]
    async fn test_auto_recovery_disabled_blocks_scans_only() {
        let e = entry().with_auto_recovery(false);
        let state = state_at(10, "extract");
        assert_eq!(decide(&e, &state, None).name(), "abort");

        let manual = decide_strategy(
            &e,
            &state,
            None,
            &workflow(),
            &RecoveryPolicy::default(),
            RecoveryTrigger::Manual,
        );
        assert_eq!(manual.name(), "clean_restart");
    }

    #[tokio::test]
    async fn test_high_progress_validates_only() {
        assert_eq!(decide(&entry(), &state_at(95, "report"), None), RecoveryStrategy::ValidateOnly);
    }

    #[tokio::test]
    async fn test_resume_when_checkpoint_has_artifacts() {
        let cp = checkpoint_after("analyze", 70, &["validate", "extract", "analyze"]);
        let strategy = decide(&entry(), &state_at(70, "report"), Some(&cp));
        match strategy {
            RecoveryStrategy::ResumeFromCheckpoint { resume_at, .. } => assert_eq!(resume_at, "report"),
            other => panic!("expected resume, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_below_threshold_restarts() {
        let cp = checkpoint_after("validate", 5, &["validate"]);
        assert_eq!(decide(&entry(), &state_at(70, "report"), Some(&cp)).name(), "clean_restart");
    }

    #[tokio::test]
    async fn test_checkpoint_missing_artifact_restarts() {
        let cp = checkpoint_after("analyze", 70, &["validate", "extract"]);
        match decide(&entry(), &state_at(70, "report"), Some(&cp)) {
            RecoveryStrategy::CleanRestart { reason, .. } => assert!(reason.contains("analyze")),
            other => panic!("expected clean restart, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insufficient_content_advances_then_aborts() {
        let mut state = state_at(5, "extract");
        state.push_error(
            PipelineError::InsufficientContent {
                chars: 50,
                minimum: 200,
                strategy: "standard".into(),
            }
            .to_record(Some("extract")),
        );
        assert!(matches!(
            decide(&entry(), &state, None),
            RecoveryStrategy::CleanRestart { advance_extraction: true, .. }
        ));

        state.extraction_strategy = 1;
        assert!(matches!(
            decide(&entry(), &state, None),
            RecoveryStrategy::Abort { reason: AbortReason::NoFallbackStrategy { tried: 2 } }
        ));
    }

    #[tokio::test]
    async fn test_fatal_error_aborts() {
        let mut state = state_at(35, "extract");
        state.push_error(PipelineError::Validation("not a contract".into()).to_record(Some("validate")));
        assert!(matches!(
            decide(&entry(), &state, None),
            RecoveryStrategy::Abort { reason: AbortReason::FatalError { kind: ErrorKind::Validation, .. } }
        ));
    }

    #[tokio::test]
    async fn test_registry_error_used_without_state_errors() {
        let mut e = entry();
        e.last_error = Some(ErrorSummary {
            kind: "configuration".into(),
            message: "bad graph".into(),
            recoverable: false,
        });
        assert_eq!(decide(&e, &state_at(35, "extract"), None).name(), "abort");
    }

    async fn coordinator_with_task(state: AnalysisState, entry: TaskRegistryEntry) -> RecoveryCoordinator {
        let graph = workflow();
        let services = graph.services();
        services.registry.create(entry).await.unwrap();
        crate::store::save_state(services.store.as_ref(), &state).await.unwrap();
        RecoveryCoordinator::new(graph, IsolationBoundary::new(IsolationTier::Context), RecoveryPolicy::default())
    }

    #[tokio::test]
    async fn test_clean_restart_resets_and_completes() {
        let mut state = state_at(35, "extract");
        state.push_error(PipelineError::TransientStore("reset".into()).to_record(Some("extract")));
        let coordinator = coordinator_with_task(state, entry().with_state(TaskState::Failed)).await;

        let report = coordinator.recover("t1", RecoveryTrigger::Manual).await.unwrap();

        assert_eq!(report.strategy, Some("clean_restart"));
        let RecoveryOutcome::Completed { state } = report.outcome else {
            panic!("expected completion, got {:?}", report.outcome);
        };
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.generation, 1);
        assert!(state.errors.is_empty());
        let entry = coordinator.graph.services().registry.require("t1").await.unwrap();
        assert_eq!(entry.state, TaskState::Completed);
        assert_eq!(entry.retry_count, 1);
    }

    #[tokio::test]
    async fn test_apply_clean_restart_uses_restart_edge() {
        let coordinator = coordinator_with_task(state_at(35, "extract"), entry()).await;
        let mut state = state_at(35, "extract");
        state.record_result("validate", StepOutput::Custom(json!("ok")));

        let (state, point) = coordinator
            .apply_strategy(RecoveryStrategy::clean_restart("test"), state)
            .await
            .unwrap();

        assert!(matches!(point, ResumePoint::Run(StartPoint::Entry)));
        assert_eq!(state.current_step, "validate");
        assert_eq!(state.progress_percent, 5);
        assert_eq!(state.retry_count, 1);
    }

    #[tokio::test]
    async fn test_validate_only_completes_without_rerun() {
        let coordinator = coordinator_with_task(state_at(95, "report"), entry().with_state(TaskState::Orphaned)).await;
        coordinator
            .graph
            .services()
            .store
            .put(collections::ANALYSIS_RESULTS, "t1", json!({"summary": "done"}))
            .await
            .unwrap();

        let report = coordinator.recover("t1", RecoveryTrigger::Scan).await.unwrap();

        assert!(matches!(report.outcome, RecoveryOutcome::AlreadyComplete));
        let entry = coordinator.graph.services().registry.require("t1").await.unwrap();
        assert_eq!(entry.state, TaskState::Completed);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn test_completed_task_skipped() {
        let coordinator = coordinator_with_task(state_at(100, "report"), entry().with_state(TaskState::Completed)).await;
        let report = coordinator.recover("t1", RecoveryTrigger::Manual).await.unwrap();
        assert!(matches!(report.outcome, RecoveryOutcome::Skipped { ref reason } if reason == "already completed"));
    }

    #[tokio::test]
    async fn test_claim_blocks_second_recovery() {
        let coordinator = coordinator_with_task(state_at(35, "extract"), entry().with_state(TaskState::Recovering)).await;
        let report = coordinator.recover("t1", RecoveryTrigger::Scan).await.unwrap();
        assert!(matches!(report.outcome, RecoveryOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_scan_orders_and_orphans() {
        let coordinator = coordinator_with_task(state_at(0, "validate"), entry().with_state(TaskState::Completed)).await;
        let registry = coordinator.graph.services().registry.clone();
        let old = Utc::now() - chrono::Duration::hours(2);

        registry
            .create(
                TaskRegistryEntry::new("stale-low", "k1", "d", "r")
                    .with_state(TaskState::Processing)
                    .with_last_heartbeat(old),
            )
            .await
            .unwrap();
        registry
            .create(
                TaskRegistryEntry::new("stale-high", "k2", "d", "r")
                    .with_state(TaskState::Checkpoint)
                    .with_priority(5)
                    .with_last_heartbeat(old),
            )
            .await
            .unwrap();
        registry
            .create(TaskRegistryEntry::new("fresh", "k3", "d", "r").with_state(TaskState::Processing))
            .await
            .unwrap();

        let found = coordinator.scan().await.unwrap();
        let ids: Vec<_> = found.iter().map(|e| e.task_id.as_str()).collect();
        assert_eq!(ids, vec!["stale-high", "stale-low"]);
        assert!(found.iter().all(|e| e.state == TaskState::Orphaned));
    }

    #[tokio::test]
    async fn test_scan_skips_cancelled_partial_and_picks_recoverable_failures() {
        let coordinator = coordinator_with_task(state_at(0, "validate"), entry().with_state(TaskState::Completed)).await;
        let registry = coordinator.graph.services().registry.clone();
        let old = Utc::now() - chrono::Duration::hours(2);

        let mut cancelled = TaskRegistryEntry::new("cancelled", "k1", "d", "r")
            .with_state(TaskState::Partial)
            .with_last_heartbeat(old);
        cancelled.last_error = Some(PipelineError::Cancelled { task_id: "cancelled".into() }.summary());
        registry.create(cancelled).await.unwrap();

        let mut transient = TaskRegistryEntry::new("transient", "k2", "d", "r").with_state(TaskState::Failed);
        transient.last_error = Some(PipelineError::TransientProvider("503".into()).summary());
        registry.create(transient).await.unwrap();

        let mut fatal = TaskRegistryEntry::new("fatal", "k3", "d", "r").with_state(TaskState::Failed);
        fatal.last_error = Some(PipelineError::Validation("empty".into()).summary());
        registry.create(fatal).await.unwrap();

        let ids: Vec<_> = coordinator.scan().await.unwrap().into_iter().map(|e| e.task_id).collect();
        assert_eq!(ids, vec!["transient".to_string()]);
    }
}
