//! Trigger surface: start, status, retry, cancel and stale-task recovery
//!
//! [`AnalysisEngine`] owns a compiled workflow, the isolation boundary and
//! the recovery coordinator. Runs are spawned in the background; callers get
//! a tracking id immediately and can [`wait`](AnalysisEngine::wait) for it.

use crate::config::{IsolationSettings, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::graph::{CompiledWorkflow, StartPoint};
use crate::isolation::{IsolationBoundary, IsolationTier, ProcessWorker};
use crate::pipeline::{contract_analysis_graph, PipelineDeps};
use crate::recovery::{RecoveryCoordinator, RecoveryPolicy, RecoveryReport, RecoveryTrigger};
use crate::state::{AnalysisState, DocumentInput};
use crate::step::WorkflowServices;
use crate::store::load_state;
use analysis_checkpoint::{Creation, TaskRegistryEntry, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Request to analyse one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Caller-chosen id; a UUID is generated when absent
    #[serde(default)]
    pub task_id: Option<String>,
    pub input: DocumentInput,
    #[serde(default)]
    pub priority: i32,
    /// Overrides the configured isolation tier
    #[serde(default)]
    pub tier: Option<IsolationTier>,
}

impl StartRequest {
    pub fn new(input: DocumentInput) -> Self {
        Self {
            task_id: None,
            input,
            priority: 0,
            tier: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tier(mut self, tier: IsolationTier) -> Self {
        self.tier = Some(tier);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartAccepted {
    pub task_id: String,
    /// True when an identical live submission was found and reused
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetryResponse {
    Accepted { task_id: String },
    Rejected { task_id: String, reason: String },
}

impl RetryResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RetryResponse::Accepted { .. })
    }
}

/// What `status` reports about one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub task_id: String,
    pub state: TaskState,
    pub current_step: Option<String>,
    pub progress_percent: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_kind: Option<String>,
    pub error_step: Option<String>,
    pub error_message: Option<String>,
    pub eligible_for_auto_recovery: bool,
    pub updated_at: DateTime<Utc>,
}

/// Isolation boundary described by configuration
pub fn boundary_from_settings(settings: &IsolationSettings) -> IsolationBoundary {
    let boundary = IsolationBoundary::new(settings.default_tier);
    match &settings.worker_program {
        Some(program) => {
            boundary.with_process_worker(ProcessWorker::new(program.clone()).with_args(settings.worker_args.clone()))
        }
        None => boundary,
    }
}

pub struct AnalysisEngine {
    graph: Arc<CompiledWorkflow>,
    boundary: IsolationBoundary,
    coordinator: Arc<RecoveryCoordinator>,
    max_retries: u32,
    auto_recovery: bool,
    heartbeat_staleness: chrono::Duration,
    runs: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl AnalysisEngine {
    pub fn new(graph: CompiledWorkflow, boundary: IsolationBoundary, config: &PipelineConfig) -> Self {
        let graph = Arc::new(graph);
        let coordinator = Arc::new(RecoveryCoordinator::new(
            graph.clone(),
            boundary.clone(),
            RecoveryPolicy::from_config(config),
        ));
        Self {
            graph,
            boundary,
            coordinator,
            max_retries: config.recovery.max_retries,
            auto_recovery: config.recovery.auto_recovery,
            heartbeat_staleness: config.recovery.heartbeat_staleness(),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Engine running the contract analysis workflow
    pub fn contract_analysis(deps: PipelineDeps, services: WorkflowServices, config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let services = services
            .with_retry(config.retry.clone())
            .with_checkpoint_frequency(config.checkpoint.frequency_percent);
        let graph = contract_analysis_graph(deps, config).compile(services)?;
        Ok(Self::new(graph, boundary_from_settings(&config.isolation), config))
    }

    pub fn graph(&self) -> &Arc<CompiledWorkflow> {
        &self.graph
    }

    pub fn coordinator(&self) -> &Arc<RecoveryCoordinator> {
        &self.coordinator
    }

    pub fn boundary(&self) -> &IsolationBoundary {
        &self.boundary
    }

    /// Register a task and spawn its run
    ///
    /// A live task with the same idempotency key is returned instead of
    /// starting a second analysis.
    pub async fn start(&self, request: StartRequest) -> Result<StartAccepted> {
        let services = self.graph.services();
        let key = request.input.idempotency_key();

        let task_id = request.task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let entry = TaskRegistryEntry::new(&task_id, &key, &request.input.document_ref, &request.input.requester)
            .with_max_retries(self.max_retries)
            .with_auto_recovery(self.auto_recovery)
            .with_priority(request.priority);
        if let Creation::Existing(existing) = services.registry.create_unless_live(entry).await? {
            info!(task_id = %existing.task_id, "Duplicate submission, returning the running task");
            return Ok(StartAccepted {
                task_id: existing.task_id,
                duplicate: true,
            });
        }

        let state = AnalysisState::new(&task_id, request.input);
        self.graph.persist_state(&state).await?;
        info!(task_id = %task_id, requester = %state.input.requester, "Analysis accepted");

        let graph = self.graph.clone();
        let boundary = self.boundary.clone();
        let tier = request.tier;
        let handle = tokio::spawn(async move {
            let fallback = state.clone();
            match boundary.run_workflow(graph.clone(), state, StartPoint::Entry, tier).await {
                Ok(Ok(_)) => {}
                Ok(Err(failure)) => {
                    debug!(task_id = %fallback.task_id, kind = %failure.error.kind(), "Run ended with a failure");
                }
                Err(e) => {
                    graph.record_failure(fallback, e).await;
                }
            }
        });
        self.track(&task_id, handle).await;

        Ok(StartAccepted {
            task_id,
            duplicate: false,
        })
    }

    pub async fn status(&self, task_id: &str) -> Result<StatusSummary> {
        let services = self.graph.services();
        let entry = services.registry.require(task_id).await?;

        // The snapshot keeps the failing step; the registry only has kind and message
        let snapshot_error = match load_state(services.store.as_ref(), task_id).await {
            Ok(state) => state.and_then(|s| s.last_error().cloned()),
            Err(e) => {
                warn!(task_id, error = %e, "Cannot read state snapshot for status");
                None
            }
        };
        let (error_kind, error_step, error_message) = match (&entry.last_error, snapshot_error) {
            (None, _) => (None, None, None),
            (Some(summary), Some(record)) if record.kind.as_str() == summary.kind => {
                (Some(summary.kind.clone()), record.step, Some(record.message))
            }
            (Some(summary), _) => (Some(summary.kind.clone()), None, Some(summary.message.clone())),
        };

        Ok(StatusSummary {
            task_id: entry.task_id.clone(),
            state: entry.state,
            current_step: entry.current_step.clone(),
            progress_percent: entry.progress_percent,
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            error_kind,
            error_step,
            error_message,
            eligible_for_auto_recovery: entry.eligible_for_auto_recovery(),
            updated_at: entry.updated_at,
        })
    }

    /// Manually re-enter a task through the recovery coordinator
    ///
    /// Completed, unknown and actively running tasks are rejected without
    /// touching the registry or the stores.
    pub async fn retry(&self, task_id: &str) -> Result<RetryResponse> {
        let rejected = |reason: &str| {
            Ok(RetryResponse::Rejected {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            })
        };

        let Some(entry) = self.graph.services().registry.get(task_id).await? else {
            return rejected("unknown task");
        };
        if entry.state == TaskState::Completed {
            return rejected("already completed");
        }
        if matches!(
            entry.state,
            TaskState::Processing | TaskState::Checkpoint | TaskState::Recovering
        ) && entry.is_heartbeat_fresh(Utc::now(), self.heartbeat_staleness)
        {
            return rejected("task is currently processing");
        }

        let coordinator = self.coordinator.clone();
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            match coordinator.recover(&id, RecoveryTrigger::Manual).await {
                Ok(report) => debug!(task_id = %id, outcome = ?report.outcome, "Manual retry finished"),
                Err(e) => warn!(task_id = %id, error = %e, "Manual retry failed"),
            }
        });
        self.track(task_id, handle).await;
        info!(task_id, "Manual retry accepted");

        Ok(RetryResponse::Accepted {
            task_id: task_id.to_string(),
        })
    }

    /// Request cancellation of a running task; false when it is not running here
    pub fn cancel(&self, task_id: &str) -> bool {
        self.boundary.cancel(task_id)
    }

    pub async fn recover_stale(&self) -> Result<Vec<RecoveryReport>> {
        self.coordinator.recover_stale().await
    }

    /// Periodic recovery scans at the configured interval
    pub fn spawn_recovery_scans(&self, interval: std::time::Duration) -> JoinHandle<()> {
        self.coordinator.clone().spawn_periodic(interval)
    }

    /// Wait for the background run most recently spawned for `task_id`
    pub async fn wait(&self, task_id: &str) -> Result<()> {
        let handle = self.runs.lock().await.remove(task_id);
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| PipelineError::Internal(format!("run of task {} aborted: {}", task_id, e))),
            None => Ok(()),
        }
    }

    async fn track(&self, task_id: &str, handle: JoinHandle<()>) {
        let mut runs = self.runs.lock().await;
        runs.retain(|_, h| !h.is_finished());
        runs.insert(task_id.to_string(), handle);
    }
}
