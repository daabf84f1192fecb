//! Isolation boundary for task execution
//!
//! Each analysis task runs inside its own [`IsolationContext`]. Resources that
//! must not outlive or escape a run (database connections, HTTP clients, any
//! handle bound to an async runtime) are pooled per context through
//! [`ScopedPool`]. A pooled handle that leaks into another context fails with
//! `CrossContextResource` at its next use, instead of corrupting the runtime
//! it was created on.
//!
//! # Tiers
//!
//! ```text
//! ┌────────────┬──────────────────────────────┬──────────────────────────────┐
//! │ Tier       │ Runs on                      │ Contains                     │
//! ├────────────┼──────────────────────────────┼──────────────────────────────┤
//! │ Context    │ caller's runtime, new task   │ pooled resources, cancel     │
//! │ Worker     │ dedicated thread + runtime   │ + runtime-bound handles      │
//! │ Process    │ child process, JSON on stdio │ + memory corruption, aborts  │
//! └────────────┴──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Worker is the default. The process tier speaks [`WorkerRequest`] /
//! [`WorkerResponse`] over stdin/stdout; the command line tool implements the
//! other end with its hidden `worker` subcommand.
//!
//! # Cancellation
//!
//! [`IsolationBoundary::cancel`] flips a watch channel observed by the
//! running context. The step executor checks it between steps and races it
//! against the running step, so a cancelled task stops at the next await point.

use crate::error::{ErrorRecord, PipelineError, Result};
use crate::graph::{CompiledWorkflow, RunFailure, RunResult, StartPoint};
use crate::state::AnalysisState;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_CONTEXT: IsolationContext;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How strongly a task is separated from its siblings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationTier {
    Context,
    #[default]
    Worker,
    Process,
}

impl IsolationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationTier::Context => "context",
            IsolationTier::Worker => "worker",
            IsolationTier::Process => "process",
        }
    }
}

impl fmt::Display for IsolationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one isolation context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    fn generate() -> Self {
        Self(format!("ctx-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read side of a cancellation signal
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolve once cancellation is requested; pending forever otherwise
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

struct ContextInner {
    id: ContextId,
    task_id: String,
    tier: IsolationTier,
    cancel: CancelToken,
    closed: Arc<AtomicBool>,
    pools: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    children: Mutex<Vec<AbortHandle>>,
}

/// Scope owning the resources of one task run
#[derive(Clone)]
pub struct IsolationContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationContext")
            .field("id", &self.inner.id)
            .field("task_id", &self.inner.task_id)
            .field("tier", &self.inner.tier)
            .finish()
    }
}

impl IsolationContext {
    fn new(task_id: &str, tier: IsolationTier, cancel: CancelToken) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ContextId::generate(),
                task_id: task_id.to_string(),
                tier,
                cancel,
                closed: Arc::new(AtomicBool::new(false)),
                pools: Mutex::new(HashMap::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Context of the task currently executing, if any
    pub fn try_current() -> Option<Self> {
        CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }

    pub fn id(&self) -> &ContextId {
        &self.inner.id
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    pub fn tier(&self) -> IsolationTier {
        self.inner.tier
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Run `future` inside this context
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT_CONTEXT.scope(self.clone(), future).await
    }

    /// Spawn a child task that inherits this context and dies with it
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(CURRENT_CONTEXT.scope(self.clone(), future));
        lock(&self.inner.children).push(handle.abort_handle());
        handle
    }

    /// Pool named `name` in this context, created with `factory` on first use
    pub fn pool<T, F>(&self, name: &str, factory: F) -> Result<ScopedPool<T>>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(PipelineError::CrossContextResource {
                resource: name.to_string(),
                owner: self.inner.id.to_string(),
                current: "a closed context".to_string(),
            });
        }

        let mut pools = lock(&self.inner.pools);
        if let Some(existing) = pools.get(name) {
            return existing
                .clone()
                .downcast::<ScopedPool<T>>()
                .map(|pool| (*pool).clone())
                .map_err(|_| {
                    PipelineError::Configuration(format!(
                        "pool '{}' already exists with a different resource type",
                        name
                    ))
                });
        }

        let pool = ScopedPool {
            name: name.to_string(),
            owner: self.inner.id.clone(),
            closed: self.inner.closed.clone(),
            idle: Arc::new(Mutex::new(Vec::new())),
            factory: Arc::new(factory),
        };
        pools.insert(name.to_string(), Arc::new(pool.clone()));
        debug!(context = %self.inner.id, pool = name, "Created scoped pool");
        Ok(pool)
    }

    /// Release pooled resources and abort child tasks
    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for child in lock(&self.inner.children).drain(..) {
            child.abort();
        }
        lock(&self.inner.pools).clear();
        debug!(context = %self.inner.id, task_id = %self.inner.task_id, "Closed isolation context");
    }
}

/// Resource pool bound to one [`IsolationContext`]
pub struct ScopedPool<T> {
    name: String,
    owner: ContextId,
    closed: Arc<AtomicBool>,
    idle: Arc<Mutex<Vec<T>>>,
    factory: Arc<dyn Fn() -> Result<T> + Send + Sync>,
}

impl<T> Clone for ScopedPool<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            owner: self.owner.clone(),
            closed: self.closed.clone(),
            idle: self.idle.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<T: Send + 'static> ScopedPool<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &ContextId {
        &self.owner
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.idle).len()
    }

    fn check_owner(&self) -> Result<()> {
        let current = IsolationContext::try_current();
        let same_context = current.as_ref().map(|ctx| ctx.id() == &self.owner).unwrap_or(false);

        if self.closed.load(Ordering::SeqCst) || !same_context {
            return Err(PipelineError::CrossContextResource {
                resource: self.name.clone(),
                owner: self.owner.to_string(),
                current: match current {
                    Some(ctx) if ctx.id() == &self.owner => "the same context after it closed".to_string(),
                    Some(ctx) => ctx.id().to_string(),
                    None => "outside any isolation context".to_string(),
                },
            });
        }
        Ok(())
    }

    /// Take an idle resource or create one
    pub fn acquire(&self) -> Result<Pooled<T>> {
        self.check_owner()?;
        let reused = lock(&self.idle).pop();
        let item = match reused {
            Some(item) => item,
            None => (self.factory)()?,
        };
        Ok(Pooled {
            item: Some(item),
            pool: self.clone(),
        })
    }
}

/// Resource borrowed from a [`ScopedPool`], returned on drop
pub struct Pooled<T: Send + 'static> {
    item: Option<T>,
    pool: ScopedPool<T>,
}

impl<T: Send + 'static> Pooled<T> {
    /// Access the resource; fails outside the owning context
    pub fn get(&self) -> Result<&T> {
        self.pool.check_owner()?;
        self.item
            .as_ref()
            .ok_or_else(|| PipelineError::Internal("pooled resource already released".to_string()))
    }

    pub fn get_mut(&mut self) -> Result<&mut T> {
        self.pool.check_owner()?;
        self.item
            .as_mut()
            .ok_or_else(|| PipelineError::Internal("pooled resource already released".to_string()))
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            if !self.pool.closed.load(Ordering::SeqCst) {
                lock(&self.pool.idle).push(item);
            }
        }
    }
}

/// Request sent to a process-tier worker on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: String,
    pub state: AnalysisState,
    pub start: StartPoint,
}

/// Response written by a process-tier worker on stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub state: AnalysisState,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
}

impl WorkerResponse {
    pub fn from_run(result: RunResult) -> Self {
        match result {
            Ok(state) => Self { state, error: None },
            Err(failure) => {
                let step = failure.state.current_step.clone();
                Self {
                    error: Some(failure.error.to_record(Some(&step))),
                    state: *failure.state,
                }
            }
        }
    }

    pub fn into_run(self) -> RunResult {
        match self.error {
            None => Ok(self.state),
            Some(record) => Err(RunFailure::new(self.state, PipelineError::from_record(&record))),
        }
    }
}

/// Executable that serves [`WorkerRequest`]s
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessWorker {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run one request in a child process; the child is killed on cancellation
    pub async fn run(&self, request: &WorkerRequest, cancel: CancelToken) -> Result<WorkerResponse> {
        let payload = serde_json::to_vec(request)?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::Internal(format!("failed to start worker {:?}: {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| PipelineError::Internal(format!("failed to send worker request: {}", e)))?;
        }

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| PipelineError::Internal(format!("worker process failed: {}", e)))?,
            _ = cancel.cancelled() => {
                return Err(PipelineError::Cancelled { task_id: request.task_id.clone() });
            }
        };

        if !output.status.success() {
            return Err(PipelineError::Internal(format!(
                "worker process exited with {}",
                output.status
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            PipelineError::Internal(format!("worker process returned an unreadable response: {}", e))
        })
    }
}

struct ActiveContext {
    id: ContextId,
    cancel: watch::Sender<bool>,
}

/// Registration of a running task; leaving happens on drop, so a run whose
/// future is dropped mid-flight still frees its task id
struct ActiveGuard<'a> {
    boundary: &'a IsolationBoundary,
    ctx: IsolationContext,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.boundary.leave(&self.ctx);
    }
}

/// Starts task runs in fresh isolation contexts and tracks them for cancellation
#[derive(Clone)]
pub struct IsolationBoundary {
    active: Arc<Mutex<HashMap<String, ActiveContext>>>,
    default_tier: IsolationTier,
    process_worker: Option<ProcessWorker>,
}

impl Default for IsolationBoundary {
    fn default() -> Self {
        Self::new(IsolationTier::default())
    }
}

impl IsolationBoundary {
    pub fn new(default_tier: IsolationTier) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            default_tier,
            process_worker: None,
        }
    }

    pub fn with_process_worker(mut self, worker: ProcessWorker) -> Self {
        self.process_worker = Some(worker);
        self
    }

    pub fn default_tier(&self) -> IsolationTier {
        self.default_tier
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        lock(&self.active).contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Request cancellation of a running task; false when nothing is running
    pub fn cancel(&self, task_id: &str) -> bool {
        match lock(&self.active).get(task_id) {
            Some(active) => {
                info!(task_id, context = %active.id, "Cancellation requested");
                active.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    fn enter(&self, task_id: &str, tier: IsolationTier) -> Result<ActiveGuard<'_>> {
        let mut active = lock(&self.active);
        if active.contains_key(task_id) {
            return Err(PipelineError::Internal(format!(
                "task {} is already running in an isolation context",
                task_id
            )));
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = IsolationContext::new(task_id, tier, CancelToken { rx: Some(cancel_rx) });
        active.insert(
            task_id.to_string(),
            ActiveContext {
                id: ctx.id().clone(),
                cancel: cancel_tx,
            },
        );
        debug!(task_id, context = %ctx.id(), tier = %tier, "Entered isolation context");
        Ok(ActiveGuard { boundary: self, ctx })
    }

    fn leave(&self, ctx: &IsolationContext) {
        ctx.close();
        let mut active = lock(&self.active);
        if active.get(ctx.task_id()).map(|a| &a.id == ctx.id()).unwrap_or(false) {
            if let Some(released) = active.remove(ctx.task_id()) {
                // work detached from a dropped run stops at its next cancellation check
                released.cancel.send_replace(true);
            }
        }
    }

    /// Run `f` in a fresh context of the given tier
    ///
    /// The process tier cannot run arbitrary closures; use
    /// [`IsolationBoundary::run_workflow`] for it.
    pub async fn run_isolated<F, Fut, T>(&self, task_id: &str, tier: IsolationTier, f: F) -> Result<T>
    where
        F: FnOnce(IsolationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if tier == IsolationTier::Process {
            return Err(PipelineError::Configuration(
                "the process tier only runs workflows".to_string(),
            ));
        }

        let guard = self.enter(task_id, tier)?;
        let ctx = guard.ctx.clone();
        let result = match tier {
            IsolationTier::Worker => run_on_worker_thread(ctx, f).await,
            _ => run_on_current_runtime(ctx, f).await,
        };
        drop(guard);
        result
    }

    /// Run a workflow for `state` in a fresh context
    ///
    /// The outer error reports an isolation failure (panic, crashed worker)
    /// that the workflow itself never saw; the inner result is the run
    /// outcome, already recorded in the registry.
    pub async fn run_workflow(
        &self,
        graph: Arc<CompiledWorkflow>,
        state: AnalysisState,
        start: StartPoint,
        tier: Option<IsolationTier>,
    ) -> Result<RunResult> {
        let tier = tier.unwrap_or(self.default_tier);
        let task_id = state.task_id.clone();
        let span = tracing::info_span!("isolated_run", task_id = %task_id, tier = %tier);

        match tier {
            IsolationTier::Process => {
                let worker = self.process_worker.clone().ok_or_else(|| {
                    PipelineError::Configuration("process tier requested but no worker program configured".to_string())
                })?;
                let guard = self.enter(&task_id, tier)?;
                let request = WorkerRequest {
                    task_id: task_id.clone(),
                    state,
                    start,
                };
                let response = worker.run(&request, guard.ctx.cancel_token()).instrument(span).await;
                drop(guard);
                Ok(response?.into_run())
            }
            _ => {
                self.run_isolated(&task_id, tier, move |_ctx| async move {
                    Ok(graph.run_at(state, start).await)
                })
                .instrument(span)
                .await
            }
        }
    }
}

async fn run_on_current_runtime<F, Fut, T>(ctx: IsolationContext, f: F) -> Result<T>
where
    F: FnOnce(IsolationContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let scoped = ctx.clone();
    let handle = tokio::spawn(CURRENT_CONTEXT.scope(scoped.clone(), f(scoped)));
    match handle.await {
        Ok(result) => result,
        Err(join_error) => {
            error!(task_id = %ctx.task_id(), error = %join_error, "Isolated task aborted");
            Err(PipelineError::Internal(format!("isolated task failed: {}", join_error)))
        }
    }
}

async fn run_on_worker_thread<F, Fut, T>(ctx: IsolationContext, f: F) -> Result<T>
where
    F: FnOnce(IsolationContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let scoped = ctx.clone();
    let thread_name = format!("analysis-{}", ctx.task_id());

    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = tx.send(Err(PipelineError::Internal(format!(
                        "failed to build worker runtime: {}",
                        e
                    ))));
                    return;
                }
            };
            let result = runtime.block_on(CURRENT_CONTEXT.scope(scoped.clone(), f(scoped)));
            let _ = tx.send(result);
        })
        .map_err(|e| PipelineError::Internal(format!("failed to spawn worker thread: {}", e)))?;

    rx.await.unwrap_or_else(|_| {
        warn!(task_id = %ctx.task_id(), "Worker thread terminated without a result");
        Err(PipelineError::Internal("worker thread terminated without a result".to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Connection {
        id: usize,
    }

    fn counting_factory(counter: Arc<AtomicUsize>) -> impl Fn() -> Result<Connection> + Send + Sync {
        move || {
            Ok(Connection {
                id: counter.fetch_add(1, Ordering::SeqCst),
            })
        }
    }

    #[tokio::test]
    async fn test_each_context_gets_its_own_pool() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let created = Arc::new(AtomicUsize::new(0));

        for task in ["a", "b"] {
            let factory = counting_factory(created.clone());
            boundary
                .run_isolated(task, IsolationTier::Context, move |ctx| async move {
                    let pool = ctx.pool("db", factory)?;
                    let first = pool.acquire()?;
                    drop(first);
                    // Released connection is reused within the context
                    let again = pool.acquire()?;
                    assert_eq!(pool.idle_count(), 0);
                    Ok(again.get()?.id)
                })
                .await
                .unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_leaked_handle_fails_in_other_context() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let created = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(created);

        let leaked = boundary
            .run_isolated("owner", IsolationTier::Context, move |ctx| async move {
                let pool = ctx.pool("db", factory)?;
                Ok(pool.acquire()?)
            })
            .await
            .unwrap();

        let err = boundary
            .run_isolated("intruder", IsolationTier::Context, move |_ctx| async move {
                leaked.get().map(|c| c.id)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::CrossContextResource { .. }));
    }

    #[tokio::test]
    async fn test_pool_unusable_outside_any_context() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let pool = boundary
            .run_isolated("t", IsolationTier::Context, |ctx| async move {
                ctx.pool("db", || Ok(1u32))
            })
            .await
            .unwrap();

        let err = pool.acquire().err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::CrossContextResource);
    }

    #[tokio::test]
    async fn test_pool_type_mismatch_is_configuration_error() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let err = boundary
            .run_isolated("t", IsolationTier::Context, |ctx| async move {
                ctx.pool("db", || Ok(1u32))?;
                ctx.pool("db", || Ok("s".to_string())).map(|_| ())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_worker_tier_runs_on_dedicated_thread() {
        let boundary = IsolationBoundary::default();
        let caller = std::thread::current().id();

        let (same_thread, task_id) = boundary
            .run_isolated("w1", IsolationTier::Worker, move |ctx| async move {
                let current = IsolationContext::try_current().map(|c| c.task_id().to_string());
                assert_eq!(ctx.tier(), IsolationTier::Worker);
                Ok((std::thread::current().id() == caller, current))
            })
            .await
            .unwrap();

        assert!(!same_thread);
        assert_eq!(task_id.as_deref(), Some("w1"));
        assert!(!boundary.is_active("w1"));
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_internal_error() {
        let boundary = IsolationBoundary::default();
        let err = boundary
            .run_isolated("p", IsolationTier::Worker, |_ctx| async move {
                if true {
                    panic!("step exploded");
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Internal(_)));
        assert!(!boundary.is_active("p"));
    }

    #[tokio::test]
    async fn test_cancel_reaches_running_context() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let runner = boundary.clone();

        let handle = tokio::spawn(async move {
            runner
                .run_isolated("c", IsolationTier::Context, |ctx| async move {
                    ctx.cancel_token().cancelled().await;
                    Ok(ctx.is_cancelled())
                })
                .await
        });

        while !boundary.is_active("c") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(boundary.cancel("c"));
        assert!(handle.await.unwrap().unwrap());
        assert!(!boundary.cancel("c"));
    }

    #[tokio::test]
    async fn test_duplicate_entry_rejected() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let runner = boundary.clone();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = tokio::spawn(async move {
            runner
                .run_isolated("dup", IsolationTier::Context, |_ctx| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        while !boundary.is_active("dup") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let second = boundary
            .run_isolated("dup", IsolationTier::Context, |_ctx| async move { Ok(()) })
            .await;
        assert!(second.is_err());

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_run_frees_task_for_next_run() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let runner = boundary.clone();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (stopped_tx, stopped_rx) = oneshot::channel::<()>();

        let run = tokio::spawn(async move {
            runner
                .run_isolated("dropped", IsolationTier::Context, move |ctx| async move {
                    let _ = started_tx.send(());
                    ctx.cancel_token().cancelled().await;
                    let _ = stopped_tx.send(());
                    Ok(())
                })
                .await
        });
        started_rx.await.unwrap();
        assert!(boundary.is_active("dropped"));

        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());
        assert!(!boundary.is_active("dropped"));
        stopped_rx.await.unwrap();

        let again = boundary
            .run_isolated("dropped", IsolationTier::Context, |_ctx| async move { Ok(7) })
            .await
            .unwrap();
        assert_eq!(again, 7);
        assert_eq!(boundary.active_count(), 0);
    }

    #[tokio::test]
    async fn test_children_aborted_when_context_closes() {
        let boundary = IsolationBoundary::new(IsolationTier::Context);
        let child = boundary
            .run_isolated("k", IsolationTier::Context, |ctx| async move {
                Ok(ctx.spawn(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }))
            })
            .await
            .unwrap();

        let joined = child.await;
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_process_tier_requires_worker_program() {
        let boundary = IsolationBoundary::new(IsolationTier::Process);
        let err = boundary
            .run_isolated("x", IsolationTier::Process, |_ctx| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
