//! Workflow graph definition, validation and execution
//!
//! A [`WorkflowGraph`] is built once with chained `&mut Self` calls, then
//! [`compile`](WorkflowGraph::compile)d. Compilation runs every structural
//! check up front so that routing can never hit a missing edge at run time.
//!
//! ```text
//!  validate_input ──► extract_text ──┬─ diagrams ────► analyze_diagrams ──┐
//!        ▲                 ┆         └─ no_diagrams ─────────────────────┤
//!        └┄┄┄┄ restart ┄┄┄┄┘                                              ▼
//!                                   compile_report ◄── ... ◄── check_compliance
//! ```
//!
//! Forward edges must form a DAG along which the progress percentage strictly
//! increases. Restart edges point backwards and are only followed by the
//! recovery coordinator on a clean restart; they take no part in routing.

use crate::error::{PipelineError, Result};
use crate::state::{AnalysisState, StepTag};
use crate::step::{ArtifactRequirement, Step, StepConfig, StepExecutor, StepOutcome, WorkflowServices};
use crate::store::save_state;
use analysis_checkpoint::{TaskRegistryEntry, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pure routing function evaluated after a step completes
#[derive(Clone)]
pub struct Router {
    labels: Vec<String>,
    route: Arc<dyn Fn(&AnalysisState) -> String + Send + Sync>,
}

impl Router {
    /// `labels` lists every label `route` may return
    pub fn new<F>(labels: impl IntoIterator<Item = impl Into<String>>, route: F) -> Self
    where
        F: Fn(&AnalysisState) -> String + Send + Sync + 'static,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            route: Arc::new(route),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn route(&self, state: &AnalysisState) -> String {
        (self.route)(state)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("labels", &self.labels).finish()
    }
}

#[derive(Debug, Clone)]
enum Edge {
    Direct(StepTag),
    Conditional {
        router: Option<Router>,
        branches: BTreeMap<String, StepTag>,
    },
}

impl Edge {
    fn targets(&self) -> Vec<&StepTag> {
        match self {
            Edge::Direct(to) => vec![to],
            Edge::Conditional { branches, .. } => branches.values().collect(),
        }
    }
}

/// Where a run begins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "step", rename_all = "snake_case")]
pub enum StartPoint {
    Entry,
    At(StepTag),
}

/// A run that stopped on an error, with the state at that point
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub state: Box<AnalysisState>,
    pub error: PipelineError,
}

impl RunFailure {
    pub fn new(state: AnalysisState, error: PipelineError) -> Self {
        Self {
            state: Box::new(state),
            error,
        }
    }
}

/// Final state, or the state the run failed in
pub type RunResult = std::result::Result<AnalysisState, RunFailure>;

/// Builder for the step graph
#[derive(Default)]
pub struct WorkflowGraph {
    nodes: BTreeMap<StepTag, (StepConfig, Arc<dyn Step>)>,
    edges: BTreeMap<StepTag, Edge>,
    restart_edges: BTreeMap<StepTag, StepTag>,
    entry: Option<StepTag>,
    finish: BTreeSet<StepTag>,
    build_errors: Vec<String>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_step(&mut self, config: StepConfig, step: Arc<dyn Step>) -> &mut Self {
        if self.nodes.contains_key(&config.tag) {
            self.build_errors
                .push(format!("step '{}' is registered twice", config.tag));
            return self;
        }
        self.nodes.insert(config.tag.clone(), (config, step));
        self
    }

    pub fn add_edge(&mut self, from: impl Into<StepTag>, to: impl Into<StepTag>) -> &mut Self {
        let from = from.into();
        if self.edges.contains_key(&from) {
            self.build_errors
                .push(format!("step '{}' already has outgoing edges", from));
            return self;
        }
        self.edges.insert(from, Edge::Direct(to.into()));
        self
    }

    /// Route by label after `from` completes
    ///
    /// The label is the one the step returned with
    /// [`StepAction::with_route`](crate::step::StepAction::with_route) or,
    /// when it returned none, the router's choice.
    pub fn add_conditional_edges(
        &mut self,
        from: impl Into<StepTag>,
        router: Option<Router>,
        branches: impl IntoIterator<Item = (impl Into<String>, impl Into<StepTag>)>,
    ) -> &mut Self {
        let from = from.into();
        if self.edges.contains_key(&from) {
            self.build_errors
                .push(format!("step '{}' already has outgoing edges", from));
            return self;
        }
        let branches = branches
            .into_iter()
            .map(|(label, to)| (label.into(), to.into()))
            .collect();
        self.edges.insert(from, Edge::Conditional { router, branches });
        self
    }

    /// Re-entry point used when `from` fails and the task is cleanly restarted
    pub fn add_restart_edge(&mut self, from: impl Into<StepTag>, to: impl Into<StepTag>) -> &mut Self {
        self.restart_edges.insert(from.into(), to.into());
        self
    }

    pub fn set_entry(&mut self, tag: impl Into<StepTag>) -> &mut Self {
        self.entry = Some(tag.into());
        self
    }

    pub fn set_finish(&mut self, tag: impl Into<StepTag>) -> &mut Self {
        self.finish.insert(tag.into());
        self
    }

    /// Structural checks run by [`compile`](Self::compile)
    pub fn validate(&self) -> Result<()> {
        if let Some(first) = self.build_errors.first() {
            return Err(PipelineError::Configuration(first.clone()));
        }

        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| PipelineError::Configuration("graph has no entry step".to_string()))?;
        if !self.nodes.contains_key(entry) {
            return Err(config_error(format!("entry step '{}' is not registered", entry)));
        }
        if self.finish.is_empty() {
            return Err(config_error("graph has no finish step"));
        }

        for tag in &self.finish {
            if !self.nodes.contains_key(tag) {
                return Err(config_error(format!("finish step '{}' is not registered", tag)));
            }
            if self.edges.contains_key(tag) {
                return Err(config_error(format!("finish step '{}' has outgoing edges", tag)));
            }
        }

        for (from, edge) in &self.edges {
            let (config, _) = self
                .nodes
                .get(from)
                .ok_or_else(|| config_error(format!("edge source '{}' is not registered", from)))?;
            for to in edge.targets() {
                if !self.nodes.contains_key(to) {
                    return Err(config_error(format!("edge target '{}' from '{}' is not registered", to, from)));
                }
            }
            self.validate_labels(config, edge)?;
        }

        for tag in self.nodes.keys() {
            if !self.finish.contains(tag) && !self.edges.contains_key(tag) {
                return Err(config_error(format!("step '{}' has no outgoing edge", tag)));
            }
        }

        self.check_acyclic()?;

        let reachable = self.reachable_from(entry);
        if let Some(orphan) = self.nodes.keys().find(|tag| !reachable.contains(*tag)) {
            return Err(config_error(format!("step '{}' is unreachable from the entry", orphan)));
        }

        for (from, edge) in &self.edges {
            let from_pct = self.nodes[from].0.target_percent;
            for to in edge.targets() {
                let to_pct = self.nodes[to].0.target_percent;
                if to_pct <= from_pct {
                    return Err(config_error(format!(
                        "progress must increase along '{}' ({}%) -> '{}' ({}%)",
                        from, from_pct, to, to_pct
                    )));
                }
            }
        }
        if let Some((tag, (config, _))) = self.nodes.iter().find(|(_, (c, _))| c.target_percent > 100) {
            return Err(config_error(format!("step '{}' targets {}%", tag, config.target_percent)));
        }

        let ancestors = self.ancestors();
        for (tag, (config, _)) in &self.nodes {
            for req in &config.requires {
                if !self.nodes.contains_key(&req.step) {
                    return Err(config_error(format!(
                        "step '{}' requires unregistered step '{}'",
                        tag, req.step
                    )));
                }
                if !ancestors[tag].contains(&req.step) {
                    return Err(config_error(format!(
                        "step '{}' requires '{}', which does not precede it",
                        tag, req.step
                    )));
                }
            }
        }

        for (from, to) in &self.restart_edges {
            if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
                return Err(config_error(format!("restart edge '{}' -> '{}' names an unregistered step", from, to)));
            }
            if from != to && !ancestors[from].contains(to) {
                return Err(config_error(format!(
                    "restart target '{}' does not precede '{}'",
                    to, from
                )));
            }
        }

        Ok(())
    }

    fn validate_labels(&self, config: &StepConfig, edge: &Edge) -> Result<()> {
        match edge {
            Edge::Direct(_) if !config.labels.is_empty() => Err(config_error(format!(
                "step '{}' returns routing labels but has a direct edge",
                config.tag
            ))),
            Edge::Direct(_) => Ok(()),
            Edge::Conditional { router, branches } => {
                if router.is_none() && config.labels.is_empty() {
                    return Err(config_error(format!(
                        "conditional edges from '{}' have neither a router nor step labels",
                        config.tag
                    )));
                }
                let declared = router
                    .iter()
                    .flat_map(|r| r.labels().iter())
                    .chain(config.labels.iter());
                for label in declared {
                    if !branches.contains_key(label) {
                        return Err(config_error(format!(
                            "label '{}' from '{}' has no branch",
                            label, config.tag
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a WorkflowGraph,
            tag: &'a StepTag,
            marks: &mut HashMap<&'a StepTag, Mark>,
        ) -> Result<()> {
            match marks.get(tag) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(config_error(format!("forward edges form a cycle through '{}'", tag)))
                }
                None => {}
            }
            marks.insert(tag, Mark::Visiting);
            if let Some(edge) = graph.edges.get(tag) {
                for to in edge.targets() {
                    visit(graph, to, marks)?;
                }
            }
            marks.insert(tag, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for tag in self.nodes.keys() {
            visit(self, tag, &mut marks)?;
        }
        Ok(())
    }

    fn reachable_from(&self, start: &StepTag) -> BTreeSet<StepTag> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(tag) = queue.pop_front() {
            if !seen.insert(tag.clone()) {
                continue;
            }
            if let Some(edge) = self.edges.get(&tag) {
                queue.extend(edge.targets().into_iter().cloned());
            }
        }
        seen
    }

    /// Strict forward ancestors of every node
    fn ancestors(&self) -> HashMap<StepTag, BTreeSet<StepTag>> {
        self.nodes
            .keys()
            .map(|tag| {
                let ancestors = self
                    .nodes
                    .keys()
                    .filter(|other| *other != tag && self.reachable_from(other).contains(tag))
                    .cloned()
                    .collect();
                (tag.clone(), ancestors)
            })
            .collect()
    }

    /// Validate and freeze the graph
    pub fn compile(self, services: WorkflowServices) -> Result<CompiledWorkflow> {
        self.validate()?;
        let entry = self
            .entry
            .ok_or_else(|| PipelineError::Configuration("graph has no entry step".to_string()))?;

        debug!(steps = self.nodes.len(), entry = %entry, "Compiled workflow graph");
        Ok(CompiledWorkflow {
            executors: self
                .nodes
                .into_iter()
                .map(|(tag, (config, step))| (tag, StepExecutor::new(config, step)))
                .collect(),
            edges: self.edges,
            restart_edges: self.restart_edges,
            entry,
            finish: self.finish,
            services,
        })
    }
}

fn config_error(message: impl Into<String>) -> PipelineError {
    PipelineError::Configuration(message.into())
}

/// Validated, executable workflow
pub struct CompiledWorkflow {
    executors: BTreeMap<StepTag, StepExecutor>,
    edges: BTreeMap<StepTag, Edge>,
    restart_edges: BTreeMap<StepTag, StepTag>,
    entry: StepTag,
    finish: BTreeSet<StepTag>,
    services: WorkflowServices,
}

impl CompiledWorkflow {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn services(&self) -> &WorkflowServices {
        &self.services
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.executors.contains_key(tag)
    }

    pub fn step_config(&self, tag: &str) -> Option<&StepConfig> {
        self.executors.get(tag).map(StepExecutor::config)
    }

    pub fn is_finish(&self, tag: &str) -> bool {
        self.finish.contains(tag)
    }

    /// Declared restart target of `tag`, if any
    pub fn restart_target(&self, tag: &str) -> Option<&str> {
        self.restart_edges.get(tag).map(String::as_str)
    }

    /// Requirements of `tag` that `state` does not satisfy
    pub fn missing_artifacts(&self, tag: &str, state: &AnalysisState) -> Vec<ArtifactRequirement> {
        self.step_config(tag)
            .map(|config| {
                config
                    .requires
                    .iter()
                    .filter(|req| !state.has_artifact(&req.step, req.min_content_len))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Step that follows `from`; `None` once a finish step completes
    pub fn next_step(&self, from: &str, label: Option<&str>, state: &AnalysisState) -> Result<Option<StepTag>> {
        if self.finish.contains(from) {
            return Ok(None);
        }
        match self.edges.get(from) {
            Some(Edge::Direct(to)) => Ok(Some(to.clone())),
            Some(Edge::Conditional { router, branches }) => {
                let label = match (label, router) {
                    (Some(label), _) => label.to_string(),
                    (None, Some(router)) => router.route(state),
                    (None, None) => {
                        return Err(config_error(format!("step '{}' completed without a routing label", from)))
                    }
                };
                branches
                    .get(&label)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| config_error(format!("no branch for label '{}' after '{}'", label, from)))
            }
            None => Err(config_error(format!("step '{}' has no outgoing edge", from))),
        }
    }

    /// Run from the entry step
    pub async fn run(&self, state: AnalysisState) -> RunResult {
        let entry = self.entry.clone();
        self.drive(state, entry).await
    }

    /// Run from `tag` without re-running earlier steps
    pub async fn run_from(&self, state: AnalysisState, tag: &str) -> RunResult {
        if !self.contains(tag) {
            let err = config_error(format!("cannot resume at unregistered step '{}'", tag));
            return Err(self.record_failure(state, err).await);
        }
        self.drive(state, tag.to_string()).await
    }

    pub async fn run_at(&self, state: AnalysisState, start: StartPoint) -> RunResult {
        match start {
            StartPoint::Entry => self.run(state).await,
            StartPoint::At(tag) => self.run_from(state, &tag).await,
        }
    }

    async fn drive(&self, mut state: AnalysisState, mut current: StepTag) -> RunResult {
        info!(
            task_id = %state.task_id,
            start = %current,
            generation = state.generation,
            retry_count = state.retry_count,
            "Workflow run started"
        );
        let mut reruns: u32 = 0;

        loop {
            let Some(executor) = self.executors.get(&current) else {
                let err = PipelineError::Internal(format!("step '{}' vanished from the graph", current));
                return Err(self.record_failure(state, err).await);
            };
            state.current_step = current.clone();

            let (next_state, outcome) = executor.execute(&self.services, state).await;
            state = next_state;

            match outcome {
                StepOutcome::Advance(label) => {
                    reruns = 0;
                    if let Err(e) = self.persist_state(&state).await {
                        return Err(self.record_failure(state, e).await);
                    }
                    match self.next_step(&current, label.as_deref(), &state) {
                        Ok(Some(next)) => {
                            debug!(task_id = %state.task_id, from = %current, to = %next, "Transition");
                            current = next;
                        }
                        Ok(None) => {
                            self.mark_completed(&state).await;
                            info!(task_id = %state.task_id, "Workflow run completed");
                            return Ok(state);
                        }
                        Err(e) => return Err(self.record_failure(state, e).await),
                    }
                }
                StepOutcome::RetrySameStep(reason) => {
                    reruns += 1;
                    if reruns > executor.config().max_local_retries {
                        let err = PipelineError::StepRetriesExhausted {
                            step: current.clone(),
                            attempts: reruns,
                            reason,
                        };
                        return Err(self.record_failure(state, err).await);
                    }
                }
                StepOutcome::Fail(err) => return Err(self.record_failure(state, err).await),
            }
        }
    }

    /// Write the state snapshot to `analysis_states`
    pub async fn persist_state(&self, state: &AnalysisState) -> Result<()> {
        save_state(self.services.store.as_ref(), state).await
    }

    async fn mark_completed(&self, state: &AnalysisState) {
        let step = state.current_step.clone();
        let percent = state.progress_percent;
        let retry_count = state.retry_count;
        let complete = move |entry: &mut TaskRegistryEntry| {
            entry.state = TaskState::Completed;
            entry.last_error = None;
            entry.retry_count = entry.retry_count.max(retry_count);
            entry.touch(Some(&step), percent);
        };
        if let Err(e) = self.services.registry.update(&state.task_id, &complete).await {
            warn!(task_id = %state.task_id, error = %e, "Failed to mark task completed");
        }
        self.services.notifier.finish_task(&state.task_id);
    }

    /// Record `error` in the state and registry and build the failure
    ///
    /// Cancelled runs become `partial`, everything else `failed`.
    pub async fn record_failure(&self, mut state: AnalysisState, error: PipelineError) -> RunFailure {
        let step = state.current_step.clone();
        state.push_error(error.to_record(Some(&step)));

        let next_state = if matches!(error.kind(), crate::error::ErrorKind::Cancelled) {
            TaskState::Partial
        } else {
            TaskState::Failed
        };
        let summary = error.summary();
        let percent = state.progress_percent;
        let retry_count = state.retry_count;
        let fail = move |entry: &mut TaskRegistryEntry| {
            entry.state = next_state;
            entry.last_error = Some(summary.clone());
            entry.retry_count = entry.retry_count.max(retry_count);
            entry.touch(Some(&step), percent);
        };
        if let Err(e) = self.services.registry.update(&state.task_id, &fail).await {
            warn!(task_id = %state.task_id, error = %e, "Failed to record task failure in the registry");
        }
        self.services.notifier.finish_task(&state.task_id);
        if let Err(e) = self.persist_state(&state).await {
            warn!(task_id = %state.task_id, error = %e, "Failed to persist state of failed run");
        }

        warn!(
            task_id = %state.task_id,
            step = %state.current_step,
            kind = %error.kind(),
            recoverable = error.is_recoverable(),
            error = %error,
            "Workflow run failed"
        );
        RunFailure::new(state, error)
    }

    /// Mermaid flowchart of the graph
    pub fn describe(&self) -> String {
        let mut out = String::from("graph TD\n");

        for (tag, executor) in &self.executors {
            let config = executor.config();
            let shape = if tag == &self.entry || self.finish.contains(tag) {
                format!("([\"{} {}%\"])", escape_mermaid(tag), config.target_percent)
            } else {
                format!("[\"{} {}%\"]", escape_mermaid(tag), config.target_percent)
            };
            out.push_str(&format!("    {}{}\n", sanitize_id(tag), shape));
        }

        for (from, edge) in &self.edges {
            match edge {
                Edge::Direct(to) => {
                    out.push_str(&format!("    {} --> {}\n", sanitize_id(from), sanitize_id(to)));
                }
                Edge::Conditional { branches, .. } => {
                    for (label, to) in branches {
                        out.push_str(&format!(
                            "    {} -->|{}| {}\n",
                            sanitize_id(from),
                            escape_mermaid(label),
                            sanitize_id(to)
                        ));
                    }
                }
            }
        }

        for (from, to) in &self.restart_edges {
            out.push_str(&format!("    {} -.->|restart| {}\n", sanitize_id(from), sanitize_id(to)));
        }
        out
    }
}

impl fmt::Debug for CompiledWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledWorkflow")
            .field("entry", &self.entry)
            .field("steps", &self.executors.keys().collect::<Vec<_>>())
            .field("finish", &self.finish)
            .finish()
    }
}

fn escape_mermaid(s: &str) -> String {
    s.replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

fn sanitize_id(s: &str) -> String {
    s.replace('-', "_").replace('.', "_").replace(' ', "_")
}
