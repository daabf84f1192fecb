//! The contract analysis workflow
//!
//! ```text
//! validate_input (5) ─► extract_text (35) ─┬─ diagrams ──► analyze_diagrams (55) ─┐
//!        ▲                     ┆           └─ no_diagrams ────────────────────────┤
//!        └┄┄┄┄┄┄ restart ┄┄┄┄┄┄┘                                                   ▼
//!  compile_report (100) ◄─ generate_recommendations (95) ◄─ assess_risk (85) ◄─ check_compliance (70)
//! ```
//!
//! Steps reach their collaborators through [`PipelineDeps`]; nothing here
//! knows which OCR engine or model provider is behind the traits.

use crate::collaborators::{require_min_content, ExtractionService, GenerationProvider, PromptRenderer};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::graph::{Router, WorkflowGraph};
use crate::state::{
    steps, AnalysisState, ComplianceOutput, DiagramOutput, RecommendationsOutput, ReportOutput, RiskLevel,
    RiskOutput, StepOutput, ValidationOutput,
};
use crate::step::{Step, StepAction, StepConfig, StepContext};
use crate::store::{collections, DocumentStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routing labels after `extract_text`
pub mod routes {
    pub const DIAGRAMS: &str = "diagrams";
    pub const NO_DIAGRAMS: &str = "no_diagrams";
}

const SUPPORTED_DOCUMENT_TYPES: &[&str] = &["purchase_agreement", "lease_agreement", "contract_of_sale"];
const AUSTRALIAN_STATES: &[&str] = &["NSW", "VIC", "QLD", "SA", "WA", "TAS", "NT", "ACT"];

/// Longest contract excerpt placed in a prompt
const PROMPT_TEXT_LIMIT: usize = 12_000;

const DIAGRAM_PROMPT: &str = "Review the diagrams on pages {{pages}} of this {{document_type}}.\n\
Describe boundaries, easements and encroachments.\n\n{{text}}";

const COMPLIANCE_PROMPT: &str = "Check this {{document_type}} governed by {{jurisdiction}} law for \
compliance problems. List each issue on its own line starting with '- '.\n\n\
Diagram findings: {{diagrams}}\n\n{{text}}";

const RISK_PROMPT: &str = "Summarise the buyer's risk for a {{document_type}} with these \
compliance issues:\n{{issues}}";

const RECOMMENDATIONS_PROMPT: &str = "Risk level {{risk_level}}: {{risk_summary}}\n\
Give the buyer concrete recommendations, one per line starting with '- '.";

/// Collaborators shared by the contract steps
#[derive(Clone)]
pub struct PipelineDeps {
    pub extraction: Arc<dyn ExtractionService>,
    pub generator: Arc<dyn GenerationProvider>,
    pub renderer: Arc<dyn PromptRenderer>,
    pub store: Arc<dyn DocumentStore>,
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Lines of a model response that look like list items
fn bullet_lines(response: &str) -> Vec<String> {
    response
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .map(|item| item.trim().to_string())
        })
        .filter(|item| !item.is_empty())
        .collect()
}

fn risk_label(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
        RiskLevel::Critical => "critical",
    }
}

fn extracted_text(state: &AnalysisState) -> Result<&str> {
    state
        .extraction()
        .map(|e| e.text.as_str())
        .ok_or_else(|| PipelineError::Internal("extraction result has an unexpected type".to_string()))
}

/// Rejects inputs that cannot be analysed
pub struct ValidateInputStep;

#[async_trait]
impl Step for ValidateInputStep {
    async fn run(&self, _ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        let input = &state.input;
        let mut passed = Vec::new();

        if input.document_ref.trim().is_empty() {
            return Err(PipelineError::Validation("document reference is empty".to_string()));
        }
        passed.push("document_ref".to_string());

        if input.requester.trim().is_empty() {
            return Err(PipelineError::Validation("requester is empty".to_string()));
        }
        passed.push("requester".to_string());

        if !SUPPORTED_DOCUMENT_TYPES.contains(&input.document_type.as_str()) {
            return Err(PipelineError::Validation(format!(
                "unsupported document type '{}'",
                input.document_type
            )));
        }
        passed.push("document_type".to_string());

        if let Some(jurisdiction) = &input.australian_state {
            if !AUSTRALIAN_STATES.contains(&jurisdiction.to_ascii_uppercase().as_str()) {
                return Err(PipelineError::Validation(format!("unknown Australian state '{}'", jurisdiction)));
            }
            passed.push("australian_state".to_string());
        }

        Ok(StepAction::complete(StepOutput::Validation(ValidationOutput {
            document_type: input.document_type.clone(),
            checks_passed: passed,
        })))
    }
}

/// Extracts document text with the strategy selected by recovery
pub struct ExtractTextStep {
    service: Arc<dyn ExtractionService>,
    strategies: Vec<String>,
    min_chars: usize,
    low_confidence_threshold: f32,
}

impl ExtractTextStep {
    pub fn new(service: Arc<dyn ExtractionService>, config: &PipelineConfig) -> Self {
        Self {
            service,
            strategies: config.extraction.strategies.clone(),
            min_chars: config.extraction.min_chars,
            low_confidence_threshold: config.extraction.low_confidence_threshold,
        }
    }
}

#[async_trait]
impl Step for ExtractTextStep {
    async fn run(&self, _ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        let strategy = self.strategies.get(state.extraction_strategy).ok_or_else(|| {
            PipelineError::Validation(format!(
                "no extraction strategy at position {}",
                state.extraction_strategy
            ))
        })?;

        debug!(task_id = %state.task_id, strategy = %strategy, "Extracting document text");
        let output = self.service.extract(&state.input.document_ref, strategy).await?;
        require_min_content(&output, self.min_chars)?;

        let low_confidence = output.confidence < self.low_confidence_threshold;
        let confidence = output.confidence;
        let mut action = StepAction::complete(StepOutput::Extraction(output));
        if low_confidence {
            warn!(task_id = %state.task_id, confidence, "Low extraction confidence");
            action = action.with_warning(format!(
                "extraction confidence {:.2} is below {:.2}",
                confidence, self.low_confidence_threshold
            ));
        }
        Ok(action)
    }
}

/// Describes site plans and survey diagrams
pub struct AnalyzeDiagramsStep {
    deps: PipelineDeps,
    system_prompt: Option<String>,
}

impl AnalyzeDiagramsStep {
    pub fn new(deps: PipelineDeps, system_prompt: Option<String>) -> Self {
        Self { deps, system_prompt }
    }
}

#[async_trait]
impl Step for AnalyzeDiagramsStep {
    async fn run(&self, _ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        let pages = state.extraction().map(|e| e.diagram_pages()).unwrap_or_default();
        let vars = BTreeMap::from([
            (
                "pages",
                pages.iter().map(u32::to_string).collect::<Vec<_>>().join(", "),
            ),
            ("document_type", state.input.document_type.clone()),
            ("text", truncate(extracted_text(state)?, PROMPT_TEXT_LIMIT)),
        ]);
        let prompt = self.deps.renderer.render(DIAGRAM_PROMPT, &vars)?;
        let findings = self
            .deps
            .generator
            .generate(&prompt, self.system_prompt.as_deref())
            .await?;

        Ok(StepAction::complete(StepOutput::Diagrams(DiagramOutput {
            diagram_pages: pages,
            findings,
        })))
    }
}

/// Checks the contract against the governing state's rules
pub struct CheckComplianceStep {
    deps: PipelineDeps,
    system_prompt: Option<String>,
}

impl CheckComplianceStep {
    pub fn new(deps: PipelineDeps, system_prompt: Option<String>) -> Self {
        Self { deps, system_prompt }
    }
}

#[async_trait]
impl Step for CheckComplianceStep {
    async fn run(&self, _ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        let diagrams = state
            .result(steps::ANALYZE_DIAGRAMS)
            .and_then(StepOutput::as_diagrams)
            .map(|d| d.findings.clone())
            .unwrap_or_else(|| "none".to_string());
        let vars = BTreeMap::from([
            ("document_type", state.input.document_type.clone()),
            (
                "jurisdiction",
                state.input.australian_state.clone().unwrap_or_else(|| "Australian".to_string()),
            ),
            ("diagrams", diagrams),
            ("text", truncate(extracted_text(state)?, PROMPT_TEXT_LIMIT)),
        ]);
        let prompt = self.deps.renderer.render(COMPLIANCE_PROMPT, &vars)?;
        let response = self
            .deps
            .generator
            .generate(&prompt, self.system_prompt.as_deref())
            .await?;

        let issues = bullet_lines(&response);
        let summary = response
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with("- ") && !line.starts_with("* "))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} compliance issue(s) found", issues.len()));

        Ok(StepAction::complete(StepOutput::Compliance(ComplianceOutput { summary, issues })))
    }
}

/// Scores risk from the compliance findings
pub struct AssessRiskStep {
    deps: PipelineDeps,
    system_prompt: Option<String>,
}

impl AssessRiskStep {
    pub fn new(deps: PipelineDeps, system_prompt: Option<String>) -> Self {
        Self { deps, system_prompt }
    }

    /// 15 points per issue, capped at 100
    pub fn score(issues: usize) -> (u8, RiskLevel) {
        let score = (issues * 15).min(100) as u8;
        let level = match score {
            0..=20 => RiskLevel::Low,
            21..=50 => RiskLevel::Medium,
            51..=80 => RiskLevel::High,
            _ => RiskLevel::Critical,
        };
        (score, level)
    }
}

#[async_trait]
impl Step for AssessRiskStep {
    async fn run(&self, _ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        let issues = state
            .result(steps::CHECK_COMPLIANCE)
            .and_then(StepOutput::as_compliance)
            .map(|c| c.issues.clone())
            .unwrap_or_default();
        let (score, level) = Self::score(issues.len());

        let vars = BTreeMap::from([
            ("document_type", state.input.document_type.clone()),
            (
                "issues",
                if issues.is_empty() {
                    "none".to_string()
                } else {
                    issues.iter().map(|i| format!("- {}", i)).collect::<Vec<_>>().join("\n")
                },
            ),
        ]);
        let prompt = self.deps.renderer.render(RISK_PROMPT, &vars)?;
        let summary = self
            .deps
            .generator
            .generate(&prompt, self.system_prompt.as_deref())
            .await?;

        Ok(StepAction::complete(StepOutput::Risk(RiskOutput {
            level,
            score,
            summary: summary.trim().to_string(),
            factors: issues,
        })))
    }
}

pub struct GenerateRecommendationsStep {
    deps: PipelineDeps,
    system_prompt: Option<String>,
}

impl GenerateRecommendationsStep {
    pub fn new(deps: PipelineDeps, system_prompt: Option<String>) -> Self {
        Self { deps, system_prompt }
    }
}

#[async_trait]
impl Step for GenerateRecommendationsStep {
    async fn run(&self, _ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        let risk = state
            .result(steps::ASSESS_RISK)
            .and_then(StepOutput::as_risk)
            .ok_or_else(|| PipelineError::Internal("risk result has an unexpected type".to_string()))?;
        let vars = BTreeMap::from([
            ("risk_level", risk_label(risk.level).to_string()),
            ("risk_summary", risk.summary.clone()),
        ]);
        let prompt = self.deps.renderer.render(RECOMMENDATIONS_PROMPT, &vars)?;
        let response = self
            .deps
            .generator
            .generate(&prompt, self.system_prompt.as_deref())
            .await?;

        let mut items = bullet_lines(&response);
        if items.is_empty() && !response.trim().is_empty() {
            items.push(response.trim().to_string());
        }
        Ok(StepAction::complete(StepOutput::Recommendations(RecommendationsOutput { items })))
    }
}

/// Assembles the report and persists it to `analysis_results`
///
/// A re-run after the write committed returns the stored report untouched.
pub struct CompileReportStep {
    store: Arc<dyn DocumentStore>,
}

impl CompileReportStep {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn commit_key(task_id: &str) -> String {
        format!("{}/{}", collections::ANALYSIS_RESULTS, task_id)
    }

    fn assemble(state: &AnalysisState) -> Result<ReportOutput> {
        let compliance = state
            .result(steps::CHECK_COMPLIANCE)
            .and_then(StepOutput::as_compliance)
            .ok_or_else(|| PipelineError::Internal("compliance result has an unexpected type".to_string()))?;
        let risk = state
            .result(steps::ASSESS_RISK)
            .and_then(StepOutput::as_risk)
            .ok_or_else(|| PipelineError::Internal("risk result has an unexpected type".to_string()))?;
        let recommendations = state
            .result(steps::GENERATE_RECOMMENDATIONS)
            .and_then(StepOutput::as_recommendations)
            .map(|r| r.items.clone())
            .unwrap_or_default();

        let mut sections = BTreeMap::new();
        sections.insert("compliance".to_string(), compliance.summary.clone());
        sections.insert("risk".to_string(), risk.summary.clone());
        sections.insert(
            "recommendations".to_string(),
            recommendations.iter().map(|r| format!("- {}", r)).collect::<Vec<_>>().join("\n"),
        );
        if let Some(diagrams) = state.result(steps::ANALYZE_DIAGRAMS).and_then(StepOutput::as_diagrams) {
            sections.insert("diagrams".to_string(), diagrams.findings.clone());
        }

        Ok(ReportOutput {
            summary: format!(
                "{} risk (score {}): {} compliance issue(s), {} recommendation(s)",
                risk_label(risk.level),
                risk.score,
                compliance.issues.len(),
                recommendations.len()
            ),
            risk_level: risk.level,
            sections,
            generated_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Step for CompileReportStep {
    async fn run(&self, _ctx: &StepContext, state: &AnalysisState) -> Result<StepAction> {
        let key = Self::commit_key(&state.task_id);

        if state.is_committed(&key) {
            if let Some(stored) = self.store.get(collections::ANALYSIS_RESULTS, &state.task_id).await? {
                debug!(task_id = %state.task_id, "Report already committed, reusing it");
                let report: ReportOutput = serde_json::from_value(stored)?;
                return Ok(StepAction::complete(StepOutput::Report(report)).with_committed(key));
            }
        }

        let report = Self::assemble(state)?;
        self.store
            .put(
                collections::ANALYSIS_RESULTS,
                &state.task_id,
                serde_json::to_value(&report)?,
            )
            .await?;
        Ok(StepAction::complete(StepOutput::Report(report)).with_committed(key))
    }
}

fn configured(tag: &str, percent: u8, config: &PipelineConfig) -> StepConfig {
    let limits = config.steps.limits_for(tag);
    StepConfig::new(tag, percent)
        .with_timeouts(limits.soft_timeout(), limits.hard_timeout())
        .with_max_local_retries(limits.max_local_retries)
}

/// Router choosing the diagram branch when extraction found diagram pages
pub fn diagram_router() -> Router {
    Router::new([routes::DIAGRAMS, routes::NO_DIAGRAMS], |state: &AnalysisState| {
        let has_diagrams = state
            .extraction()
            .map(|e| !e.diagram_pages().is_empty())
            .unwrap_or(false);
        if has_diagrams {
            routes::DIAGRAMS.to_string()
        } else {
            routes::NO_DIAGRAMS.to_string()
        }
    })
}

/// Uncompiled contract analysis graph
pub fn contract_analysis_graph(deps: PipelineDeps, config: &PipelineConfig) -> WorkflowGraph {
    let min_chars = config.extraction.min_chars;
    let system_prompt = config.generation.system_prompt.clone();
    let mut graph = WorkflowGraph::new();

    graph
        .register_step(configured(steps::VALIDATE_INPUT, 5, config), Arc::new(ValidateInputStep))
        .register_step(
            configured(steps::EXTRACT_TEXT, 35, config)
                .requires(steps::VALIDATE_INPUT, 1)
                .checkpoint_worthy(),
            Arc::new(ExtractTextStep::new(deps.extraction.clone(), config)),
        )
        .register_step(
            configured(steps::ANALYZE_DIAGRAMS, 55, config).requires(steps::EXTRACT_TEXT, min_chars),
            Arc::new(AnalyzeDiagramsStep::new(deps.clone(), system_prompt.clone())),
        )
        .register_step(
            configured(steps::CHECK_COMPLIANCE, 70, config)
                .requires(steps::EXTRACT_TEXT, min_chars)
                .checkpoint_worthy(),
            Arc::new(CheckComplianceStep::new(deps.clone(), system_prompt.clone())),
        )
        .register_step(
            configured(steps::ASSESS_RISK, 85, config)
                .requires(steps::EXTRACT_TEXT, min_chars)
                .requires(steps::CHECK_COMPLIANCE, 1)
                .checkpoint_worthy(),
            Arc::new(AssessRiskStep::new(deps.clone(), system_prompt.clone())),
        )
        .register_step(
            configured(steps::GENERATE_RECOMMENDATIONS, 95, config)
                .requires(steps::EXTRACT_TEXT, min_chars)
                .requires(steps::ASSESS_RISK, 1),
            Arc::new(GenerateRecommendationsStep::new(deps.clone(), system_prompt)),
        )
        .register_step(
            configured(steps::COMPILE_REPORT, 100, config)
                .requires(steps::EXTRACT_TEXT, min_chars)
                .requires(steps::CHECK_COMPLIANCE, 1)
                .requires(steps::ASSESS_RISK, 1)
                .requires(steps::GENERATE_RECOMMENDATIONS, 1),
            Arc::new(CompileReportStep::new(deps.store.clone())),
        )
        .add_edge(steps::VALIDATE_INPUT, steps::EXTRACT_TEXT)
        .add_conditional_edges(
            steps::EXTRACT_TEXT,
            Some(diagram_router()),
            [
                (routes::DIAGRAMS, steps::ANALYZE_DIAGRAMS),
                (routes::NO_DIAGRAMS, steps::CHECK_COMPLIANCE),
            ],
        )
        .add_edge(steps::ANALYZE_DIAGRAMS, steps::CHECK_COMPLIANCE)
        .add_edge(steps::CHECK_COMPLIANCE, steps::ASSESS_RISK)
        .add_edge(steps::ASSESS_RISK, steps::GENERATE_RECOMMENDATIONS)
        .add_edge(steps::GENERATE_RECOMMENDATIONS, steps::COMPILE_REPORT)
        .add_restart_edge(steps::EXTRACT_TEXT, steps::VALIDATE_INPUT)
        .set_entry(steps::VALIDATE_INPUT)
        .set_finish(steps::COMPILE_REPORT);

    graph
}
