//! Analysis state threaded through the step graph
//!
//! [`AnalysisState`] is the single value a run carries from step to step. It
//! is owned by exactly one running step at a time: the executor takes it by
//! value, hands the step a shared borrow, and moves it on to the next step
//! once the result is recorded.
//!
//! Step results are typed ([`StepOutput`]) and keyed by step tag. A result,
//! once written, is only ever replaced by a later successful run of the same
//! step; nothing else deletes it.

use crate::error::{ErrorRecord, PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of a step in the graph
pub type StepTag = String;

/// Tags of the contract analysis steps
pub mod steps {
    pub const VALIDATE_INPUT: &str = "validate_input";
    pub const EXTRACT_TEXT: &str = "extract_text";
    pub const ANALYZE_DIAGRAMS: &str = "analyze_diagrams";
    pub const CHECK_COMPLIANCE: &str = "check_compliance";
    pub const ASSESS_RISK: &str = "assess_risk";
    pub const GENERATE_RECOMMENDATIONS: &str = "generate_recommendations";
    pub const COMPILE_REPORT: &str = "compile_report";
}

/// Document submitted for analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInput {
    pub document_ref: String,
    pub requester: String,
    /// Hash of the document content, supplied by the caller
    pub content_fingerprint: String,
    #[serde(default = "default_document_type")]
    pub document_type: String,
    #[serde(default)]
    pub australian_state: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_document_type() -> String {
    "purchase_agreement".to_string()
}

impl DocumentInput {
    pub fn new(
        document_ref: impl Into<String>,
        requester: impl Into<String>,
        content_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            document_ref: document_ref.into(),
            requester: requester.into(),
            content_fingerprint: content_fingerprint.into(),
            document_type: default_document_type(),
            australian_state: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = document_type.into();
        self
    }

    pub fn with_australian_state(mut self, state: impl Into<String>) -> Self {
        self.australian_state = Some(state.into());
        self
    }

    /// SHA-256 of `requester \0 content_fingerprint`, hex encoded
    ///
    /// Two submissions of the same content by the same requester share a key.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.requester.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content_fingerprint.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Output of `validate_input`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutput {
    pub document_type: String,
    pub checks_passed: Vec<String>,
}

/// Per-page extraction statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub page: u32,
    pub text_chars: usize,
    pub confidence: f32,
    #[serde(default)]
    pub has_diagram: bool,
}

/// Output of `extract_text`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub text: String,
    pub confidence: f32,
    #[serde(default)]
    pub pages: Vec<PageResult>,
    pub strategy: String,
}

impl ExtractionOutput {
    pub fn new(text: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 1.0,
            pages: Vec::new(),
            strategy: strategy.into(),
        }
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    pub fn diagram_pages(&self) -> Vec<u32> {
        self.pages.iter().filter(|p| p.has_diagram).map(|p| p.page).collect()
    }
}

/// Output of `analyze_diagrams`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramOutput {
    pub diagram_pages: Vec<u32>,
    pub findings: String,
}

/// Output of `check_compliance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceOutput {
    pub summary: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Output of `assess_risk`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskOutput {
    pub level: RiskLevel,
    pub score: u8,
    pub summary: String,
    pub factors: Vec<String>,
}

/// Output of `generate_recommendations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationsOutput {
    pub items: Vec<String>,
}

/// Output of `compile_report`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportOutput {
    pub summary: String,
    pub risk_level: RiskLevel,
    pub sections: BTreeMap<String, String>,
    pub generated_at: DateTime<Utc>,
}

/// Typed result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StepOutput {
    Validation(ValidationOutput),
    Extraction(ExtractionOutput),
    Diagrams(DiagramOutput),
    Compliance(ComplianceOutput),
    Risk(RiskOutput),
    Recommendations(RecommendationsOutput),
    Report(ReportOutput),
    /// Free-form result for steps outside the contract pipeline
    Custom(Value),
}

impl StepOutput {
    /// Size of the substantive content, in characters
    ///
    /// Artifact requirements compare against this, so an extraction that
    /// returned an empty string counts as absent.
    pub fn content_len(&self) -> usize {
        match self {
            StepOutput::Validation(v) => v.checks_passed.len(),
            StepOutput::Extraction(e) => e.char_count(),
            StepOutput::Diagrams(d) => d.findings.chars().count(),
            StepOutput::Compliance(c) => {
                c.summary.chars().count() + c.issues.iter().map(|i| i.chars().count()).sum::<usize>()
            }
            StepOutput::Risk(r) => r.summary.chars().count().max(1),
            StepOutput::Recommendations(r) => r.items.iter().map(|i| i.chars().count()).sum(),
            StepOutput::Report(r) => r.summary.chars().count(),
            StepOutput::Custom(Value::Null) => 0,
            StepOutput::Custom(Value::String(s)) => s.chars().count(),
            StepOutput::Custom(other) => other.to_string().len(),
        }
    }

    pub fn as_extraction(&self) -> Option<&ExtractionOutput> {
        match self {
            StepOutput::Extraction(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_compliance(&self) -> Option<&ComplianceOutput> {
        match self {
            StepOutput::Compliance(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_risk(&self) -> Option<&RiskOutput> {
        match self {
            StepOutput::Risk(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_recommendations(&self) -> Option<&RecommendationsOutput> {
        match self {
            StepOutput::Recommendations(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_diagrams(&self) -> Option<&DiagramOutput> {
        match self {
            StepOutput::Diagrams(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_report(&self) -> Option<&ReportOutput> {
        match self {
            StepOutput::Report(r) => Some(r),
            _ => None,
        }
    }
}

/// State of one analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisState {
    pub task_id: String,
    pub idempotency_key: String,
    pub input: DocumentInput,
    pub current_step: StepTag,
    pub progress_percent: u8,
    #[serde(default)]
    pub step_results: BTreeMap<StepTag, StepOutput>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub warnings: Vec<ErrorRecord>,
    #[serde(default)]
    pub retry_count: u32,
    /// Bumped on every clean restart; progress events of older generations are stale
    #[serde(default)]
    pub generation: u32,
    /// Index into the configured extraction strategies
    #[serde(default)]
    pub extraction_strategy: usize,
    /// External writes already performed, keyed `collection/id`
    #[serde(default)]
    pub committed_writes: BTreeSet<String>,
    #[serde(default)]
    pub last_checkpoint_percent: Option<u8>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisState {
    pub fn new(task_id: impl Into<String>, input: DocumentInput) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            idempotency_key: input.idempotency_key(),
            input,
            current_step: String::new(),
            progress_percent: 0,
            step_results: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            retry_count: 0,
            generation: 0,
            extraction_strategy: 0,
            committed_writes: BTreeSet::new(),
            last_checkpoint_percent: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn result(&self, step: &str) -> Option<&StepOutput> {
        self.step_results.get(step)
    }

    pub fn record_result(&mut self, step: &str, output: StepOutput) {
        self.step_results.insert(step.to_string(), output);
        self.updated_at = Utc::now();
    }

    /// Whether `step` produced a result with at least `min_len` content
    ///
    /// A zero minimum still requires non-empty content.
    pub fn has_artifact(&self, step: &str, min_len: usize) -> bool {
        self.step_results
            .get(step)
            .map(|out| out.content_len() >= min_len.max(1))
            .unwrap_or(false)
    }

    pub fn extraction(&self) -> Option<&ExtractionOutput> {
        self.result(steps::EXTRACT_TEXT).and_then(StepOutput::as_extraction)
    }

    pub fn push_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
        self.updated_at = Utc::now();
    }

    pub fn push_warning(&mut self, record: ErrorRecord) {
        self.warnings.push(record);
        self.updated_at = Utc::now();
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }

    pub fn is_committed(&self, key: &str) -> bool {
        self.committed_writes.contains(key)
    }

    /// Reset for a clean re-run starting at `entry`
    ///
    /// Step results are kept; they are overwritten as steps re-run.
    pub fn reset_for_restart(&mut self, entry: &str, entry_percent: u8) {
        self.current_step = entry.to_string();
        self.progress_percent = entry_percent;
        self.errors.clear();
        self.generation += 1;
        self.last_checkpoint_percent = None;
        self.updated_at = Utc::now();
    }

    /// Step results in checkpoint form
    pub fn recoverable_data(&self) -> Result<BTreeMap<String, Value>> {
        self.step_results
            .iter()
            .map(|(tag, out)| Ok((tag.clone(), serde_json::to_value(out)?)))
            .collect()
    }

    /// Merge checkpointed results back into `step_results`
    pub fn load_recoverable_data(&mut self, data: &BTreeMap<String, Value>) -> Result<()> {
        for (tag, value) in data {
            let output: StepOutput = serde_json::from_value(value.clone()).map_err(|e| {
                PipelineError::Internal(format!("checkpoint data for '{}' is unreadable: {}", tag, e))
            })?;
            self.step_results.insert(tag.clone(), output);
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn input() -> DocumentInput {
        DocumentInput::new("doc-1", "alice", "fp-abc")
    }

    #[test]
    fn test_idempotency_key_stable_and_distinct() {
        let a = input().idempotency_key();
        let b = input().idempotency_key();
        let c = DocumentInput::new("doc-1", "bob", "fp-abc").idempotency_key();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_idempotency_key_separator_prevents_collisions() {
        let a = DocumentInput::new("d", "ab", "c").idempotency_key();
        let b = DocumentInput::new("d", "a", "bc").idempotency_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_has_artifact_rejects_empty_content() {
        let mut state = AnalysisState::new("t", input());
        state.record_result(
            steps::EXTRACT_TEXT,
            StepOutput::Extraction(ExtractionOutput::new("", "standard")),
        );

        assert!(!state.has_artifact(steps::EXTRACT_TEXT, 0));
        assert!(!state.has_artifact(steps::CHECK_COMPLIANCE, 0));

        state.record_result(
            steps::EXTRACT_TEXT,
            StepOutput::Extraction(ExtractionOutput::new("x".repeat(300), "standard")),
        );
        assert!(state.has_artifact(steps::EXTRACT_TEXT, 200));
        assert!(!state.has_artifact(steps::EXTRACT_TEXT, 301));
    }

    #[test]
    fn test_step_output_tagged_encoding() {
        let out = StepOutput::Compliance(ComplianceOutput {
            summary: "ok".into(),
            issues: vec![],
        });
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["kind"], "compliance");
        assert_eq!(value["data"]["summary"], "ok");
    }

    #[test]
    fn test_recoverable_data_restores_results() {
        let mut state = AnalysisState::new("t", input());
        state.record_result(
            steps::EXTRACT_TEXT,
            StepOutput::Extraction(ExtractionOutput::new("clause text", "standard")),
        );
        let data = state.recoverable_data().unwrap();

        let mut restored = AnalysisState::new("t", input());
        restored.load_recoverable_data(&data).unwrap();
        assert_eq!(restored.step_results, state.step_results);
    }

    #[test]
    fn test_restart_keeps_results_and_bumps_generation() {
        let mut state = AnalysisState::new("t", input());
        state.current_step = steps::ASSESS_RISK.into();
        state.progress_percent = 85;
        state.record_result(steps::VALIDATE_INPUT, StepOutput::Custom(Value::String("ok".into())));
        state.push_error(ErrorRecord::warning(ErrorKind::Timeout, "assess_risk", "slow"));

        state.reset_for_restart(steps::VALIDATE_INPUT, 5);

        assert_eq!(state.current_step, steps::VALIDATE_INPUT);
        assert_eq!(state.progress_percent, 5);
        assert_eq!(state.generation, 1);
        assert!(state.errors.is_empty());
        assert_eq!(state.step_results.len(), 1);
    }
}
