//! Offline stand-ins for the extraction and generation services
//!
//! Documents are plain text files. Pages are separated by form feeds; a page
//! whose first line is `[scanned]` is only readable by the `ocr_enhanced`
//! strategy, and a page containing `[diagram]` is reported as holding a
//! diagram.

use analysis_workflow::{
    ExtractionOutput, ExtractionService, GenerationProvider, NotificationSink, PageResult, PipelineError,
    ProgressEvent, Result,
};
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use tracing::info;

const SCANNED_MARKER: &str = "[scanned]";
const DIAGRAM_MARKER: &str = "[diagram]";
const PAGE_BREAK: char = '\u{c}';

/// Clause keywords and the finding reported when a prompt mentions them
const FINDINGS: &[(&str, &str)] = &[
    ("cooling-off", "cooling-off period terms need review"),
    ("special condition", "special conditions shift obligations to the purchaser"),
    ("penalty", "penalty interest applies to late settlement"),
    ("sunset", "sunset clause allows the vendor to rescind"),
    ("easement", "registered easement limits use of the land"),
    ("deposit", "deposit release terms are unusual"),
];

#[derive(Debug, Default)]
pub struct FileExtraction;

impl FileExtraction {
    fn read_pages(raw: &str, strategy: &str) -> Result<(String, Vec<PageResult>, f32)> {
        let include_scanned = match strategy {
            "standard" => false,
            "ocr_enhanced" => true,
            other => {
                return Err(PipelineError::Configuration(format!(
                    "unknown extraction strategy '{}'",
                    other
                )))
            }
        };

        let mut text = String::new();
        let mut pages = Vec::new();
        let mut scanned_pages = 0usize;
        for (index, page) in raw.split(PAGE_BREAK).enumerate() {
            let scanned = page.trim_start().starts_with(SCANNED_MARKER);
            let has_diagram = page.contains(DIAGRAM_MARKER);
            if scanned {
                scanned_pages += 1;
            }

            let readable = if scanned && !include_scanned {
                String::new()
            } else {
                page.replace(SCANNED_MARKER, "").replace(DIAGRAM_MARKER, "").trim().to_string()
            };
            let page_confidence = if scanned { 0.7 } else { 0.95 };
            pages.push(PageResult {
                page: index as u32 + 1,
                text_chars: readable.chars().count(),
                confidence: if readable.is_empty() { 0.0 } else { page_confidence },
                has_diagram,
            });
            if !readable.is_empty() {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&readable);
            }
        }

        let confidence = if scanned_pages > 0 && include_scanned { 0.7 } else { 0.95 };
        Ok((text, pages, confidence))
    }
}

#[async_trait]
impl ExtractionService for FileExtraction {
    async fn extract(&self, document_ref: &str, strategy: &str) -> Result<ExtractionOutput> {
        let path = document_ref.strip_prefix("file://").unwrap_or(document_ref);
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
            IoErrorKind::NotFound => PipelineError::Validation(format!("document {} not found", document_ref)),
            _ => PipelineError::TransientProvider(format!("cannot read {}: {}", document_ref, e)),
        })?;

        let (text, pages, confidence) = Self::read_pages(&raw, strategy)?;
        let mut output = ExtractionOutput::new(text, strategy);
        output.pages = pages;
        output.confidence = confidence;
        Ok(output)
    }
}

/// Deterministic keyword-driven generator
///
/// A provider named `offline:<name>` always fails, which exercises the
/// fallback chain.
#[derive(Debug, Clone)]
pub struct KeywordProvider {
    name: String,
    offline: bool,
}

impl KeywordProvider {
    pub fn new(name: &str) -> Self {
        match name.strip_prefix("offline:") {
            Some(rest) => Self {
                name: rest.to_string(),
                offline: true,
            },
            None => Self {
                name: name.to_string(),
                offline: false,
            },
        }
    }
}

#[async_trait]
impl GenerationProvider for KeywordProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, _system_prompt: Option<&str>) -> Result<String> {
        if self.offline {
            return Err(PipelineError::TransientProvider(format!("{} is offline", self.name)));
        }

        let lowered = prompt.to_lowercase();
        let findings: Vec<&str> = FINDINGS
            .iter()
            .filter(|(keyword, _)| lowered.contains(keyword))
            .map(|(_, finding)| *finding)
            .collect();

        let mut response = format!("Reviewed by {}: {} item(s) flagged.", self.name, findings.len());
        for finding in findings {
            response.push_str("\n- ");
            response.push_str(finding);
        }
        Ok(response)
    }
}

/// Writes progress events to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, event: &ProgressEvent) -> Result<()> {
        info!(
            task_id = %event.task_id,
            step = %event.step,
            percent = event.percent,
            generation = event.generation,
            "{}",
            event.message
        );
        Ok(())
    }
}
