//! External collaborators of the analysis steps
//!
//! Steps never talk to OCR engines, model providers or notification channels
//! directly. They receive these traits through their constructors, so a
//! deployment can swap implementations and tests can inject scripted ones.
//!
//! - [`ExtractionService`] turns a document reference into text, one strategy at a time
//! - [`GenerationProvider`] produces text from a prompt; [`FallbackGenerator`]
//!   chains several of them
//! - [`NotificationSink`] receives progress events from the
//!   [`ProgressNotifier`](crate::progress::ProgressNotifier)
//! - [`PromptRenderer`] expands prompt templates
//!
//! Persistence lives in [`crate::store`].

use crate::error::{PipelineError, ProviderFailure, Result};
use crate::progress::ProgressEvent;
use crate::state::ExtractionOutput;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Document text extraction
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Extract the text of `document_ref` with the named strategy
    async fn extract(&self, document_ref: &str, strategy: &str) -> Result<ExtractionOutput>;
}

/// Fail with `InsufficientContent` when an extraction is below `minimum` characters
pub fn require_min_content(output: &ExtractionOutput, minimum: usize) -> Result<()> {
    let chars = output.char_count();
    if chars < minimum {
        return Err(PipelineError::InsufficientContent {
            chars,
            minimum,
            strategy: output.strategy.clone(),
        });
    }
    Ok(())
}

/// Text generation backend
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String>;
}

/// Tries each provider in order and returns the first success
///
/// When every provider fails, the error lists each provider's failure
/// instead of only the last one.
#[derive(Clone)]
pub struct FallbackGenerator {
    providers: Vec<Arc<dyn GenerationProvider>>,
}

impl FallbackGenerator {
    pub fn new(providers: Vec<Arc<dyn GenerationProvider>>) -> Self {
        Self { providers }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }
}

#[async_trait]
impl GenerationProvider for FallbackGenerator {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn generate(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        if self.providers.is_empty() {
            return Err(PipelineError::Configuration(
                "no generation providers configured".to_string(),
            ));
        }

        let mut failures = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            match provider.generate(prompt, system_prompt).await {
                Ok(text) => {
                    if !failures.is_empty() {
                        debug!(
                            provider = provider.name(),
                            failed_before = failures.len(),
                            "Fallback provider succeeded"
                        );
                    }
                    return Ok(text);
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Generation provider failed");
                    failures.push(ProviderFailure {
                        provider: provider.name().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(PipelineError::ProvidersExhausted { failures })
    }
}

/// Destination of progress events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, event: &ProgressEvent) -> Result<()>;
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn send(&self, _event: &ProgressEvent) -> Result<()> {
        Ok(())
    }
}

/// Prompt template expansion
pub trait PromptRenderer: Send + Sync {
    fn render(&self, template: &str, vars: &BTreeMap<&str, String>) -> Result<String>;
}

/// `{{name}}` substitution; unknown placeholders are an error
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl PromptRenderer for TemplateRenderer {
    fn render(&self, template: &str, vars: &BTreeMap<&str, String>) -> Result<String> {
        let placeholder = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
            .map_err(|e| PipelineError::Internal(format!("placeholder pattern: {}", e)))?;

        let mut missing = Vec::new();
        let rendered = placeholder.replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            match vars.get(name) {
                Some(value) => value.clone(),
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        });

        if !missing.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "prompt template references unknown variables: {}",
                missing.join(", ")
            )));
        }
        Ok(rendered.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        reply: std::result::Result<&'static str, &'static str>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(name: &'static str, reply: &'static str) -> Arc<Self> {
            Arc::new(Self { name, reply: Ok(reply), calls: AtomicUsize::new(0) })
        }

        fn failing(name: &'static str, message: &'static str) -> Arc<Self> {
            Arc::new(Self { name, reply: Err(message), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl GenerationProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(str::to_string)
                .map_err(|m| PipelineError::TransientProvider(m.to_string()))
        }
    }

    #[tokio::test]
    async fn test_fallback_uses_next_provider() {
        let primary = Scripted::failing("gemini", "quota exceeded");
        let secondary = Scripted::ok("openai", "analysis");
        let generator = FallbackGenerator::new(vec![primary.clone(), secondary.clone()]);

        let text = generator.generate("prompt", None).await.unwrap();

        assert_eq!(text, "analysis");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_stops_at_first_success() {
        let primary = Scripted::ok("gemini", "first");
        let secondary = Scripted::ok("openai", "second");
        let generator = FallbackGenerator::new(vec![primary, secondary.clone()]);

        assert_eq!(generator.generate("p", None).await.unwrap(), "first");
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_aggregates_every_failure() {
        let generator = FallbackGenerator::new(vec![
            Scripted::failing("gemini", "quota exceeded"),
            Scripted::failing("openai", "503 unavailable"),
        ]);

        let err = generator.generate("p", None).await.unwrap_err();
        match err {
            PipelineError::ProvidersExhausted { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].provider, "gemini");
                assert!(failures[1].message.contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_chain_is_configuration_error() {
        let err = FallbackGenerator::new(vec![]).generate("p", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_template_renderer() {
        let mut vars = BTreeMap::new();
        vars.insert("state", "NSW".to_string());
        vars.insert("text", "Clause 1".to_string());

        let out = TemplateRenderer
            .render("Review this {{ state }} contract:\n{{text}}", &vars)
            .unwrap();
        assert_eq!(out, "Review this NSW contract:\nClause 1");

        let err = TemplateRenderer.render("{{missing}}", &vars).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_require_min_content() {
        let short = ExtractionOutput::new("x".repeat(50), "standard");
        let err = require_min_content(&short, 200).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientContent { chars: 50, minimum: 200, .. }
        ));
        assert!(require_min_content(&short, 50).is_ok());
    }
}
