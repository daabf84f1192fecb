//! Pipeline configuration
//!
//! Every tunable threshold of the pipeline lives in [`PipelineConfig`]. It
//! deserializes from YAML, with two preprocessing steps applied first:
//!
//! - `$include: other.yaml` replaces a mapping with the contents of another
//!   file, resolved relative to the including file
//! - `${ENV_VAR:default}` inside a string is replaced by the environment
//!   variable, or the default when it is unset
//!
//! ```yaml
//! checkpoint:
//!   frequency_percent: 20
//!   resume_threshold_percent: 25
//!   validate_only_threshold_percent: 95
//! recovery:
//!   max_retries: ${ANALYSIS_MAX_RETRIES:3}
//!   heartbeat_staleness_secs: 300
//! extraction:
//!   min_chars: 200
//!   strategies: [standard, ocr_enhanced]
//! retry:
//!   $include: retry.yaml
//! ```
//!
//! Missing sections fall back to [`Default`].

use crate::error::{PipelineError, Result};
use crate::isolation::IsolationTier;
use crate::progress::NotifierSettings;
use crate::retry::RetryPolicyTable;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_INCLUDE_DEPTH: usize = 16;

/// Checkpoint cadence and the thresholds that drive strategy selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Write a checkpoint at least every this many percentage points
    pub frequency_percent: u8,
    /// Resume from a checkpoint only above this progress
    pub resume_threshold_percent: u8,
    /// At or above this progress, recovery only verifies persisted results
    pub validate_only_threshold_percent: u8,
    pub retention_days: u32,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            frequency_percent: 20,
            resume_threshold_percent: 25,
            validate_only_threshold_percent: 95,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub max_retries: u32,
    pub auto_recovery: bool,
    /// A processing task whose heartbeat is older than this is interrupted
    pub heartbeat_staleness_secs: u64,
    /// A queued task older than this lost its dispatch
    pub queued_staleness_secs: u64,
    pub scan_interval_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            auto_recovery: true,
            heartbeat_staleness_secs: 300,
            queued_staleness_secs: 1800,
            scan_interval_secs: 60,
        }
    }
}

impl RecoverySettings {
    pub fn heartbeat_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_staleness_secs as i64)
    }

    pub fn queued_staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queued_staleness_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub min_chars: usize,
    /// Tried in order; a clean restart after insufficient content moves to the next
    pub strategies: Vec<String>,
    pub low_confidence_threshold: f32,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            min_chars: 200,
            strategies: vec!["standard".to_string(), "ocr_enhanced".to_string()],
            low_confidence_threshold: 0.6,
        }
    }
}

impl ExtractionSettings {
    pub fn strategy(&self, index: usize) -> Option<&str> {
        self.strategies.get(index).map(String::as_str)
    }

    pub fn has_fallback_after(&self, index: usize) -> bool {
        index + 1 < self.strategies.len()
    }
}

/// Timeouts and local retry budget of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepLimits {
    pub soft_timeout_secs: Option<f64>,
    pub hard_timeout_secs: Option<f64>,
    /// How often a step may ask to be re-run before the run fails
    pub max_local_retries: u32,
}

impl Default for StepLimits {
    fn default() -> Self {
        Self {
            soft_timeout_secs: Some(120.0),
            hard_timeout_secs: Some(600.0),
            max_local_retries: 2,
        }
    }
}

impl StepLimits {
    pub fn soft_timeout(&self) -> Option<Duration> {
        self.soft_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn hard_timeout(&self) -> Option<Duration> {
        self.hard_timeout_secs.map(Duration::from_secs_f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    pub default: StepLimits,
    pub overrides: BTreeMap<String, StepLimits>,
}

impl StepSettings {
    pub fn limits_for(&self, step: &str) -> &StepLimits {
        self.overrides.get(step).unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationSettings {
    pub default_tier: IsolationTier,
    /// Executable started for the process tier
    pub worker_program: Option<PathBuf>,
    pub worker_args: Vec<String>,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            default_tier: IsolationTier::Worker,
            worker_program: None,
            worker_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Provider names in fallback order
    pub providers: Vec<String>,
    pub system_prompt: Option<String>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            providers: vec!["primary".to_string(), "secondary".to_string()],
            system_prompt: None,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub checkpoint: CheckpointSettings,
    pub recovery: RecoverySettings,
    pub extraction: ExtractionSettings,
    pub steps: StepSettings,
    pub retry: RetryPolicyTable,
    pub notifier: NotifierSettings,
    pub isolation: IsolationSettings,
    pub generation: GenerationSettings,
}

impl PipelineConfig {
    /// Load from a YAML file, resolving includes and environment variables
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = load_yaml_file(path.as_ref(), 0)?;
        Self::from_yaml_value(yaml)
    }

    /// Parse YAML text; `$include` paths resolve against the working directory
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut value: YamlValue = serde_yaml::from_str(content)
            .map_err(|e| PipelineError::Configuration(format!("Failed to parse YAML: {}", e)))?;
        process_includes(&mut value, Path::new("."), 0)?;
        expand_variables(&mut value)?;
        Self::from_yaml_value(value)
    }

    fn from_yaml_value(value: YamlValue) -> Result<Self> {
        let config: Self = if value.is_null() {
            Self::default()
        } else {
            serde_yaml::from_value(value).map_err(|e| {
                PipelineError::Configuration(format!("Failed to deserialize configuration: {}", e))
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject threshold combinations that would make recovery incoherent
    pub fn validate(&self) -> Result<()> {
        let cp = &self.checkpoint;
        if cp.frequency_percent == 0 || cp.frequency_percent > 100 {
            return Err(PipelineError::Configuration(format!(
                "checkpoint.frequency_percent must be within 1..=100, got {}",
                cp.frequency_percent
            )));
        }
        if cp.validate_only_threshold_percent > 100 {
            return Err(PipelineError::Configuration(format!(
                "checkpoint.validate_only_threshold_percent must be at most 100, got {}",
                cp.validate_only_threshold_percent
            )));
        }
        if cp.resume_threshold_percent >= cp.validate_only_threshold_percent {
            return Err(PipelineError::Configuration(format!(
                "checkpoint.resume_threshold_percent ({}) must be below checkpoint.validate_only_threshold_percent ({})",
                cp.resume_threshold_percent, cp.validate_only_threshold_percent
            )));
        }
        if self.extraction.strategies.is_empty() {
            return Err(PipelineError::Configuration(
                "extraction.strategies must name at least one strategy".to_string(),
            ));
        }

        let limits = std::iter::once(("default", &self.steps.default)).chain(
            self.steps.overrides.iter().map(|(k, v)| (k.as_str(), v)),
        );
        for (name, l) in limits {
            if let (Some(soft), Some(hard)) = (l.soft_timeout_secs, l.hard_timeout_secs) {
                if soft > hard {
                    return Err(PipelineError::Configuration(format!(
                        "steps.{}: soft timeout {}s exceeds hard timeout {}s",
                        name, soft, hard
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load a YAML file with includes resolved and variables expanded
pub fn load_yaml_file(path: &Path, depth: usize) -> Result<YamlValue> {
    let content = fs::read_to_string(path).map_err(|e| {
        PipelineError::Configuration(format!("Failed to read YAML file {:?}: {}", path, e))
    })?;

    let mut value: YamlValue = serde_yaml::from_str(&content).map_err(|e| {
        PipelineError::Configuration(format!("Failed to parse YAML file {:?}: {}", path, e))
    })?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    process_includes(&mut value, base_dir, depth)?;
    expand_variables(&mut value)?;
    Ok(value)
}

fn process_includes(value: &mut YamlValue, base_dir: &Path, depth: usize) -> Result<()> {
    match value {
        YamlValue::Mapping(map) => {
            if let Some(YamlValue::String(include_path)) = map.get("$include") {
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(PipelineError::Configuration(format!(
                        "$include nested deeper than {} levels at {:?}",
                        MAX_INCLUDE_DEPTH, include_path
                    )));
                }
                let full_path = base_dir.join(include_path);
                *value = load_yaml_file(&full_path, depth + 1)?;
                return Ok(());
            }
            for (_, v) in map.iter_mut() {
                process_includes(v, base_dir, depth)?;
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                process_includes(item, base_dir, depth)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_variables(value: &mut YamlValue) -> Result<()> {
    let pattern = Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}")
        .map_err(|e| PipelineError::Internal(format!("variable pattern: {}", e)))?;
    expand_with(value, &pattern);
    Ok(())
}

fn expand_with(value: &mut YamlValue, pattern: &Regex) {
    match value {
        YamlValue::String(s) => {
            let Some(expanded) = expand_env_in_string(s, pattern) else {
                return;
            };
            // A string that was only a placeholder takes the type of its value
            let whole = pattern.find(s).map(|m| m.as_str().len()) == Some(s.len());
            let replacement = if whole {
                serde_yaml::from_str(&expanded).unwrap_or(YamlValue::String(expanded))
            } else {
                YamlValue::String(expanded)
            };
            *value = replacement;
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_with(v, pattern);
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_with(item, pattern);
            }
        }
        _ => {}
    }
}

fn expand_env_in_string(s: &str, pattern: &Regex) -> Option<String> {
    if !s.contains("${") {
        return None;
    }
    let expanded = pattern.replace_all(s, |caps: &regex::Captures| {
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
    });
    Some(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.checkpoint.resume_threshold_percent, 25);
        assert_eq!(config.checkpoint.validate_only_threshold_percent, 95);
        assert_eq!(config.isolation.default_tier, IsolationTier::Worker);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = PipelineConfig::from_yaml_str(
            r#"
extraction:
  min_chars: 500
retry:
  by_kind:
    transient_store:
      max_attempts: 7
"#,
        )
        .unwrap();

        assert_eq!(config.extraction.min_chars, 500);
        assert_eq!(config.extraction.strategies.len(), 2);
        assert_eq!(config.retry.policy_for(ErrorKind::TransientStore).max_attempts, 7);
        assert_eq!(config.recovery.max_retries, 3);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(PipelineConfig::from_yaml_str("").unwrap(), PipelineConfig::default());
    }

    #[test]
    fn test_env_expansion_keeps_types() {
        env::set_var("ANALYSIS_TEST_RETRIES", "7");
        let config = PipelineConfig::from_yaml_str(
            r#"
recovery:
  max_retries: ${ANALYSIS_TEST_RETRIES:3}
  scan_interval_secs: ${ANALYSIS_TEST_UNSET_SCAN:45}
generation:
  system_prompt: "Region ${ANALYSIS_TEST_UNSET_REGION:au}"
"#,
        )
        .unwrap();
        env::remove_var("ANALYSIS_TEST_RETRIES");

        assert_eq!(config.recovery.max_retries, 7);
        assert_eq!(config.recovery.scan_interval_secs, 45);
        assert_eq!(config.generation.system_prompt.as_deref(), Some("Region au"));
    }

    #[test]
    fn test_include_relative_to_file() {
        let dir = TempDir::new().unwrap();
        let mut retry = fs::File::create(dir.path().join("retry.yaml")).unwrap();
        writeln!(retry, "by_kind:\n  transient_provider:\n    max_attempts: 9").unwrap();

        let main = dir.path().join("pipeline.yaml");
        fs::write(&main, "retry:\n  $include: retry.yaml\n").unwrap();

        let config = PipelineConfig::from_file(&main).unwrap();
        assert_eq!(config.retry.policy_for(ErrorKind::TransientProvider).max_attempts, 9);
    }

    #[test]
    fn test_self_include_is_rejected() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("loop.yaml");
        fs::write(&main, "retry:\n  $include: loop.yaml\n").unwrap();

        let err = PipelineConfig::from_file(&main).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_incoherent_thresholds_rejected() {
        let err = PipelineConfig::from_yaml_str(
            "checkpoint:\n  resume_threshold_percent: 96\n  validate_only_threshold_percent: 95\n",
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("resume_threshold_percent (96) must be below checkpoint.validate_only_threshold_percent (95)"));

        let err = PipelineConfig::from_yaml_str("checkpoint:\n  validate_only_threshold_percent: 101\n").unwrap_err();
        assert!(err.to_string().contains("validate_only_threshold_percent must be at most 100"));

        let err = PipelineConfig::from_yaml_str(
            "steps:\n  default:\n    soft_timeout_secs: 10\n    hard_timeout_secs: 5\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("soft timeout"));
    }

    #[test]
    fn test_step_overrides() {
        let config = PipelineConfig::from_yaml_str(
            "steps:\n  overrides:\n    extract_text:\n      hard_timeout_secs: 900\n",
        )
        .unwrap();
        assert_eq!(
            config.steps.limits_for("extract_text").hard_timeout(),
            Some(Duration::from_secs(900))
        );
        assert_eq!(
            config.steps.limits_for("assess_risk").hard_timeout(),
            Some(Duration::from_secs(600))
        );
    }
}
