//! Retry Policies - Exponential backoff for transient failures
//!
//! Two layers of retry exist in the pipeline, and this module serves the inner
//! one:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Recovery Coordinator (task level)                       │
//! │  • re-enters the graph, bounded by max_retries           │
//! └─────────────┬────────────────────────────────────────────┘
//!               │ only after local retries are exhausted
//! ┌─────────────┴────────────────────────────────────────────┐
//! │  retry_with_backoff (operation level)                    │
//! │  • store writes, provider calls, notification delivery   │
//! │  • policy looked up by ErrorKind                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Delays follow `initial × backoff_factor ^ attempt`, capped at
//! `max_interval`, multiplied by a random factor in `0.5..=1.5` when jitter
//! is enabled.
//!
//! # Quick Start
//!
//! ```rust
//! use analysis_workflow::retry::{RetryPolicy, RetryPolicyTable};
//! use analysis_workflow::ErrorKind;
//!
//! let table = RetryPolicyTable::default()
//!     .with_policy(ErrorKind::TransientStore, RetryPolicy::new(5).with_initial_interval(0.1));
//!
//! assert_eq!(table.policy_for(ErrorKind::TransientStore).max_attempts, 5);
//! // Fatal kinds never retry locally
//! assert_eq!(table.policy_for(ErrorKind::Validation).max_attempts, 1);
//! ```

use crate::error::{ErrorKind, PipelineError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry policy for an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A single attempt, no retries
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Set initial interval in seconds
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set max interval in seconds
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay before the retry that follows `attempt` (0-indexed)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::from_secs(0);
        }

        let base_delay = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_interval).max(0.0);

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Whether another attempt is allowed once `attempts` have been made
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 128.0,
            jitter: true,
        }
    }
}

/// Retry policies keyed by [`ErrorKind`]
///
/// Non-recoverable kinds always resolve to a single attempt, whatever the
/// table says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyTable {
    #[serde(default = "RetryPolicy::no_retry")]
    default: RetryPolicy,
    #[serde(default)]
    by_kind: HashMap<ErrorKind, RetryPolicy>,
}

impl RetryPolicyTable {
    /// Empty table: every kind gets `default`
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_kind: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.by_kind.insert(kind, policy);
        self
    }

    pub fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        if !kind.is_recoverable() {
            return RetryPolicy::no_retry();
        }
        self.by_kind.get(&kind).cloned().unwrap_or_else(|| self.default.clone())
    }

    /// Whether an operation that failed with `error` after `attempts` may try again
    pub fn should_retry(&self, error: &PipelineError, attempts: usize) -> bool {
        error.is_recoverable() && self.policy_for(error.kind()).should_retry(attempts)
    }

    /// Same table with jitter disabled everywhere
    pub fn without_jitter(mut self) -> Self {
        self.default.jitter = false;
        for policy in self.by_kind.values_mut() {
            policy.jitter = false;
        }
        self
    }
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        Self::new(RetryPolicy::no_retry())
            .with_policy(
                ErrorKind::TransientStore,
                RetryPolicy::new(4).with_initial_interval(0.2).with_max_interval(5.0),
            )
            .with_policy(
                ErrorKind::TransientProvider,
                RetryPolicy::new(3).with_initial_interval(1.0).with_max_interval(30.0),
            )
            .with_policy(
                ErrorKind::Checkpoint,
                RetryPolicy::new(3).with_initial_interval(0.2).with_max_interval(5.0),
            )
    }
}

/// Execute `f` until it succeeds or the policy for its error kind gives up
///
/// Permanent errors are returned on the first occurrence.
pub async fn retry_with_backoff<F, Fut, T>(
    table: &RetryPolicyTable,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0usize;

    loop {
        if attempts > 0 {
            info!(operation = operation_name, attempt = attempts, "Retrying operation");
        }

        match f().await {
            Ok(result) => {
                if attempts > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempts,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                attempts += 1;
                let kind = e.kind();

                debug!(
                    operation = operation_name,
                    attempt = attempts,
                    error = %e,
                    kind = %kind,
                    "Operation failed"
                );

                if !e.is_recoverable() {
                    error!(
                        operation = operation_name,
                        error = %e,
                        "Permanent error detected, aborting retries"
                    );
                    return Err(e);
                }

                if !table.should_retry(&e, attempts) {
                    error!(
                        operation = operation_name,
                        attempts = attempts,
                        error = %e,
                        "All retry attempts exhausted"
                    );
                    return Err(e);
                }

                let delay = table.policy_for(kind).calculate_delay(attempts - 1);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error, will retry after delay"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_table() -> RetryPolicyTable {
        RetryPolicyTable::default()
            .with_policy(
                ErrorKind::TransientStore,
                RetryPolicy::new(3).with_initial_interval(0.001),
            )
            .without_jitter()
    }

    #[test]
    fn test_backoff_delay_exponential() {
        let policy = RetryPolicy::new(5).with_initial_interval(1.0).with_jitter(false);

        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_delay_max_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_interval(1.0)
            .with_max_interval(5.0)
            .with_jitter(false);

        assert_eq!(policy.calculate_delay(5), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(3).with_initial_interval(1.0);
        for _ in 0..50 {
            let delay = policy.calculate_delay(0).as_secs_f64();
            assert!((0.5..=1.5).contains(&delay));
        }
    }

    #[test]
    fn test_fatal_kinds_never_retry() {
        let table = RetryPolicyTable::new(RetryPolicy::new(10));
        assert_eq!(table.policy_for(ErrorKind::Validation).max_attempts, 1);
        assert_eq!(table.policy_for(ErrorKind::Configuration).max_attempts, 1);
        assert_eq!(table.policy_for(ErrorKind::TransientStore).max_attempts, 10);
    }

    #[test]
    fn test_table_from_yaml() {
        let yaml = r#"
default:
  max_attempts: 2
by_kind:
  transient_provider:
    max_attempts: 6
    initial_interval: 0.25
"#;
        let table: RetryPolicyTable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.policy_for(ErrorKind::TransientProvider).max_attempts, 6);
        assert_eq!(table.policy_for(ErrorKind::TransientStore).max_attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&fast_table(), "store.put", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::TransientStore("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast_table(), "store.put", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::TransientStore("still down".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(PipelineError::TransientStore(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<()> = retry_with_backoff(&fast_table(), "validate", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Validation("empty document".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
