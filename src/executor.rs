//! Step execution with bounded timeout and exponential-backoff retry.
//!
//! One step is one unit of work against one backend. The executor applies
//! the timeout per attempt, retries transient failures with doubling backoff,
//! and always returns a finalized `StepResult` on retry exhaustion — the
//! caller decides whether that kills the path or triggers a fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::BackendRegistry;
use crate::config::RetryConfig;
use crate::error::{BackendError, Result};
use crate::path::{AttemptRecord, StepResult, StepStatus};
use crate::resource::BudgetTracker;

pub struct StepExecutor {
    registry: Arc<BackendRegistry>,
    budget: Arc<BudgetTracker>,
}

impl StepExecutor {
    pub fn new(registry: Arc<BackendRegistry>, budget: Arc<BudgetTracker>) -> Self {
        Self { registry, budget }
    }

    /// Run one step. Errors only on configuration problems (unknown backend);
    /// backend failures, timeouts, and retry exhaustion all come back as a
    /// `StepResult` with the matching terminal status.
    pub async fn execute(
        &self,
        specialist_id: &str,
        backend_id: &str,
        input: &str,
        retry: &RetryConfig,
    ) -> Result<StepResult> {
        let backend = self.registry.get(backend_id)?;
        let model = self
            .registry
            .profile(backend_id)
            .map(|p| p.default_model)
            .unwrap_or_default();

        let started_at = Utc::now();
        let step_timeout = Duration::from_millis(retry.step_timeout_ms);
        let max_attempts = retry.max_retries + 1;

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<BackendError> = None;

        for attempt in 1..=max_attempts {
            let clock = Instant::now();
            let outcome = timeout(step_timeout, backend.generate(&model, input)).await;
            let latency_ms = clock.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(Ok(generation)) => {
                    attempts.push(AttemptRecord {
                        number: attempt,
                        latency_ms,
                        error_class: None,
                    });
                    self.budget.record_spend(generation.tokens_spent);
                    debug!(
                        specialist = specialist_id,
                        backend = backend_id,
                        attempt,
                        latency_ms,
                        "Step succeeded"
                    );
                    return Ok(StepResult {
                        step_id: format!("step-{}", Uuid::new_v4()),
                        specialist_id: specialist_id.to_string(),
                        backend_id: backend_id.to_string(),
                        input: input.to_string(),
                        output: generation.text,
                        status: StepStatus::Ok,
                        started_at,
                        finished_at: Utc::now(),
                        retries: attempt - 1,
                        attempts,
                        tokens_spent: generation.tokens_spent,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => BackendError::Timeout {
                    duration_ms: retry.step_timeout_ms,
                },
            };

            attempts.push(AttemptRecord {
                number: attempt,
                latency_ms,
                error_class: Some(error.class().to_string()),
            });
            warn!(
                specialist = specialist_id,
                backend = backend_id,
                attempt,
                error = %error,
                "Step attempt failed"
            );

            let transient = error.is_transient();
            let base = error.suggested_delay(retry);
            last_error = Some(error);

            if !transient {
                break;
            }
            if attempt < max_attempts {
                sleep(backoff_delay(base, attempt - 1, retry.max_delay_ms)).await;
            }
        }

        let status = match &last_error {
            Some(BackendError::Timeout { .. }) => StepStatus::Timeout,
            _ => StepStatus::Error,
        };

        Ok(StepResult {
            step_id: format!("step-{}", Uuid::new_v4()),
            specialist_id: specialist_id.to_string(),
            backend_id: backend_id.to_string(),
            input: input.to_string(),
            output: String::new(),
            status,
            started_at,
            finished_at: Utc::now(),
            retries: attempts.len() as u32 - 1,
            attempts,
            tokens_spent: 0,
        })
    }
}

/// Doubling backoff capped at the configured maximum.
fn backoff_delay(base: Duration, completed_retries: u32, max_delay_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(completed_retries.min(16));
    let delay_ms = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(delay_ms.min(max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendProfile, BackendTier, Generation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyBackend {
        calls: AtomicU32,
        succeed_after: u32,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn generate(
            &self,
            _model_id: &str,
            prompt: &str,
        ) -> std::result::Result<Generation, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.succeed_after {
                Err(BackendError::Network("connection reset".into()))
            } else {
                Ok(Generation {
                    text: format!("ok: {}", prompt),
                    tokens_spent: 5,
                })
            }
        }
    }

    struct RejectingBackend;

    #[async_trait]
    impl Backend for RejectingBackend {
        async fn generate(
            &self,
            _model_id: &str,
            _prompt: &str,
        ) -> std::result::Result<Generation, BackendError> {
            Err(BackendError::Rejected("malformed".into()))
        }
    }

    fn harness(backend: Arc<dyn Backend>) -> (StepExecutor, Arc<BudgetTracker>) {
        let registry = Arc::new(BackendRegistry::new());
        registry.register(BackendProfile::new("b", BackendTier::Local, "m"), backend);
        let budget = Arc::new(BudgetTracker::new(1000));
        (StepExecutor::new(registry, Arc::clone(&budget)), budget)
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            step_timeout_ms: 1_000,
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (executor, budget) = harness(Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            succeed_after: 2,
        }));

        let step = executor
            .execute("review", "b", "input", &fast_retry(3))
            .await
            .unwrap();

        assert_eq!(step.status, StepStatus::Ok);
        assert_eq!(step.retries, 2);
        assert_eq!(step.attempts.len(), 3);
        assert_eq!(step.attempts[0].error_class.as_deref(), Some("network"));
        assert!(step.attempts[2].error_class.is_none());
        assert_eq!(budget.spent(), 5);
    }

    #[tokio::test]
    async fn test_attempt_bound_is_max_retries_plus_one() {
        let backend = Arc::new(FlakyBackend {
            calls: AtomicU32::new(0),
            succeed_after: u32::MAX,
        });
        let calls = Arc::clone(&backend);
        let (executor, _) = harness(backend);

        let step = executor
            .execute("review", "b", "input", &fast_retry(2))
            .await
            .unwrap();

        assert_eq!(step.status, StepStatus::Error);
        assert!(step.output.is_empty());
        assert_eq!(step.attempts.len(), 3);
        assert_eq!(calls.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_skips_retries() {
        let (executor, budget) = harness(Arc::new(RejectingBackend));

        let step = executor
            .execute("review", "b", "input", &fast_retry(5))
            .await
            .unwrap();

        assert_eq!(step.status, StepStatus::Error);
        assert_eq!(step.attempts.len(), 1);
        assert_eq!(step.attempts[0].error_class.as_deref(), Some("rejected"));
        assert_eq!(budget.spent(), 0);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_config_error() {
        let (executor, _) = harness(Arc::new(RejectingBackend));
        assert!(executor
            .execute("review", "missing", "x", &fast_retry(0))
            .await
            .is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0, 10_000), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1, 10_000), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 2, 10_000), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 10, 1_000), Duration::from_millis(1_000));
    }
}
