use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::credentials::Credential;
use crate::engine::CancelSignal;
use crate::error::ErrorKind;
use crate::plan::ProvisioningStep;
use crate::providers::ProviderAdapter;
use crate::report::StepResult;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Retry budget and timing for a single step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Deadline covering every attempt and the waits between them.
    pub step_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `retry` (1-based), capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_backoff.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_nanos() as f64 {
            return self.max_backoff;
        }
        Duration::from_nanos(scaled as u64)
    }

    /// Backoff for `retry`, stretched to a provider's Retry-After hint when longer.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.backoff(retry);
        hint.map_or(backoff, |hint| hint.max(backoff))
    }
}

/// Runs one step against its adapter, retrying retryable failures.
#[derive(Debug, Clone, Default)]
pub struct StepExecutor {
    policy: RetryPolicy,
}

impl StepExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes `step` with already resolved `inputs`. The returned result is
    /// always terminal: succeeded or failed.
    pub async fn execute(
        &self,
        step: &ProvisioningStep,
        adapter: &dyn ProviderAdapter,
        credential: &Credential,
        inputs: &Value,
        cancel: &CancelSignal,
    ) -> StepResult {
        let mut record = StepResult::pending(step);
        record.start();

        let max_attempts = self.policy.max_attempts.max(1);
        let deadline = Instant::now() + self.policy.step_timeout;
        let mut attempts = 0;
        loop {
            attempts += 1;
            debug!(step = %step.id, attempt = attempts, "calling provider");
            let err = match timeout_at(
                deadline,
                adapter.execute(step.capability, inputs, credential),
            )
            .await
            {
                Ok(Ok(result)) => {
                    info!(step = %step.id, attempts, "{}", result.summary);
                    return record.succeed(result.summary, result.output, attempts);
                }
                Ok(Err(err)) => err,
                Err(_) => {
                    warn!(step = %step.id, attempts, "step timed out");
                    return record.fail(
                        ErrorKind::TimeoutError,
                        format!(
                            "no result within {}s",
                            self.policy.step_timeout.as_secs_f64()
                        ),
                        attempts,
                    );
                }
            };

            let kind = err.kind();
            if !kind.is_retryable() {
                warn!(step = %step.id, error = %err, "non-retryable provider error");
                return record.fail(kind, err.to_string(), attempts);
            }
            if attempts >= max_attempts {
                warn!(step = %step.id, attempts, error = %err, "retry budget exhausted");
                return record.fail(kind, err.to_string(), attempts);
            }

            let delay = self.policy.delay_for(attempts, err.retry_after());
            if Instant::now() + delay >= deadline {
                warn!(step = %step.id, attempts, ?delay, "next retry would pass the step deadline");
                return record.fail(
                    ErrorKind::TimeoutError,
                    format!("deadline reached while retrying; last error: {err}"),
                    attempts,
                );
            }

            warn!(step = %step.id, attempt = attempts, ?delay, error = %err, "retrying");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return record.fail(
                        kind,
                        format!("{err}; retries abandoned after cancellation"),
                        attempts,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cancellation;
    use crate::plan::{Capability, StepSpec};
    use crate::providers::SimulatedAdapter;
    use crate::report::StepStatus;
    use serde_json::json;

    fn step(inputs: Value) -> ProvisioningStep {
        let spec: StepSpec = serde_json::from_value(json!({
            "id": "deploy",
            "provider": "render",
            "capability": "trigger_deploy",
            "inputs": inputs,
        }))
        .expect("spec");
        spec.into()
    }

    fn credential() -> Credential {
        Credential::new("render", "default", "rnd_token")
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let adapter = SimulatedAdapter::new("render");
        let step = step(json!({"simulate": {"fail": "transient", "times": 2}}));
        let (_handle, signal) = cancellation();
        let result = StepExecutor::default()
            .execute(&step, &adapter, &credential(), &step.inputs, &signal)
            .await;
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_uses_whole_budget() {
        let adapter = SimulatedAdapter::new("render");
        let step = step(json!({"simulate": {"fail": "rate_limit"}}));
        let (_handle, signal) = cancellation();
        let policy = RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        };
        let result = StepExecutor::new(policy)
            .execute(&step, &adapter, &credential(), &step.inputs, &signal)
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.error_kind(), Some(ErrorKind::RateLimitError));
        assert_eq!(adapter.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_not_retried() {
        let adapter = SimulatedAdapter::new("render");
        let step = step(json!({"simulate": {"fail": "auth"}}));
        let (_handle, signal) = cancellation();
        let result = StepExecutor::default()
            .execute(&step, &adapter, &credential(), &step.inputs, &signal)
            .await;
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::AuthError));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let adapter = SimulatedAdapter::with_capabilities("render", &[Capability::TriggerDeploy]);
        let step = step(json!({"simulate": {"delay_ms": 5_000}}));
        let (_handle, signal) = cancellation();
        let policy = RetryPolicy {
            step_timeout: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        let result = StepExecutor::new(policy)
            .execute(&step, &adapter, &credential(), &step.inputs, &signal)
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error_kind(), Some(ErrorKind::TimeoutError));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_backoff() {
        let adapter = SimulatedAdapter::new("render");
        let step = step(json!({"simulate": {"fail": "transient"}}));
        let (handle, signal) = cancellation();
        handle.cancel();
        let result = StepExecutor::default()
            .execute(&step, &adapter, &credential(), &step.inputs, &signal)
            .await;
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::TransientNetworkError));
        assert!(result.detail.contains("cancellation"));
    }
}
