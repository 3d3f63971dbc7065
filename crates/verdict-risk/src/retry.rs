//! Bounded retry decorator for risk evaluators.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use verdict_types::{RiskResult, WorkflowRecord};

use crate::{RiskError, RiskEvaluator};

/// Retry budget for transient risk failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// First backoff; doubles per retry.
    pub backoff_base: Duration,
    /// Ceiling for a single backoff before jitter.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (1-based), with uniform jitter of up
    /// to half the deterministic delay.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
        let capped = exp.min(self.backoff_cap);
        let jitter_ceiling = capped.as_millis() as u64 / 2;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Evaluator decorator retrying transient failures within a bounded budget.
///
/// Permanent failures surface immediately; exhausting the budget surfaces
/// the last transient error for the caller's fallback policy.
pub struct Retrying<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E> Retrying<E> {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<E: RiskEvaluator> RiskEvaluator for Retrying<E> {
    async fn evaluate(&self, workflow: &WorkflowRecord) -> Result<RiskResult, RiskError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.evaluate(workflow).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.backoff(attempt);
                    debug!(
                        workflow_id = %workflow.workflow_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient risk failure, backing off"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(
                            workflow_id = %workflow.workflow_id,
                            attempts = attempt + 1,
                            "risk retry budget exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
