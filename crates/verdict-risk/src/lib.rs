#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-risk** – Risk evaluation client for Verdict.
//!
//! The engine consumes risk as a value: an evaluator receives a workflow
//! snapshot and returns a [`RiskResult`] or a classified failure. This crate
//! provides the evaluator trait, an HTTP client for the external risk
//! service, a retrying decorator with exponential backoff and jitter, and a
//! scripted evaluator for tests and development. Evaluators never mutate
//! workflow state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use verdict_types::{RiskResult, WorkflowRecord};

pub mod http;
pub mod retry;

pub use http::HttpRiskEvaluator;
pub use retry::{Retrying, RetryPolicy};

//─────────────────────────────
//  Evaluator trait
//─────────────────────────────

/// Risk service failures, classified for the caller's recovery policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RiskError {
    /// The call may succeed if retried: timeouts, transport failures, 5xx.
    #[error("transient risk service failure: {0}")]
    Transient(String),
    /// Retrying cannot help: 4xx responses, schema violations.
    #[error("permanent risk service failure: {0}")]
    Permanent(String),
}

impl RiskError {
    /// Whether retrying this failure can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RiskError::Transient(_))
    }
}

/// Synchronous risk evaluation over a workflow snapshot.
#[async_trait]
pub trait RiskEvaluator: Send + Sync {
    /// Evaluate the workflow's accumulated signals.
    async fn evaluate(&self, workflow: &WorkflowRecord) -> Result<RiskResult, RiskError>;
}

#[async_trait]
impl<T: RiskEvaluator + ?Sized> RiskEvaluator for Arc<T> {
    async fn evaluate(&self, workflow: &WorkflowRecord) -> Result<RiskResult, RiskError> {
        (**self).evaluate(workflow).await
    }
}

//─────────────────────────────
//  Scripted evaluator
//─────────────────────────────

/// Deterministic evaluator for tests and for running without a risk service.
///
/// Scripted responses are consumed front-to-back; once exhausted the
/// fallback answers every call.
pub struct StaticRiskEvaluator {
    script: Mutex<VecDeque<Result<RiskResult, RiskError>>>,
    fallback: Result<RiskResult, RiskError>,
}

impl StaticRiskEvaluator {
    /// Answer every call with `result`.
    pub fn always(result: RiskResult) -> Self {
        Self { script: Mutex::new(VecDeque::new()), fallback: Ok(result) }
    }

    /// Answer every call with `error`.
    pub fn always_err(error: RiskError) -> Self {
        Self { script: Mutex::new(VecDeque::new()), fallback: Err(error) }
    }

    /// Answer with `steps` in order, then `fallback` forever.
    pub fn scripted(
        steps: Vec<Result<RiskResult, RiskError>>,
        fallback: Result<RiskResult, RiskError>,
    ) -> Self {
        Self { script: Mutex::new(steps.into()), fallback }
    }

    /// Low-band approving evaluator used by the service's dev mode.
    pub fn approving() -> Self {
        Self::always(RiskResult {
            band: "low".to_owned(),
            score: 10.0,
            confidence: 0.95,
            detail: serde_json::Value::Null,
        })
    }

    /// Calls not yet consumed from the script.
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RiskEvaluator for StaticRiskEvaluator {
    async fn evaluate(&self, _workflow: &WorkflowRecord) -> Result<RiskResult, RiskError> {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verdict_types::{TenantId, WorkflowId};

    fn workflow() -> WorkflowRecord {
        WorkflowRecord::new(WorkflowId::new("wf-1"), TenantId::new("acme"), Utc::now())
    }

    #[tokio::test]
    async fn scripted_evaluator_plays_steps_then_fallback() {
        let eval = StaticRiskEvaluator::scripted(
            vec![
                Err(RiskError::Transient("blip".to_owned())),
                Ok(RiskResult {
                    band: "low".to_owned(),
                    score: 15.0,
                    confidence: 0.97,
                    detail: serde_json::Value::Null,
                }),
            ],
            Err(RiskError::Permanent("script exhausted".to_owned())),
        );

        let wf = workflow();
        assert!(eval.evaluate(&wf).await.unwrap_err().is_transient());
        assert_eq!(eval.evaluate(&wf).await.unwrap().band, "low");
        assert!(!eval.evaluate(&wf).await.unwrap_err().is_transient());
        assert_eq!(eval.remaining(), 0);
    }

    #[tokio::test]
    async fn arc_evaluators_delegate() {
        let eval: Arc<dyn RiskEvaluator> = Arc::new(StaticRiskEvaluator::approving());
        assert_eq!(eval.evaluate(&workflow()).await.unwrap().band, "low");
    }
}
