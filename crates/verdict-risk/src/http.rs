//! HTTP client for the external risk service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use tracing::debug;

use verdict_types::{RiskResult, WorkflowRecord};

use crate::{RiskError, RiskEvaluator};

/// Snapshot posted to the risk service.
#[derive(Debug, Serialize)]
struct EvaluationRequest<'a> {
    workflow_id: &'a str,
    tenant_id: &'a str,
    signals: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

/// Evaluator calling a remote risk service over HTTP.
///
/// Failure classification: transport errors and timeouts are transient, 5xx
/// responses are transient, 4xx responses and unparseable bodies are
/// permanent. The per-call timeout lives on the client and must stay
/// stricter than the handler deadline so finalisation keeps budget.
#[derive(Debug)]
pub struct HttpRiskEvaluator {
    client: Client,
    endpoint: Url,
}

impl HttpRiskEvaluator {
    /// Build a client for `endpoint` with the given per-call timeout.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RiskError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| RiskError::Permanent(format!("invalid risk endpoint: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RiskError::Permanent(format!("failed to build http client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl RiskEvaluator for HttpRiskEvaluator {
    async fn evaluate(&self, workflow: &WorkflowRecord) -> Result<RiskResult, RiskError> {
        let request = EvaluationRequest {
            workflow_id: workflow.workflow_id.as_str(),
            tenant_id: workflow.tenant_id.as_str(),
            signals: &workflow.signals,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| RiskError::Transient(format!("risk request failed: {e}")))?;

        let status = response.status();
        debug!(workflow_id = %workflow.workflow_id, %status, "risk service responded");

        if status.is_success() {
            response
                .json::<RiskResult>()
                .await
                .map_err(|e| RiskError::Permanent(format!("risk response schema violation: {e}")))
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(RiskError::Transient(format!("risk service returned {status}")))
        } else {
            Err(RiskError::Permanent(format!("risk service returned {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_endpoint_is_a_permanent_error() {
        let err = HttpRiskEvaluator::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(!err.is_transient());
    }
}
