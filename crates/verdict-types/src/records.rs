//! Workflow projection, decision records and risk result shapes.
//!
//! Decision records are append-only: once constructed by the decision
//! authority and appended to a workflow's log they are never modified.
//! The workflow record is the mutable projection the state machine advances;
//! its `version` is the optimistic-concurrency token and bumps by exactly
//! one on every successful write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{CorrelationId, DecisionId, TenantId, WorkflowId};

//─────────────────────────────
//  Workflow projection
//─────────────────────────────

/// Lifecycle states of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Created, no signals collected yet.
    Pending,
    /// At least one signal recorded; required set may be incomplete.
    SignalsCollected,
    /// Required signal set closed; risk evaluation in flight.
    RiskEvaluated,
    /// An authoritative decision is current.
    Finalised,
    /// The prior decision is being superseded by an override.
    Superseded,
}

/// Mutable per-workflow projection keyed by [`WorkflowId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Resolve subject identifier.
    pub workflow_id: WorkflowId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Current lifecycle state.
    pub state: WorkflowState,
    /// Last-observed value per signal name.
    pub signals: BTreeMap<String, Value>,
    /// Identifier of the currently authoritative decision, if any.
    pub current_decision_id: Option<DecisionId>,
    /// Whether the internal completion input has fired for this workflow.
    pub signals_complete_emitted: bool,
    /// Optimistic-concurrency token; +1 per successful mutation.
    pub version: u64,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Fresh workflow in `Pending` at version 1.
    pub fn new(workflow_id: WorkflowId, tenant_id: TenantId, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            tenant_id,
            state: WorkflowState::Pending,
            signals: BTreeMap::new(),
            current_decision_id: None,
            signals_complete_emitted: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

//─────────────────────────────
//  Decision outcome and record
//─────────────────────────────

/// Closed set of authoritative outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The subject may proceed.
    Approve,
    /// Route to human investigation.
    Review,
    /// The subject is refused.
    Decline,
}

impl Default for Outcome {
    fn default() -> Self {
        Outcome::Review
    }
}

/// Jurisdiction policy pack reference stamped on every decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRef {
    /// Jurisdiction the pack applies to.
    pub jurisdiction: String,
    /// Rule pack identifier.
    pub pack_id: String,
    /// Rule pack version.
    pub pack_version: String,
}

/// Who finalised the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authority {
    /// Deciding service name.
    pub decided_by: String,
    /// Deciding service version.
    pub service_version: String,
    /// Whether a human override produced this decision.
    pub is_override: bool,
    /// Human actor id, present exactly when `is_override`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

/// Override lineage link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Decision that was current when this one was appended, when overriding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes_decision_id: Option<DecisionId>,
}

/// Subject the decision resolves, for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Kind of subject, e.g. `identity_workflow`.
    pub subject_type: String,
    /// Subject identifier.
    pub subject_id: String,
    /// Action being resolved.
    pub action: String,
}

/// Append-only authoritative decision record (`decision.finalised`).
///
/// `decision_id` is a deterministic digest of the workflow, causing event and
/// deciding authority, which makes finalisation idempotent under redelivery
/// and lets downstream consumers deduplicate. The `timestamp` is copied from
/// the causing event so replaying the event log reproduces identical records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Deterministic decision identifier.
    pub decision_id: DecisionId,
    /// Workflow this decision resolves.
    pub workflow_id: WorkflowId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Authoritative outcome.
    pub outcome: Outcome,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Ordered short reason tokens.
    pub reason_codes: Vec<String>,
    /// Opaque structured value captured from the risk service.
    pub risk_summary: Value,
    /// Jurisdiction policy pack in force.
    pub policy: PolicyRef,
    /// Deciding authority.
    pub authority: Authority,
    /// Override lineage.
    pub lineage: Lineage,
    /// Resolved subject.
    pub subject: Subject,
    /// Correlation token from the causing event.
    pub correlation_id: CorrelationId,
    /// Timestamp of the causing event.
    pub timestamp: DateTime<Utc>,
}

//─────────────────────────────
//  Risk result
//─────────────────────────────

/// Value returned by the external risk service for a workflow snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskResult {
    /// Risk band label, e.g. `low`, `medium`, `high`.
    pub band: String,
    /// Raw risk score.
    pub score: f64,
    /// Service confidence in `[0, 1]`.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Opaque detail passed through onto the decision's risk summary.
    #[serde(default)]
    pub detail: Value,
}

fn default_confidence() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_states_serialise_snake_case() {
        assert_eq!(
            serde_json::to_value(WorkflowState::SignalsCollected).unwrap(),
            json!("signals_collected")
        );
        assert_eq!(serde_json::to_value(Outcome::Approve).unwrap(), json!("approve"));
    }

    #[test]
    fn new_workflow_starts_pending_at_version_one() {
        let wf = WorkflowRecord::new(WorkflowId::new("wf-1"), TenantId::new("acme"), Utc::now());
        assert_eq!(wf.state, WorkflowState::Pending);
        assert_eq!(wf.version, 1);
        assert!(wf.current_decision_id.is_none());
        assert!(!wf.signals_complete_emitted);
    }

    #[test]
    fn risk_result_defaults_tolerate_sparse_payloads() {
        let r: RiskResult = serde_json::from_value(json!({"band": "low", "score": 15.0})).unwrap();
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.detail, Value::Null);
    }
}
