//! Decision authority: the single emitter of `decision.finalised`.
//!
//! No other code path in the workspace constructs a [`DecisionRecord`] or
//! calls the store's `append_decision`. The deterministic decision id plus
//! the store's id uniqueness give the single-authoritative-decision-per-cause
//! property; redelivered causes short-circuit on the stored record without
//! re-publishing.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use verdict_bus_core::DecisionBus;
use verdict_store_core::{decision_id, DecisionAppend, StoreError, WorkflowStore};
use verdict_types::{
    signal, Authority, DecisionRecord, EventEnvelope, Lineage, Outcome, Subject, WorkflowId,
    WorkflowRecord,
};

use crate::machine::RiskDisposition;
use crate::policy::PolicyPack;

/// Subject type stamped on every decision.
const SUBJECT_TYPE: &str = "identity_workflow";

/// Action stamped on every decision.
const SUBJECT_ACTION: &str = "resolve";

//─────────────────────────────
//  Identity and contexts
//─────────────────────────────

/// Stable identity of the deciding service.
///
/// The decision id digest covers `decided_by` only, so patch releases do not
/// change the ids a replayed event log produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityIdentity {
    /// Deciding service name.
    pub decided_by: String,
    /// Deciding service version, stamped on records but not hashed.
    pub service_version: String,
}

impl Default for AuthorityIdentity {
    fn default() -> Self {
        Self {
            decided_by: "verdict-engine".to_owned(),
            service_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Human override parameters threaded through from the override payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideContext {
    /// Outcome the actor imposes.
    pub outcome: Outcome,
    /// Non-empty justification.
    pub reason: String,
    /// Authorising actor id.
    pub actor_id: String,
}

/// Result of a finalisation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FinaliseOutcome {
    /// A new decision was appended and published.
    Finalised {
        /// The appended record.
        decision: DecisionRecord,
        /// Workflow record after the append.
        workflow: WorkflowRecord,
    },
    /// The causing event had already been finalised; nothing was written or
    /// published.
    AlreadyFinalised(DecisionRecord),
}

impl FinaliseOutcome {
    /// The decision this finalisation resolved to, new or pre-existing.
    pub fn decision(&self) -> &DecisionRecord {
        match self {
            FinaliseOutcome::Finalised { decision, .. } => decision,
            FinaliseOutcome::AlreadyFinalised(decision) => decision,
        }
    }
}

/// Finalisation failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    /// An override was requested for a workflow with no current decision.
    #[error("override on workflow {0} has no decision to supersede")]
    InvalidOverrideTarget(WorkflowId),
    /// The store rejected the append.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Finalisation was requested without a risk disposition or override.
    #[error("finalisation for workflow {0} carries neither risk disposition nor override")]
    MissingBasis(WorkflowId),
}

//─────────────────────────────
//  Decision authority
//─────────────────────────────

/// The only component permitted to append to the decision log.
pub struct DecisionAuthority {
    identity: AuthorityIdentity,
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn DecisionBus>,
}

impl DecisionAuthority {
    /// Build an authority over the injected store and outbound bus.
    pub fn new(
        identity: AuthorityIdentity,
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn DecisionBus>,
    ) -> Self {
        Self { identity, store, bus }
    }

    /// The deciding identity stamped on records.
    pub fn identity(&self) -> &AuthorityIdentity {
        &self.identity
    }

    /// Finalise a decision for `workflow`, caused by `cause`.
    ///
    /// Exactly one of `disposition` (risk path) or `override_ctx` (override
    /// path) supplies the basis. The decision id is a deterministic digest
    /// of `(workflow, cause, authority)`, so redelivery of the same cause
    /// returns the stored record without a second append or publish.
    pub async fn finalise(
        &self,
        workflow: &WorkflowRecord,
        cause: &EventEnvelope,
        disposition: Option<&RiskDisposition>,
        pack: &PolicyPack,
        override_ctx: Option<OverrideContext>,
    ) -> Result<FinaliseOutcome, AuthorityError> {
        let id = decision_id(&workflow.workflow_id, &cause.event_id, &self.identity.decided_by);
        let is_override = override_ctx.is_some();

        let supersedes = if is_override {
            match &workflow.current_decision_id {
                Some(current) => Some(current.clone()),
                None => {
                    return Err(AuthorityError::InvalidOverrideTarget(
                        workflow.workflow_id.clone(),
                    ))
                }
            }
        } else {
            None
        };

        let (outcome, confidence, mut reason_codes, risk_summary, actor_id) =
            match (override_ctx, disposition) {
                (Some(ctx), _) => (
                    ctx.outcome,
                    1.0,
                    vec!["manual_override".to_owned()],
                    json!({ "override_reason": ctx.reason }),
                    Some(ctx.actor_id),
                ),
                (None, Some(RiskDisposition::Evaluated(result))) => (
                    pack.outcome_for(&result.band),
                    result.confidence,
                    vec![format!("risk_band_{}", result.band)],
                    serde_json::to_value(result).unwrap_or(Value::Null),
                    None,
                ),
                (None, Some(RiskDisposition::UnavailablePermanent { detail })) => (
                    Outcome::Decline,
                    0.0,
                    vec!["risk_unavailable_permanent".to_owned()],
                    json!({ "error": detail }),
                    None,
                ),
                (None, Some(RiskDisposition::UnavailableTransient { detail })) => (
                    Outcome::Review,
                    0.0,
                    vec!["risk_unavailable_transient".to_owned()],
                    json!({ "error": detail }),
                    None,
                ),
                (None, None) => {
                    return Err(AuthorityError::MissingBasis(workflow.workflow_id.clone()))
                }
            };

        let timed_out = workflow
            .signals
            .get(signal::SIGNALS_TIMED_OUT)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if timed_out && !is_override {
            reason_codes.push("signals_timeout".to_owned());
        }

        let decision = DecisionRecord {
            decision_id: id,
            workflow_id: workflow.workflow_id.clone(),
            tenant_id: workflow.tenant_id.clone(),
            outcome,
            confidence,
            reason_codes,
            risk_summary,
            policy: pack.policy_ref(),
            authority: Authority {
                decided_by: self.identity.decided_by.clone(),
                service_version: self.identity.service_version.clone(),
                is_override,
                actor_id,
            },
            lineage: Lineage { supersedes_decision_id: supersedes },
            subject: Subject {
                subject_type: SUBJECT_TYPE.to_owned(),
                subject_id: workflow.workflow_id.to_string(),
                action: SUBJECT_ACTION.to_owned(),
            },
            correlation_id: cause.correlation_id.clone(),
            timestamp: cause.timestamp,
        };

        match self
            .store
            .append_decision(&workflow.workflow_id, workflow.version, decision.clone())
            .await?
        {
            DecisionAppend::Appended(updated) => {
                info!(
                    workflow_id = %workflow.workflow_id,
                    decision_id = %decision.decision_id,
                    outcome = ?decision.outcome,
                    is_override,
                    "decision finalised"
                );
                if let Err(err) = self.bus.publish(&decision) {
                    // The record is durable; consumers recover from the log.
                    warn!(decision_id = %decision.decision_id, %err, "outbound publish failed");
                }
                Ok(FinaliseOutcome::Finalised { decision, workflow: updated })
            }
            DecisionAppend::Duplicate(existing) => {
                debug!(
                    workflow_id = %workflow.workflow_id,
                    decision_id = %existing.decision_id,
                    "finalisation redelivered, returning stored decision"
                );
                Ok(FinaliseOutcome::AlreadyFinalised(existing))
            }
        }
    }
}
