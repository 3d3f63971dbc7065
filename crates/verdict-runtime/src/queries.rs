//! Investigator projection reads.
//!
//! Pure reads over the store; none of these take serialiser locks, so
//! investigator traffic can never stall event processing.

use serde::Serialize;

use verdict_store_core::{StoreError, WorkflowFilter, WorkflowStore};
use verdict_types::{DecisionId, DecisionRecord, WorkflowId, WorkflowRecord};

/// One decision in a workflow timeline, annotated with its lineage role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    /// The decision record.
    #[serde(flatten)]
    pub decision: DecisionRecord,
    /// Whether this is the currently authoritative decision.
    pub is_current: bool,
    /// Decision this one superseded, if it was an override.
    pub supersedes: Option<DecisionId>,
}

/// The currently authoritative decision for a workflow, if finalised.
pub async fn current_decision(
    store: &dyn WorkflowStore,
    workflow_id: &WorkflowId,
) -> Result<Option<DecisionRecord>, StoreError> {
    let Some(snapshot) = store.load(workflow_id).await? else {
        return Ok(None);
    };
    let Some(current_id) = snapshot.workflow.current_decision_id else {
        return Ok(None);
    };
    Ok(snapshot.decisions.into_iter().find(|d| d.decision_id == current_id))
}

/// Full decision timeline in chronological (append) order.
pub async fn timeline(
    store: &dyn WorkflowStore,
    workflow_id: &WorkflowId,
) -> Result<Option<Vec<TimelineEntry>>, StoreError> {
    let Some(snapshot) = store.load(workflow_id).await? else {
        return Ok(None);
    };
    let current = snapshot.workflow.current_decision_id;
    Ok(Some(
        snapshot
            .decisions
            .into_iter()
            .map(|decision| TimelineEntry {
                is_current: Some(&decision.decision_id) == current.as_ref(),
                supersedes: decision.lineage.supersedes_decision_id.clone(),
                decision,
            })
            .collect(),
    ))
}

/// Investigator listing with tenant/state/time-range filters.
pub async fn list_workflows(
    store: &dyn WorkflowStore,
    filter: &WorkflowFilter,
) -> Result<Vec<WorkflowRecord>, StoreError> {
    store.list_workflows(filter).await
}
