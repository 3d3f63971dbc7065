#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-store-memory** – In-memory storage driver for Verdict.
//!
//! This crate provides a fast, non-persistent workflow store suitable for
//! testing, development, and replay verification. All data is stored in
//! memory and lost when the process terminates; production deployments use
//! a durable driver behind the same trait.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use verdict_store_core::{
    DeadLetter, DecisionAppend, EventRecord, StoreError, WorkflowFilter, WorkflowMutation,
    WorkflowSnapshot, WorkflowStore,
};
use verdict_types::{
    DecisionRecord, EventEnvelope, EventId, TenantId, WorkflowId, WorkflowRecord, WorkflowState,
};

//─────────────────────────────
//  In-memory workflow store
//─────────────────────────────

#[derive(Debug, Default)]
struct Inner {
    workflows: HashMap<WorkflowId, WorkflowRecord>,
    decisions: HashMap<WorkflowId, Vec<DecisionRecord>>,
    decision_ids: HashMap<String, WorkflowId>,
    events: HashMap<EventId, EventEnvelope>,
    event_order: HashMap<WorkflowId, Vec<EventId>>,
    dead_letters: HashMap<WorkflowId, Vec<DeadLetter>>,
}

/// An in-memory, non-persistent workflow store.
///
/// A single `RwLock` over the whole state makes every multi-key operation
/// (version check + decision append + current pointer update) atomic, which
/// is exactly the uniqueness contract the trait demands. Contention is not a
/// concern at the scales this driver serves.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Creates a new, empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflows currently stored.
    pub async fn workflow_count(&self) -> usize {
        self.inner.read().await.workflows.len()
    }

    /// Number of events recorded across all workflows.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Drop all stored state. Useful for replay tests that rebuild the
    /// store from a retained event log.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }
}

fn apply_mutation(workflow: &mut WorkflowRecord, mutation: WorkflowMutation) {
    if let Some(state) = mutation.set_state {
        workflow.state = state;
    }
    for (name, value) in mutation.merge_signals {
        workflow.signals.insert(name, value);
    }
    if mutation.mark_signals_complete {
        workflow.signals_complete_emitted = true;
    }
    workflow.version += 1;
    workflow.updated_at = Utc::now();
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn load(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowSnapshot>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.workflows.get(workflow_id).map(|workflow| WorkflowSnapshot {
            workflow: workflow.clone(),
            decisions: inner.decisions.get(workflow_id).cloned().unwrap_or_default(),
        }))
    }

    async fn create_if_absent(
        &self,
        workflow_id: &WorkflowId,
        tenant_id: &TenantId,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .workflows
            .entry(workflow_id.clone())
            .or_insert_with(|| {
                WorkflowRecord::new(workflow_id.clone(), tenant_id.clone(), Utc::now())
            });
        Ok(record.clone())
    }

    async fn apply(
        &self,
        workflow_id: &WorkflowId,
        expected_version: u64,
        mutation: WorkflowMutation,
    ) -> Result<WorkflowRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let workflow = inner
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.clone()))?;
        if workflow.version != expected_version {
            return Err(StoreError::StaleVersion {
                workflow_id: workflow_id.clone(),
                expected: expected_version,
                actual: workflow.version,
            });
        }
        apply_mutation(workflow, mutation);
        Ok(workflow.clone())
    }

    async fn append_decision(
        &self,
        workflow_id: &WorkflowId,
        expected_version: u64,
        decision: DecisionRecord,
    ) -> Result<DecisionAppend, StoreError> {
        let mut inner = self.inner.write().await;

        // Duplicate detection comes before the version check so a redelivered
        // finalisation whose first attempt already landed reports idempotent
        // success instead of a stale conflict.
        if let Some(owner) = inner.decision_ids.get(decision.decision_id.as_str()) {
            let existing = inner
                .decisions
                .get(owner)
                .and_then(|log| {
                    log.iter().find(|d| d.decision_id == decision.decision_id).cloned()
                })
                .ok_or_else(|| {
                    StoreError::Unavailable("decision index out of sync with log".to_owned())
                })?;
            return Ok(DecisionAppend::Duplicate(existing));
        }

        let workflow = inner
            .workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.clone()))?;
        if workflow.version != expected_version {
            return Err(StoreError::StaleVersion {
                workflow_id: workflow_id.clone(),
                expected: expected_version,
                actual: workflow.version,
            });
        }

        workflow.current_decision_id = Some(decision.decision_id.clone());
        workflow.state = WorkflowState::Finalised;
        workflow.version += 1;
        workflow.updated_at = Utc::now();
        let updated = workflow.clone();

        inner
            .decision_ids
            .insert(decision.decision_id.as_str().to_owned(), workflow_id.clone());
        inner.decisions.entry(workflow_id.clone()).or_default().push(decision);

        Ok(DecisionAppend::Appended(updated))
    }

    async fn record_event(&self, event: &EventEnvelope) -> Result<EventRecord, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.events.contains_key(&event.event_id) {
            return Ok(EventRecord::Duplicate);
        }
        inner.events.insert(event.event_id.clone(), event.clone());
        inner
            .event_order
            .entry(event.workflow_id.clone())
            .or_default()
            .push(event.event_id.clone());
        Ok(EventRecord::New)
    }

    async fn discard_event(&self, event_id: &EventId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(event) = inner.events.remove(event_id) {
            if let Some(order) = inner.event_order.get_mut(&event.workflow_id) {
                order.retain(|id| id != event_id);
            }
        }
        Ok(())
    }

    async fn list_events(&self, workflow_id: &WorkflowId) -> Result<Vec<EventEnvelope>, StoreError> {
        let inner = self.inner.read().await;
        let Some(order) = inner.event_order.get(workflow_id) else {
            return Ok(Vec::new());
        };
        let mut seen = HashSet::new();
        Ok(order
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .filter_map(|id| inner.events.get(id).cloned())
            .collect())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut matches: Vec<WorkflowRecord> =
            inner.workflows.values().filter(|wf| filter.matches(wf)).cloned().collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn record_dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.dead_letters.entry(letter.workflow_id.clone()).or_default().push(letter);
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.dead_letters.get(workflow_id).cloned().unwrap_or_default())
    }
}
