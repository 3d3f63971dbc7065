#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-store-core** – Core storage abstraction for Verdict.
//!
//! This crate defines the contracts a workflow store must honour without
//! providing concrete implementations. Storage drivers (in-memory, sled,
//! anything durable and key-indexed) implement these traits in separate
//! crates that depend on this core abstraction.
//!
//! Two uniqueness guarantees provided here are the foundation of the
//! system's single-emitter invariant: `record_event` observes each
//! `event_id` as new exactly once, and `append_decision` observes each
//! `decision_id` as new exactly once, regardless of caller interleaving.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use verdict_types::{
    DecisionId, DecisionRecord, EventEnvelope, EventId, TenantId, WorkflowId, WorkflowRecord,
    WorkflowState,
};

//─────────────────────────────
//  Deterministic decision ids
//─────────────────────────────

/// Compute the deterministic decision identifier for a finalisation.
///
/// The digest covers the workflow, the causing event and the deciding
/// authority's stable name, with domain separators so no field pair can
/// collide by concatenation. Redelivery of the same causing event therefore
/// reproduces the same id, and replaying a full event log reproduces every
/// id byte-for-byte.
pub fn decision_id(
    workflow_id: &WorkflowId,
    cause_event_id: &EventId,
    decided_by: &str,
) -> DecisionId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(workflow_id.as_str().as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(cause_event_id.as_str().as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(decided_by.as_bytes());
    DecisionId::new(hasher.finalize().to_hex().to_string())
}

//─────────────────────────────
//  Store value types
//─────────────────────────────

/// A workflow record together with its full decision history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Current projection.
    pub workflow: WorkflowRecord,
    /// Decision log in append order.
    pub decisions: Vec<DecisionRecord>,
}

/// Declarative mutation applied to a workflow record.
///
/// Mutations are plain data so drivers stay dumb: the engine decides *what*
/// changes, the driver only enforces versioning and persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowMutation {
    /// New lifecycle state, when changing.
    pub set_state: Option<WorkflowState>,
    /// Signal facts to merge (last-observed-wins per name).
    pub merge_signals: BTreeMap<String, Value>,
    /// Latch the one-shot completion flag.
    pub mark_signals_complete: bool,
}

impl WorkflowMutation {
    /// Whether applying this mutation would change nothing.
    pub fn is_empty(&self) -> bool {
        self.set_state.is_none() && self.merge_signals.is_empty() && !self.mark_signals_complete
    }
}

/// Outcome of [`WorkflowStore::append_decision`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionAppend {
    /// The decision was new; the updated workflow record is returned.
    Appended(WorkflowRecord),
    /// A decision with this id already existed; the stored record is
    /// returned unchanged and nothing was written.
    Duplicate(DecisionRecord),
}

/// Outcome of [`WorkflowStore::record_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRecord {
    /// First sighting of this `event_id`.
    New,
    /// The `event_id` was already recorded; the submission is a no-op.
    Duplicate,
}

/// Investigator-facing workflow listing filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowFilter {
    /// Restrict to one tenant.
    pub tenant_id: Option<TenantId>,
    /// Restrict to one lifecycle state.
    pub state: Option<WorkflowState>,
    /// Only workflows created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Only workflows created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
}

impl WorkflowFilter {
    /// Whether `workflow` satisfies every set criterion.
    pub fn matches(&self, workflow: &WorkflowRecord) -> bool {
        if let Some(tenant) = &self.tenant_id {
            if &workflow.tenant_id != tenant {
                return false;
            }
        }
        if let Some(state) = self.state {
            if workflow.state != state {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if workflow.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if workflow.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Terminal failure record for an event that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The failed event.
    pub event_id: EventId,
    /// Workflow the event targeted.
    pub workflow_id: WorkflowId,
    /// Processing attempts before giving up.
    pub attempts: u32,
    /// Last failure description.
    pub reason: String,
    /// When the event was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic-concurrency conflict; the caller must reload and retry.
    #[error("stale version for workflow {workflow_id}: expected {expected}, found {actual}")]
    StaleVersion {
        /// Workflow the write targeted.
        workflow_id: WorkflowId,
        /// Version the caller expected.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },
    /// The workflow does not exist.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
    /// The backend is unreachable or failed an IO operation.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    /// A record could not be encoded or decoded.
    #[error("failed to encode or decode record: {0}")]
    Encoding(String),
}

impl StoreError {
    /// Whether a retry with fresh state can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::StaleVersion { .. } | StoreError::Unavailable(_))
    }
}

//─────────────────────────────
//  Storage backend trait
//─────────────────────────────

/// Durable per-workflow state plus the append-only decision log.
///
/// All operations must be durable before returning. Concurrency is
/// controlled per workflow via `expected_version` and globally via
/// uniqueness on `event_id` and `decision_id`; drivers take no locks the
/// caller can observe.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Load the workflow record and its full decision history.
    async fn load(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowSnapshot>, StoreError>;

    /// Atomically create the workflow if absent; return the stored record
    /// either way. Concurrent first arrivals observe one creation.
    async fn create_if_absent(
        &self,
        workflow_id: &WorkflowId,
        tenant_id: &TenantId,
    ) -> Result<WorkflowRecord, StoreError>;

    /// Optimistic-concurrency mutation; bumps `version` by exactly one.
    async fn apply(
        &self,
        workflow_id: &WorkflowId,
        expected_version: u64,
        mutation: WorkflowMutation,
    ) -> Result<WorkflowRecord, StoreError>;

    /// Atomically append a decision, set it current, move the workflow to
    /// `Finalised` and bump `version`. A duplicate `decision_id` (by any
    /// caller, any interleaving) is observed by exactly one caller as
    /// [`DecisionAppend::Appended`]; every other observes
    /// [`DecisionAppend::Duplicate`] with the stored record and no write.
    async fn append_decision(
        &self,
        workflow_id: &WorkflowId,
        expected_version: u64,
        decision: DecisionRecord,
    ) -> Result<DecisionAppend, StoreError>;

    /// Record an ingested event for idempotency and audit. Duplicate
    /// `event_id`s are reported, never re-stored.
    async fn record_event(&self, event: &EventEnvelope) -> Result<EventRecord, StoreError>;

    /// Compensation for ingress backpressure: forget an event that was
    /// recorded but never enqueued, so its redelivery is not mistaken for a
    /// processed duplicate. Must only be called by the ingress path that
    /// recorded it.
    async fn discard_event(&self, event_id: &EventId) -> Result<(), StoreError>;

    /// Recorded events for a workflow in arrival order, for audit and
    /// replay.
    async fn list_events(&self, workflow_id: &WorkflowId) -> Result<Vec<EventEnvelope>, StoreError>;

    /// Investigator listing; pure read.
    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Record a terminal processing failure.
    async fn record_dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError>;

    /// Dead letters for a workflow in failure order.
    async fn list_dead_letters(&self, workflow_id: &WorkflowId)
        -> Result<Vec<DeadLetter>, StoreError>;
}

//─────────────────────────────
//  Convenience re-exports
//─────────────────────────────

/// Convenient prelude for importing the most common store types.
pub mod prelude {
    pub use super::{
        decision_id, DeadLetter, DecisionAppend, EventRecord, StoreError, WorkflowFilter,
        WorkflowMutation, WorkflowSnapshot, WorkflowStore,
    };
}
