#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-store-sled** – Sled-based persistent storage driver for Verdict.
//!
//! This crate provides a durable, embedded workflow store using the sled
//! database engine. It offers crash recovery and efficient on-disk storage
//! while honouring the same contract as the in-memory driver: every
//! operation is flushed before returning, and `event_id`/`decision_id`
//! uniqueness is observed atomically.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sled::{Db, Tree};
use tokio::sync::Mutex;

use verdict_store_core::{
    DeadLetter, DecisionAppend, EventRecord, StoreError, WorkflowFilter, WorkflowMutation,
    WorkflowSnapshot, WorkflowStore,
};
use verdict_types::{
    DecisionRecord, EventEnvelope, EventId, TenantId, WorkflowId, WorkflowRecord, WorkflowState,
};

const SEP: u8 = 0x1f;

//─────────────────────────────
//  Sled workflow store
//─────────────────────────────

/// A persistent workflow store backed by the sled embedded database.
///
/// Six trees hold workflows, decisions (keyed by workflow and append
/// sequence), the decision-id uniqueness index, events, per-workflow event
/// arrival order, and dead letters. A single async mutex serialises
/// cross-tree writes; per-workflow serialisation upstream keeps contention
/// negligible.
#[derive(Debug)]
pub struct SledStore {
    _db: Db, // Keep reference to prevent premature database closure
    workflows: Tree,
    decisions: Tree,
    decision_ids: Tree,
    events: Tree,
    event_order: Tree,
    dead_letters: Tree,
    write_guard: Mutex<()>,
}

impl SledStore {
    /// Opens or creates a sled database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::Config::default()
            .path(path)
            .open()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_db(db)
    }

    /// Creates a store from an existing sled database instance.
    pub fn from_db(db: Db) -> Result<Self, StoreError> {
        let open = |name: &str| {
            db.open_tree(name).map_err(|e| StoreError::Unavailable(e.to_string()))
        };
        Ok(Self {
            workflows: open("workflows")?,
            decisions: open("decisions")?,
            decision_ids: open("decision_ids")?,
            events: open("events")?,
            event_order: open("event_order")?,
            dead_letters: open("dead_letters")?,
            _db: db,
            write_guard: Mutex::new(()),
        })
    }

    /// Creates a temporary store for testing purposes.
    ///
    /// The database lives in a temporary directory and is cleaned up when
    /// the store is dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_db(db)
    }

    /// Total number of workflows on disk.
    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self._db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowRecord>, StoreError> {
        self.workflows
            .get(workflow_id.as_str().as_bytes())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn put_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        self.workflows
            .insert(workflow.workflow_id.as_str().as_bytes(), encode(workflow)?)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn scoped_entries<T: serde::de::DeserializeOwned>(
        &self,
        tree: &Tree,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for entry in tree.scan_prefix(scope_prefix(workflow_id)) {
            let (_, bytes) = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    fn scoped_len(&self, tree: &Tree, workflow_id: &WorkflowId) -> u64 {
        tree.scan_prefix(scope_prefix(workflow_id)).count() as u64
    }
}

fn scope_prefix(workflow_id: &WorkflowId) -> Vec<u8> {
    let mut prefix = workflow_id.as_str().as_bytes().to_vec();
    prefix.push(SEP);
    prefix
}

fn scoped_key(workflow_id: &WorkflowId, seq: u64) -> Vec<u8> {
    let mut key = scope_prefix(workflow_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    rmp_serde::to_vec_named(value).map_err(|e| StoreError::Encoding(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Encoding(e.to_string()))
}

#[async_trait]
impl WorkflowStore for SledStore {
    async fn load(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowSnapshot>, StoreError> {
        let _guard = self.write_guard.lock().await;
        let Some(workflow) = self.get_workflow(workflow_id)? else {
            return Ok(None);
        };
        let decisions = self.scoped_entries(&self.decisions, workflow_id)?;
        Ok(Some(WorkflowSnapshot { workflow, decisions }))
    }

    async fn create_if_absent(
        &self,
        workflow_id: &WorkflowId,
        tenant_id: &TenantId,
    ) -> Result<WorkflowRecord, StoreError> {
        let _guard = self.write_guard.lock().await;
        if let Some(existing) = self.get_workflow(workflow_id)? {
            return Ok(existing);
        }
        let record = WorkflowRecord::new(workflow_id.clone(), tenant_id.clone(), Utc::now());
        self.put_workflow(&record)?;
        self.flush().await?;
        Ok(record)
    }

    async fn apply(
        &self,
        workflow_id: &WorkflowId,
        expected_version: u64,
        mutation: WorkflowMutation,
    ) -> Result<WorkflowRecord, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut workflow = self
            .get_workflow(workflow_id)?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.clone()))?;
        if workflow.version != expected_version {
            return Err(StoreError::StaleVersion {
                workflow_id: workflow_id.clone(),
                expected: expected_version,
                actual: workflow.version,
            });
        }
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
        self.put_workflow(&workflow)?;
        self.flush().await?;
        Ok(workflow)
    }

    async fn append_decision(
        &self,
        workflow_id: &WorkflowId,
        expected_version: u64,
        decision: DecisionRecord,
    ) -> Result<DecisionAppend, StoreError> {
        let _guard = self.write_guard.lock().await;

        if let Some(key) = self
            .decision_ids
            .get(decision.decision_id.as_str().as_bytes())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            let bytes = self
                .decisions
                .get(key)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
                .ok_or_else(|| {
                    StoreError::Unavailable("decision index out of sync with log".to_owned())
                })?;
            return Ok(DecisionAppend::Duplicate(decode(&bytes)?));
        }

        let mut workflow = self
            .get_workflow(workflow_id)?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.clone()))?;
        if workflow.version != expected_version {
            return Err(StoreError::StaleVersion {
                workflow_id: workflow_id.clone(),
                expected: expected_version,
                actual: workflow.version,
            });
        }

        let seq = self.scoped_len(&self.decisions, workflow_id);
        let key = scoped_key(workflow_id, seq);
        self.decisions
            .insert(key.clone(), encode(&decision)?)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.decision_ids
            .insert(decision.decision_id.as_str().as_bytes(), key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        workflow.current_decision_id = Some(decision.decision_id.clone());
        workflow.state = WorkflowState::Finalised;
        workflow.version += 1;
        workflow.updated_at = Utc::now();
        self.put_workflow(&workflow)?;
        self.flush().await?;
        Ok(DecisionAppend::Appended(workflow))
    }

    async fn record_event(&self, event: &EventEnvelope) -> Result<EventRecord, StoreError> {
        let _guard = self.write_guard.lock().await;
        if self
            .events
            .contains_key(event.event_id.as_str().as_bytes())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        {
            return Ok(EventRecord::Duplicate);
        }
        self.events
            .insert(event.event_id.as_str().as_bytes(), encode(event)?)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let seq = self.scoped_len(&self.event_order, &event.workflow_id);
        self.event_order
            .insert(
                scoped_key(&event.workflow_id, seq),
                event.event_id.as_str().as_bytes(),
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.flush().await?;
        Ok(EventRecord::New)
    }

    async fn discard_event(&self, event_id: &EventId) -> Result<(), StoreError> {
        let _guard = self.write_guard.lock().await;
        let Some(bytes) = self
            .events
            .remove(event_id.as_str().as_bytes())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
        else {
            return Ok(());
        };
        let event: EventEnvelope = decode(&bytes)?;
        for entry in self.event_order.scan_prefix(scope_prefix(&event.workflow_id)) {
            let (key, value) = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            if value.as_ref() == event_id.as_str().as_bytes() {
                self.event_order
                    .remove(key)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                break;
            }
        }
        self.flush().await
    }

    async fn list_events(&self, workflow_id: &WorkflowId) -> Result<Vec<EventEnvelope>, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut out = Vec::new();
        for entry in self.event_order.scan_prefix(scope_prefix(workflow_id)) {
            let (_, event_id) = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            if let Some(bytes) = self
                .events
                .get(&event_id)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
            {
                out.push(decode(&bytes)?);
            }
        }
        Ok(out)
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut matches = Vec::new();
        for entry in self.workflows.iter() {
            let (_, bytes) = entry.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            let workflow: WorkflowRecord = decode(&bytes)?;
            if filter.matches(&workflow) {
                matches.push(workflow);
            }
        }
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches)
    }

    async fn record_dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        let _guard = self.write_guard.lock().await;
        let seq = self.scoped_len(&self.dead_letters, &letter.workflow_id);
        self.dead_letters
            .insert(scoped_key(&letter.workflow_id, seq), encode(&letter)?)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.flush().await
    }

    async fn list_dead_letters(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let _guard = self.write_guard.lock().await;
        self.scoped_entries(&self.dead_letters, workflow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verdict_store_core::decision_id;
    use verdict_types::{
        Authority, CorrelationId, EventKind, Lineage, MatchPayload, Outcome, PolicyRef, Subject,
    };

    fn wf_id() -> WorkflowId {
        WorkflowId::new("wf-1")
    }

    fn envelope(event_id: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: EventId::new(event_id),
            workflow_id: wf_id(),
            tenant_id: TenantId::new("acme"),
            correlation_id: CorrelationId::new(event_id),
            timestamp: Utc::now(),
            kind: EventKind::MatchCompleted(MatchPayload {
                match_score: 0.88,
                model_ids: vec!["facenet-v4".to_owned()],
            }),
        }
    }

    fn decision(workflow: &WorkflowRecord, cause: &str) -> DecisionRecord {
        DecisionRecord {
            decision_id: decision_id(&workflow.workflow_id, &EventId::new(cause), "verdict-engine"),
            workflow_id: workflow.workflow_id.clone(),
            tenant_id: workflow.tenant_id.clone(),
            outcome: Outcome::Approve,
            confidence: 1.0,
            reason_codes: vec!["risk_band_low".to_owned()],
            risk_summary: json!({"band": "low", "score": 15.0}),
            policy: PolicyRef {
                jurisdiction: "eu".to_owned(),
                pack_id: "default".to_owned(),
                pack_version: "1".to_owned(),
            },
            authority: Authority {
                decided_by: "verdict-engine".to_owned(),
                service_version: "0.1.0".to_owned(),
                is_override: false,
                actor_id: None,
            },
            lineage: Lineage { supersedes_decision_id: None },
            subject: Subject {
                subject_type: "identity_workflow".to_owned(),
                subject_id: workflow.workflow_id.to_string(),
                action: "resolve".to_owned(),
            },
            correlation_id: CorrelationId::new(cause),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn workflow_round_trips_through_disk_encoding() {
        let store = SledStore::temporary().unwrap();
        let created = store.create_if_absent(&wf_id(), &TenantId::new("acme")).await.unwrap();
        let loaded = store.load(&wf_id()).await.unwrap().unwrap();
        assert_eq!(loaded.workflow, created);
        assert!(loaded.decisions.is_empty());
    }

    #[tokio::test]
    async fn append_decision_is_idempotent_by_id() {
        let store = SledStore::temporary().unwrap();
        let wf = store.create_if_absent(&wf_id(), &TenantId::new("acme")).await.unwrap();
        let d = decision(&wf, "evt-1");

        let first = store.append_decision(&wf_id(), wf.version, d.clone()).await.unwrap();
        assert!(matches!(first, DecisionAppend::Appended(_)));

        let second = store.append_decision(&wf_id(), wf.version, d.clone()).await.unwrap();
        assert_eq!(second, DecisionAppend::Duplicate(d));

        let snapshot = store.load(&wf_id()).await.unwrap().unwrap();
        assert_eq!(snapshot.decisions.len(), 1);
        assert_eq!(snapshot.workflow.state, WorkflowState::Finalised);
    }

    #[tokio::test]
    async fn decisions_preserve_append_order() {
        let store = SledStore::temporary().unwrap();
        let wf = store.create_if_absent(&wf_id(), &TenantId::new("acme")).await.unwrap();

        let d1 = decision(&wf, "evt-1");
        let DecisionAppend::Appended(wf) =
            store.append_decision(&wf_id(), wf.version, d1.clone()).await.unwrap()
        else {
            panic!("first append must be new");
        };
        let d2 = decision(&wf, "evt-2");
        store.append_decision(&wf_id(), wf.version, d2.clone()).await.unwrap();

        let snapshot = store.load(&wf_id()).await.unwrap().unwrap();
        assert_eq!(
            snapshot.decisions.iter().map(|d| d.decision_id.clone()).collect::<Vec<_>>(),
            vec![d1.decision_id, d2.decision_id]
        );
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = SledStore::temporary().unwrap();
        let wf = store.create_if_absent(&wf_id(), &TenantId::new("acme")).await.unwrap();
        store
            .apply(
                &wf_id(),
                wf.version,
                WorkflowMutation {
                    set_state: Some(WorkflowState::SignalsCollected),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = store
            .apply(&wf_id(), wf.version, WorkflowMutation::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleVersion { .. }));
    }

    #[tokio::test]
    async fn events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.record_event(&envelope("evt-1")).await.unwrap();
            store.record_event(&envelope("evt-2")).await.unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        let events = store.list_events(&wf_id()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, EventId::new("evt-1"));
        assert_eq!(store.record_event(&envelope("evt-1")).await.unwrap(), EventRecord::Duplicate);
    }
}
