#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-bus-core** – Outbound decision event bus abstraction for Verdict.
//!
//! This crate provides the publish/subscribe seam through which the decision
//! authority hands `decision.finalised` records to downstream consumers. It
//! carries no persistence: durability lives in the workflow store's decision
//! log, and publication is at-least-once with `decision_id` as the consumer
//! deduplication key.
//!
//! `override.applied` inputs never appear on this bus; only the decisions
//! they produce do.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use verdict_types::DecisionRecord;

/// Wire name of the single outbound authoritative event.
pub const DECISION_FINALISED: &str = "decision.finalised";

//─────────────────────────────
//  Bus trait
//─────────────────────────────

/// Publish/subscribe abstraction for authoritative decisions.
///
/// Implementations must be thread-safe and support multiple subscribers.
/// Publishing should complete quickly and never block the deciding path;
/// slow subscribers may miss events and are expected to recover from the
/// decision log.
pub trait DecisionBus: Send + Sync {
    /// Publish a finalised decision to all subscribers.
    fn publish(&self, decision: &DecisionRecord) -> Result<(), BusError>;

    /// Subscribe to the live decision stream.
    fn subscribe(&self) -> broadcast::Receiver<DecisionRecord>;
}

//─────────────────────────────
//  In-memory bus implementation
//─────────────────────────────

/// Simple in-memory, broadcast-only decision bus using Tokio channels.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<DecisionRecord>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Create a new in-memory bus with the specified ring buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl DecisionBus for InMemoryBus {
    fn publish(&self, decision: &DecisionRecord) -> Result<(), BusError> {
        // Lagging receivers must recover from the decision log
        let _ = self.tx.send(decision.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DecisionRecord> {
        self.tx.subscribe()
    }
}

//─────────────────────────────
//  Buffered publisher
//─────────────────────────────

/// Decorator implementing the `async_with_buffer` publish mode.
///
/// Publishes enqueue onto a bounded channel drained by a forwarder task, so
/// the deciding path never waits on subscriber fan-out. A full buffer fails
/// the publish; the decision is already durable in the store at that point,
/// so callers log and move on rather than blocking finalisation.
pub struct BufferedBus {
    inner: Arc<dyn DecisionBus>,
    tx: mpsc::Sender<DecisionRecord>,
}

impl BufferedBus {
    /// Wrap `inner`, spawning the forwarder task on the current runtime.
    pub fn spawn(inner: Arc<dyn DecisionBus>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<DecisionRecord>(capacity);
        let forward_to = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(decision) = rx.recv().await {
                if let Err(err) = forward_to.publish(&decision) {
                    warn!(decision_id = %decision.decision_id, %err, "buffered publish failed");
                }
            }
        });
        Self { inner, tx }
    }
}

impl DecisionBus for BufferedBus {
    fn publish(&self, decision: &DecisionRecord) -> Result<(), BusError> {
        self.tx
            .try_send(decision.clone())
            .map_err(|_| BusError::BufferFull(decision.decision_id.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<DecisionRecord> {
        self.inner.subscribe()
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Decision could not be published.
    #[error("failed to publish decision: {0}")]
    PublishFailed(String),
    /// The async publish buffer is full.
    #[error("publish buffer full, dropping decision {0}")]
    BufferFull(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verdict_types::{
        Authority, CorrelationId, DecisionId, Lineage, Outcome, PolicyRef, Subject, TenantId,
        WorkflowId,
    };

    fn decision(id: &str) -> DecisionRecord {
        DecisionRecord {
            decision_id: DecisionId::new(id),
            workflow_id: WorkflowId::new("wf-1"),
            tenant_id: TenantId::new("acme"),
            outcome: Outcome::Approve,
            confidence: 0.9,
            reason_codes: vec!["risk_band_low".to_owned()],
            risk_summary: serde_json::json!({"band": "low"}),
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
                subject_id: "wf-1".to_owned(),
                action: "resolve".to_owned(),
            },
            correlation_id: CorrelationId::new("corr-1"),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_bus_delivers_to_all_subscribers() {
        let bus = InMemoryBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let d = decision("d-1");
        bus.publish(&d).unwrap();

        assert_eq!(rx1.recv().await.unwrap(), d);
        assert_eq!(rx2.recv().await.unwrap(), d);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = InMemoryBus::default();
        bus.publish(&decision("d-2")).unwrap();
    }

    #[tokio::test]
    async fn buffered_bus_forwards_to_inner_subscribers() {
        let inner: Arc<dyn DecisionBus> = Arc::new(InMemoryBus::new(16));
        let buffered = BufferedBus::spawn(Arc::clone(&inner), 8);
        let mut rx = buffered.subscribe();

        let d = decision("d-3");
        buffered.publish(&d).unwrap();

        assert_eq!(rx.recv().await.unwrap(), d);
    }
}
