//! Ingress dispatcher.
//!
//! Accepts raw event envelopes, validates them, records them for
//! idempotency, ensures the workflow exists, and hands them to the
//! per-workflow serialiser. The acknowledgement means *enqueued*, not
//! *processed*: callers that need the outcome read the projection API or
//! subscribe to the outbound decision stream.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use verdict_store_core::{EventRecord, WorkflowStore};
use verdict_types::{parse_envelope, EventId, ValidationError};

use crate::serializer::{EnqueueOutcome, Serializer};

/// Ingress acknowledgement returned to the submitting client.
#[derive(Debug, Clone, PartialEq)]
pub enum IngressResponse {
    /// Newly recorded and enqueued for processing.
    Accepted {
        /// Recorded event id (server-assigned when the client omitted it).
        event_id: EventId,
    },
    /// The event id was seen before; the submission is an acknowledged
    /// no-op.
    Duplicate {
        /// The previously recorded event id.
        event_id: EventId,
    },
    /// The workflow's queue is full; the caller should retry with backoff.
    Backpressure {
        /// Event id of the rejected submission.
        event_id: EventId,
    },
    /// The envelope failed validation; not retriable as submitted.
    Invalid {
        /// What was wrong with the envelope.
        error: ValidationError,
    },
}

impl IngressResponse {
    /// Wire status token for the HTTP surface.
    pub fn status(&self) -> &'static str {
        match self {
            IngressResponse::Accepted { .. } => "accepted",
            IngressResponse::Duplicate { .. } => "duplicate",
            IngressResponse::Backpressure { .. } => "backpressure",
            IngressResponse::Invalid { .. } => "invalid",
        }
    }
}

/// Validates, records and routes inbound events.
pub struct Dispatcher {
    store: Arc<dyn WorkflowStore>,
    serializer: Arc<Serializer>,
}

impl Dispatcher {
    pub(crate) fn new(store: Arc<dyn WorkflowStore>, serializer: Arc<Serializer>) -> Self {
        Self { store, serializer }
    }

    /// Ingest one raw envelope.
    pub async fn submit(&self, raw: Value) -> IngressResponse {
        let envelope = match parse_envelope(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                debug!(%error, "rejected invalid event");
                return IngressResponse::Invalid { error };
            }
        };
        let event_id = envelope.event_id.clone();

        match self.store.record_event(&envelope).await {
            Ok(EventRecord::New) => {}
            Ok(EventRecord::Duplicate) => {
                debug!(event_id = %event_id, "duplicate event acknowledged");
                return IngressResponse::Duplicate { event_id };
            }
            Err(err) => {
                warn!(event_id = %event_id, %err, "event record failed, asking caller to retry");
                return IngressResponse::Backpressure { event_id };
            }
        }

        if let Err(err) = self
            .store
            .create_if_absent(&envelope.workflow_id, &envelope.tenant_id)
            .await
        {
            warn!(
                workflow_id = %envelope.workflow_id,
                %err,
                "workflow creation failed, unrecording event"
            );
            let _ = self.store.discard_event(&event_id).await;
            return IngressResponse::Backpressure { event_id };
        }

        match self.serializer.enqueue(envelope) {
            EnqueueOutcome::Enqueued => {
                info!(event_id = %event_id, "event accepted");
                IngressResponse::Accepted { event_id }
            }
            EnqueueOutcome::Backpressure => {
                // The event never reached a queue; forget it so a retried
                // delivery is not mistaken for a processed duplicate.
                let _ = self.store.discard_event(&event_id).await;
                IngressResponse::Backpressure { event_id }
            }
        }
    }
}
