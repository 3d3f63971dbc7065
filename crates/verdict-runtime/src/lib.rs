#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-runtime** – Async coordination layer of Verdict.
//!
//! Wires the deterministic engine to the outside world: the ingress
//! dispatcher validates and records events, the per-workflow serialiser
//! guarantees one in-flight handler per workflow, and the handler pipeline
//! drives transitions, risk evaluation and finalisation. All collaborators
//! (store, risk evaluator, decision bus) are injected; the runtime owns no
//! global state.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;

use verdict_bus_core::{BufferedBus, DecisionBus};
use verdict_engine::{AuthorityIdentity, DecisionAuthority};
use verdict_risk::{Retrying, RiskEvaluator};
use verdict_store_core::WorkflowStore;
use verdict_types::DecisionRecord;

pub mod config;
pub mod dispatch;
pub mod queries;

mod handler;
mod serializer;

pub use config::{PublishMode, RiskExhaustedAction, RuntimeConfig};
pub use dispatch::{Dispatcher, IngressResponse};
pub use queries::{current_decision, list_workflows, timeline, TimelineEntry};

use handler::EventHandler;
use serializer::Serializer;

/// Default capacity of the buffered outbound publisher.
const PUBLISH_BUFFER: usize = 1024;

//─────────────────────────────
//  Orchestrator
//─────────────────────────────

/// Fully wired orchestrator: dispatcher, serialiser and handler pipeline
/// over injected collaborators.
///
/// Construction must happen inside a tokio runtime; the serialiser spawns
/// per-workflow tasks and the buffered publish mode spawns a forwarder.
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn DecisionBus>,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    /// Wire an orchestrator from configuration and collaborators.
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn WorkflowStore>,
        risk: Arc<dyn RiskEvaluator>,
        bus: Arc<dyn DecisionBus>,
    ) -> anyhow::Result<Self> {
        config.policies.validate().context("invalid policy configuration")?;

        let publish_bus: Arc<dyn DecisionBus> = match config.outbound_publish_mode {
            PublishMode::Sync => Arc::clone(&bus),
            PublishMode::AsyncWithBuffer => {
                Arc::new(BufferedBus::spawn(Arc::clone(&bus), PUBLISH_BUFFER))
            }
        };

        let retrying: Arc<dyn RiskEvaluator> =
            Arc::new(Retrying::new(risk, config.risk_retry_policy()));

        let authority = DecisionAuthority::new(
            AuthorityIdentity::default(),
            Arc::clone(&store),
            publish_bus,
        );

        let handler =
            Arc::new(EventHandler::new(&config, Arc::clone(&store), retrying, authority));
        let serializer = Arc::new(Serializer::new(
            handler,
            config.worker_cap,
            config.per_workflow_queue_depth,
            config.actor_idle_ttl(),
            config.dead_letter_max_attempts,
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&store), serializer);

        Ok(Self { store, bus, dispatcher })
    }

    /// Ingest one raw event envelope.
    pub async fn submit(&self, raw: serde_json::Value) -> IngressResponse {
        self.dispatcher.submit(raw).await
    }

    /// The injected workflow store, for projection reads.
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Subscribe to the outbound `decision.finalised` stream.
    pub fn subscribe_decisions(&self) -> broadcast::Receiver<DecisionRecord> {
        self.bus.subscribe()
    }
}
