//! Per-event processing pipeline.
//!
//! A handler invocation owns its workflow between suspension points: the
//! serializer guarantees no other handler runs for the same workflow, so the
//! pipeline can load, transition, call risk and finalise without taking
//! locks. Optimistic-version conflicts can still arise from operator tooling
//! writing to the same store; they are absorbed by a bounded reload loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use verdict_engine::machine::{self, Effect, MachineInput, RiskDisposition};
use verdict_engine::{DecisionAuthority, MachineError, OverrideContext, PolicySet};
use verdict_risk::{RiskError, RiskEvaluator};
use verdict_store_core::{DeadLetter, StoreError, WorkflowStore};
use verdict_types::{EventEnvelope, WorkflowId, WorkflowRecord, WorkflowState};

use crate::config::{RiskExhaustedAction, RuntimeConfig};

/// Bound on reload cycles after optimistic-version conflicts.
const STALE_RETRY_BOUND: u32 = 3;

//─────────────────────────────
//  Actor-facing contract
//─────────────────────────────

/// How the serializer should proceed after a handler invocation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    /// The input was processed (possibly as a recorded no-op).
    Done {
        /// Arm a signals-timeout tick this far in the future.
        arm_signals_tick: Option<Duration>,
    },
    /// A retriable failure; the event should be retried in place.
    Retry(String),
    /// A terminal failure; the event dead-letters immediately.
    Failed(String),
}

/// Contract between the serializer's actors and the processing pipeline.
#[async_trait]
pub(crate) trait ActorHandler: Send + Sync {
    /// Process one external event.
    async fn handle_event(&self, event: &EventEnvelope) -> HandlerOutcome;

    /// Process a signals-timeout tick.
    async fn handle_tick(&self, workflow_id: &WorkflowId) -> HandlerOutcome;

    /// Record a terminal processing failure.
    async fn dead_letter(&self, event: &EventEnvelope, attempts: u32, reason: &str);
}

//─────────────────────────────
//  Pipeline errors
//─────────────────────────────

#[derive(Debug)]
enum HandlerError {
    /// Version conflict; reload and re-run within the bound.
    Stale,
    /// Worth retrying the whole event later.
    Retriable(String),
    /// Retrying cannot help.
    Terminal(String),
}

impl HandlerError {
    fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::StaleVersion { .. } => HandlerError::Stale,
            StoreError::Unavailable(msg) => HandlerError::Retriable(msg),
            other => HandlerError::Terminal(other.to_string()),
        }
    }

    fn into_outcome(self) -> HandlerOutcome {
        match self {
            HandlerError::Stale => {
                HandlerOutcome::Retry("stale version retries exhausted".to_owned())
            }
            HandlerError::Retriable(msg) => HandlerOutcome::Retry(msg),
            HandlerError::Terminal(msg) => HandlerOutcome::Failed(msg),
        }
    }
}

impl From<verdict_engine::AuthorityError> for HandlerError {
    fn from(err: verdict_engine::AuthorityError) -> Self {
        match err {
            verdict_engine::AuthorityError::Store(store) => HandlerError::from_store(store),
            other => HandlerError::Terminal(other.to_string()),
        }
    }
}

//─────────────────────────────
//  Event handler
//─────────────────────────────

/// The processing pipeline behind every per-workflow actor.
pub(crate) struct EventHandler {
    store: Arc<dyn WorkflowStore>,
    risk: Arc<dyn RiskEvaluator>,
    authority: DecisionAuthority,
    policies: PolicySet,
    deadline: Duration,
    risk_exhausted: RiskExhaustedAction,
    signals_timeout: Option<Duration>,
}

impl EventHandler {
    pub(crate) fn new(
        config: &RuntimeConfig,
        store: Arc<dyn WorkflowStore>,
        risk: Arc<dyn RiskEvaluator>,
        authority: DecisionAuthority,
    ) -> Self {
        Self {
            store,
            risk,
            authority,
            policies: config.policies.clone(),
            deadline: config.event_handler_deadline(),
            risk_exhausted: config.risk_exhausted_action,
            signals_timeout: config.signals_timeout(),
        }
    }

    /// Run the pipeline for one event with stale-version reloads.
    async fn process_event(&self, event: &EventEnvelope) -> Result<Option<Duration>, HandlerError> {
        for _ in 0..=STALE_RETRY_BOUND {
            let snapshot = self
                .store
                .load(&event.workflow_id)
                .await
                .map_err(HandlerError::from_store)?
                .ok_or_else(|| {
                    HandlerError::Terminal(format!(
                        "workflow {} missing at processing time",
                        event.workflow_id
                    ))
                })?;
            match self.run_event(snapshot.workflow, event).await {
                Err(HandlerError::Stale) => continue,
                other => return other,
            }
        }
        Err(HandlerError::Stale)
    }

    async fn run_event(
        &self,
        workflow: WorkflowRecord,
        event: &EventEnvelope,
    ) -> Result<Option<Duration>, HandlerError> {
        let transition = match machine::step(&workflow, MachineInput::External(event)) {
            Ok(transition) => transition,
            Err(MachineError::InvalidOverrideTarget { state }) => {
                return Err(HandlerError::Terminal(format!(
                    "override {} targets workflow {} in state {state:?}",
                    event.event_id, event.workflow_id
                )));
            }
        };

        if let Some(reason) = transition.noop {
            debug!(
                workflow_id = %event.workflow_id,
                event_id = %event.event_id,
                reason,
                "event recorded as no-op"
            );
            return Ok(None);
        }

        let mutation = transition.mutation();
        let effect = transition.effect;
        let workflow = if mutation.is_empty() {
            workflow
        } else {
            self.store
                .apply(&event.workflow_id, workflow.version, mutation)
                .await
                .map_err(HandlerError::from_store)?
        };

        match effect {
            Some(Effect::EmitOverrideDecision { outcome, reason, actor_id }) => {
                self.authority
                    .finalise(
                        &workflow,
                        event,
                        None,
                        self.pack_for(&workflow)?,
                        Some(OverrideContext { outcome, reason, actor_id }),
                    )
                    .await?;
                Ok(None)
            }
            // The external table never produces these; internal inputs do.
            Some(Effect::InvokeRisk) | Some(Effect::EmitDecision(_)) => Ok(None),
            None => self.after_signal_update(workflow, event).await,
        }
    }

    /// Decide what a recorded signal update leads to: completion, a resumed
    /// risk evaluation, a timeout arm, or nothing.
    async fn after_signal_update(
        &self,
        workflow: WorkflowRecord,
        event: &EventEnvelope,
    ) -> Result<Option<Duration>, HandlerError> {
        let pack = self.pack_for(&workflow)?;

        if workflow.state == WorkflowState::SignalsCollected
            && !workflow.signals_complete_emitted
            && pack.signals_complete(&workflow.signals)
        {
            return self.advance_to_risk(workflow, event, false).await;
        }

        // Risk was invoked but never finalised (crash window or a retained
        // transient failure): the next event through drives it to completion
        // and becomes the decision's cause.
        if workflow.state == WorkflowState::RiskEvaluated
            && workflow.current_decision_id.is_none()
            && workflow.signals_complete_emitted
        {
            return self.evaluate_and_finalise(workflow, event).await;
        }

        if workflow.state == WorkflowState::SignalsCollected {
            return Ok(self.signals_timeout);
        }
        Ok(None)
    }

    /// Close the signal set and run the risk leg.
    async fn advance_to_risk(
        &self,
        workflow: WorkflowRecord,
        cause: &EventEnvelope,
        timed_out: bool,
    ) -> Result<Option<Duration>, HandlerError> {
        let transition = machine::step(&workflow, MachineInput::SignalsComplete { timed_out })
            .map_err(|e| HandlerError::Terminal(e.to_string()))?;
        if transition.noop.is_some() {
            return Ok(None);
        }
        let workflow = self
            .store
            .apply(&workflow.workflow_id, workflow.version, transition.mutation())
            .await
            .map_err(HandlerError::from_store)?;
        self.evaluate_and_finalise(workflow, cause).await
    }

    /// Call the risk service and finalise from its disposition.
    async fn evaluate_and_finalise(
        &self,
        workflow: WorkflowRecord,
        cause: &EventEnvelope,
    ) -> Result<Option<Duration>, HandlerError> {
        let disposition = match self.risk.evaluate(&workflow).await {
            Ok(result) => RiskDisposition::Evaluated(result),
            Err(RiskError::Permanent(detail)) => RiskDisposition::UnavailablePermanent { detail },
            Err(RiskError::Transient(detail)) => match self.risk_exhausted {
                RiskExhaustedAction::Review => RiskDisposition::UnavailableTransient { detail },
                RiskExhaustedAction::Retain => {
                    return Err(HandlerError::Retriable(format!(
                        "risk unavailable, event retained: {detail}"
                    )));
                }
            },
        };

        let transition = machine::step(&workflow, MachineInput::RiskReturned(disposition))
            .map_err(|e| HandlerError::Terminal(e.to_string()))?;
        if let Some(Effect::EmitDecision(disposition)) = transition.effect {
            self.authority
                .finalise(&workflow, cause, Some(&disposition), self.pack_for(&workflow)?, None)
                .await?;
        }
        Ok(None)
    }

    /// Run the pipeline for a signals-timeout tick.
    async fn process_tick(&self, workflow_id: &WorkflowId) -> Result<Option<Duration>, HandlerError> {
        let Some(timeout_budget) = self.signals_timeout else {
            return Ok(None);
        };
        for _ in 0..=STALE_RETRY_BOUND {
            let Some(snapshot) = self
                .store
                .load(workflow_id)
                .await
                .map_err(HandlerError::from_store)?
            else {
                return Ok(None);
            };
            let workflow = snapshot.workflow;
            if workflow.state != WorkflowState::SignalsCollected
                || workflow.signals_complete_emitted
            {
                return Ok(None);
            }

            let waited = Utc::now()
                .signed_duration_since(workflow.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if waited < timeout_budget {
                // A signal arrived since the tick was armed; re-arm for the
                // remainder.
                return Ok(Some(timeout_budget - waited));
            }

            let events =
                self.store.list_events(workflow_id).await.map_err(HandlerError::from_store)?;
            let Some(cause) = events.last().cloned() else {
                return Ok(None);
            };
            match self.advance_to_risk(workflow, &cause, true).await {
                Err(HandlerError::Stale) => continue,
                other => return other,
            }
        }
        Err(HandlerError::Stale)
    }

    fn pack_for(&self, workflow: &WorkflowRecord) -> Result<&verdict_engine::PolicyPack, HandlerError> {
        self.policies
            .pack_for_tenant(&workflow.tenant_id)
            .map_err(|e| HandlerError::Terminal(e.to_string()))
    }
}

#[async_trait]
impl ActorHandler for EventHandler {
    async fn handle_event(&self, event: &EventEnvelope) -> HandlerOutcome {
        match timeout(self.deadline, self.process_event(event)).await {
            Ok(Ok(arm_signals_tick)) => HandlerOutcome::Done { arm_signals_tick },
            Ok(Err(err)) => err.into_outcome(),
            Err(_) => HandlerOutcome::Retry("event handler deadline exceeded".to_owned()),
        }
    }

    async fn handle_tick(&self, workflow_id: &WorkflowId) -> HandlerOutcome {
        match timeout(self.deadline, self.process_tick(workflow_id)).await {
            Ok(Ok(arm_signals_tick)) => HandlerOutcome::Done { arm_signals_tick },
            Ok(Err(err)) => err.into_outcome(),
            Err(_) => HandlerOutcome::Retry("tick handler deadline exceeded".to_owned()),
        }
    }

    async fn dead_letter(&self, event: &EventEnvelope, attempts: u32, reason: &str) {
        error!(
            workflow_id = %event.workflow_id,
            event_id = %event.event_id,
            attempts,
            reason,
            "event dead-lettered"
        );
        let letter = DeadLetter {
            event_id: event.event_id.clone(),
            workflow_id: event.workflow_id.clone(),
            attempts,
            reason: reason.to_owned(),
            failed_at: Utc::now(),
        };
        if let Err(err) = self.store.record_dead_letter(letter).await {
            warn!(event_id = %event.event_id, %err, "failed to record dead letter");
        }
    }
}
