//! Pure workflow state machine.
//!
//! Transitions are a function of the current workflow record and one input;
//! they return declarative signal updates, an optional state change and an
//! optional side effect for the caller to execute. The machine performs no
//! IO and never constructs decisions itself.

use std::collections::BTreeMap;

use serde_json::Value;

use verdict_store_core::WorkflowMutation;
use verdict_types::{
    signal, EventEnvelope, EventKind, Outcome, RiskResult, WorkflowRecord, WorkflowState,
};

//─────────────────────────────
//  Machine inputs
//─────────────────────────────

/// Outcome of the risk evaluation attempt fed back into the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDisposition {
    /// The risk service returned a result.
    Evaluated(RiskResult),
    /// The risk service failed non-retriably.
    UnavailablePermanent {
        /// Failure description.
        detail: String,
    },
    /// Retries were exhausted on transient failures.
    UnavailableTransient {
        /// Failure description.
        detail: String,
    },
}

/// One input to the state machine.
///
/// `SignalsComplete` and `RiskReturned` are the internal inputs of the
/// transition table; they are synthesised by the handler, never ingested.
#[derive(Debug)]
pub enum MachineInput<'a> {
    /// A validated external event.
    External(&'a EventEnvelope),
    /// The required signal set closed (or the signals timeout fired).
    SignalsComplete {
        /// Whether a timeout, not completeness, closed the set.
        timed_out: bool,
    },
    /// The risk evaluation attempt concluded.
    RiskReturned(RiskDisposition),
}

//─────────────────────────────
//  Transition output
//─────────────────────────────

/// Declarative side effect for the caller to execute after persisting the
/// transition's mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Call the risk service with the post-mutation workflow snapshot.
    InvokeRisk,
    /// Finalise a decision from the given risk disposition.
    EmitDecision(RiskDisposition),
    /// Finalise an override decision superseding the current one.
    EmitOverrideDecision {
        /// Outcome imposed by the human actor.
        outcome: Outcome,
        /// Human-readable justification from the override payload.
        reason: String,
        /// Authorising actor id.
        actor_id: String,
    },
}

/// Result of one transition.
#[derive(Debug, Default, PartialEq)]
pub struct Transition {
    /// New lifecycle state, when changing.
    pub set_state: Option<WorkflowState>,
    /// Signal facts to merge into the workflow.
    pub signal_updates: BTreeMap<String, Value>,
    /// Latch the one-shot completion flag.
    pub mark_signals_complete: bool,
    /// Side effect to execute, if any.
    pub effect: Option<Effect>,
    /// Set when the input changed nothing; names why, for the audit log.
    pub noop: Option<&'static str>,
}

impl Transition {
    fn noop(reason: &'static str) -> Self {
        Self { noop: Some(reason), ..Default::default() }
    }

    /// Whether the transition mutates the workflow record.
    pub fn mutates(&self) -> bool {
        self.set_state.is_some() || !self.signal_updates.is_empty() || self.mark_signals_complete
    }

    /// The store mutation this transition prescribes.
    pub fn mutation(&self) -> WorkflowMutation {
        WorkflowMutation {
            set_state: self.set_state,
            merge_signals: self.signal_updates.clone(),
            mark_signals_complete: self.mark_signals_complete,
        }
    }
}

/// Transition rejections surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    /// An override arrived for a workflow that has never finalised.
    #[error("override targets workflow in state {state:?} with no decision to supersede")]
    InvalidOverrideTarget {
        /// State the workflow was in.
        state: WorkflowState,
    },
}

//─────────────────────────────
//  Transition function
//─────────────────────────────

/// Advance `workflow` by one input.
///
/// Pure: the only observable output is the returned [`Transition`].
pub fn step(workflow: &WorkflowRecord, input: MachineInput<'_>) -> Result<Transition, MachineError> {
    match input {
        MachineInput::External(event) => step_external(workflow, event),
        MachineInput::SignalsComplete { timed_out } => Ok(step_signals_complete(workflow, timed_out)),
        MachineInput::RiskReturned(disposition) => Ok(step_risk_returned(workflow, disposition)),
    }
}

fn step_external(
    workflow: &WorkflowRecord,
    event: &EventEnvelope,
) -> Result<Transition, MachineError> {
    match &event.kind {
        EventKind::SelfieUploaded(_) | EventKind::DocumentUploaded(_) | EventKind::MatchCompleted(_) => {
            let set_state = match workflow.state {
                WorkflowState::Pending => Some(WorkflowState::SignalsCollected),
                // Late or parallel arrivals are recorded on signals without
                // re-opening the state or re-triggering risk.
                _ => None,
            };
            Ok(Transition {
                set_state,
                signal_updates: event.kind.signal_updates(),
                ..Default::default()
            })
        }
        EventKind::OverrideApplied(payload) => match workflow.state {
            WorkflowState::Finalised => Ok(Transition {
                set_state: Some(WorkflowState::Superseded),
                effect: Some(Effect::EmitOverrideDecision {
                    outcome: payload.new_outcome,
                    reason: payload.reason.clone(),
                    actor_id: payload.authorized_by.clone(),
                }),
                ..Default::default()
            }),
            // Redelivery window: the supersede write landed but the new
            // decision did not. The deterministic decision id makes the
            // re-emission idempotent.
            WorkflowState::Superseded => Ok(Transition {
                effect: Some(Effect::EmitOverrideDecision {
                    outcome: payload.new_outcome,
                    reason: payload.reason.clone(),
                    actor_id: payload.authorized_by.clone(),
                }),
                ..Default::default()
            }),
            state => Err(MachineError::InvalidOverrideTarget { state }),
        },
    }
}

fn step_signals_complete(workflow: &WorkflowRecord, timed_out: bool) -> Transition {
    if workflow.state != WorkflowState::SignalsCollected {
        return Transition::noop("signals_complete_outside_collection");
    }
    if workflow.signals_complete_emitted {
        return Transition::noop("signals_complete_already_emitted");
    }
    let mut signal_updates = BTreeMap::new();
    if timed_out {
        signal_updates.insert(signal::SIGNALS_TIMED_OUT.to_owned(), Value::Bool(true));
    }
    Transition {
        set_state: Some(WorkflowState::RiskEvaluated),
        signal_updates,
        mark_signals_complete: true,
        effect: Some(Effect::InvokeRisk),
        ..Default::default()
    }
}

fn step_risk_returned(workflow: &WorkflowRecord, disposition: RiskDisposition) -> Transition {
    if workflow.state != WorkflowState::RiskEvaluated {
        return Transition::noop("risk_result_outside_evaluation");
    }
    if workflow.current_decision_id.is_some() {
        return Transition::noop("risk_result_after_finalisation");
    }
    Transition { effect: Some(Effect::EmitDecision(disposition)), ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use verdict_types::{
        CorrelationId, DecisionId, DocumentPayload, EventId, MatchPayload, OverridePayload,
        SelfiePayload, TenantId, WorkflowId,
    };

    fn workflow(state: WorkflowState) -> WorkflowRecord {
        let mut wf =
            WorkflowRecord::new(WorkflowId::new("wf-1"), TenantId::new("acme"), Utc::now());
        wf.state = state;
        wf
    }

    fn event(kind: EventKind) -> EventEnvelope {
        EventEnvelope {
            event_id: EventId::new("evt-1"),
            workflow_id: WorkflowId::new("wf-1"),
            tenant_id: TenantId::new("acme"),
            correlation_id: CorrelationId::new("evt-1"),
            timestamp: Utc::now(),
            kind,
        }
    }

    fn selfie() -> EventEnvelope {
        event(EventKind::SelfieUploaded(SelfiePayload {
            liveness_score: 0.85,
            confidence: 0.9,
            face_centered: true,
            face_size: 0.4,
        }))
    }

    fn override_event() -> EventEnvelope {
        event(EventKind::OverrideApplied(OverridePayload {
            new_outcome: Outcome::Decline,
            reason: "manual review".to_owned(),
            authorized_by: "inv_007".to_owned(),
        }))
    }

    #[test]
    fn first_signal_moves_pending_to_collecting() {
        let t = step(&workflow(WorkflowState::Pending), MachineInput::External(&selfie())).unwrap();
        assert_eq!(t.set_state, Some(WorkflowState::SignalsCollected));
        assert!(t.signal_updates.contains_key(signal::LIVENESS_SCORE));
        assert!(t.effect.is_none());
    }

    #[test]
    fn further_signals_accumulate_without_state_change() {
        let doc = event(EventKind::DocumentUploaded(DocumentPayload {
            document_type: "passport".to_owned(),
            quality_score: 0.9,
        }));
        let t = step(&workflow(WorkflowState::SignalsCollected), MachineInput::External(&doc))
            .unwrap();
        assert_eq!(t.set_state, None);
        assert!(t.signal_updates.contains_key(signal::DOCUMENT_QUALITY));
    }

    #[test]
    fn late_signals_after_finalisation_are_recorded_but_inert() {
        let m = event(EventKind::MatchCompleted(MatchPayload {
            match_score: 0.88,
            model_ids: vec![],
        }));
        let t = step(&workflow(WorkflowState::Finalised), MachineInput::External(&m)).unwrap();
        assert_eq!(t.set_state, None);
        assert!(t.effect.is_none());
        assert!(t.mutates());
    }

    #[test]
    fn signals_complete_fires_risk_exactly_once() {
        let wf = workflow(WorkflowState::SignalsCollected);
        let t = step(&wf, MachineInput::SignalsComplete { timed_out: false }).unwrap();
        assert_eq!(t.set_state, Some(WorkflowState::RiskEvaluated));
        assert!(t.mark_signals_complete);
        assert_eq!(t.effect, Some(Effect::InvokeRisk));

        let mut emitted = wf.clone();
        emitted.signals_complete_emitted = true;
        let t = step(&emitted, MachineInput::SignalsComplete { timed_out: false }).unwrap();
        assert_eq!(t.noop, Some("signals_complete_already_emitted"));
        assert!(!t.mutates());
    }

    #[test]
    fn timed_out_completion_marks_the_signal_set() {
        let t = step(
            &workflow(WorkflowState::SignalsCollected),
            MachineInput::SignalsComplete { timed_out: true },
        )
        .unwrap();
        assert_eq!(t.signal_updates[signal::SIGNALS_TIMED_OUT], Value::Bool(true));
    }

    #[test]
    fn risk_return_emits_decision_only_while_evaluating() {
        let d = RiskDisposition::Evaluated(RiskResult {
            band: "low".to_owned(),
            score: 15.0,
            confidence: 0.97,
            detail: Value::Null,
        });
        let t = step(&workflow(WorkflowState::RiskEvaluated), MachineInput::RiskReturned(d.clone()))
            .unwrap();
        assert_eq!(t.effect, Some(Effect::EmitDecision(d.clone())));

        let t = step(&workflow(WorkflowState::Pending), MachineInput::RiskReturned(d)).unwrap();
        assert!(t.noop.is_some());
    }

    #[test]
    fn risk_return_after_decision_is_inert() {
        let mut wf = workflow(WorkflowState::RiskEvaluated);
        wf.current_decision_id = Some(DecisionId::new("d-1"));
        let t = step(
            &wf,
            MachineInput::RiskReturned(RiskDisposition::UnavailableTransient {
                detail: "late".to_owned(),
            }),
        )
        .unwrap();
        assert_eq!(t.noop, Some("risk_result_after_finalisation"));
    }

    #[test]
    fn override_supersedes_only_finalised_workflows() {
        let ovr = override_event();
        let t = step(&workflow(WorkflowState::Finalised), MachineInput::External(&ovr)).unwrap();
        assert_eq!(t.set_state, Some(WorkflowState::Superseded));
        assert!(matches!(t.effect, Some(Effect::EmitOverrideDecision { .. })));

        // Redelivery after the supersede write landed re-emits without a
        // state change.
        let t = step(&workflow(WorkflowState::Superseded), MachineInput::External(&ovr)).unwrap();
        assert_eq!(t.set_state, None);
        assert!(matches!(t.effect, Some(Effect::EmitOverrideDecision { .. })));

        let err =
            step(&workflow(WorkflowState::Pending), MachineInput::External(&ovr)).unwrap_err();
        assert_eq!(err, MachineError::InvalidOverrideTarget { state: WorkflowState::Pending });
    }
}
