use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::Value;

use verdict_bus_core::{DecisionBus, InMemoryBus};
use verdict_engine::machine::{self, Effect, MachineInput, RiskDisposition};
use verdict_engine::{AuthorityError, AuthorityIdentity, DecisionAuthority, OverrideContext, PolicyPack};
use verdict_store_core::{decision_id, WorkflowStore};
use verdict_store_memory::MemoryStore;
use verdict_types::{
    CorrelationId, EventEnvelope, EventId, EventKind, MatchPayload, Outcome, OverridePayload,
    TenantId, WorkflowId, WorkflowRecord, WorkflowState,
};

//──────────────────────────────────────────────────────────────────────────────
//  Fixtures
//──────────────────────────────────────────────────────────────────────────────

fn wf_id() -> WorkflowId {
    WorkflowId::new("wf-1")
}

fn match_event(event_id: &str) -> EventEnvelope {
    EventEnvelope {
        event_id: EventId::new(event_id),
        workflow_id: wf_id(),
        tenant_id: TenantId::new("acme"),
        correlation_id: CorrelationId::new(event_id),
        timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        kind: EventKind::MatchCompleted(MatchPayload {
            match_score: 0.88,
            model_ids: vec!["facenet-v4".to_owned()],
        }),
    }
}

fn override_event(event_id: &str, actor: &str) -> EventEnvelope {
    EventEnvelope {
        event_id: EventId::new(event_id),
        workflow_id: wf_id(),
        tenant_id: TenantId::new("acme"),
        correlation_id: CorrelationId::new(event_id),
        timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
        kind: EventKind::OverrideApplied(OverridePayload {
            new_outcome: Outcome::Decline,
            reason: "manual review".to_owned(),
            authorized_by: actor.to_owned(),
        }),
    }
}

fn low_risk() -> RiskDisposition {
    RiskDisposition::Evaluated(verdict_types::RiskResult {
        band: "low".to_owned(),
        score: 15.0,
        confidence: 0.97,
        detail: Value::Null,
    })
}

struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<InMemoryBus>,
    authority: DecisionAuthority,
    pack: PolicyPack,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryBus::new(16));
    let authority = DecisionAuthority::new(
        AuthorityIdentity::default(),
        Arc::clone(&store) as Arc<dyn WorkflowStore>,
        Arc::clone(&bus) as Arc<dyn DecisionBus>,
    );
    Harness { store, bus, authority, pack: PolicyPack::baseline() }
}

async fn created(store: &MemoryStore) -> WorkflowRecord {
    store.create_if_absent(&wf_id(), &TenantId::new("acme")).await.unwrap()
}

//──────────────────────────────────────────────────────────────────────────────
//  Tests
//──────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn risk_finalisation_appends_and_publishes() -> Result<()> {
    let h = harness();
    let mut rx = h.bus.subscribe();
    let wf = created(&h.store).await;
    let cause = match_event("evt-match");

    let outcome = h.authority.finalise(&wf, &cause, Some(&low_risk()), &h.pack, None).await?;
    let decision = outcome.decision();

    assert_eq!(decision.outcome, Outcome::Approve);
    assert_eq!(
        decision.decision_id,
        decision_id(&wf_id(), &cause.event_id, "verdict-engine")
    );
    assert_eq!(decision.lineage.supersedes_decision_id, None);
    assert!(!decision.authority.is_override);
    assert_eq!(decision.reason_codes, vec!["risk_band_low".to_owned()]);
    // Decisions carry the causing event's timestamp, not wall clock.
    assert_eq!(decision.timestamp, cause.timestamp);

    let published = rx.recv().await?;
    assert_eq!(&published, decision);

    let snapshot = h.store.load(&wf_id()).await?.unwrap();
    assert_eq!(snapshot.workflow.state, WorkflowState::Finalised);
    assert_eq!(snapshot.workflow.current_decision_id, Some(decision.decision_id.clone()));
    Ok(())
}

#[tokio::test]
async fn redelivered_cause_does_not_append_or_republish() -> Result<()> {
    let h = harness();
    let mut rx = h.bus.subscribe();
    let wf = created(&h.store).await;
    let cause = match_event("evt-match");

    let first = h.authority.finalise(&wf, &cause, Some(&low_risk()), &h.pack, None).await?;
    // Second delivery arrives with the pre-append snapshot, as a crashed
    // handler would retry it.
    let second = h.authority.finalise(&wf, &cause, Some(&low_risk()), &h.pack, None).await?;

    assert_eq!(second.decision(), first.decision());
    let snapshot = h.store.load(&wf_id()).await?.unwrap();
    assert_eq!(snapshot.decisions.len(), 1);

    // Exactly one outbound publication.
    assert!(rx.recv().await.is_ok());
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn override_supersedes_and_preserves_history() -> Result<()> {
    let h = harness();
    let wf = created(&h.store).await;
    let cause = match_event("evt-match");
    let first = h.authority.finalise(&wf, &cause, Some(&low_risk()), &h.pack, None).await?;
    let first_id = first.decision().decision_id.clone();

    let ovr = override_event("ovr-1", "inv_007");
    let snapshot = h.store.load(&wf_id()).await?.unwrap();
    let transition = machine::step(&snapshot.workflow, MachineInput::External(&ovr))?;
    let mutation = transition.mutation();
    let Some(Effect::EmitOverrideDecision { outcome, reason, actor_id }) = transition.effect else {
        panic!("override must emit an override decision");
    };
    let superseded = h.store.apply(&wf_id(), snapshot.workflow.version, mutation).await?;
    assert_eq!(superseded.state, WorkflowState::Superseded);

    let result = h
        .authority
        .finalise(
            &superseded,
            &ovr,
            None,
            &h.pack,
            Some(OverrideContext { outcome, reason, actor_id }),
        )
        .await?;
    let decision = result.decision();

    assert_eq!(decision.outcome, Outcome::Decline);
    assert!(decision.authority.is_override);
    assert_eq!(decision.authority.actor_id.as_deref(), Some("inv_007"));
    assert_eq!(decision.lineage.supersedes_decision_id, Some(first_id.clone()));

    let snapshot = h.store.load(&wf_id()).await?.unwrap();
    assert_eq!(snapshot.workflow.state, WorkflowState::Finalised);
    assert_eq!(snapshot.workflow.current_decision_id, Some(decision.decision_id.clone()));
    assert_eq!(
        snapshot.decisions.iter().map(|d| d.decision_id.clone()).collect::<Vec<_>>(),
        vec![first_id, decision.decision_id.clone()]
    );
    Ok(())
}

#[tokio::test]
async fn override_without_prior_decision_is_rejected() {
    let h = harness();
    let wf = created(&h.store).await;
    let ovr = override_event("ovr-1", "inv_007");

    let err = h
        .authority
        .finalise(
            &wf,
            &ovr,
            None,
            &h.pack,
            Some(OverrideContext {
                outcome: Outcome::Decline,
                reason: "manual review".to_owned(),
                actor_id: "inv_007".to_owned(),
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorityError::InvalidOverrideTarget(_)));

    let snapshot = h.store.load(&wf_id()).await.unwrap().unwrap();
    assert!(snapshot.decisions.is_empty());
}

#[tokio::test]
async fn risk_failures_map_to_fallback_outcomes() -> Result<()> {
    let h = harness();
    let wf = created(&h.store).await;
    let cause = match_event("evt-match");

    let permanent = RiskDisposition::UnavailablePermanent { detail: "schema rejected".to_owned() };
    let outcome = h.authority.finalise(&wf, &cause, Some(&permanent), &h.pack, None).await?;
    assert_eq!(outcome.decision().outcome, Outcome::Decline);
    assert_eq!(outcome.decision().reason_codes, vec!["risk_unavailable_permanent".to_owned()]);
    assert_eq!(outcome.decision().confidence, 0.0);

    // A second workflow exercises the transient-exhausted path.
    let wf2_id = WorkflowId::new("wf-2");
    let wf2 = h.store.create_if_absent(&wf2_id, &TenantId::new("acme")).await?;
    let mut cause2 = match_event("evt-match-2");
    cause2.workflow_id = wf2_id;
    let transient = RiskDisposition::UnavailableTransient { detail: "timed out".to_owned() };
    let outcome = h.authority.finalise(&wf2, &cause2, Some(&transient), &h.pack, None).await?;
    assert_eq!(outcome.decision().outcome, Outcome::Review);
    assert_eq!(outcome.decision().reason_codes, vec!["risk_unavailable_transient".to_owned()]);
    Ok(())
}
