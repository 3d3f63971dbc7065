#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-types** – Shared primitive data structures for Verdict.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the inbound event envelope with its typed payloads, the
//! workflow projection and decision records, and the validation rules that
//! guarantee downstream components only ever see well-typed events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum allowed length for any identifier field on the envelope.
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Maximum allowed length for a human-supplied override reason.
pub const MAX_OVERRIDE_REASON_LEN: usize = 4096;

//─────────────────────────────
//  Records sub-module
//─────────────────────────────

/// Workflow projection, decision records and risk result shapes.
pub mod records;
pub use records::{
    Authority, DecisionRecord, Lineage, Outcome, PolicyRef, RiskResult, Subject, WorkflowRecord,
    WorkflowState,
};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Build the identifier, trimming surrounding whitespace.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into().trim().to_owned())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty after trimming.
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }

            /// Strip surrounding whitespace in place.
            pub fn normalise(&mut self) {
                let trimmed = self.0.trim();
                if trimmed.len() != self.0.len() {
                    self.0 = trimmed.to_owned();
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }
    };
}

string_id! {
    /// Unique identifier for an ingested event; the idempotency key.
    ///
    /// Client-supplied when present, assigned exactly once by the server
    /// otherwise. Duplicate submissions with the same id are acknowledged
    /// no-ops.
    EventId
}

string_id! {
    /// Groups all events belonging to one resolve subject.
    WorkflowId
}

string_id! {
    /// Identifies the tenant a workflow belongs to.
    TenantId
}

string_id! {
    /// Caller-supplied correlation token propagated onto decisions.
    CorrelationId
}

string_id! {
    /// Identifier of an appended decision record (deterministic digest).
    DecisionId
}

impl EventId {
    /// Assign a fresh server-side identifier (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

//─────────────────────────────
//  Signal names
//─────────────────────────────

/// Canonical names of the signal facts accumulated on a workflow.
pub mod signal {
    /// Liveness score from a selfie capture.
    pub const LIVENESS_SCORE: &str = "liveness_score";
    /// Capture-side confidence in the liveness score.
    pub const LIVENESS_CONFIDENCE: &str = "liveness_confidence";
    /// Whether the face was centred in frame.
    pub const FACE_CENTERED: &str = "face_centered";
    /// Relative face size in frame.
    pub const FACE_SIZE: &str = "face_size";
    /// Submitted document type.
    pub const DOCUMENT_TYPE: &str = "document_type";
    /// Document capture quality score.
    pub const DOCUMENT_QUALITY: &str = "document_quality";
    /// Face match score against the document.
    pub const MATCH_SCORE: &str = "match_score";
    /// Models that produced the match score.
    pub const MATCH_MODELS: &str = "match_models";
    /// Marker set when the signal set was closed by timeout rather than
    /// completeness.
    pub const SIGNALS_TIMED_OUT: &str = "signals_timed_out";
}

//─────────────────────────────
//  Event payloads
//─────────────────────────────

/// Payload of a `selfie.uploaded` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfiePayload {
    /// Liveness score in `[0, 1]`.
    pub liveness_score: f64,
    /// Capture confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether the face was centred in frame.
    pub face_centered: bool,
    /// Relative face size in `[0, 1]`.
    pub face_size: f64,
}

/// Payload of a `document.uploaded` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Submitted document type, e.g. `passport`.
    pub document_type: String,
    /// Capture quality score in `[0, 1]`.
    pub quality_score: f64,
}

/// Payload of a `match.completed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPayload {
    /// Face match score in `[0, 1]`.
    pub match_score: f64,
    /// Models that produced the score.
    #[serde(default)]
    pub model_ids: Vec<String>,
}

/// Payload of an `override.applied` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverridePayload {
    /// Outcome the human actor is imposing.
    pub new_outcome: Outcome,
    /// Non-empty human-readable justification.
    pub reason: String,
    /// Identifier of the authorising actor.
    pub authorized_by: String,
}

/// Typed discrimination over the ingestable event kinds.
///
/// The internal machine inputs (`signals.complete`, `risk.returned`) are
/// deliberately absent: they are synthesised inside the engine and can never
/// arrive on the wire. The validator rejects envelopes claiming them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum EventKind {
    /// Biometric selfie capture result.
    #[serde(rename = "selfie.uploaded")]
    SelfieUploaded(SelfiePayload),
    /// Identity document submission result.
    #[serde(rename = "document.uploaded")]
    DocumentUploaded(DocumentPayload),
    /// Face/document match computation result.
    #[serde(rename = "match.completed")]
    MatchCompleted(MatchPayload),
    /// Human-initiated override of a prior resolve.
    #[serde(rename = "override.applied")]
    OverrideApplied(OverridePayload),
}

impl EventKind {
    /// Wire name of the event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::SelfieUploaded(_) => "selfie.uploaded",
            EventKind::DocumentUploaded(_) => "document.uploaded",
            EventKind::MatchCompleted(_) => "match.completed",
            EventKind::OverrideApplied(_) => "override.applied",
        }
    }

    /// Whether this kind carries signal facts (everything but overrides).
    pub fn is_signal(&self) -> bool {
        !matches!(self, EventKind::OverrideApplied(_))
    }

    /// Signal facts contributed by this event, keyed by canonical name.
    pub fn signal_updates(&self) -> BTreeMap<String, Value> {
        let mut updates = BTreeMap::new();
        match self {
            EventKind::SelfieUploaded(p) => {
                updates.insert(signal::LIVENESS_SCORE.to_owned(), json_f64(p.liveness_score));
                updates.insert(signal::LIVENESS_CONFIDENCE.to_owned(), json_f64(p.confidence));
                updates.insert(signal::FACE_CENTERED.to_owned(), Value::Bool(p.face_centered));
                updates.insert(signal::FACE_SIZE.to_owned(), json_f64(p.face_size));
            }
            EventKind::DocumentUploaded(p) => {
                updates.insert(
                    signal::DOCUMENT_TYPE.to_owned(),
                    Value::String(p.document_type.clone()),
                );
                updates.insert(signal::DOCUMENT_QUALITY.to_owned(), json_f64(p.quality_score));
            }
            EventKind::MatchCompleted(p) => {
                updates.insert(signal::MATCH_SCORE.to_owned(), json_f64(p.match_score));
                updates.insert(
                    signal::MATCH_MODELS.to_owned(),
                    Value::Array(p.model_ids.iter().cloned().map(Value::String).collect()),
                );
            }
            EventKind::OverrideApplied(_) => {}
        }
        updates
    }
}

fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// Canonical immutable envelope submitted to the orchestrator.
///
/// Envelopes are never mutated after validation and never deleted once
/// recorded. Equality of `event_id` defines duplicate delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Idempotency key; assigned once by the server when absent.
    pub event_id: EventId,
    /// Resolve subject this event belongs to.
    pub workflow_id: WorkflowId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Correlation token; defaults to the event id when omitted.
    #[serde(default = "CorrelationId::default_empty")]
    pub correlation_id: CorrelationId,
    /// Producer timestamp, normalised to UTC.
    pub timestamp: DateTime<Utc>,
    /// Typed event kind and payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl CorrelationId {
    fn default_empty() -> Self {
        Self::new("")
    }
}

impl EventEnvelope {
    /// Strip identifier whitespace and backfill the correlation token.
    pub fn normalise(&mut self) {
        self.event_id.normalise();
        self.workflow_id.normalise();
        self.tenant_id.normalise();
        self.correlation_id.normalise();
        if self.correlation_id.is_empty() {
            self.correlation_id = CorrelationId::new(self.event_id.as_str());
        }
    }

    /// Validate envelope fields and the payload against its kind.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_id("event_id", self.event_id.as_str())?;
        check_id("workflow_id", self.workflow_id.as_str())?;
        check_id("tenant_id", self.tenant_id.as_str())?;
        match &self.kind {
            EventKind::SelfieUploaded(p) => {
                check_unit("liveness_score", p.liveness_score)?;
                check_unit("confidence", p.confidence)?;
                check_unit("face_size", p.face_size)?;
            }
            EventKind::DocumentUploaded(p) => {
                if p.document_type.trim().is_empty() {
                    return Err(ValidationError::MalformedEvent(
                        "document_type cannot be empty".to_owned(),
                    ));
                }
                check_unit("quality_score", p.quality_score)?;
            }
            EventKind::MatchCompleted(p) => {
                check_unit("match_score", p.match_score)?;
            }
            EventKind::OverrideApplied(p) => {
                if p.reason.trim().is_empty() {
                    return Err(ValidationError::MalformedEvent(
                        "override reason cannot be empty".to_owned(),
                    ));
                }
                if p.reason.len() > MAX_OVERRIDE_REASON_LEN {
                    return Err(ValidationError::MalformedEvent(
                        "override reason exceeds maximum length".to_owned(),
                    ));
                }
                if p.authorized_by.trim().is_empty() {
                    return Err(ValidationError::MalformedEvent(
                        "override authorized_by cannot be empty".to_owned(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_id(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MalformedEvent(format!("{field} cannot be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::MalformedEvent(format!(
            "{field} exceeds maximum length of {MAX_IDENTIFIER_LEN}"
        )));
    }
    Ok(())
}

fn check_unit(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ValidationError::MalformedEvent(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

//─────────────────────────────
//  Envelope parsing
//─────────────────────────────

/// Event types that exist only inside the engine and are never ingestable.
pub const INTERNAL_EVENT_TYPES: [&str; 2] = ["signals.complete", "risk.returned"];

const KNOWN_EVENT_TYPES: [&str; 4] = [
    "selfie.uploaded",
    "document.uploaded",
    "match.completed",
    "override.applied",
];

/// Validation failures surfaced to ingress callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Envelope shape or payload values do not satisfy the schema.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    /// `event_type` is outside the enumerated set.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    /// `event_type` names an internal machine input.
    #[error("event type {0} is internal and cannot be ingested")]
    InternalEventType(String),
}

/// Parse, normalise and validate a raw JSON envelope.
///
/// Assigns a server-side `event_id` exactly once when the caller omitted it,
/// so retried deliveries of a client-identified event stay idempotent while
/// anonymous submissions are still individually trackable.
pub fn parse_envelope(mut value: Value) -> Result<EventEnvelope, ValidationError> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| ValidationError::MalformedEvent("envelope must be a JSON object".to_owned()))?;

    let event_type = obj
        .get("event_type")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_owned())
        .ok_or_else(|| ValidationError::MalformedEvent("missing event_type".to_owned()))?;

    if INTERNAL_EVENT_TYPES.contains(&event_type.as_str()) {
        return Err(ValidationError::InternalEventType(event_type));
    }
    if !KNOWN_EVENT_TYPES.contains(&event_type.as_str()) {
        return Err(ValidationError::UnknownEventType(event_type));
    }

    let missing_id = match obj.get("event_id") {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if missing_id {
        obj.insert(
            "event_id".to_owned(),
            Value::String(EventId::generate().as_str().to_owned()),
        );
    }

    let mut envelope: EventEnvelope = serde_json::from_value(value)
        .map_err(|e| ValidationError::MalformedEvent(e.to_string()))?;
    envelope.normalise();
    envelope.validate()?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn selfie_value() -> Value {
        json!({
            "event_id": "  evt-1  ",
            "event_type": "selfie.uploaded",
            "workflow_id": "wf-1",
            "tenant_id": "acme",
            "timestamp": "2026-03-01T12:00:00+02:00",
            "payload": {
                "liveness_score": 0.85,
                "confidence": 0.9,
                "face_centered": true,
                "face_size": 0.4
            }
        })
    }

    #[test]
    fn parse_normalises_ids_and_timestamp() {
        let env = parse_envelope(selfie_value()).unwrap();
        assert_eq!(env.event_id.as_str(), "evt-1");
        // Correlation backfills from the event id when omitted.
        assert_eq!(env.correlation_id.as_str(), "evt-1");
        // +02:00 producer offset is normalised to UTC.
        assert_eq!(env.timestamp.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn parse_assigns_event_id_once_when_absent() {
        let mut value = selfie_value();
        value.as_object_mut().unwrap().remove("event_id");
        let env = parse_envelope(value).unwrap();
        assert!(!env.event_id.is_empty());
    }

    #[test]
    fn internal_types_are_rejected() {
        let mut value = selfie_value();
        value["event_type"] = json!("risk.returned");
        assert_eq!(
            parse_envelope(value),
            Err(ValidationError::InternalEventType("risk.returned".to_owned()))
        );
    }

    #[test]
    fn unknown_type_is_distinguished_from_malformed() {
        let mut value = selfie_value();
        value["event_type"] = json!("selfie.deleted");
        assert!(matches!(
            parse_envelope(value),
            Err(ValidationError::UnknownEventType(_))
        ));

        let mut value = selfie_value();
        value["payload"]["liveness_score"] = json!(1.7);
        assert!(matches!(
            parse_envelope(value),
            Err(ValidationError::MalformedEvent(_))
        ));
    }

    #[test]
    fn override_requires_reason_and_actor() {
        let value = json!({
            "event_id": "ovr-1",
            "event_type": "override.applied",
            "workflow_id": "wf-1",
            "tenant_id": "acme",
            "timestamp": "2026-03-01T12:00:00Z",
            "payload": {"new_outcome": "decline", "reason": "  ", "authorized_by": "inv_007"}
        });
        assert!(matches!(
            parse_envelope(value),
            Err(ValidationError::MalformedEvent(_))
        ));
    }

    #[test]
    fn signal_updates_cover_every_signal_kind() {
        let env = parse_envelope(selfie_value()).unwrap();
        let updates = env.kind.signal_updates();
        assert_eq!(updates[signal::LIVENESS_SCORE], json!(0.85));
        assert_eq!(updates[signal::FACE_CENTERED], json!(true));

        let doc = EventKind::DocumentUploaded(DocumentPayload {
            document_type: "passport".to_owned(),
            quality_score: 0.9,
        });
        assert_eq!(doc.signal_updates()[signal::DOCUMENT_QUALITY], json!(0.9));

        let ovr = EventKind::OverrideApplied(OverridePayload {
            new_outcome: Outcome::Decline,
            reason: "manual".to_owned(),
            authorized_by: "inv".to_owned(),
        });
        assert!(ovr.signal_updates().is_empty());
        assert!(!ovr.is_signal());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = parse_envelope(selfie_value()).unwrap();
        let text = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }
}
