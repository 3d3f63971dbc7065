#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **verdict-engine** – Deterministic decision core of Verdict.
//!
//! The engine has three parts:
//!
//! - **machine**: a pure transition function from `(workflow, input)` to a
//!   declarative [`machine::Transition`]. No IO happens here, which keeps
//!   every transition unit-testable in isolation.
//! - **policy**: jurisdiction policy packs supplied as data: the required
//!   signal set and the band-to-outcome mapping. The machine itself is
//!   jurisdiction-agnostic.
//! - **authority**: the only component permitted to construct and append
//!   `decision.finalised` records. Finalisation is idempotent via
//!   deterministic decision ids, and overrides supersede prior decisions
//!   without ever editing them.
//!
//! All operations are deterministic for a given workflow snapshot and input;
//! the async coordination around them lives in `verdict-runtime`.

pub mod authority;
pub mod machine;
pub mod policy;

pub use authority::{
    AuthorityError, AuthorityIdentity, DecisionAuthority, FinaliseOutcome, OverrideContext,
};
pub use machine::{Effect, MachineError, MachineInput, RiskDisposition, Transition};
pub use policy::{PolicyError, PolicyPack, PolicySet};
