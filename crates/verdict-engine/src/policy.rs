//! Jurisdiction policy packs.
//!
//! Policy arrives as data: which signal names must be present before risk
//! evaluation, and how risk bands map onto outcomes. The state machine and
//! authority consume a [`PolicyPack`] without knowing any jurisdiction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use verdict_types::{signal, Outcome, PolicyRef, TenantId};

//─────────────────────────────
//  Policy pack
//─────────────────────────────

/// One jurisdiction's rule pack: required signals and band outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyPack {
    /// Jurisdiction the pack applies to.
    pub jurisdiction: String,
    /// Rule pack identifier.
    pub pack_id: String,
    /// Rule pack version.
    pub pack_version: String,
    /// Signal names that must all be present before `signals.complete`.
    pub required_signals: Vec<String>,
    /// Risk band name to outcome.
    pub outcome_bands: BTreeMap<String, Outcome>,
    /// Outcome for bands absent from the mapping.
    #[serde(default)]
    pub unknown_band_outcome: Outcome,
}

impl PolicyPack {
    /// Baseline pack used when no configuration is supplied: liveness,
    /// document quality and face match required; low/medium/high bands.
    pub fn baseline() -> Self {
        Self {
            jurisdiction: "default".to_owned(),
            pack_id: "baseline".to_owned(),
            pack_version: "1".to_owned(),
            required_signals: vec![
                signal::LIVENESS_SCORE.to_owned(),
                signal::DOCUMENT_QUALITY.to_owned(),
                signal::MATCH_SCORE.to_owned(),
            ],
            outcome_bands: BTreeMap::from([
                ("low".to_owned(), Outcome::Approve),
                ("medium".to_owned(), Outcome::Review),
                ("high".to_owned(), Outcome::Decline),
            ]),
            unknown_band_outcome: Outcome::Review,
        }
    }

    /// Whether every required signal has been observed.
    pub fn signals_complete(&self, signals: &BTreeMap<String, Value>) -> bool {
        self.required_signals.iter().all(|name| signals.contains_key(name))
    }

    /// Outcome for a risk band.
    pub fn outcome_for(&self, band: &str) -> Outcome {
        self.outcome_bands.get(band).copied().unwrap_or(self.unknown_band_outcome)
    }

    /// Reference stamped onto decisions made under this pack.
    pub fn policy_ref(&self) -> PolicyRef {
        PolicyRef {
            jurisdiction: self.jurisdiction.clone(),
            pack_id: self.pack_id.clone(),
            pack_version: self.pack_version.clone(),
        }
    }
}

//─────────────────────────────
//  Policy set
//─────────────────────────────

/// All configured packs plus the tenant-to-jurisdiction routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Jurisdiction used for tenants without an explicit mapping.
    pub default_jurisdiction: String,
    /// Tenant id to jurisdiction.
    #[serde(default)]
    pub tenant_jurisdictions: HashMap<String, String>,
    /// Configured packs, one per jurisdiction.
    pub packs: Vec<PolicyPack>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::single(PolicyPack::baseline())
    }
}

impl PolicySet {
    /// A set holding exactly one pack, routing every tenant to it.
    pub fn single(pack: PolicyPack) -> Self {
        Self {
            default_jurisdiction: pack.jurisdiction.clone(),
            tenant_jurisdictions: HashMap::new(),
            packs: vec![pack],
        }
    }

    /// Reject sets whose routing points at a missing pack.
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.pack_for_jurisdiction(&self.default_jurisdiction)?;
        for jurisdiction in self.tenant_jurisdictions.values() {
            self.pack_for_jurisdiction(jurisdiction)?;
        }
        Ok(())
    }

    fn pack_for_jurisdiction(&self, jurisdiction: &str) -> Result<&PolicyPack, PolicyError> {
        self.packs
            .iter()
            .find(|pack| pack.jurisdiction == jurisdiction)
            .ok_or_else(|| PolicyError::UnknownJurisdiction(jurisdiction.to_owned()))
    }

    /// Pack in force for a tenant.
    pub fn pack_for_tenant(&self, tenant_id: &TenantId) -> Result<&PolicyPack, PolicyError> {
        let jurisdiction = self
            .tenant_jurisdictions
            .get(tenant_id.as_str())
            .map(String::as_str)
            .unwrap_or(&self.default_jurisdiction);
        self.pack_for_jurisdiction(jurisdiction)
    }
}

/// Policy configuration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Routing references a jurisdiction with no configured pack.
    #[error("no policy pack configured for jurisdiction {0}")]
    UnknownJurisdiction(String),
}
