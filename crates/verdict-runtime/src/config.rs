//! Runtime configuration.
//!
//! Every field has a safe default so the orchestrator runs unconfigured;
//! deployments load a TOML file and override what they need. Durations are
//! carried as integer milliseconds to keep the file format obvious.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use verdict_engine::PolicySet;
use verdict_risk::RetryPolicy;

/// What to do when risk retries are exhausted on transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskExhaustedAction {
    /// Finalise with `review` and a `risk_unavailable_transient` reason.
    Review,
    /// Keep the event retriable until it dead-letters.
    Retain,
}

/// How decisions reach the outbound bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Publish inline on the deciding path.
    Sync,
    /// Enqueue onto a buffered forwarder task.
    AsyncWithBuffer,
}

/// Orchestrator runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum concurrently processing handlers across all workflows.
    pub worker_cap: usize,
    /// Bounded queue depth per workflow; overflow is backpressure.
    pub per_workflow_queue_depth: usize,
    /// How long an idle per-workflow actor lingers before release.
    pub actor_idle_ttl_ms: u64,
    /// Per-event processing deadline.
    pub event_handler_deadline_ms: u64,
    /// Per-call risk service timeout; must stay under the handler deadline.
    pub risk_timeout_ms: u64,
    /// Risk retries after the first attempt.
    pub risk_max_retries: u32,
    /// First risk backoff; doubles per retry.
    pub risk_backoff_base_ms: u64,
    /// Ceiling for a single risk backoff.
    pub risk_backoff_cap_ms: u64,
    /// Policy once transient risk retries are exhausted.
    pub risk_exhausted_action: RiskExhaustedAction,
    /// Optional timeout that closes an incomplete signal set.
    pub signals_timeout_ms: Option<u64>,
    /// Total processing attempts before an event dead-letters.
    pub dead_letter_max_attempts: u32,
    /// Outbound publication mode.
    pub outbound_publish_mode: PublishMode,
    /// Jurisdiction policy packs and tenant routing.
    pub policies: PolicySet,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_cap: 64,
            per_workflow_queue_depth: 32,
            actor_idle_ttl_ms: 30_000,
            event_handler_deadline_ms: 10_000,
            risk_timeout_ms: 3_000,
            risk_max_retries: 2,
            risk_backoff_base_ms: 100,
            risk_backoff_cap_ms: 2_000,
            risk_exhausted_action: RiskExhaustedAction::Review,
            signals_timeout_ms: None,
            dead_letter_max_attempts: 3,
            outbound_publish_mode: PublishMode::Sync,
            policies: PolicySet::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.policies.validate().context("invalid policy configuration")?;
        Ok(config)
    }

    /// Idle TTL as a [`Duration`].
    pub fn actor_idle_ttl(&self) -> Duration {
        Duration::from_millis(self.actor_idle_ttl_ms)
    }

    /// Handler deadline as a [`Duration`].
    pub fn event_handler_deadline(&self) -> Duration {
        Duration::from_millis(self.event_handler_deadline_ms)
    }

    /// Risk per-call timeout as a [`Duration`].
    pub fn risk_timeout(&self) -> Duration {
        Duration::from_millis(self.risk_timeout_ms)
    }

    /// Signals timeout as a [`Duration`], when configured.
    pub fn signals_timeout(&self) -> Option<Duration> {
        self.signals_timeout_ms.map(Duration::from_millis)
    }

    /// Retry policy handed to the risk client.
    pub fn risk_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.risk_max_retries,
            backoff_base: Duration::from_millis(self.risk_backoff_base_ms),
            backoff_cap: Duration::from_millis(self.risk_backoff_cap_ms),
        }
    }
}
