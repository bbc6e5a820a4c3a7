//! Configuration management for the incident response engine.
//!
//! All tunable behavior lives in a single immutable [`Config`] loaded at
//! process start: agent timeouts, consensus weights and thresholds, circuit
//! breaker and rate-limit parameters, admission control, and the storage
//! layout. Reloading requires a restart so that every consensus decision is
//! evaluated against one fixed weight set.

pub mod defaults;
pub mod loader;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use loader::{ConfigLoadResult, ConfigLoader};
pub use validation::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub agents: AgentTimeoutConfig,
    pub consensus: ConsensusConfig,
    pub store: StoreConfig,
    pub fabric: FabricConfig,
    pub orchestrator: OrchestratorConfig,
    pub impact: ImpactConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub data_dir: Option<PathBuf>,
    pub log_level: String,
    pub instance_name: Option<String>,
}

/// Hard per-class agent timeouts, in seconds.
///
/// These are the canonical scheduling constants; every component that waits
/// on an agent reads them from here rather than carrying its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTimeoutConfig {
    pub detection_timeout_secs: u64,
    pub diagnosis_timeout_secs: u64,
    pub prediction_timeout_secs: u64,
    pub resolution_timeout_secs: u64,
    pub communication_timeout_secs: u64,
    /// Grace period for cooperative cancellation before a task is abandoned.
    pub cancel_grace_secs: u64,
}

impl AgentTimeoutConfig {
    pub fn timeout_for(&self, class: crate::agents::AgentClass) -> Duration {
        use crate::agents::AgentClass::*;
        let secs = match class {
            Detection => self.detection_timeout_secs,
            Diagnosis => self.diagnosis_timeout_secs,
            Prediction => self.prediction_timeout_secs,
            Resolution => self.resolution_timeout_secs,
            Communication => self.communication_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    /// Longest configured class timeout. Lease TTLs are derived from this.
    pub fn longest(&self) -> Duration {
        let secs = [
            self.detection_timeout_secs,
            self.diagnosis_timeout_secs,
            self.prediction_timeout_secs,
            self.resolution_timeout_secs,
            self.communication_timeout_secs,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        Duration::from_secs(secs)
    }
}

/// Consensus engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Canonical per-class weights, normalized over the trusted subset at
    /// evaluation time.
    pub weights: ConsensusWeights,
    /// Aggregate confidence required for a full approval.
    pub approval_threshold: f64,
    /// Aggregate confidence required for a degraded approval on
    /// non-critical incidents.
    pub degraded_threshold: f64,
    /// Minimum trusted agents that must survive quarantine.
    pub min_trusted: usize,
    /// Z-score beyond which a confidence is behaviorally suspect.
    pub behavior_z_threshold: f64,
    /// Evidence-overlap floor below which isolation counts against an agent.
    pub evidence_overlap_floor: f64,
    /// Wall-clock budget for one consensus evaluation, in seconds.
    pub evaluation_budget_secs: u64,
}

/// Per-class consensus weights.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsensusWeights {
    pub detection: f64,
    pub diagnosis: f64,
    pub prediction: f64,
    pub resolution: f64,
}

impl ConsensusWeights {
    pub fn weight_for(&self, class: crate::agents::AgentClass) -> f64 {
        use crate::agents::AgentClass::*;
        match class {
            Detection => self.detection,
            Diagnosis => self.diagnosis,
            Prediction => self.prediction,
            Resolution => self.resolution,
            // Communication carries no vote in consensus.
            Communication => 0.0,
        }
    }
}

/// Event store layout and durability parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for the file-backed log; `None` selects in-memory.
    pub root: Option<PathBuf>,
    /// Physical partition count for hot-key spreading.
    pub partitions: u32,
    /// How long append retries may run before the outage policy fires,
    /// in seconds.
    pub outage_budget_secs: u64,
    /// Incidents older than this are eligible for the cold tier, in days.
    pub archive_after_days: i64,
}

/// Circuit breaker and rate limiter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Consecutive failures that trip a breaker.
    pub breaker_failure_budget: u32,
    /// Seconds a tripped breaker rejects before probing.
    pub breaker_open_secs: u64,
    /// Probe calls admitted while half-open.
    pub breaker_probe_budget: u32,
    /// Consecutive probe successes required to close.
    pub breaker_close_successes: u32,
    /// Upper bound on time spent queued for a token, in seconds.
    pub queue_wait_cap_secs: u64,
    /// Per-channel token bucket parameters.
    pub channels: HashMap<String, ChannelLimit>,
    /// Consecutive model failures before the router demotes it.
    pub router_demotion_budget: u32,
    /// Seconds a demoted model sits out.
    pub router_cooldown_secs: u64,
}

/// Token bucket parameters for one named channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelLimit {
    pub rate_per_sec: f64,
    pub burst: u32,
}

/// Lifecycle orchestrator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently active incidents.
    pub admission_cap: usize,
    /// Idempotency-key dedup window, in hours.
    pub dedup_window_hours: i64,
    /// Global budget from detection to consensus, in seconds.
    pub phase_budget_secs: u64,
    /// Checkpoint cadence during long phases, in seconds.
    pub checkpoint_interval_secs: u64,
}

/// Business impact model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactConfig {
    pub critical_cost_per_min: f64,
    pub important_cost_per_min: f64,
    pub supporting_cost_per_min: f64,
    pub cost_per_affected_user: f64,
    /// Cost multiplier applied when the incident was detected during
    /// business hours (UTC).
    pub business_hours_multiplier: f64,
    pub business_hours_start: u32,
    pub business_hours_end: u32,
}

/// Errors that can occur during configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration value: {field} - {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Config directory not found")]
    DirectoryNotFound,
}

impl Config {
    /// Resolve the data directory, defaulting under the platform data dir.
    pub fn data_dir(&self) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("opsentry")
        })
    }

    pub fn phase_budget(&self) -> Duration {
        Duration::from_secs(self.orchestrator.phase_budget_secs)
    }

    pub fn consensus_budget(&self) -> Duration {
        Duration::from_secs(self.consensus.evaluation_budget_secs)
    }

    /// Lease TTL: twice the longest phase timeout, per the ownership rule.
    pub fn lease_ttl(&self) -> Duration {
        self.agents.longest() * 2
    }
}
