//! Default configuration values.
//!
//! The timeout and weight constants here are the canonical copies; no other
//! module hard-codes them. Behavioral screening thresholds are deliberately
//! configuration rather than invariants.

use crate::config::{
    AgentTimeoutConfig, ChannelLimit, Config, ConsensusConfig, ConsensusWeights, FabricConfig,
    GeneralConfig, ImpactConfig, OrchestratorConfig, StoreConfig,
};
use std::collections::HashMap;

/// Canonical consensus weights: Detection 0.2, Diagnosis 0.4,
/// Prediction 0.3, Resolution 0.1.
pub const CANONICAL_WEIGHTS: ConsensusWeights = ConsensusWeights {
    detection: 0.2,
    diagnosis: 0.4,
    prediction: 0.3,
    resolution: 0.1,
};

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            agents: AgentTimeoutConfig::default(),
            consensus: ConsensusConfig::default(),
            store: StoreConfig::default(),
            fabric: FabricConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            impact: ImpactConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: "info".to_string(),
            instance_name: None,
        }
    }
}

impl Default for AgentTimeoutConfig {
    fn default() -> Self {
        Self {
            detection_timeout_secs: 60,
            diagnosis_timeout_secs: 180,
            prediction_timeout_secs: 90,
            resolution_timeout_secs: 300,
            communication_timeout_secs: 30,
            cancel_grace_secs: 5,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            weights: CANONICAL_WEIGHTS,
            approval_threshold: 0.70,
            degraded_threshold: 0.60,
            min_trusted: 3,
            behavior_z_threshold: 3.0,
            evidence_overlap_floor: 0.0,
            evaluation_budget_secs: 120,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            partitions: 8,
            outage_budget_secs: 600,
            archive_after_days: 180,
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        let mut channels = HashMap::new();
        channels.insert(
            "model.reasoning".to_string(),
            ChannelLimit { rate_per_sec: 2.0, burst: 4 },
        );
        channels.insert(
            "model.classify".to_string(),
            ChannelLimit { rate_per_sec: 10.0, burst: 20 },
        );
        channels.insert(
            "actuator".to_string(),
            ChannelLimit { rate_per_sec: 1.0, burst: 2 },
        );
        channels.insert(
            "store".to_string(),
            ChannelLimit { rate_per_sec: 50.0, burst: 100 },
        );

        Self {
            breaker_failure_budget: 5,
            breaker_open_secs: 30,
            breaker_probe_budget: 3,
            breaker_close_successes: 2,
            queue_wait_cap_secs: 300,
            channels,
            router_demotion_budget: 3,
            router_cooldown_secs: 120,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            admission_cap: 1000,
            dedup_window_hours: 24,
            phase_budget_secs: 600,
            checkpoint_interval_secs: 30,
        }
    }
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            critical_cost_per_min: 1200.0,
            important_cost_per_min: 300.0,
            supporting_cost_per_min: 40.0,
            cost_per_affected_user: 0.25,
            business_hours_multiplier: 2.0,
            business_hours_start: 9,
            business_hours_end: 17,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_weights_sum_to_one() {
        let w = CANONICAL_WEIGHTS;
        let sum = w.detection + w.diagnosis + w.prediction + w.resolution;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn default_timeouts_match_agent_classes() {
        let t = AgentTimeoutConfig::default();
        assert_eq!(t.detection_timeout_secs, 60);
        assert_eq!(t.diagnosis_timeout_secs, 180);
        assert_eq!(t.prediction_timeout_secs, 90);
        assert_eq!(t.resolution_timeout_secs, 300);
        assert_eq!(t.communication_timeout_secs, 30);
    }
}
