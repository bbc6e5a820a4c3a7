//! Configuration validation utilities.

use crate::config::{Config, ConfigError};
use std::collections::HashSet;

/// Configuration validator with the engine's structural rules.
#[derive(Debug)]
pub struct ConfigValidator {
    valid_log_levels: HashSet<String>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        Self { valid_log_levels }
    }

    /// Validate an entire configuration, failing on the first violation.
    pub fn validate(&self, config: &Config) -> Result<(), ConfigError> {
        self.validate_general(config)?;
        self.validate_agents(config)?;
        self.validate_consensus(config)?;
        self.validate_store(config)?;
        self.validate_fabric(config)?;
        self.validate_orchestrator(config)?;
        self.validate_impact(config)?;
        Ok(())
    }

    fn validate_general(&self, config: &Config) -> Result<(), ConfigError> {
        if !self.valid_log_levels.contains(&config.general.log_level) {
            return Err(invalid(
                "general.log_level",
                format!("'{}' is not a log level", config.general.log_level),
            ));
        }
        Ok(())
    }

    fn validate_agents(&self, config: &Config) -> Result<(), ConfigError> {
        let a = &config.agents;
        for (field, value) in [
            ("agents.detection_timeout_secs", a.detection_timeout_secs),
            ("agents.diagnosis_timeout_secs", a.diagnosis_timeout_secs),
            ("agents.prediction_timeout_secs", a.prediction_timeout_secs),
            ("agents.resolution_timeout_secs", a.resolution_timeout_secs),
            ("agents.communication_timeout_secs", a.communication_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "timeout must be positive".to_string()));
            }
        }
        Ok(())
    }

    fn validate_consensus(&self, config: &Config) -> Result<(), ConfigError> {
        let c = &config.consensus;
        let w = &c.weights;

        for (field, value) in [
            ("consensus.weights.detection", w.detection),
            ("consensus.weights.diagnosis", w.diagnosis),
            ("consensus.weights.prediction", w.prediction),
            ("consensus.weights.resolution", w.resolution),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, "weight must be within [0, 1]".to_string()));
            }
        }

        let sum = w.detection + w.diagnosis + w.prediction + w.resolution;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(invalid(
                "consensus.weights",
                format!("weights must sum to 1.0, got {sum}"),
            ));
        }

        if !(0.0..=1.0).contains(&c.approval_threshold)
            || !(0.0..=1.0).contains(&c.degraded_threshold)
        {
            return Err(invalid(
                "consensus.thresholds",
                "thresholds must be within [0, 1]".to_string(),
            ));
        }
        if c.degraded_threshold > c.approval_threshold {
            return Err(invalid(
                "consensus.degraded_threshold",
                "degraded threshold cannot exceed approval threshold".to_string(),
            ));
        }
        if c.min_trusted == 0 {
            return Err(invalid("consensus.min_trusted", "must be at least 1".to_string()));
        }
        if c.behavior_z_threshold <= 0.0 {
            return Err(invalid(
                "consensus.behavior_z_threshold",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_store(&self, config: &Config) -> Result<(), ConfigError> {
        if config.store.partitions == 0 {
            return Err(invalid("store.partitions", "must be at least 1".to_string()));
        }
        if config.store.outage_budget_secs == 0 {
            return Err(invalid("store.outage_budget_secs", "must be positive".to_string()));
        }
        Ok(())
    }

    fn validate_fabric(&self, config: &Config) -> Result<(), ConfigError> {
        let f = &config.fabric;
        if f.breaker_failure_budget == 0 {
            return Err(invalid("fabric.breaker_failure_budget", "must be positive".to_string()));
        }
        if f.breaker_close_successes > f.breaker_probe_budget {
            return Err(invalid(
                "fabric.breaker_close_successes",
                "cannot exceed the probe budget".to_string(),
            ));
        }
        for (name, limit) in &f.channels {
            if limit.rate_per_sec <= 0.0 {
                return Err(invalid(
                    &format!("fabric.channels.{name}.rate_per_sec"),
                    "must be positive".to_string(),
                ));
            }
            if limit.burst == 0 {
                return Err(invalid(
                    &format!("fabric.channels.{name}.burst"),
                    "must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn validate_orchestrator(&self, config: &Config) -> Result<(), ConfigError> {
        let o = &config.orchestrator;
        if o.admission_cap == 0 {
            return Err(invalid("orchestrator.admission_cap", "must be at least 1".to_string()));
        }
        if o.phase_budget_secs == 0 {
            return Err(invalid("orchestrator.phase_budget_secs", "must be positive".to_string()));
        }
        Ok(())
    }

    fn validate_impact(&self, config: &Config) -> Result<(), ConfigError> {
        let i = &config.impact;
        if i.business_hours_start >= 24 || i.business_hours_end > 24 {
            return Err(invalid("impact.business_hours", "hours must be within 0..24".to_string()));
        }
        if i.business_hours_multiplier < 1.0 {
            return Err(invalid(
                "impact.business_hours_multiplier",
                "must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue { field: field.to_string(), reason }
}
