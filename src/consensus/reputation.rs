//! Agent reputation tracking for the behavioral screen.
//!
//! The consensus engine never mutates reputation; it reads an immutable
//! [`ReputationView`] snapshot taken before evaluation, which keeps a
//! consensus round a pure function of its inputs.

use crate::agents::AgentClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Running confidence statistics for one agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct BehaviorStats {
    pub samples: u64,
    pub mean: f64,
    /// Sum of squared deviations, kept for incremental variance.
    m2: f64,
}

impl BehaviorStats {
    /// Welford update with one observed confidence.
    pub fn record(&mut self, confidence: f64) {
        self.samples += 1;
        let delta = confidence - self.mean;
        self.mean += delta / self.samples as f64;
        let delta2 = confidence - self.mean;
        self.m2 += delta * delta2;
    }

    /// Population standard deviation; `None` until enough samples exist to
    /// make a z-score meaningful.
    pub fn std_dev(&self) -> Option<f64> {
        if self.samples < 3 {
            return None;
        }
        let variance = self.m2 / self.samples as f64;
        if variance <= f64::EPSILON {
            None
        } else {
            Some(variance.sqrt())
        }
    }

    /// Z-score of a confidence against this history, when defined.
    pub fn z_score(&self, confidence: f64) -> Option<f64> {
        self.std_dev().map(|sd| ((confidence - self.mean) / sd).abs())
    }
}

/// Mutable per-agent history, owned by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReputationBook {
    stats: BTreeMap<AgentClass, BehaviorStats>,
}

impl ReputationBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, agent: AgentClass, confidence: f64) {
        self.stats.entry(agent).or_default().record(confidence);
    }

    /// Immutable snapshot for one consensus round.
    pub fn view(&self) -> ReputationView {
        ReputationView { stats: self.stats.clone() }
    }
}

/// Read-only reputation snapshot consumed by the consensus engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReputationView {
    stats: BTreeMap<AgentClass, BehaviorStats>,
}

impl ReputationView {
    pub fn stats_for(&self, agent: AgentClass) -> Option<&BehaviorStats> {
        self.stats.get(&agent)
    }
}
