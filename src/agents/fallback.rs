//! Per-class fallback chains.
//!
//! When an agent fails or times out past its breaker budget, the
//! orchestrator re-invokes it in progressively simpler modes before giving
//! up. The final rung of every chain is manual escalation, which is handled
//! by the orchestrator rather than expressed as a mode.

use crate::agents::AgentClass;
use serde::{Deserialize, Serialize};

/// A degraded operating mode an agent can be asked to run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Detection: correlate across all telemetry sources (normal mode).
    MultiSourceCorrelation,
    /// Detection: static threshold checks only.
    ThresholdOnly,
    /// Diagnosis: retrieval-augmented analysis (normal mode).
    RagAnalysis,
    /// Diagnosis: pattern match over historical incident events.
    HistoricalPatternMatch,
    /// Resolution: the full proposed action (normal mode).
    FullAction,
    /// Resolution: restrict to the pre-approved safe subset.
    SafeSubset,
    /// Resolution: roll back to the last known good state.
    RollbackToKnownGood,
}

/// An ordered chain of modes for one agent class.
#[derive(Debug, Clone)]
pub struct FallbackChain {
    class: AgentClass,
    modes: Vec<FallbackMode>,
}

impl FallbackChain {
    /// The chain for an agent class. Prediction and Communication have no
    /// degraded modes; their failures skip straight to proceeding without
    /// them.
    pub fn for_class(class: AgentClass) -> Self {
        use FallbackMode::*;
        let modes = match class {
            AgentClass::Detection => vec![MultiSourceCorrelation, ThresholdOnly],
            AgentClass::Diagnosis => vec![RagAnalysis, HistoricalPatternMatch],
            AgentClass::Resolution => vec![FullAction, SafeSubset, RollbackToKnownGood],
            AgentClass::Prediction | AgentClass::Communication => vec![],
        };
        Self { class, modes }
    }

    pub fn class(&self) -> AgentClass {
        self.class
    }

    /// Mode to try at the given attempt index; `None` once the chain is
    /// exhausted and only manual escalation remains.
    pub fn mode_at(&self, attempt: usize) -> Option<FallbackMode> {
        self.modes.get(attempt).copied()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_chain_degrades_to_threshold_only() {
        let chain = FallbackChain::for_class(AgentClass::Detection);
        assert_eq!(chain.mode_at(0), Some(FallbackMode::MultiSourceCorrelation));
        assert_eq!(chain.mode_at(1), Some(FallbackMode::ThresholdOnly));
        assert_eq!(chain.mode_at(2), None);
    }

    #[test]
    fn resolution_chain_ends_in_rollback() {
        let chain = FallbackChain::for_class(AgentClass::Resolution);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.mode_at(2), Some(FallbackMode::RollbackToKnownGood));
    }

    #[test]
    fn prediction_has_no_degraded_modes() {
        assert!(FallbackChain::for_class(AgentClass::Prediction).is_empty());
    }
}
