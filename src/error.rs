//! Error handling for the incident response engine.
//!
//! Every component boundary returns errors as values. The taxonomy below
//! classifies each error into one of five kinds that determine the recovery
//! path: transient upstream failures retry through the fabric, persistent
//! ones fail fast and degrade, integrity violations are never silently
//! retried, logic violations escalate with full context, and resource
//! exhaustion applies backpressure at ingress.

use thiserror::Error;

/// Main error type that encompasses all errors in the engine.
#[derive(Debug, Error)]
pub enum OpsentryError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Event store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] crate::consensus::ConsensusError),

    #[error("Fabric error: {0}")]
    Fabric(#[from] crate::fabric::FabricError),

    #[error("Agent error: {0}")]
    Agent(#[from] crate::agents::AgentError),

    #[error("Security validation error: {0}")]
    Security(#[from] crate::security::SecurityError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] crate::orchestrator::OrchestratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for engine operations.
pub type OpsentryResult<T> = Result<T, OpsentryError>;

/// The five recovery classes of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Throttling, timeouts, network: retry with backoff through the fabric.
    TransientUpstream,
    /// Auth, schema, 4xx-equivalent: fail fast, open the breaker, degrade.
    PersistentUpstream,
    /// Chain hash mismatch, invalid agent signature: quarantine or escalate.
    IntegrityViolation,
    /// Invariant breach, unknown action id: bug-equivalent, escalate.
    LogicViolation,
    /// Admission cap, memory pressure: reject ingress with backpressure.
    ResourceExhaustion,
}

/// Structured reason codes carried by every `Escalated` event, enumerated
/// against the taxonomy so downstream consumers never parse free text.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    EventStoreOutage,
    ConsensusRejected,
    InsufficientTrustedAgents,
    CorruptionDetected,
    ValidationFailed,
    ActionFailed,
    RollbackCompleted,
    PhaseBudgetExhausted,
    AgentFallbacksExhausted,
    OperatorRequest,
    LogicViolation,
}

impl EscalationReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            EscalationReason::EventStoreOutage => ErrorClass::TransientUpstream,
            EscalationReason::ConsensusRejected => ErrorClass::PersistentUpstream,
            EscalationReason::InsufficientTrustedAgents => ErrorClass::IntegrityViolation,
            EscalationReason::CorruptionDetected => ErrorClass::IntegrityViolation,
            EscalationReason::ValidationFailed => ErrorClass::IntegrityViolation,
            EscalationReason::ActionFailed => ErrorClass::PersistentUpstream,
            EscalationReason::RollbackCompleted => ErrorClass::PersistentUpstream,
            EscalationReason::PhaseBudgetExhausted => ErrorClass::TransientUpstream,
            EscalationReason::AgentFallbacksExhausted => ErrorClass::PersistentUpstream,
            EscalationReason::OperatorRequest => ErrorClass::LogicViolation,
            EscalationReason::LogicViolation => ErrorClass::LogicViolation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::EventStoreOutage => "event_store_outage",
            EscalationReason::ConsensusRejected => "consensus_rejected",
            EscalationReason::InsufficientTrustedAgents => "insufficient_trusted_agents",
            EscalationReason::CorruptionDetected => "corruption_detected",
            EscalationReason::ValidationFailed => "validation_failed",
            EscalationReason::ActionFailed => "action_failed",
            EscalationReason::RollbackCompleted => "rollback_completed",
            EscalationReason::PhaseBudgetExhausted => "phase_budget_exhausted",
            EscalationReason::AgentFallbacksExhausted => "agent_fallbacks_exhausted",
            EscalationReason::OperatorRequest => "operator_request",
            EscalationReason::LogicViolation => "logic_violation",
        }
    }
}

impl OpsentryError {
    /// Classify an error into its recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            OpsentryError::Store(e) => e.class(),
            OpsentryError::Fabric(e) => e.class(),
            OpsentryError::Consensus(_) => ErrorClass::IntegrityViolation,
            OpsentryError::Security(_) => ErrorClass::IntegrityViolation,
            OpsentryError::Agent(e) => e.class(),
            OpsentryError::Orchestrator(e) => e.class(),
            OpsentryError::Io(_) => ErrorClass::TransientUpstream,
            OpsentryError::Config(_) | OpsentryError::Json(_) => ErrorClass::LogicViolation,
            OpsentryError::Internal { .. } => ErrorClass::LogicViolation,
        }
    }

    /// Whether the fabric may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::TransientUpstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_map_to_taxonomy() {
        assert_eq!(
            EscalationReason::EventStoreOutage.class(),
            ErrorClass::TransientUpstream
        );
        assert_eq!(
            EscalationReason::CorruptionDetected.class(),
            ErrorClass::IntegrityViolation
        );
        assert_eq!(EscalationReason::LogicViolation.class(), ErrorClass::LogicViolation);
    }

    #[test]
    fn reason_codes_serialize_as_snake_case() {
        let json = serde_json::to_string(&EscalationReason::EventStoreOutage).unwrap();
        assert_eq!(json, "\"event_store_outage\"");
    }
}
