//! Incident event records and chain integrity.
//!
//! Events are a closed tagged union: every kind has a versioned payload
//! struct and unknown kinds are rejected at the deserialization boundary.
//! Each event carries a SHA-256 hash linked to its predecessor so that any
//! mutation of payload, kind, sequence, or linkage is detectable on replay.

use crate::agents::{AgentClass, AgentRecommendation};
use crate::consensus::ConsensusDecision;
use crate::error::EscalationReason;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// `prev_integrity_hash` of the first event in every chain: 32 zero bytes,
/// hex-lower.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Detected,
    Diagnosed,
    Predicted,
    ConsensusRequested,
    ConsensusReached,
    ActionProposed,
    SandboxTestPassed,
    ActionValidated,
    ValidationFailed,
    ActionExecuted,
    ActionFailed,
    RolledBack,
    AgentTimedOut,
    AgentQuarantined,
    Escalated,
    Resolved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Detected => "detected",
            EventKind::Diagnosed => "diagnosed",
            EventKind::Predicted => "predicted",
            EventKind::ConsensusRequested => "consensus_requested",
            EventKind::ConsensusReached => "consensus_reached",
            EventKind::ActionProposed => "action_proposed",
            EventKind::SandboxTestPassed => "sandbox_test_passed",
            EventKind::ActionValidated => "action_validated",
            EventKind::ValidationFailed => "validation_failed",
            EventKind::ActionExecuted => "action_executed",
            EventKind::ActionFailed => "action_failed",
            EventKind::RolledBack => "rolled_back",
            EventKind::AgentTimedOut => "agent_timed_out",
            EventKind::AgentQuarantined => "agent_quarantined",
            EventKind::Escalated => "escalated",
            EventKind::Resolved => "resolved",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind-specific payloads, internally tagged so the wire form stays
/// self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Detected(DetectedPayload),
    Diagnosed(RecommendationPayload),
    Predicted(RecommendationPayload),
    ConsensusRequested(ConsensusRequestedPayload),
    ConsensusReached(ConsensusReachedPayload),
    ActionProposed(ActionProposedPayload),
    SandboxTestPassed(SandboxTestPassedPayload),
    ActionValidated(ActionValidatedPayload),
    ValidationFailed(ValidationFailedPayload),
    ActionExecuted(ActionExecutedPayload),
    ActionFailed(ActionFailedPayload),
    RolledBack(RolledBackPayload),
    AgentTimedOut(AgentTimedOutPayload),
    AgentQuarantined(AgentQuarantinedPayload),
    Escalated(EscalatedPayload),
    Resolved(ResolvedPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Detected(_) => EventKind::Detected,
            EventPayload::Diagnosed(_) => EventKind::Diagnosed,
            EventPayload::Predicted(_) => EventKind::Predicted,
            EventPayload::ConsensusRequested(_) => EventKind::ConsensusRequested,
            EventPayload::ConsensusReached(_) => EventKind::ConsensusReached,
            EventPayload::ActionProposed(_) => EventKind::ActionProposed,
            EventPayload::SandboxTestPassed(_) => EventKind::SandboxTestPassed,
            EventPayload::ActionValidated(_) => EventKind::ActionValidated,
            EventPayload::ValidationFailed(_) => EventKind::ValidationFailed,
            EventPayload::ActionExecuted(_) => EventKind::ActionExecuted,
            EventPayload::ActionFailed(_) => EventKind::ActionFailed,
            EventPayload::RolledBack(_) => EventKind::RolledBack,
            EventPayload::AgentTimedOut(_) => EventKind::AgentTimedOut,
            EventPayload::AgentQuarantined(_) => EventKind::AgentQuarantined,
            EventPayload::Escalated(_) => EventKind::Escalated,
            EventPayload::Resolved(_) => EventKind::Resolved,
        }
    }

    /// Canonical byte serialization used for chain hashing. Struct fields
    /// serialize in declaration order, so the bytes are stable for a given
    /// payload value.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serialize event payload")
    }
}

/// Seed recorded when the detection agent admits an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPayload {
    pub source_ids: Vec<String>,
    pub signals: BTreeMap<String, f64>,
    pub severity: crate::incident::Severity,
    pub service_tier: String,
    pub affected_services: BTreeSet<String>,
    pub affected_users: u64,
    /// Detection's own consensus vote, when it produced one alongside the
    /// seed.
    pub recommendation: Option<AgentRecommendation>,
    pub idempotency_key: String,
}

/// Diagnosis or prediction output, with a flag for partial results flushed
/// through the interrupt channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationPayload {
    pub recommendation: AgentRecommendation,
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRequestedPayload {
    pub participating: Vec<AgentClass>,
    pub degraded_inputs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusReachedPayload {
    pub decision: ConsensusDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionProposedPayload {
    pub action_id: String,
    pub action_payload: serde_json::Value,
    /// hex-lower SHA-256 of the canonical action payload bytes; the
    /// security gate requires the executed payload to match.
    pub payload_hash: String,
    /// The resolution agent's full recommendation backing the proposal.
    pub recommendation: AgentRecommendation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxTestPassedPayload {
    pub action_id: String,
    pub report: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionValidatedPayload {
    pub action_id: String,
    pub payload_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailedPayload {
    pub action_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecutedPayload {
    pub action_id: String,
    pub payload_hash: String,
    pub idempotency_key: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionFailedPayload {
    pub action_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolledBackPayload {
    pub action_id: String,
    pub rollback_template_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTimedOutPayload {
    pub agent: AgentClass,
    pub timeout_secs: u64,
    pub partial_used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQuarantinedPayload {
    pub agent: AgentClass,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalatedPayload {
    pub reason: EscalationReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPayload {
    pub action_id: Option<String>,
    pub notes: String,
}

/// The self-describing wire envelope for one durable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub incident_id: String,
    pub sequence_number: u64,
    pub timestamp_ns: u64,
    pub agent_id: String,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub integrity_hash: String,
    pub prev_integrity_hash: String,
}

impl EventEnvelope {
    /// Build an envelope, computing the chain hash from the predecessor.
    pub fn link(
        incident_id: String,
        sequence_number: u64,
        timestamp_ns: u64,
        agent_id: String,
        payload: EventPayload,
        prev_integrity_hash: &str,
    ) -> Self {
        let kind = payload.kind();
        let integrity_hash = chain_hash(prev_integrity_hash, sequence_number, kind, &payload);
        Self {
            incident_id,
            sequence_number,
            timestamp_ns,
            agent_id,
            kind,
            payload,
            integrity_hash,
            prev_integrity_hash: prev_integrity_hash.to_string(),
        }
    }

    /// Recompute this event's hash against a claimed predecessor hash.
    pub fn verify_link(&self, prev_hash: &str) -> bool {
        self.prev_integrity_hash == prev_hash
            && self.integrity_hash
                == chain_hash(prev_hash, self.sequence_number, self.kind, &self.payload)
    }
}

/// hex-lower SHA-256 over `prev_hash || sequence || kind || canonical(payload)`.
pub fn chain_hash(
    prev_hash: &str,
    sequence_number: u64,
    kind: EventKind,
    payload: &EventPayload,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(sequence_number.to_be_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(payload.canonical_bytes());
    hex::encode(hasher.finalize())
}

/// hex-lower SHA-256 of an action payload's canonical JSON bytes.
pub fn action_payload_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(payload).expect("serialize action payload"));
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::Severity;

    fn detected_payload() -> EventPayload {
        EventPayload::Detected(DetectedPayload {
            source_ids: vec!["cloudwatch".to_string()],
            signals: BTreeMap::from([("error_rate".to_string(), 0.32)]),
            severity: Severity::Critical,
            service_tier: "tier-1".to_string(),
            affected_services: BTreeSet::from(["checkout".to_string()]),
            affected_users: 1200,
            recommendation: None,
            idempotency_key: "det-001".to_string(),
        })
    }

    #[test]
    fn chain_hash_is_deterministic() {
        let payload = detected_payload();
        let a = chain_hash(GENESIS_HASH, 1, EventKind::Detected, &payload);
        let b = chain_hash(GENESIS_HASH, 1, EventKind::Detected, &payload);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hash_changes_with_sequence() {
        let payload = detected_payload();
        let a = chain_hash(GENESIS_HASH, 1, EventKind::Detected, &payload);
        let b = chain_hash(GENESIS_HASH, 2, EventKind::Detected, &payload);
        assert_ne!(a, b);
    }

    #[test]
    fn linked_envelope_verifies() {
        let env = EventEnvelope::link(
            "inc-1".to_string(),
            1,
            42,
            "detection".to_string(),
            detected_payload(),
            GENESIS_HASH,
        );
        assert!(env.verify_link(GENESIS_HASH));
        assert!(!env.verify_link(&env.integrity_hash));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut env = EventEnvelope::link(
            "inc-1".to_string(),
            1,
            42,
            "detection".to_string(),
            detected_payload(),
            GENESIS_HASH,
        );
        if let EventPayload::Detected(ref mut p) = env.payload {
            p.affected_users = 9999;
        }
        assert!(!env.verify_link(GENESIS_HASH));
    }

    #[test]
    fn unknown_kind_is_rejected_at_the_boundary() {
        let raw = r#"{"kind":"totally_new_kind","data":1}"#;
        assert!(serde_json::from_str::<EventPayload>(raw).is_err());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = EventEnvelope::link(
            "inc-1".to_string(),
            1,
            42,
            "detection".to_string(),
            detected_payload(),
            GENESIS_HASH,
        );
        let text = serde_json::to_string(&env).unwrap();
        let back: EventEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.integrity_hash, env.integrity_hash);
        assert!(back.verify_link(GENESIS_HASH));
    }
}
