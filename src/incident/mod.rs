//! Incident aggregate and lifecycle phases.
//!
//! An incident is the aggregate root rebuilt by folding its event stream
//! through a pure reducer. The reducer enforces the phase machine edges and
//! dense versioning, so a replayed aggregate is bytewise identical across
//! runs and an illegal event sequence is rejected rather than absorbed.

pub mod event;

use crate::agents::{AgentClass, AgentRecommendation};
use crate::config::ImpactConfig;
use crate::consensus::ConsensusDecision;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use event::{
    ActionExecutedPayload, ActionFailedPayload, ActionProposedPayload, ActionValidatedPayload,
    AgentQuarantinedPayload, AgentTimedOutPayload, ConsensusReachedPayload,
    ConsensusRequestedPayload, DetectedPayload, EscalatedPayload, EventEnvelope, EventKind,
    EventPayload, RecommendationPayload, ResolvedPayload, RolledBackPayload,
    SandboxTestPassedPayload, ValidationFailedPayload, GENESIS_HASH,
};

/// Incident severity tiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Important,
    Supporting,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "CRITICAL",
            Severity::Important => "IMPORTANT",
            Severity::Supporting => "SUPPORTING",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle phases.
///
/// `Validating` and `RollingBack` are entered only by the live owner task;
/// replay observes the durable outcome events instead, so a post-crash
/// rebuild surfaces `Resolving` and the validation step re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Detected,
    Diagnosing,
    Predicting,
    AwaitingConsensus,
    Resolving,
    Validating,
    RollingBack,
    Resolved,
    Escalated,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Resolved | Phase::Escalated)
    }

    /// Legal edges of the phase machine.
    pub fn can_transition(from: Phase, to: Phase) -> bool {
        use Phase::*;
        // Operator escalation may terminate any live incident.
        if to == Escalated {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (Detected, Diagnosing)
                | (Diagnosing, Predicting)
                | (Diagnosing, AwaitingConsensus)
                | (Predicting, AwaitingConsensus)
                | (AwaitingConsensus, Resolving)
                | (Resolving, Validating)
                | (Resolving, Resolved)
                | (Validating, Resolved)
                | (Validating, RollingBack)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Detected => "detected",
            Phase::Diagnosing => "diagnosing",
            Phase::Predicting => "predicting",
            Phase::AwaitingConsensus => "awaiting_consensus",
            Phase::Resolving => "resolving",
            Phase::Validating => "validating",
            Phase::RollingBack => "rolling_back",
            Phase::Resolved => "resolved",
            Phase::Escalated => "escalated",
        };
        write!(f, "{s}")
    }
}

/// Errors from the reducer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReducerError {
    #[error("First event for an incident must be 'detected', got '{0}'")]
    FirstEventNotDetected(EventKind),

    #[error("Event sequence {got} is not dense: expected {expected}")]
    NonDenseSequence { expected: u64, got: u64 },

    #[error("Event for incident '{got}' applied to aggregate '{expected}'")]
    IncidentMismatch { expected: String, got: String },

    #[error("Event '{kind}' is illegal in phase '{phase}'")]
    IllegalEvent { kind: EventKind, phase: Phase },
}

/// The in-memory incident aggregate.
///
/// All collections are ordered so the serialized projection is stable:
/// replaying the same events always produces the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    /// Strictly increases by 1 per applied event; equals the sequence
    /// number of the last applied event.
    pub version: u64,
    pub phase: Phase,
    pub severity: Severity,
    pub detected_at_ns: u64,
    pub resolved_at_ns: Option<u64>,
    pub service_tier: String,
    pub affected_services: BTreeSet<String>,
    pub affected_users: u64,
    pub consensus_history: Vec<ConsensusDecision>,
    pub agent_outputs: BTreeMap<AgentClass, AgentRecommendation>,
    pub quarantined_agents: BTreeSet<AgentClass>,
    pub executed_action: Option<String>,
    pub escalation: Option<EscalatedPayload>,
    pub last_event_ns: u64,
    has_diagnosis_result: bool,
    has_prediction_result: bool,
}

impl Incident {
    /// Build the aggregate from the first event, which must be `Detected`.
    pub fn from_detected(envelope: &EventEnvelope) -> Result<Self, ReducerError> {
        let seed = match &envelope.payload {
            EventPayload::Detected(seed) => seed,
            other => return Err(ReducerError::FirstEventNotDetected(other.kind())),
        };
        if envelope.sequence_number != 1 {
            return Err(ReducerError::NonDenseSequence {
                expected: 1,
                got: envelope.sequence_number,
            });
        }
        let mut agent_outputs = BTreeMap::new();
        if let Some(rec) = &seed.recommendation {
            agent_outputs.insert(AgentClass::Detection, rec.clone());
        }
        Ok(Self {
            id: envelope.incident_id.clone(),
            version: 1,
            // Work begins as soon as detection is durable.
            phase: Phase::Diagnosing,
            severity: seed.severity,
            detected_at_ns: envelope.timestamp_ns,
            resolved_at_ns: None,
            service_tier: seed.service_tier.clone(),
            affected_services: seed.affected_services.clone(),
            affected_users: seed.affected_users,
            consensus_history: Vec::new(),
            agent_outputs,
            quarantined_agents: BTreeSet::new(),
            executed_action: None,
            escalation: None,
            last_event_ns: envelope.timestamp_ns,
            has_diagnosis_result: false,
            has_prediction_result: false,
        })
    }

    /// Apply one event. Pure with respect to the envelope: the same
    /// aggregate state and event always produce the same next state.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> Result<(), ReducerError> {
        if envelope.incident_id != self.id {
            return Err(ReducerError::IncidentMismatch {
                expected: self.id.clone(),
                got: envelope.incident_id.clone(),
            });
        }
        if envelope.sequence_number != self.version + 1 {
            return Err(ReducerError::NonDenseSequence {
                expected: self.version + 1,
                got: envelope.sequence_number,
            });
        }
        if self.phase.is_terminal() {
            return Err(ReducerError::IllegalEvent {
                kind: envelope.kind,
                phase: self.phase,
            });
        }

        match &envelope.payload {
            EventPayload::Detected(_) => {
                return Err(ReducerError::IllegalEvent {
                    kind: EventKind::Detected,
                    phase: self.phase,
                });
            }
            EventPayload::Diagnosed(p) => {
                self.expect_phase(&[Phase::Diagnosing], envelope.kind)?;
                self.agent_outputs.insert(AgentClass::Diagnosis, p.recommendation.clone());
                self.has_diagnosis_result = true;
                self.advance_triage();
            }
            EventPayload::Predicted(p) => {
                self.expect_phase(&[Phase::Diagnosing, Phase::Predicting], envelope.kind)?;
                self.agent_outputs.insert(AgentClass::Prediction, p.recommendation.clone());
                self.has_prediction_result = true;
                self.advance_triage();
            }
            EventPayload::AgentTimedOut(p) => {
                self.expect_phase(
                    &[Phase::Diagnosing, Phase::Predicting, Phase::AwaitingConsensus, Phase::Resolving],
                    envelope.kind,
                )?;
                match p.agent {
                    AgentClass::Diagnosis => {
                        self.has_diagnosis_result = true;
                        self.advance_triage();
                    }
                    AgentClass::Prediction => {
                        self.has_prediction_result = true;
                        self.advance_triage();
                    }
                    _ => {}
                }
            }
            EventPayload::ConsensusRequested(_) => {
                self.expect_phase(&[Phase::AwaitingConsensus], envelope.kind)?;
            }
            EventPayload::AgentQuarantined(p) => {
                self.expect_phase(&[Phase::AwaitingConsensus], envelope.kind)?;
                self.quarantined_agents.insert(p.agent);
            }
            EventPayload::ConsensusReached(p) => {
                self.expect_phase(&[Phase::AwaitingConsensus], envelope.kind)?;
                let approved = p.decision.selected_action_id.is_some();
                self.consensus_history.push(p.decision.clone());
                if approved {
                    self.transition(Phase::Resolving)?;
                }
            }
            EventPayload::ActionProposed(p) => {
                self.expect_phase(&[Phase::Resolving], envelope.kind)?;
                self.agent_outputs.insert(AgentClass::Resolution, p.recommendation.clone());
            }
            EventPayload::SandboxTestPassed(_)
            | EventPayload::ActionValidated(_)
            | EventPayload::ValidationFailed(_)
            | EventPayload::ActionFailed(_) => {
                self.expect_phase(&[Phase::Resolving], envelope.kind)?;
            }
            EventPayload::ActionExecuted(p) => {
                self.expect_phase(&[Phase::Resolving], envelope.kind)?;
                self.executed_action = Some(p.action_id.clone());
            }
            EventPayload::RolledBack(_) => {
                self.expect_phase(&[Phase::Resolving, Phase::RollingBack], envelope.kind)?;
                self.executed_action = None;
            }
            EventPayload::Escalated(p) => {
                self.escalation = Some(p.clone());
                self.resolved_at_ns = Some(envelope.timestamp_ns);
                self.phase = Phase::Escalated;
            }
            EventPayload::Resolved(_) => {
                self.expect_phase(&[Phase::Resolving, Phase::Validating], envelope.kind)?;
                self.resolved_at_ns = Some(envelope.timestamp_ns);
                self.phase = Phase::Resolved;
            }
        }

        self.version = envelope.sequence_number;
        self.last_event_ns = envelope.timestamp_ns;
        Ok(())
    }

    fn expect_phase(&self, allowed: &[Phase], kind: EventKind) -> Result<(), ReducerError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(ReducerError::IllegalEvent { kind, phase: self.phase })
        }
    }

    /// Move through the triage phases as branch results land.
    fn advance_triage(&mut self) {
        if self.has_diagnosis_result && self.has_prediction_result {
            self.phase = Phase::AwaitingConsensus;
        } else if self.has_diagnosis_result && self.phase == Phase::Diagnosing {
            self.phase = Phase::Predicting;
        }
    }

    /// Whether the diagnosis branch still owes a result (output or
    /// recorded timeout).
    pub fn awaiting_diagnosis(&self) -> bool {
        !self.has_diagnosis_result
    }

    /// Whether the prediction branch still owes a result.
    pub fn awaiting_prediction(&self) -> bool {
        !self.has_prediction_result
    }

    /// Checked in-memory transition used by the live owner task for phases
    /// that have no durable record (`Validating`, `RollingBack`).
    pub fn transition(&mut self, to: Phase) -> Result<(), ReducerError> {
        if !Phase::can_transition(self.phase, to) {
            return Err(ReducerError::IllegalEvent {
                kind: EventKind::Escalated,
                phase: self.phase,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Cost model: cost/min for the severity tier times elapsed minutes,
    /// doubled during business hours, plus a per-affected-user term.
    pub fn business_impact(&self, as_of_ns: u64, impact: &ImpactConfig) -> f64 {
        let end_ns = self.resolved_at_ns.unwrap_or(as_of_ns).max(self.detected_at_ns);
        let elapsed_min = (end_ns - self.detected_at_ns) as f64 / 60_000_000_000.0;

        let per_min = match self.severity {
            Severity::Critical => impact.critical_cost_per_min,
            Severity::Important => impact.important_cost_per_min,
            Severity::Supporting => impact.supporting_cost_per_min,
        };

        let mut cost = per_min * elapsed_min;
        if detected_in_business_hours(self.detected_at_ns, impact) {
            cost *= impact.business_hours_multiplier;
        }
        cost + self.affected_users as f64 * impact.cost_per_affected_user
    }

    /// hex-lower SHA-256 of the serialized projection; checkpoints carry
    /// this so a resuming orchestrator can detect divergence from replay.
    pub fn projection_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).expect("serialize incident projection"));
        hex::encode(hasher.finalize())
    }

    /// Read-only snapshot handed to agents and status queries.
    pub fn snapshot(&self, impact: &ImpactConfig) -> IncidentSnapshot {
        IncidentSnapshot {
            id: self.id.clone(),
            version: self.version,
            phase: self.phase,
            severity: self.severity,
            detected_at: ns_to_datetime(self.detected_at_ns),
            resolved_at: self.resolved_at_ns.map(ns_to_datetime),
            service_tier: self.service_tier.clone(),
            affected_services: self.affected_services.clone(),
            affected_users: self.affected_users,
            business_impact: self.business_impact(self.last_event_ns, impact),
            agent_outputs: self.agent_outputs.clone(),
            quarantined_agents: self.quarantined_agents.clone(),
            escalation: self.escalation.clone(),
        }
    }
}

/// A point-in-time read-only view of an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentSnapshot {
    pub id: String,
    pub version: u64,
    pub phase: Phase,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub service_tier: String,
    pub affected_services: BTreeSet<String>,
    pub affected_users: u64,
    pub business_impact: f64,
    pub agent_outputs: BTreeMap<AgentClass, AgentRecommendation>,
    pub quarantined_agents: BTreeSet<AgentClass>,
    pub escalation: Option<EscalatedPayload>,
}

fn ns_to_datetime(ns: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(
        (ns / 1_000_000_000) as i64,
        (ns % 1_000_000_000) as u32,
    )
    .unwrap_or_else(Utc::now)
}

fn detected_in_business_hours(detected_at_ns: u64, impact: &ImpactConfig) -> bool {
    let dt = ns_to_datetime(detected_at_ns);
    let weekday = dt.weekday().number_from_monday();
    let hour = dt.hour();
    weekday <= 5 && hour >= impact.business_hours_start && hour < impact.business_hours_end
}
