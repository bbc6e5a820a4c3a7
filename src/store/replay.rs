//! Replay and chain verification.
//!
//! Reconstruction is replay-only: the aggregate is the fold of the event
//! stream through the incident reducer, and every full replay verifies the
//! integrity chain first. A broken chain halts replay before a single event
//! is applied, so a corrupted stream can never materialize as state.

use crate::incident::{EventEnvelope, Incident, GENESIS_HASH};
use crate::store::{EventLog, StoreError};
use tracing::error;

/// Outcome of a chain verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Ok { length: u64 },
    Broken { first_broken_sequence: u64 },
}

impl ChainStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChainStatus::Ok { .. })
    }
}

/// Verify the hash chain of one incident without building the aggregate.
pub async fn verify_chain(
    store: &dyn EventLog,
    incident_id: &str,
) -> Result<ChainStatus, StoreError> {
    let events = store.read(incident_id, 0).await?;
    Ok(verify_events(&events))
}

/// Chain verification over an already-read event slice.
pub fn verify_events(events: &[EventEnvelope]) -> ChainStatus {
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut expected_seq = 1u64;

    for event in events {
        if event.sequence_number != expected_seq || !event.verify_link(&prev_hash) {
            return ChainStatus::Broken { first_broken_sequence: event.sequence_number };
        }
        prev_hash = event.integrity_hash.clone();
        expected_seq += 1;
    }
    ChainStatus::Ok { length: events.len() as u64 }
}

/// Rebuild an incident aggregate by folding its verified event stream.
///
/// Chain verification runs on every full replay; a mismatch surfaces as
/// `CorruptionDetected` and the caller must escalate rather than continue.
pub async fn replay(store: &dyn EventLog, incident_id: &str) -> Result<Incident, StoreError> {
    let events = store.read(incident_id, 0).await?;
    if events.is_empty() {
        return Err(StoreError::UnknownIncident(incident_id.to_string()));
    }

    match verify_events(&events) {
        ChainStatus::Ok { .. } => {}
        ChainStatus::Broken { first_broken_sequence } => {
            error!(incident_id, first_broken_sequence, "chain verification failed during replay");
            return Err(StoreError::CorruptionDetected {
                incident_id: incident_id.to_string(),
                first_broken_sequence,
            });
        }
    }

    fold(&events)
}

/// Pure fold of a verified event slice into the aggregate.
pub fn fold(events: &[EventEnvelope]) -> Result<Incident, StoreError> {
    let first = events.first().ok_or_else(|| StoreError::UnknownIncident(String::new()))?;
    let mut incident = Incident::from_detected(first)?;
    for event in &events[1..] {
        incident.apply(event)?;
    }
    Ok(incident)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentClass, AgentRecommendation, RiskLevel};
    use crate::incident::{
        DetectedPayload, EventPayload, Phase, RecommendationPayload, Severity,
    };
    use crate::store::{MemoryEventLog, ProposedEvent};
    use std::collections::{BTreeMap, BTreeSet};

    fn detected() -> EventPayload {
        EventPayload::Detected(DetectedPayload {
            source_ids: vec!["synthetic".to_string()],
            signals: BTreeMap::from([("latency_p99_ms".to_string(), 2_400.0)]),
            severity: Severity::Critical,
            service_tier: "tier-1".to_string(),
            affected_services: BTreeSet::from(["payments".to_string()]),
            affected_users: 40,
            recommendation: None,
            idempotency_key: "k1".to_string(),
        })
    }

    fn branch_result(agent: AgentClass) -> EventPayload {
        let rec = AgentRecommendation {
            agent,
            action_id: "restart_db_pool".to_string(),
            confidence: 0.9,
            risk: RiskLevel::Low,
            reasoning: String::new(),
            evidence: vec![],
            estimated_duration_secs: 30,
            rollback_plan: None,
            signature: "sig".to_string(),
        };
        match agent {
            AgentClass::Diagnosis => {
                EventPayload::Diagnosed(RecommendationPayload { recommendation: rec, partial: false })
            }
            _ => EventPayload::Predicted(RecommendationPayload { recommendation: rec, partial: false }),
        }
    }

    async fn seeded_log() -> MemoryEventLog {
        let log = MemoryEventLog::new();
        for (seq, payload) in [
            (1, detected()),
            (2, branch_result(AgentClass::Diagnosis)),
            (3, branch_result(AgentClass::Prediction)),
        ] {
            log.append(ProposedEvent {
                incident_id: "inc-1".to_string(),
                sequence_number: seq,
                agent_id: "test".to_string(),
                payload,
            })
            .await
            .unwrap();
        }
        log
    }

    #[tokio::test]
    async fn replay_rebuilds_the_aggregate() {
        let log = seeded_log().await;
        let incident = replay(&log, "inc-1").await.unwrap();
        assert_eq!(incident.version, 3);
        assert_eq!(incident.phase, Phase::AwaitingConsensus);
        assert_eq!(incident.agent_outputs.len(), 2);
    }

    #[tokio::test]
    async fn replay_is_bytewise_deterministic() {
        let log = seeded_log().await;
        let a = replay(&log, "inc-1").await.unwrap();
        let b = replay(&log, "inc-1").await.unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
        assert_eq!(a.projection_digest(), b.projection_digest());
    }

    #[tokio::test]
    async fn tampered_event_breaks_replay() {
        let log = seeded_log().await;
        log.tamper("inc-1", 2, |event| {
            if let EventPayload::Diagnosed(p) = &mut event.payload {
                p.recommendation.confidence = 0.1;
            }
        })
        .await;

        let status = verify_chain(&log, "inc-1").await.unwrap();
        assert_eq!(status, ChainStatus::Broken { first_broken_sequence: 2 });

        let err = replay(&log, "inc-1").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptionDetected { first_broken_sequence: 2, .. }
        ));
    }

    #[tokio::test]
    async fn intact_chain_verifies() {
        let log = seeded_log().await;
        let status = verify_chain(&log, "inc-1").await.unwrap();
        assert_eq!(status, ChainStatus::Ok { length: 3 });
    }

    #[tokio::test]
    async fn unknown_incident_errors() {
        let log = MemoryEventLog::new();
        assert!(matches!(
            replay(&log, "missing").await.unwrap_err(),
            StoreError::UnknownIncident(_)
        ));
    }
}
