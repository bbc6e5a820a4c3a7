//! End-to-end lifecycle scenarios against in-memory stores.

mod common;

use common::*;
use opsentry::agents::{AgentClass, RiskLevel};
use opsentry::incident::{EventKind, EventPayload, Phase, Severity};
use opsentry::orchestrator::OrchestratorError;
use opsentry::store::{replay, verify_chain, EventLog, ProposedEvent};
use opsentry::EscalationReason;
use pretty_assertions::assert_eq;
use std::time::Duration;

fn s1_agents() -> Connectors {
    vec![
        ScriptedAgent::new(
            AgentClass::Diagnosis,
            Script::Recommend(rec(AgentClass::Diagnosis, "restart_db_pool", 0.95, RiskLevel::Low)),
        ),
        ScriptedAgent::new(
            AgentClass::Prediction,
            Script::Recommend(rec(AgentClass::Prediction, "restart_db_pool", 0.85, RiskLevel::Low)),
        ),
        ScriptedAgent::new(
            AgentClass::Resolution,
            Script::Recommend(rec(AgentClass::Resolution, "restart_db_pool", 0.9, RiskLevel::Low)),
        ),
    ]
}

#[tokio::test]
async fn unanimous_approval_runs_to_resolved() {
    let mut config = test_config();
    config.consensus.min_trusted = 3;
    let h = harness(config, s1_agents());

    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);
    let id = h
        .orchestrator
        .submit(detection_event("s1-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();

    let phase = wait_terminal(&h.orchestrator, &id, Duration::from_secs(20)).await;
    assert_eq!(phase, Phase::Resolved);

    let incident = replay(h.store.as_ref(), &id).await.unwrap();
    let decision = incident.consensus_history.last().unwrap();
    assert_eq!(decision.selected_action_id.as_deref(), Some("restart_db_pool"));
    let expected = (0.2 * 0.9 + 0.4 * 0.95 + 0.3 * 0.85) / 0.9;
    assert!((decision.aggregated_confidence - expected).abs() < 1e-9);
    assert!(!decision.escalated_to_human);

    // The event stream ends with execution then resolution.
    let events = h.store.read(&id, 0).await.unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    let executed_at = kinds.iter().position(|k| *k == EventKind::ActionExecuted).unwrap();
    let resolved_at = kinds.iter().position(|k| *k == EventKind::Resolved).unwrap();
    assert!(executed_at < resolved_at);
    assert_eq!(h.actuator.execution_count(), 1);

    // Full chain still verifies after the whole lifecycle.
    assert!(verify_chain(h.store.as_ref(), &id).await.unwrap().is_ok());
}

#[tokio::test]
async fn byzantine_confidence_is_quarantined_with_audit_event() {
    // Diagnosis reports an impossible confidence; consensus renormalizes
    // over detection and prediction at 0.4/0.6.
    let agents: Connectors = vec![
        ScriptedAgent::new(
            AgentClass::Diagnosis,
            Script::Recommend(rec(AgentClass::Diagnosis, "restart_db_pool", 1.5, RiskLevel::Low)),
        ),
        ScriptedAgent::new(
            AgentClass::Prediction,
            Script::Recommend(rec(AgentClass::Prediction, "restart_db_pool", 0.8, RiskLevel::Low)),
        ),
        ScriptedAgent::new(
            AgentClass::Resolution,
            Script::Recommend(rec(AgentClass::Resolution, "restart_db_pool", 0.9, RiskLevel::Low)),
        ),
    ];
    let h = harness(test_config(), agents);

    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);
    let id = h
        .orchestrator
        .submit(detection_event("s2-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    wait_terminal(&h.orchestrator, &id, Duration::from_secs(20)).await;

    let events = h.store.read(&id, 0).await.unwrap();
    let quarantine = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::AgentQuarantined(p) => Some(p.clone()),
            _ => None,
        })
        .expect("quarantine audit event");
    assert_eq!(quarantine.agent, AgentClass::Diagnosis);
    assert_eq!(quarantine.reason, "confidence_out_of_range");

    let incident = replay(h.store.as_ref(), &id).await.unwrap();
    let decision = incident.consensus_history.last().unwrap();
    assert!(!decision.participating_agents.contains(&AgentClass::Diagnosis));
    let expected = (0.2 * 0.9 + 0.3 * 0.8) / 0.5;
    assert!((decision.aggregated_confidence - expected).abs() < 1e-9);
}

#[tokio::test]
async fn hung_agent_times_out_and_consensus_degrades() {
    let agents: Connectors = vec![
        ScriptedAgent::new(AgentClass::Diagnosis, Script::Hang),
        ScriptedAgent::new(
            AgentClass::Prediction,
            Script::Recommend(rec(AgentClass::Prediction, "restart_db_pool", 0.85, RiskLevel::Low)),
        ),
        ScriptedAgent::new(
            AgentClass::Resolution,
            Script::Recommend(rec(AgentClass::Resolution, "restart_db_pool", 0.9, RiskLevel::Low)),
        ),
    ];
    let h = harness(test_config(), agents);

    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);
    let id = h
        .orchestrator
        .submit(detection_event("timeout-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    let phase = wait_terminal(&h.orchestrator, &id, Duration::from_secs(30)).await;
    assert_eq!(phase, Phase::Resolved);

    let events = h.store.read(&id, 0).await.unwrap();
    let timed_out = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::AgentTimedOut(p) => Some(p.agent),
            _ => None,
        })
        .expect("timeout audit event");
    assert_eq!(timed_out, AgentClass::Diagnosis);

    let incident = replay(h.store.as_ref(), &id).await.unwrap();
    let decision = incident.consensus_history.last().unwrap();
    assert!(!decision.participating_agents.contains(&AgentClass::Diagnosis));
}

#[tokio::test]
async fn cancelled_agent_flushes_partial_result() {
    let agents: Connectors = vec![
        ScriptedAgent::new(
            AgentClass::Diagnosis,
            Script::HangThenPartial(rec(AgentClass::Diagnosis, "restart_db_pool", 0.75, RiskLevel::Low)),
        ),
        ScriptedAgent::new(
            AgentClass::Prediction,
            Script::Recommend(rec(AgentClass::Prediction, "restart_db_pool", 0.85, RiskLevel::Low)),
        ),
        ScriptedAgent::new(
            AgentClass::Resolution,
            Script::Recommend(rec(AgentClass::Resolution, "restart_db_pool", 0.9, RiskLevel::Low)),
        ),
    ];
    let h = harness(test_config(), agents);

    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);
    let id = h
        .orchestrator
        .submit(detection_event("partial-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    wait_terminal(&h.orchestrator, &id, Duration::from_secs(30)).await;

    let events = h.store.read(&id, 0).await.unwrap();
    let diagnosed = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::Diagnosed(p) => Some(p.clone()),
            _ => None,
        })
        .expect("diagnosis event from the partial flush");
    assert!(diagnosed.partial);
    assert!((diagnosed.recommendation.confidence - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn duplicate_idempotency_key_returns_same_incident() {
    let h = harness(test_config(), s1_agents());
    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);

    let first = h
        .orchestrator
        .submit(detection_event("dup-key", Severity::Critical, Some(vote.clone())))
        .await
        .unwrap();
    let events_after_first = h.store.read(&first, 0).await.unwrap().len();

    let second = h
        .orchestrator
        .submit(detection_event("dup-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    assert_eq!(first, second);

    // No new detection event was appended for the duplicate.
    let detected: usize = h
        .store
        .read(&first, 0)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::Detected)
        .count();
    assert_eq!(detected, 1);
    assert!(h.store.read(&first, 0).await.unwrap().len() >= events_after_first);
}

#[tokio::test]
async fn admission_cap_rejects_with_backpressure() {
    let mut config = test_config();
    config.orchestrator.admission_cap = 1;
    config.agents.diagnosis_timeout_secs = 30;
    config.agents.prediction_timeout_secs = 30;
    let agents: Connectors = vec![
        ScriptedAgent::new(AgentClass::Diagnosis, Script::Hang),
        ScriptedAgent::new(AgentClass::Prediction, Script::Hang),
    ];
    let h = harness(config, agents);

    h.orchestrator
        .submit(detection_event("cap-1", Severity::Important, None))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .submit(detection_event("cap-2", Severity::Important, None))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AdmissionRejected { active: 1, cap: 1 }));
}

#[tokio::test]
async fn store_outage_escalates_without_executing() {
    // Outage begins right after admission; the delayed agents guarantee
    // their results land after the store goes dark. The outage budget in
    // the test config is two seconds.
    let agents: Connectors = vec![
        ScriptedAgent::new(
            AgentClass::Diagnosis,
            Script::DelayThenRecommend(
                Duration::from_millis(300),
                rec(AgentClass::Diagnosis, "restart_db_pool", 0.95, RiskLevel::Low),
            ),
        ),
        ScriptedAgent::new(
            AgentClass::Prediction,
            Script::DelayThenRecommend(
                Duration::from_millis(300),
                rec(AgentClass::Prediction, "restart_db_pool", 0.85, RiskLevel::Low),
            ),
        ),
        ScriptedAgent::new(
            AgentClass::Resolution,
            Script::Recommend(rec(AgentClass::Resolution, "restart_db_pool", 0.9, RiskLevel::Low)),
        ),
    ];
    let h = harness(test_config(), agents);
    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);

    let id = h
        .orchestrator
        .submit(detection_event("outage-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    h.store.set_offline(true);

    let phase = wait_terminal(&h.orchestrator, &id, Duration::from_secs(20)).await;
    assert_eq!(phase, Phase::Escalated);
    assert_eq!(h.actuator.execution_count(), 0);

    // Only the admission event made it to the log during the outage.
    h.store.set_offline(false);
    let events = h.store.read(&id, 0).await.unwrap();
    assert!(events.iter().all(|e| e.kind != EventKind::ActionExecuted));
}

#[tokio::test]
async fn escalate_on_terminal_incident_is_a_no_op() {
    let mut config = test_config();
    config.consensus.min_trusted = 3;
    let h = harness(config, s1_agents());
    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);

    let id = h
        .orchestrator
        .submit(detection_event("noop-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    wait_terminal(&h.orchestrator, &id, Duration::from_secs(20)).await;

    let before = h.store.read(&id, 0).await.unwrap().len();
    h.orchestrator
        .escalate(&id, EscalationReason::OperatorRequest, "drill")
        .await
        .unwrap();
    let after = h.store.read(&id, 0).await.unwrap().len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn operator_escalation_terminates_a_live_incident() {
    let mut config = test_config();
    config.agents.diagnosis_timeout_secs = 30;
    config.agents.prediction_timeout_secs = 30;
    let agents: Connectors = vec![
        ScriptedAgent::new(AgentClass::Diagnosis, Script::Hang),
        ScriptedAgent::new(AgentClass::Prediction, Script::Hang),
    ];
    let h = harness(config, agents);

    let id = h
        .orchestrator
        .submit(detection_event("op-esc", Severity::Important, None))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.orchestrator
        .escalate(&id, EscalationReason::OperatorRequest, "handing to on-call")
        .await
        .unwrap();

    let phase = wait_terminal(&h.orchestrator, &id, Duration::from_secs(10)).await;
    assert_eq!(phase, Phase::Escalated);

    let incident = replay(h.store.as_ref(), &id).await.unwrap();
    assert_eq!(
        incident.escalation.unwrap().reason,
        EscalationReason::OperatorRequest
    );
}

#[tokio::test]
async fn recovery_resumes_after_executed_action_without_duplicating_it() {
    // A prior owner crashed after ActionExecuted but before validation.
    // Build that exact history, then recover with a fresh orchestrator.
    use opsentry::consensus::{ConsensusDecision, ConsensusMethod};
    use opsentry::incident::{
        ActionExecutedPayload, ActionProposedPayload, ActionValidatedPayload,
        ConsensusReachedPayload, ConsensusRequestedPayload, DetectedPayload,
        RecommendationPayload, SandboxTestPassedPayload,
    };

    let h = harness(test_config(), s1_agents());
    let id = "inc-recovered";

    let action_payload = serde_json::json!({
        "action_id": "restart_db_pool",
        "incident_id": id,
        "rollback_plan": "reverse the change",
    });
    let payload_hash = opsentry::incident::event::action_payload_hash(&action_payload);

    let decision = ConsensusDecision {
        participating_agents: vec![AgentClass::Detection, AgentClass::Diagnosis, AgentClass::Prediction],
        inputs: vec![
            rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low),
            rec(AgentClass::Diagnosis, "restart_db_pool", 0.95, RiskLevel::Low),
            rec(AgentClass::Prediction, "restart_db_pool", 0.85, RiskLevel::Low),
        ],
        quarantined: vec![],
        selected_action_id: Some("restart_db_pool".to_string()),
        aggregated_confidence: 0.911,
        method: ConsensusMethod::Weighted,
        escalated_to_human: false,
        degraded: false,
        tie_break_seed: None,
    };

    let payloads: Vec<EventPayload> = vec![
        EventPayload::Detected(DetectedPayload {
            source_ids: vec!["cloudwatch".to_string()],
            signals: Default::default(),
            severity: Severity::Critical,
            service_tier: "tier-1".to_string(),
            affected_services: Default::default(),
            affected_users: 10,
            recommendation: Some(rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low)),
            idempotency_key: "recover-key".to_string(),
        }),
        EventPayload::Diagnosed(RecommendationPayload {
            recommendation: rec(AgentClass::Diagnosis, "restart_db_pool", 0.95, RiskLevel::Low),
            partial: false,
        }),
        EventPayload::Predicted(RecommendationPayload {
            recommendation: rec(AgentClass::Prediction, "restart_db_pool", 0.85, RiskLevel::Low),
            partial: false,
        }),
        EventPayload::ConsensusRequested(ConsensusRequestedPayload {
            participating: vec![AgentClass::Detection, AgentClass::Diagnosis, AgentClass::Prediction],
            degraded_inputs: false,
        }),
        EventPayload::ConsensusReached(ConsensusReachedPayload { decision }),
        EventPayload::ActionProposed(ActionProposedPayload {
            action_id: "restart_db_pool".to_string(),
            action_payload,
            payload_hash: payload_hash.clone(),
            recommendation: rec(AgentClass::Resolution, "restart_db_pool", 0.9, RiskLevel::Low),
        }),
        EventPayload::SandboxTestPassed(SandboxTestPassedPayload {
            action_id: "restart_db_pool".to_string(),
            report: "sandbox ok".to_string(),
        }),
        EventPayload::ActionValidated(ActionValidatedPayload {
            action_id: "restart_db_pool".to_string(),
            payload_hash: payload_hash.clone(),
        }),
        EventPayload::ActionExecuted(ActionExecutedPayload {
            action_id: "restart_db_pool".to_string(),
            payload_hash,
            idempotency_key: format!("{id}:restart_db_pool:8"),
            outcome: "restart_db_pool executed".to_string(),
        }),
    ];
    for (i, payload) in payloads.into_iter().enumerate() {
        h.store
            .append(ProposedEvent {
                incident_id: id.to_string(),
                sequence_number: (i + 1) as u64,
                agent_id: "test".to_string(),
                payload,
            })
            .await
            .unwrap();
    }

    // The rebuilt aggregate is mid-Resolving with the action on record.
    let incident = replay(h.store.as_ref(), id).await.unwrap();
    assert_eq!(incident.phase, Phase::Resolving);
    assert_eq!(incident.executed_action.as_deref(), Some("restart_db_pool"));

    let resumed = h.orchestrator.recover().await.unwrap();
    assert_eq!(resumed, 1);

    let phase = wait_terminal(&h.orchestrator, id, Duration::from_secs(20)).await;
    assert_eq!(phase, Phase::Resolved);

    // Validation re-ran; execution did not.
    assert_eq!(h.actuator.execution_count(), 0);
    let executed: usize = h
        .store
        .read(id, 0)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == EventKind::ActionExecuted)
        .count();
    assert_eq!(executed, 1);
}

#[tokio::test]
async fn failed_health_check_rolls_back_and_escalates() {
    let h = harness(test_config(), s1_agents());
    h.actuator.fail_health.store(true, std::sync::atomic::Ordering::SeqCst);

    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);
    let id = h
        .orchestrator
        .submit(detection_event("rollback-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    let phase = wait_terminal(&h.orchestrator, &id, Duration::from_secs(20)).await;
    assert_eq!(phase, Phase::Escalated);

    let events = h.store.read(&id, 0).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::RolledBack));
    assert_eq!(h.actuator.rollbacks.lock().unwrap().len(), 1);

    let incident = replay(h.store.as_ref(), &id).await.unwrap();
    assert_eq!(incident.escalation.unwrap().reason, EscalationReason::RollbackCompleted);
    // The rollback clears the executed action from the aggregate.
    assert!(incident.executed_action.is_none());
}

#[tokio::test]
async fn corrupted_stream_escalates_and_stops_appends() {
    let h = harness(test_config(), s1_agents());
    let vote = rec(AgentClass::Detection, "restart_db_pool", 0.9, RiskLevel::Low);
    let id = h
        .orchestrator
        .submit(detection_event("corrupt-key", Severity::Critical, Some(vote)))
        .await
        .unwrap();
    wait_terminal(&h.orchestrator, &id, Duration::from_secs(20)).await;

    // Tamper with history, then try to recover it.
    h.store
        .tamper(&id, 2, |event| {
            if let EventPayload::Diagnosed(p) = &mut event.payload {
                p.recommendation.confidence = 0.01;
            }
        })
        .await;

    let status = verify_chain(h.store.as_ref(), &id).await.unwrap();
    assert_eq!(status, opsentry::store::ChainStatus::Broken { first_broken_sequence: 2 });

    // A fresh orchestrator over the same store refuses the incident
    // entirely: no resume, no further appends.
    let fresh = harness_with_store(test_config(), vec![], h.store.clone());
    let events_before = h.store.read(&id, 0).await.unwrap().len();
    let resumed = fresh.orchestrator.recover().await.unwrap();
    assert_eq!(resumed, 0);
    assert_eq!(h.store.read(&id, 0).await.unwrap().len(), events_before);
}
