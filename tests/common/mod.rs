//! Shared harness for integration tests: scripted agent connectors, a
//! recording actuator, and an orchestrator wired to in-memory stores.

#![allow(dead_code)]

use opsentry::agents::{
    AgentClass, AgentConnector, AgentContext, AgentError, AgentIdentity, AgentOutput,
    AgentRecommendation, RiskLevel,
};
use opsentry::bus::DetectionEvent;
use opsentry::config::Config;
use opsentry::consensus::{AllowAllVerifier, ConsensusEngine};
use opsentry::fabric::{Fabric, UpstreamError};
use opsentry::incident::Severity;
use opsentry::orchestrator::{
    ActionExecutor, AgentRegistry, CredentialBroker, Dependencies, MemoryCheckpointStore,
    Orchestrator,
};
use opsentry::security::{ActionWhitelist, CredentialHandle, SecurityGate};
use opsentry::store::MemoryEventLog;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Connector list accepted by the harness.
pub type Connectors = Vec<Arc<dyn AgentConnector>>;

/// How a scripted agent behaves when invoked.
#[derive(Debug, Clone)]
pub enum Script {
    /// Return this recommendation immediately.
    Recommend(AgentRecommendation),
    /// Sleep first, then return the recommendation.
    DelayThenRecommend(Duration, AgentRecommendation),
    /// Ignore cancellation and never return.
    Hang,
    /// Hang until cancelled, then flush this partial result.
    HangThenPartial(AgentRecommendation),
    /// Fail immediately with a non-retryable upstream error.
    Fail(String),
}

#[derive(Debug)]
pub struct ScriptedAgent {
    class: AgentClass,
    script: Script,
}

impl ScriptedAgent {
    pub fn new(class: AgentClass, script: Script) -> Arc<Self> {
        Arc::new(Self { class, script })
    }
}

#[async_trait::async_trait]
impl AgentConnector for ScriptedAgent {
    fn class(&self) -> AgentClass {
        self.class
    }

    async fn run(
        &self,
        _snapshot: opsentry::incident::IncidentSnapshot,
        context: AgentContext,
    ) -> Result<AgentOutput, AgentError> {
        match &self.script {
            Script::Recommend(rec) => Ok(AgentOutput::Recommendation(rec.clone())),
            Script::DelayThenRecommend(delay, rec) => {
                tokio::time::sleep(*delay).await;
                Ok(AgentOutput::Recommendation(rec.clone()))
            }
            Script::Hang => {
                // Deliberately ignores context.cancel.
                std::future::pending::<()>().await;
                unreachable!()
            }
            Script::HangThenPartial(rec) => {
                context.cancel.cancelled().await;
                Ok(AgentOutput::Partial(rec.clone()))
            }
            Script::Fail(message) => Err(AgentError::Upstream {
                class: self.class,
                message: message.clone(),
                retryable: false,
            }),
        }
    }

    fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            agent_id: format!("{}-agent", self.class),
            class: self.class,
            token: format!("token-{}", self.class),
        }
    }
}

/// Actuator that records every call and answers from toggles.
#[derive(Debug, Default)]
pub struct MockActuator {
    pub executions: Mutex<Vec<String>>,
    pub sandbox_runs: Mutex<Vec<String>>,
    pub rollbacks: Mutex<Vec<String>>,
    pub fail_sandbox: AtomicBool,
    pub fail_execute: AtomicBool,
    pub fail_health: AtomicBool,
}

impl MockActuator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ActionExecutor for MockActuator {
    async fn sandbox_test(
        &self,
        _incident_id: &str,
        action_id: &str,
        _payload: &serde_json::Value,
    ) -> Result<String, UpstreamError> {
        self.sandbox_runs.lock().unwrap().push(action_id.to_string());
        if self.fail_sandbox.load(Ordering::SeqCst) {
            Err(UpstreamError::permanent("sandbox rejected the action"))
        } else {
            Ok("sandbox ok".to_string())
        }
    }

    async fn execute(
        &self,
        action_id: &str,
        _payload: &serde_json::Value,
        _credentials: &CredentialHandle,
        idempotency_key: &str,
    ) -> Result<String, UpstreamError> {
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(UpstreamError::permanent("actuator refused"));
        }
        self.executions.lock().unwrap().push(idempotency_key.to_string());
        Ok(format!("{action_id} executed"))
    }

    async fn health_check(
        &self,
        _incident_id: &str,
        _invariants: &[String],
    ) -> Result<bool, UpstreamError> {
        Ok(!self.fail_health.load(Ordering::SeqCst))
    }

    async fn rollback(
        &self,
        action_id: &str,
        _rollback_template_id: Option<&str>,
    ) -> Result<(), UpstreamError> {
        self.rollbacks.lock().unwrap().push(action_id.to_string());
        Ok(())
    }
}

#[derive(Debug)]
pub struct FixedBroker;

impl CredentialBroker for FixedBroker {
    fn issue(&self, _action_id: &str) -> CredentialHandle {
        CredentialHandle::new("test-credentials", chrono::Utc::now())
    }
}

/// A recommendation literal.
pub fn rec(agent: AgentClass, action: &str, confidence: f64, risk: RiskLevel) -> AgentRecommendation {
    AgentRecommendation {
        agent,
        action_id: action.to_string(),
        confidence,
        risk,
        reasoning: format!("{agent} analysis"),
        evidence: vec![format!("{agent}-evidence")],
        estimated_duration_secs: 30,
        rollback_plan: Some("reverse the change".to_string()),
        signature: format!("token-{agent}"),
    }
}

/// A detection event literal with the given idempotency key.
pub fn detection_event(key: &str, severity: Severity, vote: Option<AgentRecommendation>) -> DetectionEvent {
    DetectionEvent {
        idempotency_key: key.to_string(),
        source_ids: vec!["cloudwatch".to_string(), "pagers".to_string()],
        signals: BTreeMap::from([("error_rate".to_string(), 0.37)]),
        severity_hint: severity,
        service_tier: "tier-1".to_string(),
        affected_services: BTreeSet::from(["checkout".to_string()]),
        affected_users: 1200,
        recommendation: vote,
        observed_at: chrono::Utc::now(),
    }
}

/// Config tuned for fast tests: short timeouts, small outage budget.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.agents.detection_timeout_secs = 5;
    config.agents.diagnosis_timeout_secs = 2;
    config.agents.prediction_timeout_secs = 2;
    config.agents.resolution_timeout_secs = 5;
    config.agents.communication_timeout_secs = 1;
    config.agents.cancel_grace_secs = 1;
    config.orchestrator.phase_budget_secs = 30;
    config.store.outage_budget_secs = 2;
    config.consensus.min_trusted = 2;
    config
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryEventLog>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub actuator: Arc<MockActuator>,
}

/// Wire an orchestrator to in-memory stores with the given connectors.
pub fn harness(config: Config, connectors: Vec<Arc<dyn AgentConnector>>) -> Harness {
    harness_with_store(config, connectors, Arc::new(MemoryEventLog::new()))
}

/// Same, but over an existing event log. Used by recovery tests that hand
/// one store to a second orchestrator instance.
pub fn harness_with_store(
    config: Config,
    connectors: Vec<Arc<dyn AgentConnector>>,
    store: Arc<MemoryEventLog>,
) -> Harness {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let actuator = MockActuator::new();

    let mut agents = AgentRegistry::new();
    for connector in connectors {
        agents.register(connector);
    }

    let mut gate = SecurityGate::new(ActionWhitelist::builtin());
    gate.grant_all_known("resolution-agent");

    let consensus = ConsensusEngine::new(config.consensus.clone(), Arc::new(AllowAllVerifier));
    let fabric = Arc::new(Fabric::new(&config.fabric));

    let orchestrator = Orchestrator::new(
        config,
        Dependencies {
            store: store.clone(),
            checkpoints: checkpoints.clone(),
            fabric,
            agents,
            actuator: actuator.clone(),
            broker: Arc::new(FixedBroker),
            gate,
            consensus,
        },
    );

    Harness { orchestrator, store, checkpoints, actuator }
}

/// Poll status until the incident reaches a terminal phase.
pub async fn wait_terminal(
    orchestrator: &Orchestrator,
    incident_id: &str,
    budget: Duration,
) -> opsentry::incident::Phase {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Ok((phase, _)) = orchestrator.status(incident_id).await {
            if phase.is_terminal() {
                return phase;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("incident {incident_id} did not reach a terminal phase in {budget:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
