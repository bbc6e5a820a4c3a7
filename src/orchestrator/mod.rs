//! Incident lifecycle orchestrator.
//!
//! One owner task per active incident drives the phase machine: triage
//! (diagnosis and prediction in parallel), consensus, the guarded
//! resolution pipeline, and the post-action health check. Every transition
//! is an event append; the orchestrator never shares mutable aggregate
//! state with anything else. Agents are invoked through the fabric with
//! hard per-class timeouts and cooperative cancellation, and a lease from
//! the checkpoint store enforces single ownership across instances.

pub mod checkpoint;

use crate::agents::{
    AgentClass, AgentConnector, AgentContext, AgentError, AgentIdentity, AgentOutput,
    AgentRecommendation, FallbackChain,
};
use crate::bus::DetectionEvent;
use crate::config::Config;
use crate::consensus::{
    ConsensusDecision, ConsensusEngine, ConsensusError, ConsensusMethod, ReputationBook,
};
use crate::error::EscalationReason;
use crate::fabric::{Fabric, FabricError, UpstreamError};
use crate::incident::{
    ActionExecutedPayload, ActionFailedPayload, ActionProposedPayload, AgentQuarantinedPayload,
    AgentTimedOutPayload, ConsensusReachedPayload, ConsensusRequestedPayload, DetectedPayload,
    EscalatedPayload, EventEnvelope, EventPayload, Incident, IncidentSnapshot, Phase,
    RecommendationPayload, ResolvedPayload, RolledBackPayload, SandboxTestPassedPayload,
    Severity, ValidationFailedPayload,
};
use crate::security::{CredentialHandle, SecurityGate};
use crate::store::{replay, EventLog, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};

const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";

/// Errors surfaced by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Admission rejected: {active} active incidents at cap {cap}")]
    AdmissionRejected { active: usize, cap: usize },

    #[error("Unknown incident: {0}")]
    UnknownIncident(String),

    #[error("Event store outage exceeded {budget_secs}s")]
    StoreOutage { budget_secs: u64 },

    #[error("Lease for incident '{incident_id}' is held elsewhere")]
    LeaseHeld { incident_id: String },

    #[error("Incident '{incident_id}' is terminal in phase '{phase}'")]
    Terminal { incident_id: String, phase: Phase },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn class(&self) -> crate::error::ErrorClass {
        use crate::error::ErrorClass;
        match self {
            OrchestratorError::AdmissionRejected { .. } => ErrorClass::ResourceExhaustion,
            OrchestratorError::StoreOutage { .. } => ErrorClass::TransientUpstream,
            OrchestratorError::LeaseHeld { .. } => ErrorClass::ResourceExhaustion,
            OrchestratorError::Terminal { .. } => ErrorClass::LogicViolation,
            OrchestratorError::Store(e) => e.class(),
            OrchestratorError::Checkpoint(_) => ErrorClass::TransientUpstream,
            OrchestratorError::UnknownIncident(_) => ErrorClass::LogicViolation,
        }
    }
}

/// External actuator executing validated remediation. The real system is a
/// deployment concern; the core sees these four operations.
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync + std::fmt::Debug {
    /// Run the action in an isolated sandbox; returns a test report.
    async fn sandbox_test(
        &self,
        incident_id: &str,
        action_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, UpstreamError>;

    /// Execute the action for real. `idempotency_key` makes retries safe:
    /// at-least-once delivery with upstream deduplication.
    async fn execute(
        &self,
        action_id: &str,
        payload: &serde_json::Value,
        credentials: &CredentialHandle,
        idempotency_key: &str,
    ) -> Result<String, UpstreamError>;

    /// Post-action health check against the template's invariants.
    async fn health_check(
        &self,
        incident_id: &str,
        invariants: &[String],
    ) -> Result<bool, UpstreamError>;

    /// Undo a previously executed action.
    async fn rollback(
        &self,
        action_id: &str,
        rollback_template_id: Option<&str>,
    ) -> Result<(), UpstreamError>;
}

/// Issues short-lived credential handles for one action each. The broker
/// itself is external; this is the seam the core calls through.
pub trait CredentialBroker: Send + Sync + std::fmt::Debug {
    fn issue(&self, action_id: &str) -> CredentialHandle;
}

/// Broker handing out opaque random tokens; suits single-tenant runs where
/// the actuator validates the handle out of band.
#[derive(Debug, Default)]
pub struct LocalCredentialBroker;

impl CredentialBroker for LocalCredentialBroker {
    fn issue(&self, _action_id: &str) -> CredentialHandle {
        CredentialHandle::new(uuid::Uuid::new_v4().to_string(), Utc::now())
    }
}

/// The five agent connectors, keyed by class.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    connectors: HashMap<AgentClass, Arc<dyn AgentConnector>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn AgentConnector>) {
        self.connectors.insert(connector.class(), connector);
    }

    pub fn get(&self, class: AgentClass) -> Option<Arc<dyn AgentConnector>> {
        self.connectors.get(&class).cloned()
    }
}

/// Everything the orchestrator depends on, wired at startup.
#[derive(Debug)]
pub struct Dependencies {
    pub store: Arc<dyn EventLog>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub fabric: Arc<Fabric>,
    pub agents: AgentRegistry,
    pub actuator: Arc<dyn ActionExecutor>,
    pub broker: Arc<dyn CredentialBroker>,
    pub gate: SecurityGate,
    pub consensus: ConsensusEngine,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    store: Arc<dyn EventLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    fabric: Arc<Fabric>,
    agents: AgentRegistry,
    actuator: Arc<dyn ActionExecutor>,
    broker: Arc<dyn CredentialBroker>,
    gate: SecurityGate,
    consensus: ConsensusEngine,
    reputation: Mutex<ReputationBook>,
    /// Projection cache for O(1) status; the single writer per incident is
    /// the owning drive task.
    live: RwLock<HashMap<String, Incident>>,
    /// Idempotency-key dedup window: key -> (incident id, expiry).
    dedup: Mutex<HashMap<String, (String, chrono::DateTime<Utc>)>>,
    /// Per-incident append guard: serializes in-process writers (the owner
    /// task racing an operator escalation) and rejects appends to terminal
    /// incidents before they reach the store.
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    owner_id: String,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// The incident lifecycle orchestrator. Cheap to clone; all clones share
/// one inner state.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: Config, deps: Dependencies) -> Self {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        let owner_id = format!("{host}-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        Self {
            inner: Arc::new(Inner {
                config,
                store: deps.store,
                checkpoints: deps.checkpoints,
                fabric: deps.fabric,
                agents: deps.agents,
                actuator: deps.actuator,
                broker: deps.broker,
                gate: deps.gate,
                consensus: deps.consensus,
                reputation: Mutex::new(ReputationBook::new()),
                live: RwLock::new(HashMap::new()),
                dedup: Mutex::new(HashMap::new()),
                append_locks: Mutex::new(HashMap::new()),
                owner_id,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    /// Admit a detection event. Duplicate idempotency keys inside the
    /// dedup window return the existing incident id without appending
    /// anything; an exceeded admission cap rejects with backpressure.
    pub async fn submit(&self, seed: DetectionEvent) -> Result<String, OrchestratorError> {
        // Dedup window check.
        {
            let mut dedup = self.inner.dedup.lock().await;
            let now = Utc::now();
            dedup.retain(|_, (_, expiry)| *expiry > now);
            if let Some((incident_id, _)) = dedup.get(&seed.idempotency_key) {
                info!(
                    incident_id,
                    key = %seed.idempotency_key,
                    "duplicate detection event deduplicated"
                );
                return Ok(incident_id.clone());
            }
        }

        let incident_id = format!("inc-{}", uuid::Uuid::new_v4());

        // Admission control under the live-map lock.
        {
            let live = self.inner.live.read().await;
            let active = live.values().filter(|i| !i.phase.is_terminal()).count();
            let cap = self.inner.config.orchestrator.admission_cap;
            if active >= cap {
                warn!(active, cap, "admission cap reached, rejecting detection event");
                return Err(OrchestratorError::AdmissionRejected { active, cap });
            }
        }

        let payload = EventPayload::Detected(DetectedPayload {
            source_ids: seed.source_ids,
            signals: seed.signals,
            severity: seed.severity_hint,
            service_tier: seed.service_tier,
            affected_services: seed.affected_services,
            affected_users: seed.affected_users,
            recommendation: seed.recommendation,
            idempotency_key: seed.idempotency_key.clone(),
        });

        let envelope = self
            .append_with_outage_policy(&incident_id, AgentClass::Detection.as_str(), payload)
            .await?;
        let incident = Incident::from_detected(&envelope)
            .map_err(StoreError::Reducer)?;

        {
            let mut live = self.inner.live.write().await;
            live.insert(incident_id.clone(), incident);
        }
        {
            let mut dedup = self.inner.dedup.lock().await;
            let window =
                chrono::Duration::hours(self.inner.config.orchestrator.dedup_window_hours);
            dedup.insert(seed.idempotency_key, (incident_id.clone(), Utc::now() + window));
        }

        if !self
            .inner
            .checkpoints
            .acquire_lease(&incident_id, &self.inner.owner_id, self.inner.config.lease_ttl())
            .await?
        {
            return Err(OrchestratorError::LeaseHeld { incident_id });
        }
        self.checkpoint_now(&incident_id).await;

        info!(incident_id, "incident admitted");
        self.spawn_drive(incident_id.clone());
        Ok(incident_id)
    }

    /// Current phase and snapshot: O(1) from the projection cache, replay
    /// otherwise.
    pub async fn status(
        &self,
        incident_id: &str,
    ) -> Result<(Phase, IncidentSnapshot), OrchestratorError> {
        {
            let live = self.inner.live.read().await;
            if let Some(incident) = live.get(incident_id) {
                return Ok((incident.phase, incident.snapshot(&self.inner.config.impact)));
            }
        }
        let incident = replay(self.inner.store.as_ref(), incident_id).await?;
        Ok((incident.phase, incident.snapshot(&self.inner.config.impact)))
    }

    /// Force-terminate an incident. A no-op on already-terminal incidents.
    pub async fn escalate(
        &self,
        incident_id: &str,
        reason: EscalationReason,
        detail: &str,
    ) -> Result<(), OrchestratorError> {
        let phase = match self.status(incident_id).await {
            Ok((phase, _)) => phase,
            Err(OrchestratorError::Store(StoreError::UnknownIncident(_))) => {
                return Err(OrchestratorError::UnknownIncident(incident_id.to_string()))
            }
            Err(e) => return Err(e),
        };
        if phase.is_terminal() {
            return Ok(());
        }

        self.append_escalated(incident_id, reason, detail).await?;
        Ok(())
    }

    /// Resume every non-terminal incident found in the store: reload the
    /// checkpoint, replay the event tail, re-acquire the lease, and spawn
    /// a fresh owner task.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let mut resumed = 0;
        for incident_id in self.inner.store.incident_ids().await? {
            let incident = match replay(self.inner.store.as_ref(), &incident_id).await {
                Ok(incident) => incident,
                Err(StoreError::CorruptionDetected { first_broken_sequence, .. }) => {
                    error!(
                        incident_id,
                        first_broken_sequence, "corruption detected during recovery"
                    );
                    // Append refusal is deliberate: nothing more is written
                    // to a corrupted chain.
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if incident.phase.is_terminal() {
                continue;
            }
            if !self
                .inner
                .checkpoints
                .acquire_lease(&incident_id, &self.inner.owner_id, self.inner.config.lease_ttl())
                .await?
            {
                info!(incident_id, "lease held elsewhere, skipping recovery");
                continue;
            }
            if let Some(checkpoint) = self.inner.checkpoints.load(&incident_id).await? {
                if !checkpoint.projection_digest.is_empty()
                    && checkpoint.last_applied_sequence == incident.version
                    && checkpoint.projection_digest != incident.projection_digest()
                {
                    warn!(incident_id, "checkpoint digest diverges from replay, trusting replay");
                }
            }
            self.inner.live.write().await.insert(incident_id.clone(), incident);
            self.spawn_drive(incident_id.clone());
            resumed += 1;
        }
        info!(resumed, "recovery complete");
        Ok(resumed)
    }

    /// Checkpoint everything, stop the owner tasks, release leases.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let ids: Vec<String> = self.inner.live.read().await.keys().cloned().collect();
        for incident_id in ids {
            self.checkpoint_now(&incident_id).await;
            let _ = self
                .inner
                .checkpoints
                .release_lease(&incident_id, &self.inner.owner_id)
                .await;
        }
    }

    /// Forced-priority resolution for when the consensus engine cannot
    /// produce a decision: the highest-ranked available recommendation
    /// wins, flagged degraded.
    pub fn forced_priority_decision(inputs: &[AgentRecommendation]) -> Option<ConsensusDecision> {
        let best = inputs.iter().min_by_key(|r| r.agent.priority_rank())?;
        Some(ConsensusDecision {
            participating_agents: vec![best.agent],
            inputs: inputs.to_vec(),
            quarantined: Vec::new(),
            selected_action_id: Some(best.action_id.clone()),
            aggregated_confidence: best.confidence,
            method: ConsensusMethod::DeadlockBestSingle,
            escalated_to_human: true,
            degraded: true,
            tie_break_seed: None,
        })
    }

    // ---- owner task -----------------------------------------------------

    fn spawn_drive(&self, incident_id: String) {
        let this = self.clone();
        let _ = self.inner.tasks.spawn(async move {
            this.drive(incident_id).await;
        });
    }

    async fn drive(&self, incident_id: String) {
        let deadline = Instant::now() + self.inner.config.phase_budget();

        loop {
            if self.inner.shutdown.is_cancelled() {
                self.checkpoint_now(&incident_id).await;
                let _ = self
                    .inner
                    .checkpoints
                    .release_lease(&incident_id, &self.inner.owner_id)
                    .await;
                return;
            }

            let phase = match self.live_phase(&incident_id).await {
                Some(phase) => phase,
                None => return,
            };
            if phase.is_terminal() {
                break;
            }

            let work = async {
                match phase {
                    Phase::Detected | Phase::Diagnosing | Phase::Predicting => {
                        self.run_triage(&incident_id, deadline).await
                    }
                    Phase::AwaitingConsensus => self.run_consensus(&incident_id).await,
                    Phase::Resolving => self.run_resolution(&incident_id).await,
                    // Live-only phases never appear at the top of the loop.
                    Phase::Validating | Phase::RollingBack => self
                        .append_escalated(
                            &incident_id,
                            EscalationReason::LogicViolation,
                            "owner loop observed a live-only phase",
                        )
                        .await
                        .map(|_| ()),
                    Phase::Resolved | Phase::Escalated => Ok(()),
                }
            };
            let step = tokio::select! {
                res = work => res,
                _ = self.inner.shutdown.cancelled() => {
                    self.checkpoint_now(&incident_id).await;
                    let _ = self
                        .inner
                        .checkpoints
                        .release_lease(&incident_id, &self.inner.owner_id)
                        .await;
                    return;
                }
            };

            if let Err(err) = step {
                match err {
                    OrchestratorError::StoreOutage { budget_secs } => {
                        error!(incident_id, budget_secs, "event store outage, escalating");
                        self.escalate_after_outage(&incident_id).await;
                        return;
                    }
                    // Another in-process writer terminated the incident
                    // first; the next loop iteration observes it.
                    OrchestratorError::Terminal { .. } => {}
                    OrchestratorError::Store(StoreError::CorruptionDetected {
                        first_broken_sequence,
                        ..
                    }) => {
                        error!(incident_id, first_broken_sequence, "chain corruption, halting incident");
                        self.mark_live_escalated(&incident_id).await;
                        return;
                    }
                    other => {
                        error!(incident_id, error = %other, "incident step failed, escalating");
                        let _ = self
                            .append_escalated(
                                &incident_id,
                                EscalationReason::LogicViolation,
                                &other.to_string(),
                            )
                            .await;
                        break;
                    }
                }
            }
            self.checkpoint_now(&incident_id).await;
        }

        self.notify_communication(&incident_id).await;
        self.checkpoint_now(&incident_id).await;
        let _ = self
            .inner
            .checkpoints
            .release_lease(&incident_id, &self.inner.owner_id)
            .await;
        self.inner.live.write().await.remove(&incident_id);
        info!(incident_id, "incident terminal, owner task done");
    }

    // ---- triage ---------------------------------------------------------

    async fn run_triage(
        &self,
        incident_id: &str,
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        let incident = self
            .live_incident(incident_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownIncident(incident_id.to_string()))?;
        let snapshot = incident.snapshot(&self.inner.config.impact);

        let diagnosis = async {
            if incident.awaiting_diagnosis() {
                self.run_branch(incident_id, AgentClass::Diagnosis, snapshot.clone(), deadline)
                    .await
            } else {
                Ok(())
            }
        };
        let prediction = async {
            if incident.awaiting_prediction() {
                self.run_branch(incident_id, AgentClass::Prediction, snapshot.clone(), deadline)
                    .await
            } else {
                Ok(())
            }
        };

        let (d, p) = tokio::join!(diagnosis, prediction);
        d?;
        p?;
        Ok(())
    }

    /// Drive one triage branch to a durable outcome: a recommendation
    /// (possibly partial), or a recorded timeout after the fallback chain
    /// is exhausted.
    async fn run_branch(
        &self,
        incident_id: &str,
        class: AgentClass,
        snapshot: IncidentSnapshot,
        deadline: Instant,
    ) -> Result<(), OrchestratorError> {
        let chain = FallbackChain::for_class(class);
        let attempts = chain.len().max(1);
        let timeout_secs = self.inner.config.agents.timeout_for(class).as_secs();

        for attempt in 0..attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mode = chain.mode_at(attempt);
            match self
                .invoke_agent(class, mode, snapshot.clone(), remaining, snapshot.severity)
                .await
            {
                Ok(output) => {
                    let partial = output.is_partial();
                    let mut recommendation = output.into_recommendation();
                    if recommendation.agent != class {
                        // The event kind is authoritative; a connector does
                        // not get to claim another class's weight.
                        warn!(incident_id, agent = %class, claimed = %recommendation.agent, "normalizing misattributed recommendation");
                        recommendation.agent = class;
                    }
                    self.inner
                        .reputation
                        .lock()
                        .await
                        .record(class, recommendation.confidence);
                    let payload = RecommendationPayload { recommendation, partial };
                    let event = match class {
                        AgentClass::Diagnosis => EventPayload::Diagnosed(payload),
                        _ => EventPayload::Predicted(payload),
                    };
                    self.append_with_outage_policy(incident_id, class.as_str(), event).await?;
                    return Ok(());
                }
                Err(AgentError::Timeout { .. }) => {
                    warn!(incident_id, agent = %class, "agent hard timeout");
                    break;
                }
                Err(err) => {
                    warn!(incident_id, agent = %class, attempt, error = %err, "agent attempt failed, walking fallback chain");
                }
            }
        }

        self.append_with_outage_policy(
            incident_id,
            ORCHESTRATOR_AGENT_ID,
            EventPayload::AgentTimedOut(AgentTimedOutPayload {
                agent: class,
                timeout_secs,
                partial_used: false,
            }),
        )
        .await?;
        Ok(())
    }

    // ---- consensus ------------------------------------------------------

    async fn run_consensus(&self, incident_id: &str) -> Result<(), OrchestratorError> {
        let incident = self
            .live_incident(incident_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownIncident(incident_id.to_string()))?;

        let inputs: Vec<AgentRecommendation> = AgentClass::VOTING
            .iter()
            .filter_map(|class| incident.agent_outputs.get(class).cloned())
            .collect();

        let participating: Vec<AgentClass> = inputs.iter().map(|r| r.agent).collect();
        let degraded_inputs = incident.awaiting_diagnosis() || incident.awaiting_prediction();

        self.append_with_outage_policy(
            incident_id,
            ORCHESTRATOR_AGENT_ID,
            EventPayload::ConsensusRequested(ConsensusRequestedPayload {
                participating: participating.clone(),
                degraded_inputs,
            }),
        )
        .await?;

        if inputs.is_empty() {
            self.append_escalated(
                incident_id,
                EscalationReason::ConsensusRejected,
                "no agent recommendations available",
            )
            .await?;
            return Ok(());
        }

        let view = self.inner.reputation.lock().await.view();
        let started = Instant::now();
        let result =
            self.inner.consensus.evaluate(incident.severity, &inputs, &view, started);

        match result {
            Ok(decision) => {
                for q in &decision.quarantined {
                    self.append_with_outage_policy(
                        incident_id,
                        ORCHESTRATOR_AGENT_ID,
                        EventPayload::AgentQuarantined(AgentQuarantinedPayload {
                            agent: q.agent,
                            reason: q.reason.as_str().to_string(),
                        }),
                    )
                    .await?;
                }
                let approved = decision.selected_action_id.is_some();
                self.append_with_outage_policy(
                    incident_id,
                    ORCHESTRATOR_AGENT_ID,
                    EventPayload::ConsensusReached(ConsensusReachedPayload {
                        decision: decision.clone(),
                    }),
                )
                .await?;
                if !approved {
                    self.append_escalated(
                        incident_id,
                        EscalationReason::ConsensusRejected,
                        &format!(
                            "aggregate confidence {:.3} below threshold",
                            decision.aggregated_confidence
                        ),
                    )
                    .await?;
                }
                Ok(())
            }
            Err(ConsensusError::InsufficientTrustedAgents { trusted, required }) => {
                self.append_escalated(
                    incident_id,
                    EscalationReason::InsufficientTrustedAgents,
                    &format!("{trusted} trusted agents remain, {required} required"),
                )
                .await?;
                Ok(())
            }
            Err(ConsensusError::NoInputs) => {
                // Engine gave nothing usable; fall back to priority order.
                match Self::forced_priority_decision(&inputs) {
                    Some(decision) => {
                        self.append_with_outage_policy(
                            incident_id,
                            ORCHESTRATOR_AGENT_ID,
                            EventPayload::ConsensusReached(ConsensusReachedPayload { decision }),
                        )
                        .await?;
                        Ok(())
                    }
                    None => {
                        self.append_escalated(
                            incident_id,
                            EscalationReason::ConsensusRejected,
                            "no recommendations for forced resolution",
                        )
                        .await?;
                        Ok(())
                    }
                }
            }
        }
    }

    // ---- resolution pipeline -------------------------------------------

    async fn run_resolution(&self, incident_id: &str) -> Result<(), OrchestratorError> {
        let incident = self
            .live_incident(incident_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownIncident(incident_id.to_string()))?;
        let snapshot = incident.snapshot(&self.inner.config.impact);

        let action_id = incident
            .consensus_history
            .iter()
            .rev()
            .find_map(|d| d.selected_action_id.clone());
        let action_id = match action_id {
            Some(a) => a,
            None => {
                self.append_escalated(
                    incident_id,
                    EscalationReason::LogicViolation,
                    "resolving without an approved action",
                )
                .await?;
                return Ok(());
            }
        };

        if incident.executed_action.is_none() {
            let events = self.inner.store.read(incident_id, 0).await?;

            // Proposal, unless a prior owner already recorded one.
            let proposal = events.iter().rev().find_map(|e| match &e.payload {
                EventPayload::ActionProposed(p) if p.action_id == action_id => Some(p.clone()),
                _ => None,
            });
            let proposal = match proposal {
                Some(p) => p,
                None => {
                    self.propose_action(incident_id, &action_id, snapshot.clone()).await?
                }
            };

            // Sandbox evidence when the template demands it.
            let template = match self.inner.gate.whitelist().get(&action_id) {
                Some(t) => t.clone(),
                None => {
                    self.append_validation_failure(
                        incident_id,
                        &action_id,
                        &format!("action '{action_id}' is not whitelisted"),
                    )
                    .await?;
                    return Ok(());
                }
            };

            if template.sandbox_required {
                let tested = events.iter().any(|e| {
                    matches!(&e.payload, EventPayload::SandboxTestPassed(p) if p.action_id == action_id)
                });
                if !tested {
                    match self.run_sandbox(incident_id, &action_id, &proposal.action_payload).await
                    {
                        Ok(report) => {
                            self.append_with_outage_policy(
                                incident_id,
                                ORCHESTRATOR_AGENT_ID,
                                EventPayload::SandboxTestPassed(SandboxTestPassedPayload {
                                    action_id: action_id.clone(),
                                    report,
                                }),
                            )
                            .await?;
                        }
                        Err(message) => {
                            self.append_validation_failure(
                                incident_id,
                                &action_id,
                                &format!("sandbox test failed: {message}"),
                            )
                            .await?;
                            return Ok(());
                        }
                    }
                }
            }

            // Security gate over the refreshed history.
            let events = self.inner.store.read(incident_id, 0).await?;
            let caller = self.resolution_identity();
            let credentials = self.inner.broker.issue(&action_id);
            if let Err(err) = self.inner.gate.validate(
                &events,
                &action_id,
                &proposal.action_payload,
                &caller,
                &credentials,
            ) {
                self.append_validation_failure(incident_id, &action_id, &err.to_string())
                    .await?;
                return Ok(());
            }
            let validated = self
                .append_with_outage_policy(
                    incident_id,
                    ORCHESTRATOR_AGENT_ID,
                    EventPayload::ActionValidated(crate::incident::ActionValidatedPayload {
                        action_id: action_id.clone(),
                        payload_hash: proposal.payload_hash.clone(),
                    }),
                )
                .await?;

            // Execute, checkpointing on the configured cadence while the
            // actuator works.
            let idempotency_key =
                format!("{incident_id}:{action_id}:{}", validated.sequence_number);
            let outcome = self
                .with_resolving_checkpoints(
                    incident_id,
                    self.execute_action(&action_id, &proposal.action_payload, &credentials, &idempotency_key),
                )
                .await;

            match outcome {
                Ok(result) => {
                    self.append_with_outage_policy(
                        incident_id,
                        ORCHESTRATOR_AGENT_ID,
                        EventPayload::ActionExecuted(ActionExecutedPayload {
                            action_id: action_id.clone(),
                            payload_hash: proposal.payload_hash.clone(),
                            idempotency_key,
                            outcome: result,
                        }),
                    )
                    .await?;
                }
                Err(message) => {
                    self.append_with_outage_policy(
                        incident_id,
                        ORCHESTRATOR_AGENT_ID,
                        EventPayload::ActionFailed(ActionFailedPayload {
                            action_id: action_id.clone(),
                            error: message.clone(),
                        }),
                    )
                    .await?;
                    self.append_escalated(incident_id, EscalationReason::ActionFailed, &message)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Post-action health check: the live-only Validating phase.
        self.transition_live(incident_id, Phase::Validating).await;
        let template = self.inner.gate.whitelist().get(&action_id).cloned();
        let invariants =
            template.as_ref().map(|t| t.validation_invariants.clone()).unwrap_or_default();

        let actuator = self.inner.actuator.clone();
        let healthy = self
            .inner
            .fabric
            .invoke(
                "actuator",
                severity_priority(snapshot.severity),
                self.inner.config.agents.timeout_for(AgentClass::Resolution),
                None,
                move |_ctx| {
                    let actuator = actuator.clone();
                    let invariants = invariants.clone();
                    async move { actuator.health_check(incident_id, &invariants).await }
                },
            )
            .await;

        match healthy {
            Ok(true) => {
                self.append_with_outage_policy(
                    incident_id,
                    ORCHESTRATOR_AGENT_ID,
                    EventPayload::Resolved(ResolvedPayload {
                        action_id: Some(action_id),
                        notes: "post-action health check passed".to_string(),
                    }),
                )
                .await?;
            }
            Ok(false) | Err(_) => {
                warn!(incident_id, "post-action health check failed, rolling back");
                self.transition_live(incident_id, Phase::RollingBack).await;
                let rollback_template =
                    template.as_ref().and_then(|t| t.rollback_template_id.clone());
                let actuator = self.inner.actuator.clone();
                let action_ref: &str = &action_id;
                let rollback_ref = rollback_template.as_deref();
                let rolled = self
                    .inner
                    .fabric
                    .invoke(
                        "actuator",
                        0,
                        self.inner.config.agents.timeout_for(AgentClass::Resolution),
                        None,
                        move |_ctx| {
                            let actuator = actuator.clone();
                            async move { actuator.rollback(action_ref, rollback_ref).await }
                        },
                    )
                    .await;
                if let Err(err) = rolled {
                    self.append_escalated(
                        incident_id,
                        EscalationReason::ActionFailed,
                        &format!("rollback failed: {err}"),
                    )
                    .await?;
                    return Ok(());
                }
                self.append_with_outage_policy(
                    incident_id,
                    ORCHESTRATOR_AGENT_ID,
                    EventPayload::RolledBack(RolledBackPayload {
                        action_id: action_id.clone(),
                        rollback_template_id: rollback_template,
                    }),
                )
                .await?;
                self.append_escalated(
                    incident_id,
                    EscalationReason::RollbackCompleted,
                    "action rolled back after failed health check",
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn propose_action(
        &self,
        incident_id: &str,
        action_id: &str,
        snapshot: IncidentSnapshot,
    ) -> Result<ActionProposedPayload, OrchestratorError> {
        let severity = snapshot.severity;
        let remaining = self.inner.config.agents.timeout_for(AgentClass::Resolution);
        let chain = FallbackChain::for_class(AgentClass::Resolution);

        let mut recommendation = None;
        for attempt in 0..chain.len().max(1) {
            let mode = chain.mode_at(attempt);
            match self
                .invoke_agent(AgentClass::Resolution, mode, snapshot.clone(), remaining, severity)
                .await
            {
                Ok(output) => {
                    recommendation = Some(output.into_recommendation());
                    break;
                }
                Err(err) => {
                    warn!(incident_id, attempt, error = %err, "resolution agent attempt failed, walking fallback chain");
                }
            }
        }
        // Every rung failed: the consensus-approved action is still safe to
        // propose on its own, leaving the human-takeover rung to the gate
        // and health check.
        let recommendation = recommendation.unwrap_or_else(|| AgentRecommendation {
            agent: AgentClass::Resolution,
            action_id: action_id.to_string(),
            confidence: 0.0,
            risk: crate::agents::RiskLevel::Medium,
            reasoning: "synthesized from approved consensus action".to_string(),
            evidence: Vec::new(),
            estimated_duration_secs: 0,
            rollback_plan: None,
            signature: String::new(),
        });

        let action_payload = serde_json::json!({
            "action_id": action_id,
            "incident_id": incident_id,
            "rollback_plan": recommendation.rollback_plan,
        });
        let payload = ActionProposedPayload {
            action_id: action_id.to_string(),
            payload_hash: crate::incident::event::action_payload_hash(&action_payload),
            action_payload,
            recommendation,
        };
        self.append_with_outage_policy(
            incident_id,
            AgentClass::Resolution.as_str(),
            EventPayload::ActionProposed(payload.clone()),
        )
        .await?;
        Ok(payload)
    }

    async fn run_sandbox(
        &self,
        incident_id: &str,
        action_id: &str,
        payload: &serde_json::Value,
    ) -> Result<String, String> {
        let actuator = self.inner.actuator.clone();
        self.inner
            .fabric
            .invoke(
                "actuator",
                1,
                self.inner.config.agents.timeout_for(AgentClass::Resolution),
                None,
                move |_ctx| {
                    let actuator = actuator.clone();
                    async move { actuator.sandbox_test(incident_id, action_id, payload).await }
                },
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn execute_action(
        &self,
        action_id: &str,
        payload: &serde_json::Value,
        credentials: &CredentialHandle,
        idempotency_key: &str,
    ) -> Result<String, String> {
        let actuator = self.inner.actuator.clone();
        self.inner
            .fabric
            .invoke(
                "actuator",
                0,
                self.inner.config.agents.timeout_for(AgentClass::Resolution),
                Some(idempotency_key.to_string()),
                move |ctx| {
                    let actuator = actuator.clone();
                    async move {
                        actuator
                            .execute(
                                action_id,
                                payload,
                                credentials,
                                ctx.idempotency_key.as_deref().unwrap_or_default(),
                            )
                            .await
                    }
                },
            )
            .await
            .map_err(|e| e.to_string())
    }

    // ---- agent invocation ----------------------------------------------

    /// Invoke one agent through the fabric with the hard class timeout,
    /// cooperative cancellation, and the grace window for flushing a
    /// partial result.
    async fn invoke_agent(
        &self,
        class: AgentClass,
        mode: Option<crate::agents::FallbackMode>,
        snapshot: IncidentSnapshot,
        remaining: Duration,
        severity: Severity,
    ) -> Result<AgentOutput, AgentError> {
        let connector = self
            .inner
            .agents
            .get(class)
            .ok_or(AgentError::Unavailable { class })?;

        let hard_timeout = self.inner.config.agents.timeout_for(class).min(remaining);
        let grace = Duration::from_secs(self.inner.config.agents.cancel_grace_secs);
        let channel = match class {
            AgentClass::Diagnosis | AgentClass::Resolution => "model.reasoning",
            _ => "model.classify",
        };
        let complexity = match severity {
            Severity::Critical => crate::fabric::ComplexityEstimate::Deep,
            Severity::Important => crate::fabric::ComplexityEstimate::Standard,
            Severity::Supporting => crate::fabric::ComplexityEstimate::Fast,
        };
        let model_id = self.inner.fabric.router().route(class, complexity);

        let failure: Arc<StdMutex<Option<AgentError>>> = Arc::new(StdMutex::new(None));
        let result = self
            .inner
            .fabric
            .invoke(
                channel,
                severity_priority(severity),
                hard_timeout + grace,
                None,
                {
                    let failure = failure.clone();
                    let connector = connector.clone();
                    let model_id = model_id.clone();
                    move |_ctx| {
                        let failure = failure.clone();
                        let connector = connector.clone();
                        let snapshot = snapshot.clone();
                        let model_id = model_id.clone();
                        async move {
                            let cancel = CancellationToken::new();
                            let context = AgentContext {
                                cancel: cancel.clone(),
                                fallback_mode: mode,
                                deadline: hard_timeout,
                                model_id,
                            };
                            let run = connector.run(snapshot, context);
                            tokio::pin!(run);
                            let outcome = tokio::select! {
                                res = &mut run => res,
                                _ = tokio::time::sleep(hard_timeout) => {
                                    cancel.cancel();
                                    match tokio::time::timeout(grace, &mut run).await {
                                        Ok(res) => res,
                                        Err(_) => Err(AgentError::Timeout {
                                            class,
                                            timeout_secs: hard_timeout.as_secs(),
                                        }),
                                    }
                                }
                            };
                            match outcome {
                                Ok(output) => Ok(output),
                                Err(err) => {
                                    let message = err.to_string();
                                    *failure.lock().expect("failure slot") = Some(err);
                                    // Fallback chains own retries; the
                                    // fabric must not retry on its own.
                                    Err(UpstreamError { message, retryable: false })
                                }
                            }
                        }
                    }
                },
            )
            .await;

        match result {
            Ok(output) => {
                self.inner.fabric.router().record_success(&model_id);
                Ok(output)
            }
            Err(fabric_err) => {
                self.inner.fabric.router().record_failure(&model_id);
                let stored = failure.lock().expect("failure slot").take();
                Err(stored.unwrap_or_else(|| match fabric_err {
                    FabricError::Timeout { .. } => AgentError::Timeout {
                        class,
                        timeout_secs: hard_timeout.as_secs(),
                    },
                    FabricError::Throttled { .. } | FabricError::CircuitOpen { .. } => {
                        AgentError::Unavailable { class }
                    }
                    other => AgentError::Upstream {
                        class,
                        message: other.to_string(),
                        retryable: false,
                    },
                }))
            }
        }
    }

    async fn notify_communication(&self, incident_id: &str) {
        let snapshot = match self.status(incident_id).await {
            Ok((_, snapshot)) => snapshot,
            Err(_) => return,
        };
        let severity = snapshot.severity;
        let timeout = self.inner.config.agents.timeout_for(AgentClass::Communication);
        match self
            .invoke_agent(AgentClass::Communication, None, snapshot, timeout, severity)
            .await
        {
            Ok(_) => info!(incident_id, "stakeholders notified"),
            Err(err) => warn!(incident_id, error = %err, "communication agent failed"),
        }
    }

    // ---- append / projection plumbing ----------------------------------

    /// Append with the store-outage policy: exponential backoff while the
    /// store is unavailable, bounded by the configured outage budget. All
    /// in-process writers for one incident serialize through its append
    /// guard, and appends to terminal incidents are rejected up front.
    async fn append_with_outage_policy(
        &self,
        incident_id: &str,
        agent_id: &str,
        payload: EventPayload,
    ) -> Result<EventEnvelope, OrchestratorError> {
        let guard = {
            let mut locks = self.inner.append_locks.lock().await;
            locks.entry(incident_id.to_string()).or_default().clone()
        };
        let _held = guard.lock().await;

        {
            let live = self.inner.live.read().await;
            if let Some(incident) = live.get(incident_id) {
                if incident.phase.is_terminal() {
                    return Err(OrchestratorError::Terminal {
                        incident_id: incident_id.to_string(),
                        phase: incident.phase,
                    });
                }
            }
        }

        let budget = Duration::from_secs(self.inner.config.store.outage_budget_secs);
        let started = Instant::now();
        let mut delay = Duration::from_secs(1);

        loop {
            match self.inner.store.append_next(incident_id, agent_id, payload.clone()).await {
                Ok(envelope) => {
                    self.apply_to_live(&envelope).await;
                    return Ok(envelope);
                }
                Err(err) if err.is_retryable() => {
                    let elapsed = started.elapsed();
                    if elapsed >= budget {
                        return Err(OrchestratorError::StoreOutage {
                            budget_secs: budget.as_secs(),
                        });
                    }
                    warn!(incident_id, error = %err, "append failed, backing off");
                    let sleep = delay.min(budget - elapsed);
                    tokio::time::sleep(sleep).await;
                    delay = (delay * 2).min(Duration::from_secs(60));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn append_escalated(
        &self,
        incident_id: &str,
        reason: EscalationReason,
        detail: &str,
    ) -> Result<EventEnvelope, OrchestratorError> {
        self.append_with_outage_policy(
            incident_id,
            ORCHESTRATOR_AGENT_ID,
            EventPayload::Escalated(EscalatedPayload {
                reason,
                detail: detail.to_string(),
            }),
        )
        .await
    }

    async fn append_validation_failure(
        &self,
        incident_id: &str,
        action_id: &str,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        self.append_with_outage_policy(
            incident_id,
            ORCHESTRATOR_AGENT_ID,
            EventPayload::ValidationFailed(ValidationFailedPayload {
                action_id: action_id.to_string(),
                reason: reason.to_string(),
            }),
        )
        .await?;
        self.append_escalated(incident_id, EscalationReason::ValidationFailed, reason)
            .await?;
        Ok(())
    }

    /// Outage path: best-effort final event, then terminate locally. No
    /// action executes while the store is down, and the incident surfaces
    /// as escalated either way.
    async fn escalate_after_outage(&self, incident_id: &str) {
        let attempt = self
            .inner
            .store
            .append_next(
                incident_id,
                ORCHESTRATOR_AGENT_ID,
                EventPayload::Escalated(EscalatedPayload {
                    reason: EscalationReason::EventStoreOutage,
                    detail: "event store outage exceeded its budget".to_string(),
                }),
            )
            .await;
        if let Ok(envelope) = attempt {
            self.apply_to_live(&envelope).await;
        }
        self.mark_live_escalated(incident_id).await;
        self.checkpoint_now(incident_id).await;
        let _ = self
            .inner
            .checkpoints
            .release_lease(incident_id, &self.inner.owner_id)
            .await;
        // The entry stays in the projection cache: with the store down it
        // is the only place the escalation is visible.
    }

    async fn apply_to_live(&self, envelope: &EventEnvelope) {
        let mut live = self.inner.live.write().await;
        match live.get_mut(&envelope.incident_id) {
            Some(incident) => {
                if incident.version + 1 == envelope.sequence_number {
                    if let Err(err) = incident.apply(envelope) {
                        error!(
                            incident_id = %envelope.incident_id,
                            error = %err,
                            "projection rejected its own event, rebuilding from replay"
                        );
                        live.remove(&envelope.incident_id);
                    }
                }
            }
            None => {
                if envelope.sequence_number == 1 {
                    if let Ok(incident) = Incident::from_detected(envelope) {
                        live.insert(envelope.incident_id.clone(), incident);
                    }
                }
            }
        }
    }

    async fn live_incident(&self, incident_id: &str) -> Option<Incident> {
        {
            let live = self.inner.live.read().await;
            if let Some(incident) = live.get(incident_id) {
                return Some(incident.clone());
            }
        }
        match replay(self.inner.store.as_ref(), incident_id).await {
            Ok(incident) => {
                let mut live = self.inner.live.write().await;
                live.insert(incident_id.to_string(), incident.clone());
                Some(incident)
            }
            Err(_) => None,
        }
    }

    async fn live_phase(&self, incident_id: &str) -> Option<Phase> {
        self.live_incident(incident_id).await.map(|i| i.phase)
    }

    async fn transition_live(&self, incident_id: &str, to: Phase) {
        let mut live = self.inner.live.write().await;
        if let Some(incident) = live.get_mut(incident_id) {
            if let Err(err) = incident.transition(to) {
                error!(incident_id, error = %err, "illegal live transition");
            }
        }
    }

    async fn mark_live_escalated(&self, incident_id: &str) {
        let mut live = self.inner.live.write().await;
        if let Some(incident) = live.get_mut(incident_id) {
            incident.phase = Phase::Escalated;
        }
    }

    async fn checkpoint_now(&self, incident_id: &str) {
        let (phase, digest, sequence) = {
            let live = self.inner.live.read().await;
            match live.get(incident_id) {
                Some(incident) => {
                    (incident.phase, incident.projection_digest(), incident.version)
                }
                None => return,
            }
        };
        let checkpoint = Checkpoint {
            incident_id: incident_id.to_string(),
            phase,
            projection_digest: digest,
            last_applied_sequence: sequence,
            lease_owner: Some(self.inner.owner_id.clone()),
            lease_expiry: Some(
                Utc::now()
                    + chrono::Duration::from_std(self.inner.config.lease_ttl())
                        .unwrap_or(chrono::Duration::seconds(600)),
            ),
            updated_at: Utc::now(),
        };
        if let Err(err) = self.inner.checkpoints.save(&checkpoint).await {
            warn!(incident_id, error = %err, "checkpoint write failed");
        }
    }

    /// Run `fut`, checkpointing the incident on the configured cadence
    /// until it completes. This is the long-phase cadence rule for
    /// `Resolving`.
    async fn with_resolving_checkpoints<T>(
        &self,
        incident_id: &str,
        fut: impl std::future::Future<Output = T>,
    ) -> T {
        let interval =
            Duration::from_secs(self.inner.config.orchestrator.checkpoint_interval_secs.max(1));
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = tokio::time::sleep(interval) => {
                    self.checkpoint_now(incident_id).await;
                }
            }
        }
    }

    fn resolution_identity(&self) -> AgentIdentity {
        self.inner
            .agents
            .get(AgentClass::Resolution)
            .map(|c| c.identity())
            .unwrap_or(AgentIdentity {
                agent_id: "resolution".to_string(),
                class: AgentClass::Resolution,
                token: String::new(),
            })
    }
}

fn severity_priority(severity: Severity) -> u8 {
    match severity {
        Severity::Critical => 0,
        Severity::Important => 1,
        Severity::Supporting => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::RiskLevel;

    fn rec(agent: AgentClass, action: &str, confidence: f64) -> AgentRecommendation {
        AgentRecommendation {
            agent,
            action_id: action.to_string(),
            confidence,
            risk: RiskLevel::Low,
            reasoning: String::new(),
            evidence: vec![],
            estimated_duration_secs: 10,
            rollback_plan: None,
            signature: "sig".to_string(),
        }
    }

    #[test]
    fn forced_priority_prefers_detection() {
        let inputs = vec![
            rec(AgentClass::Resolution, "c", 0.99),
            rec(AgentClass::Prediction, "b", 0.8),
            rec(AgentClass::Detection, "a", 0.2),
        ];
        let decision = Orchestrator::forced_priority_decision(&inputs).unwrap();
        assert_eq!(decision.selected_action_id.as_deref(), Some("a"));
        assert!(decision.degraded);
        assert!(decision.escalated_to_human);
    }

    #[test]
    fn forced_priority_on_empty_inputs_is_none() {
        assert!(Orchestrator::forced_priority_decision(&[]).is_none());
    }

    #[test]
    fn severity_maps_to_queue_priority() {
        assert_eq!(severity_priority(Severity::Critical), 0);
        assert_eq!(severity_priority(Severity::Important), 1);
        assert_eq!(severity_priority(Severity::Supporting), 2);
    }
}
