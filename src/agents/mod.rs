//! Agent interface layer.
//!
//! The engine coordinates five fixed agent classes. Each agent is an
//! external collaborator behind one capability trait: it runs against a
//! read-only incident snapshot, honors cooperative cancellation, and proves
//! its identity with a signed token. Agent internals (model prompting, log
//! parsing, forecasting) are invisible to the core; the only thing an agent
//! produces that the core understands is an [`AgentRecommendation`].

pub mod fallback;

use crate::incident::IncidentSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use fallback::{FallbackChain, FallbackMode};

/// The five fixed agent classes, in forced-resolution priority order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AgentClass {
    Detection,
    Diagnosis,
    Prediction,
    Resolution,
    Communication,
}

impl AgentClass {
    pub const ALL: [AgentClass; 5] = [
        AgentClass::Detection,
        AgentClass::Diagnosis,
        AgentClass::Prediction,
        AgentClass::Resolution,
        AgentClass::Communication,
    ];

    /// Classes that carry a vote in consensus.
    pub const VOTING: [AgentClass; 4] = [
        AgentClass::Detection,
        AgentClass::Diagnosis,
        AgentClass::Prediction,
        AgentClass::Resolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentClass::Detection => "detection",
            AgentClass::Diagnosis => "diagnosis",
            AgentClass::Prediction => "prediction",
            AgentClass::Resolution => "resolution",
            AgentClass::Communication => "communication",
        }
    }

    /// Priority rank for forced resolution when consensus is unreachable.
    /// Lower is higher priority: Detection > Diagnosis > Prediction >
    /// Resolution.
    pub fn priority_rank(&self) -> u8 {
        match self {
            AgentClass::Detection => 0,
            AgentClass::Diagnosis => 1,
            AgentClass::Prediction => 2,
            AgentClass::Resolution => 3,
            AgentClass::Communication => 4,
        }
    }
}

impl fmt::Display for AgentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Risk attached to a recommended action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A single agent's recommendation for one incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecommendation {
    pub agent: AgentClass,
    /// Key into the action whitelist.
    pub action_id: String,
    /// Must be strictly within [0, 1]; out-of-range values flag the
    /// producing agent as suspect in the consensus engine.
    pub confidence: f64,
    pub risk: RiskLevel,
    /// Opaque reasoning text or JSON, never interpreted by the core.
    pub reasoning: String,
    /// Opaque evidence blobs; overlap between agents feeds the behavioral
    /// screen.
    pub evidence: Vec<String>,
    pub estimated_duration_secs: u64,
    pub rollback_plan: Option<String>,
    /// Opaque signature checked by the configured identity verifier.
    pub signature: String,
}

impl AgentRecommendation {
    pub fn confidence_in_range(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}

/// What an agent run can yield.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentOutput {
    Recommendation(AgentRecommendation),
    /// Flushed through the interrupt channel when a cancelled or timed-out
    /// agent had something usable.
    Partial(AgentRecommendation),
}

impl AgentOutput {
    pub fn into_recommendation(self) -> AgentRecommendation {
        match self {
            AgentOutput::Recommendation(r) | AgentOutput::Partial(r) => r,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, AgentOutput::Partial(_))
    }
}

/// Context handed to an agent run.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Cooperative cancellation signal; agents must yield within the grace
    /// period and flush a partial result if they have one.
    pub cancel: CancellationToken,
    /// Set when the orchestrator is walking the agent's fallback chain.
    pub fallback_mode: Option<FallbackMode>,
    /// Remaining budget inherited from the phase deadline.
    pub deadline: Duration,
    /// Model selected by the router for this call.
    pub model_id: String,
}

/// A signed identity token presented by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub class: AgentClass,
    pub token: String,
}

/// Capability trait implemented by every agent connector.
///
/// Agents never call each other; all inter-agent information flows through
/// event store appends made by the orchestrator.
#[async_trait::async_trait]
pub trait AgentConnector: Send + Sync + fmt::Debug {
    /// The class this connector serves.
    fn class(&self) -> AgentClass;

    /// Run the agent against a read-only snapshot.
    async fn run(
        &self,
        snapshot: IncidentSnapshot,
        context: AgentContext,
    ) -> Result<AgentOutput, AgentError>;

    /// Signed identity token, verified by the consensus integrity screen.
    fn identity(&self) -> AgentIdentity;
}

/// Errors surfaced by agent connectors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {class} timed out after {timeout_secs}s")]
    Timeout { class: AgentClass, timeout_secs: u64 },

    #[error("Agent {class} was cancelled")]
    Cancelled { class: AgentClass },

    #[error("Agent {class} upstream failure: {message}")]
    Upstream { class: AgentClass, message: String, retryable: bool },

    #[error("Agent {class} returned malformed output: {message}")]
    Malformed { class: AgentClass, message: String },

    #[error("Agent {class} is unavailable")]
    Unavailable { class: AgentClass },
}

impl AgentError {
    pub fn class(&self) -> crate::error::ErrorClass {
        use crate::error::ErrorClass;
        match self {
            AgentError::Timeout { .. } | AgentError::Cancelled { .. } => {
                ErrorClass::TransientUpstream
            }
            AgentError::Upstream { retryable: true, .. } => ErrorClass::TransientUpstream,
            AgentError::Upstream { retryable: false, .. } | AgentError::Unavailable { .. } => {
                ErrorClass::PersistentUpstream
            }
            AgentError::Malformed { .. } => ErrorClass::IntegrityViolation,
        }
    }

    pub fn agent_class(&self) -> AgentClass {
        match self {
            AgentError::Timeout { class, .. }
            | AgentError::Cancelled { class }
            | AgentError::Upstream { class, .. }
            | AgentError::Malformed { class, .. }
            | AgentError::Unavailable { class } => *class,
        }
    }
}
