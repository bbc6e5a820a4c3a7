// opsentry - autonomous incident response engine
//
// A fixed swarm of reasoning agents (detection, diagnosis, prediction,
// resolution, communication) coordinated over an append-only hash-chained
// event log, with Byzantine-tolerant weighted consensus gating every
// remediation and a rate-limit/circuit-breaker fabric around every
// outbound call.

pub mod agents;
pub mod bus;
pub mod config;
pub mod consensus;
pub mod error;
pub mod fabric;
pub mod incident;
pub mod orchestrator;
pub mod security;
pub mod store;

// Re-export commonly used types
pub use agents::{
    AgentClass, AgentConnector, AgentContext, AgentError, AgentIdentity, AgentOutput,
    AgentRecommendation, RiskLevel,
};
pub use bus::{ingress_channel, DetectionEvent, IngressQueue};
pub use config::{Config, ConfigError, ConfigLoader};
pub use consensus::{
    ConsensusDecision, ConsensusEngine, ConsensusError, ConsensusMethod, ReputationBook,
};
pub use error::{ErrorClass, EscalationReason, OpsentryError, OpsentryResult};
pub use fabric::{CircuitBreaker, Fabric, FabricError, TokenBucket};
pub use incident::{EventEnvelope, EventKind, EventPayload, Incident, IncidentSnapshot, Phase, Severity};
pub use orchestrator::{
    ActionExecutor, AgentRegistry, CredentialBroker, Dependencies, Orchestrator,
    OrchestratorError,
};
pub use security::{ActionTemplate, ActionWhitelist, CredentialHandle, SecurityGate};
pub use store::{replay, verify_chain, ChainStatus, EventLog, FileEventLog, MemoryEventLog};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
