//! Security validation gate.
//!
//! Nothing executes unless it passes four checks: the action is on the
//! whitelist, the proposing agent holds every permission the template
//! demands, sandbox evidence exists when the template requires it, and the
//! payload about to execute hashes to exactly what was approved in the most
//! recent proposal. Credentials are opaque just-in-time handles with a
//! short TTL, held by value and never inspected.

use crate::agents::{AgentClass, AgentIdentity};
use crate::incident::{event::action_payload_hash, EventEnvelope, EventPayload};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// A whitelist entry describing one permitted remediation action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub action_id: String,
    pub required_permissions: BTreeSet<String>,
    #[serde(default = "default_sandbox_required")]
    pub sandbox_required: bool,
    /// Named pre/post-state predicates checked by the actuator.
    pub validation_invariants: Vec<String>,
    pub rollback_template_id: Option<String>,
}

fn default_sandbox_required() -> bool {
    true
}

/// Read-mostly action whitelist keyed by action id.
#[derive(Debug, Clone, Default)]
pub struct ActionWhitelist {
    templates: IndexMap<String, ActionTemplate>,
}

impl ActionWhitelist {
    pub fn new(templates: Vec<ActionTemplate>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.action_id.clone(), t)).collect(),
        }
    }

    pub fn get(&self, action_id: &str) -> Option<&ActionTemplate> {
        self.templates.get(action_id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// The stock whitelist shipped with the engine. Deployments replace
    /// this with their own catalog.
    pub fn builtin() -> Self {
        static BUILTIN: Lazy<ActionWhitelist> = Lazy::new(ActionWhitelist::builtin_catalog);
        BUILTIN.clone()
    }

    fn builtin_catalog() -> Self {
        Self::new(vec![
            ActionTemplate {
                action_id: "restart_db_pool".to_string(),
                required_permissions: BTreeSet::from(["db.pool.restart".to_string()]),
                sandbox_required: true,
                validation_invariants: vec!["db_connections_recovered".to_string()],
                rollback_template_id: None,
            },
            ActionTemplate {
                action_id: "scale_out".to_string(),
                required_permissions: BTreeSet::from(["asg.scale".to_string()]),
                sandbox_required: false,
                validation_invariants: vec!["capacity_within_budget".to_string()],
                rollback_template_id: Some("scale_in".to_string()),
            },
            ActionTemplate {
                action_id: "scale_in".to_string(),
                required_permissions: BTreeSet::from(["asg.scale".to_string()]),
                sandbox_required: false,
                validation_invariants: vec![],
                rollback_template_id: None,
            },
            ActionTemplate {
                action_id: "flush_cache".to_string(),
                required_permissions: BTreeSet::from(["cache.flush".to_string()]),
                sandbox_required: true,
                validation_invariants: vec!["hit_rate_recovering".to_string()],
                rollback_template_id: None,
            },
            ActionTemplate {
                action_id: "failover_replica".to_string(),
                required_permissions: BTreeSet::from([
                    "db.failover".to_string(),
                    "dns.update".to_string(),
                ]),
                sandbox_required: true,
                validation_invariants: vec!["replica_promoted".to_string()],
                rollback_template_id: Some("failback_primary".to_string()),
            },
        ])
    }
}

/// Opaque just-in-time credential handle. The broker that issues it is an
/// external collaborator; the core only carries the handle and its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialHandle {
    token: String,
    issued_at: DateTime<Utc>,
    ttl_secs: i64,
}

impl CredentialHandle {
    pub const DEFAULT_TTL_SECS: i64 = 15 * 60;

    pub fn new(token: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self { token: token.into(), issued_at, ttl_secs: Self::DEFAULT_TTL_SECS }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.issued_at + ChronoDuration::seconds(self.ttl_secs)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// The opaque token, handed to the actuator verbatim.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Rejections from the validation gate.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Caller '{caller}' lacks permissions for '{action_id}': missing {missing:?}")]
    PermissionDenied { caller: String, action_id: String, missing: Vec<String> },

    #[error("Action '{0}' requires a passed sandbox test for this incident")]
    SandboxNotTested(String),

    #[error("Payload hash mismatch for action '{action_id}': approved {approved}, got {got}")]
    PayloadHashMismatch { action_id: String, approved: String, got: String },

    #[error("No action proposal recorded for '{0}'")]
    NoProposal(String),

    #[error("Only the resolution agent may execute actions, got '{0}'")]
    CallerNotResolution(String),

    #[error("Credential handle expired")]
    CredentialExpired,
}

/// The gate itself: whitelist plus per-agent permission grants.
#[derive(Debug, Clone)]
pub struct SecurityGate {
    whitelist: ActionWhitelist,
    permissions: BTreeMap<String, BTreeSet<String>>,
}

impl SecurityGate {
    pub fn new(whitelist: ActionWhitelist) -> Self {
        Self { whitelist, permissions: BTreeMap::new() }
    }

    pub fn grant(&mut self, agent_id: impl Into<String>, permission: impl Into<String>) {
        self.permissions.entry(agent_id.into()).or_default().insert(permission.into());
    }

    /// Grant every permission the builtin whitelist mentions. Used by
    /// single-tenant deployments where the resolution agent is fully
    /// trusted once authenticated.
    pub fn grant_all_known(&mut self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        let all: BTreeSet<String> = self
            .whitelist
            .templates
            .values()
            .flat_map(|t| t.required_permissions.iter().cloned())
            .collect();
        self.permissions.insert(agent_id, all);
    }

    pub fn whitelist(&self) -> &ActionWhitelist {
        &self.whitelist
    }

    /// Run the full gate against the incident's event history.
    ///
    /// `execute_payload` is the payload about to be handed to the actuator;
    /// it must hash to the value recorded in the latest proposal.
    pub fn validate(
        &self,
        events: &[EventEnvelope],
        action_id: &str,
        execute_payload: &serde_json::Value,
        caller: &AgentIdentity,
        credentials: &CredentialHandle,
    ) -> Result<(), SecurityError> {
        if caller.class != AgentClass::Resolution {
            return Err(SecurityError::CallerNotResolution(caller.class.to_string()));
        }
        if !credentials.is_valid() {
            return Err(SecurityError::CredentialExpired);
        }

        // 1. Whitelist lookup.
        let template = self
            .whitelist
            .get(action_id)
            .ok_or_else(|| SecurityError::UnknownAction(action_id.to_string()))?;

        // 2. Permission check against the caller's grants.
        let held = self.permissions.get(&caller.agent_id).cloned().unwrap_or_default();
        let missing: Vec<String> =
            template.required_permissions.difference(&held).cloned().collect();
        if !missing.is_empty() {
            warn!(caller = %caller.agent_id, action_id, ?missing, "permission check failed");
            return Err(SecurityError::PermissionDenied {
                caller: caller.agent_id.clone(),
                action_id: action_id.to_string(),
                missing,
            });
        }

        // 3. Sandbox evidence for this (incident, action) pair.
        if template.sandbox_required {
            let tested = events.iter().any(|e| {
                matches!(&e.payload, EventPayload::SandboxTestPassed(p) if p.action_id == action_id)
            });
            if !tested {
                return Err(SecurityError::SandboxNotTested(action_id.to_string()));
            }
        }

        // 4. Payload hash must match the most recent proposal.
        let approved_hash = events
            .iter()
            .rev()
            .find_map(|e| match &e.payload {
                EventPayload::ActionProposed(p) if p.action_id == action_id => {
                    Some(p.payload_hash.clone())
                }
                _ => None,
            })
            .ok_or_else(|| SecurityError::NoProposal(action_id.to_string()))?;

        let got = action_payload_hash(execute_payload);
        if got != approved_hash {
            warn!(action_id, "payload hash mismatch between approval and execution");
            return Err(SecurityError::PayloadHashMismatch {
                action_id: action_id.to_string(),
                approved: approved_hash,
                got,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRecommendation, RiskLevel};
    use crate::incident::{ActionProposedPayload, SandboxTestPassedPayload, GENESIS_HASH};

    fn caller() -> AgentIdentity {
        AgentIdentity {
            agent_id: "resolution-1".to_string(),
            class: AgentClass::Resolution,
            token: "tok".to_string(),
        }
    }

    fn credentials() -> CredentialHandle {
        CredentialHandle::new("jit-token", Utc::now())
    }

    fn gate() -> SecurityGate {
        let mut gate = SecurityGate::new(ActionWhitelist::builtin());
        gate.grant_all_known("resolution-1");
        gate
    }

    fn resolution_rec(action: &str) -> AgentRecommendation {
        AgentRecommendation {
            agent: AgentClass::Resolution,
            action_id: action.to_string(),
            confidence: 0.9,
            risk: RiskLevel::Low,
            reasoning: String::new(),
            evidence: vec![],
            estimated_duration_secs: 60,
            rollback_plan: None,
            signature: "sig".to_string(),
        }
    }

    fn history(action: &str, payload: &serde_json::Value, sandboxed: bool) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        let mut prev = GENESIS_HASH.to_string();
        let mut seq = 1;

        let proposal = EventEnvelope::link(
            "inc-1".to_string(),
            seq,
            seq * 1000,
            "resolution-1".to_string(),
            EventPayload::ActionProposed(ActionProposedPayload {
                action_id: action.to_string(),
                action_payload: payload.clone(),
                payload_hash: action_payload_hash(payload),
                recommendation: resolution_rec(action),
            }),
            &prev,
        );
        prev = proposal.integrity_hash.clone();
        seq += 1;
        events.push(proposal);

        if sandboxed {
            events.push(EventEnvelope::link(
                "inc-1".to_string(),
                seq,
                seq * 1000,
                "sandbox".to_string(),
                EventPayload::SandboxTestPassed(SandboxTestPassedPayload {
                    action_id: action.to_string(),
                    report: "ok".to_string(),
                }),
                &prev,
            ));
        }
        events
    }

    #[test]
    fn valid_request_passes_all_checks() {
        let payload = serde_json::json!({"pool": "primary"});
        let events = history("restart_db_pool", &payload, true);
        gate()
            .validate(&events, "restart_db_pool", &payload, &caller(), &credentials())
            .unwrap();
    }

    #[test]
    fn unknown_action_is_rejected() {
        let payload = serde_json::json!({});
        let events = history("restart_db_pool", &payload, true);
        let err = gate()
            .validate(&events, "drop_everything", &payload, &caller(), &credentials())
            .unwrap_err();
        assert_eq!(err, SecurityError::UnknownAction("drop_everything".to_string()));
    }

    #[test]
    fn missing_permission_is_rejected() {
        let payload = serde_json::json!({"pool": "primary"});
        let events = history("restart_db_pool", &payload, true);
        let gate = SecurityGate::new(ActionWhitelist::builtin());
        let err = gate
            .validate(&events, "restart_db_pool", &payload, &caller(), &credentials())
            .unwrap_err();
        assert!(matches!(err, SecurityError::PermissionDenied { .. }));
    }

    #[test]
    fn sandbox_requirement_is_enforced() {
        let payload = serde_json::json!({"pool": "primary"});
        let events = history("restart_db_pool", &payload, false);
        let err = gate()
            .validate(&events, "restart_db_pool", &payload, &caller(), &credentials())
            .unwrap_err();
        assert_eq!(err, SecurityError::SandboxNotTested("restart_db_pool".to_string()));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let approved = serde_json::json!({"pool": "primary"});
        let events = history("restart_db_pool", &approved, true);
        let tampered = serde_json::json!({"pool": "ALL"});
        let err = gate()
            .validate(&events, "restart_db_pool", &tampered, &caller(), &credentials())
            .unwrap_err();
        assert!(matches!(err, SecurityError::PayloadHashMismatch { .. }));
    }

    #[test]
    fn non_resolution_caller_is_rejected() {
        let payload = serde_json::json!({});
        let events = history("restart_db_pool", &payload, true);
        let imposter = AgentIdentity {
            agent_id: "diagnosis-1".to_string(),
            class: AgentClass::Diagnosis,
            token: "tok".to_string(),
        };
        let err = gate()
            .validate(&events, "restart_db_pool", &payload, &imposter, &credentials())
            .unwrap_err();
        assert!(matches!(err, SecurityError::CallerNotResolution(_)));
    }

    #[test]
    fn expired_credentials_are_rejected() {
        let payload = serde_json::json!({"pool": "primary"});
        let events = history("restart_db_pool", &payload, true);
        let stale =
            CredentialHandle::new("jit-token", Utc::now() - ChronoDuration::minutes(16));
        let err = gate()
            .validate(&events, "restart_db_pool", &payload, &caller(), &stale)
            .unwrap_err();
        assert_eq!(err, SecurityError::CredentialExpired);
    }

    #[test]
    fn sandbox_free_action_skips_evidence_check() {
        let payload = serde_json::json!({"desired": 12});
        let events = history("scale_out", &payload, false);
        gate()
            .validate(&events, "scale_out", &payload, &caller(), &credentials())
            .unwrap();
    }
}
