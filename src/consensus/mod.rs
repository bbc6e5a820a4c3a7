//! Byzantine-tolerant consensus engine.
//!
//! Collapses the agents' recommendations for one incident into a single
//! [`ConsensusDecision`]. Agents may be slow, wrong, or adversarial, so
//! every input passes three screens (validation, behavioral, signature)
//! before the surviving trusted subset votes with renormalized weights.
//! Given identical inputs and the same reputation snapshot, the engine
//! always produces the identical decision.

pub mod reputation;

use crate::agents::{AgentClass, AgentRecommendation, RiskLevel};
use crate::config::ConsensusConfig;
use crate::incident::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub use reputation::{BehaviorStats, ReputationBook, ReputationView};

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    Weighted,
    DeadlockBestSingle,
    Escalated,
}

/// Why an agent was excluded from the trusted subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    ConfidenceOutOfRange,
    MissingActionId,
    BehavioralOutlier,
    SignatureInvalid,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::ConfidenceOutOfRange => "confidence_out_of_range",
            QuarantineReason::MissingActionId => "missing_action_id",
            QuarantineReason::BehavioralOutlier => "behavioral_outlier",
            QuarantineReason::SignatureInvalid => "signature_invalid",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub agent: AgentClass,
    pub reason: QuarantineReason,
}

/// The engine's output for one incident at one consensus round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub participating_agents: Vec<AgentClass>,
    pub inputs: Vec<AgentRecommendation>,
    pub quarantined: Vec<QuarantineRecord>,
    pub selected_action_id: Option<String>,
    pub aggregated_confidence: f64,
    pub method: ConsensusMethod,
    pub escalated_to_human: bool,
    pub degraded: bool,
    /// Recorded seed for random tie-breaking. The mandated tie-break chain
    /// is total, so this stays `None` unless a future policy needs it.
    pub tie_break_seed: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Insufficient trusted agents: {trusted} remain, {required} required")]
    InsufficientTrustedAgents { trusted: usize, required: usize },

    #[error("No recommendations to evaluate")]
    NoInputs,
}

/// Verifies an agent's cryptographic identity. The PKI itself is a
/// deployment concern; the engine only needs the boolean answer.
pub trait IdentityVerifier: Send + Sync + fmt::Debug {
    fn verify(&self, agent: AgentClass, recommendation: &AgentRecommendation) -> bool;
}

/// Verifier that compares signatures against preshared per-class tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: BTreeMap<AgentClass, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: BTreeMap<AgentClass, String>) -> Self {
        Self { tokens }
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify(&self, agent: AgentClass, recommendation: &AgentRecommendation) -> bool {
        match self.tokens.get(&agent) {
            Some(token) => recommendation.signature == *token,
            None => false,
        }
    }
}

/// Verifier that accepts everything. Used when signature checking is
/// delegated to the transport layer.
#[derive(Debug, Clone, Default)]
pub struct AllowAllVerifier;

impl IdentityVerifier for AllowAllVerifier {
    fn verify(&self, _agent: AgentClass, _recommendation: &AgentRecommendation) -> bool {
        true
    }
}

/// The consensus engine. Stateless apart from configuration; reads only
/// the reputation view passed into each round.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
    verifier: Arc<dyn IdentityVerifier>,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Evaluate one consensus round.
    ///
    /// `started` marks when this round began; once the configured budget
    /// has elapsed the engine stops converging and falls back to the
    /// single best recommendation.
    pub fn evaluate(
        &self,
        severity: Severity,
        inputs: &[AgentRecommendation],
        reputation: &ReputationView,
        started: Instant,
    ) -> Result<ConsensusDecision, ConsensusError> {
        if inputs.is_empty() {
            return Err(ConsensusError::NoInputs);
        }

        let mut quarantined: Vec<QuarantineRecord> = Vec::new();
        let mut trusted: Vec<&AgentRecommendation> = Vec::new();

        // Screen 1: structural validation.
        let mut candidates: Vec<&AgentRecommendation> = Vec::new();
        for rec in inputs {
            if !rec.confidence_in_range() {
                warn!(agent = %rec.agent, confidence = rec.confidence, "quarantining agent: confidence out of range");
                quarantined.push(QuarantineRecord {
                    agent: rec.agent,
                    reason: QuarantineReason::ConfidenceOutOfRange,
                });
            } else if rec.action_id.is_empty() {
                quarantined.push(QuarantineRecord {
                    agent: rec.agent,
                    reason: QuarantineReason::MissingActionId,
                });
            } else {
                candidates.push(rec);
            }
        }

        // Deadlock path: budget exhausted, stop trying to converge.
        if started.elapsed() >= self.config_budget() {
            return self.deadlock_best_single(inputs, &candidates, quarantined);
        }

        // Screen 2: behavioral outliers against reputation.
        let mut behaviorally_sound: Vec<&AgentRecommendation> = Vec::new();
        for &rec in &candidates {
            if self.is_behavioral_outlier(rec, &candidates, reputation) {
                warn!(agent = %rec.agent, "quarantining agent: behavioral outlier");
                quarantined.push(QuarantineRecord {
                    agent: rec.agent,
                    reason: QuarantineReason::BehavioralOutlier,
                });
            } else {
                behaviorally_sound.push(rec);
            }
        }

        // Screen 3: cryptographic identity.
        for &rec in &behaviorally_sound {
            if self.verifier.verify(rec.agent, rec) {
                trusted.push(rec);
            } else {
                warn!(agent = %rec.agent, "quarantining agent: signature rejected");
                quarantined.push(QuarantineRecord {
                    agent: rec.agent,
                    reason: QuarantineReason::SignatureInvalid,
                });
            }
        }

        if trusted.len() < self.config.min_trusted {
            return Err(ConsensusError::InsufficientTrustedAgents {
                trusted: trusted.len(),
                required: self.config.min_trusted,
            });
        }

        // Weighted aggregation over the trusted subset.
        let groups = self.group_by_action(&trusted);
        let (winner_action, winner_score) = self.pick_winner(&groups);

        debug!(
            action = %winner_action,
            score = winner_score,
            trusted = trusted.len(),
            quarantined = quarantined.len(),
            "consensus aggregation complete"
        );

        let group = &groups[&winner_action];
        let group_risk = group.iter().map(|r| r.risk).max().unwrap_or(RiskLevel::Low);

        let participating: Vec<AgentClass> = sorted_classes(&trusted);

        // Threshold gate. The tolerance keeps the boundary inclusive:
        // a unanimous 0.70 must not fall below 0.70 through float error.
        if winner_score + SCORE_TOLERANCE >= self.config.approval_threshold
            && group_risk != RiskLevel::High
        {
            Ok(ConsensusDecision {
                participating_agents: participating,
                inputs: inputs.to_vec(),
                quarantined,
                selected_action_id: Some(winner_action),
                aggregated_confidence: winner_score,
                method: ConsensusMethod::Weighted,
                escalated_to_human: false,
                degraded: false,
                tie_break_seed: None,
            })
        } else if winner_score + SCORE_TOLERANCE >= self.config.degraded_threshold
            && severity != Severity::Critical
        {
            Ok(ConsensusDecision {
                participating_agents: participating,
                inputs: inputs.to_vec(),
                quarantined,
                selected_action_id: Some(winner_action),
                aggregated_confidence: winner_score,
                method: ConsensusMethod::Weighted,
                escalated_to_human: false,
                degraded: true,
                tie_break_seed: None,
            })
        } else {
            Ok(ConsensusDecision {
                participating_agents: participating,
                inputs: inputs.to_vec(),
                quarantined,
                selected_action_id: None,
                aggregated_confidence: winner_score,
                method: ConsensusMethod::Escalated,
                escalated_to_human: true,
                degraded: false,
                tie_break_seed: None,
            })
        }
    }

    fn config_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.evaluation_budget_secs)
    }

    /// Budget exhausted: take the single highest-confidence structurally
    /// valid recommendation and hand the round to a human.
    fn deadlock_best_single(
        &self,
        inputs: &[AgentRecommendation],
        candidates: &[&AgentRecommendation],
        quarantined: Vec<QuarantineRecord>,
    ) -> Result<ConsensusDecision, ConsensusError> {
        let best = candidates
            .iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Prefer higher priority (lower rank), then smaller
                    // action id, on equal confidence.
                    .then_with(|| b.agent.priority_rank().cmp(&a.agent.priority_rank()))
                    .then_with(|| b.action_id.cmp(&a.action_id))
            })
            .ok_or(ConsensusError::NoInputs)?;

        warn!(action = %best.action_id, "consensus deadlocked, selecting best single recommendation");

        Ok(ConsensusDecision {
            participating_agents: sorted_classes(candidates),
            inputs: inputs.to_vec(),
            quarantined,
            selected_action_id: Some(best.action_id.clone()),
            aggregated_confidence: best.confidence,
            method: ConsensusMethod::DeadlockBestSingle,
            escalated_to_human: true,
            degraded: true,
            tie_break_seed: None,
        })
    }

    /// Behavioral score: the reputation z-component, discounted by how much
    /// the agent agrees with its peers on action and evidence. Only a score
    /// past the configured z-threshold marks an outlier, so disagreement
    /// alone never quarantines an agent without a confidence anomaly.
    fn is_behavioral_outlier(
        &self,
        rec: &AgentRecommendation,
        all: &[&AgentRecommendation],
        reputation: &ReputationView,
    ) -> bool {
        let z = reputation
            .stats_for(rec.agent)
            .and_then(|stats| stats.z_score(rec.confidence))
            .unwrap_or(0.0);
        if z == 0.0 {
            return false;
        }

        let others: Vec<&&AgentRecommendation> =
            all.iter().filter(|r| r.agent != rec.agent).collect();
        if others.is_empty() {
            return z > self.config.behavior_z_threshold;
        }

        let agreement = others.iter().filter(|r| r.action_id == rec.action_id).count() as f64
            / others.len() as f64;
        let overlap = others
            .iter()
            .map(|r| evidence_overlap(&rec.evidence, &r.evidence))
            .fold(0.0_f64, f64::max);

        let discounted = z * (1.0 - 0.25 * agreement - 0.25 * overlap.max(self.config.evidence_overlap_floor));
        discounted > self.config.behavior_z_threshold
    }

    /// Group trusted recommendations by action id; keys iterate in
    /// lexicographic order which anchors the final tie-break.
    fn group_by_action<'a>(
        &self,
        trusted: &[&'a AgentRecommendation],
    ) -> BTreeMap<String, Vec<&'a AgentRecommendation>> {
        let mut groups: BTreeMap<String, Vec<&AgentRecommendation>> = BTreeMap::new();
        for rec in trusted {
            groups.entry(rec.action_id.clone()).or_default().push(rec);
        }
        groups
    }

    /// Score each action group as `Σ wᵢcᵢ / Σ wᵢ` over its supporters and
    /// pick the winner. Ties break by lower aggregate risk, then supporter
    /// priority order, then lexicographic action id (the map order).
    fn pick_winner(
        &self,
        groups: &BTreeMap<String, Vec<&AgentRecommendation>>,
    ) -> (String, f64) {
        let mut best: Option<(String, f64, RiskLevel, u8)> = None;

        for (action, supporters) in groups {
            let weight_sum: f64 = supporters
                .iter()
                .map(|r| self.config.weights.weight_for(r.agent))
                .sum();
            if weight_sum <= 0.0 {
                continue;
            }
            let score: f64 = supporters
                .iter()
                .map(|r| self.config.weights.weight_for(r.agent) * r.confidence)
                .sum::<f64>()
                / weight_sum;
            let risk = supporters.iter().map(|r| r.risk).max().unwrap_or(RiskLevel::Low);
            let top_rank = supporters
                .iter()
                .map(|r| r.agent.priority_rank())
                .min()
                .unwrap_or(u8::MAX);

            let better = match &best {
                None => true,
                Some((_, best_score, best_risk, best_rank)) => {
                    score > *best_score + SCORE_TOLERANCE
                        || (close(score, *best_score)
                            && (risk < *best_risk
                                || (risk == *best_risk && top_rank < *best_rank)))
                }
            };
            if better {
                best = Some((action.clone(), score, risk, top_rank));
            }
        }

        let (action, score, _, _) = best.expect("at least one scored group");
        (action, score)
    }
}

/// Scores within this distance count as tied; weighted averages of the
/// same inputs can differ by a few ULPs depending on summation order.
const SCORE_TOLERANCE: f64 = 1e-9;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= SCORE_TOLERANCE
}

fn sorted_classes(recs: &[&AgentRecommendation]) -> Vec<AgentClass> {
    let mut classes: Vec<AgentClass> = recs.iter().map(|r| r.agent).collect();
    classes.sort();
    classes.dedup();
    classes
}

/// Jaccard overlap of two evidence sets.
fn evidence_overlap(a: &[String], b: &[String]) -> f64 {
    use std::collections::BTreeSet;
    let sa: BTreeSet<&String> = a.iter().collect();
    let sb: BTreeSet<&String> = b.iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    intersection / union
}
