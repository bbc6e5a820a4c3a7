//! Model routing.
//!
//! Critical-path reasoning goes to a high-capability model; fast
//! classification goes to a lightweight one. The choice is a pure function
//! of `(agent_class, complexity_estimate)` until failures accumulate: a
//! model that keeps failing is demoted for a cool-down window and the
//! router picks the best remaining alternate.

use crate::agents::AgentClass;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Caller's estimate of how much reasoning a call needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityEstimate {
    Fast,
    Standard,
    Deep,
}

/// Capability tier of a routed model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    HighCapability,
    Lightweight,
}

#[derive(Debug, Clone)]
struct ModelEntry {
    model_id: String,
    tier: ModelTier,
}

#[derive(Debug, Default)]
struct ModelHealth {
    consecutive_failures: u32,
    demoted_until: Option<Instant>,
}

#[derive(Debug)]
pub struct ModelRouter {
    models: Vec<ModelEntry>,
    demotion_budget: u32,
    cooldown: Duration,
    health: Mutex<HashMap<String, ModelHealth>>,
}

impl ModelRouter {
    pub fn new(demotion_budget: u32, cooldown: Duration) -> Self {
        // Preference order within each tier is the declaration order.
        let models = vec![
            ModelEntry { model_id: "reason-xl".to_string(), tier: ModelTier::HighCapability },
            ModelEntry { model_id: "reason-l".to_string(), tier: ModelTier::HighCapability },
            ModelEntry { model_id: "classify-s".to_string(), tier: ModelTier::Lightweight },
            ModelEntry { model_id: "classify-xs".to_string(), tier: ModelTier::Lightweight },
        ];
        Self { models, demotion_budget, cooldown, health: Mutex::new(HashMap::new()) }
    }

    pub fn from_config(fabric: &crate::config::FabricConfig) -> Self {
        Self::new(
            fabric.router_demotion_budget,
            Duration::from_secs(fabric.router_cooldown_secs),
        )
    }

    /// Tier wanted for a call: diagnosis/resolution reasoning and anything
    /// marked deep take the high-capability model; the rest classify fast.
    fn tier_for(class: AgentClass, complexity: ComplexityEstimate) -> ModelTier {
        match (class, complexity) {
            (_, ComplexityEstimate::Deep) => ModelTier::HighCapability,
            (AgentClass::Diagnosis | AgentClass::Resolution, ComplexityEstimate::Standard) => {
                ModelTier::HighCapability
            }
            _ => ModelTier::Lightweight,
        }
    }

    /// Pick a model for `(agent_class, complexity_estimate)`, skipping
    /// demoted models. Falls back across tiers before reusing a demoted
    /// model as a last resort.
    pub fn route(&self, class: AgentClass, complexity: ComplexityEstimate) -> String {
        let wanted = Self::tier_for(class, complexity);
        let mut health = self.health.lock().expect("router lock");
        let now = Instant::now();

        let available = |h: &mut HashMap<String, ModelHealth>, id: &str| -> bool {
            match h.get(id).and_then(|m| m.demoted_until) {
                Some(until) => now >= until,
                None => true,
            }
        };

        // Preferred tier first, then anything else that is healthy.
        for pass in 0..2 {
            for entry in &self.models {
                let tier_match = if pass == 0 { entry.tier == wanted } else { true };
                if tier_match && available(&mut health, &entry.model_id) {
                    debug!(model = %entry.model_id, agent = %class, "routed model call");
                    return entry.model_id.clone();
                }
            }
        }

        // Everything is demoted: take the one whose cooldown expires first.
        let fallback = self
            .models
            .iter()
            .min_by_key(|entry| {
                health
                    .get(&entry.model_id)
                    .and_then(|m| m.demoted_until)
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO)
            })
            .map(|entry| entry.model_id.clone())
            .unwrap_or_else(|| "reason-xl".to_string());
        warn!(model = %fallback, "all models demoted, reusing soonest-available");
        fallback
    }

    pub fn record_success(&self, model_id: &str) {
        let mut health = self.health.lock().expect("router lock");
        if let Some(entry) = health.get_mut(model_id) {
            entry.consecutive_failures = 0;
            entry.demoted_until = None;
        }
    }

    pub fn record_failure(&self, model_id: &str) {
        let mut health = self.health.lock().expect("router lock");
        let entry = health.entry(model_id.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.demotion_budget {
            warn!(model = model_id, "model demoted for cooldown");
            entry.demoted_until = Some(Instant::now() + self.cooldown);
            entry.consecutive_failures = 0;
        }
    }
}

/// Backoff for throttling errors: `min(60s, 2^retry + uniform(0, 1))`.
pub fn backoff_delay(retry: u32) -> Duration {
    let base = 2u64.saturating_pow(retry.min(6)) as f64;
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64((base + jitter).min(60.0))
}
