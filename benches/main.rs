use criterion::{criterion_group, criterion_main, Criterion};
use opsentry::agents::{AgentClass, AgentRecommendation, RiskLevel};
use opsentry::config::ConsensusConfig;
use opsentry::consensus::{AllowAllVerifier, ConsensusEngine, ReputationView};
use opsentry::fabric::{BreakerConfig, CircuitBreaker};
use opsentry::incident::{
    event::chain_hash, DetectedPayload, EventKind, EventPayload, Severity, GENESIS_HASH,
};
use std::sync::Arc;
use std::time::Instant;

fn rec(agent: AgentClass, action: &str, confidence: f64) -> AgentRecommendation {
    AgentRecommendation {
        agent,
        action_id: action.to_string(),
        confidence,
        risk: RiskLevel::Low,
        reasoning: "bench".to_string(),
        evidence: vec!["metric-a".to_string(), "metric-b".to_string()],
        estimated_duration_secs: 30,
        rollback_plan: None,
        signature: "sig".to_string(),
    }
}

fn consensus_evaluate(c: &mut Criterion) {
    let engine = ConsensusEngine::new(ConsensusConfig::default(), Arc::new(AllowAllVerifier));
    let inputs = vec![
        rec(AgentClass::Detection, "restart_db_pool", 0.9),
        rec(AgentClass::Diagnosis, "restart_db_pool", 0.95),
        rec(AgentClass::Prediction, "scale_out", 0.85),
        rec(AgentClass::Resolution, "restart_db_pool", 0.8),
    ];
    let view = ReputationView::default();

    c.bench_function("consensus_evaluate_4_agents", |b| {
        b.iter(|| {
            engine
                .evaluate(Severity::Critical, &inputs, &view, Instant::now())
                .unwrap()
        })
    });
}

fn breaker_fast_path(c: &mut Criterion) {
    let closed = CircuitBreaker::new("bench-closed", BreakerConfig::default());
    c.bench_function("breaker_closed_acquire", |b| {
        b.iter(|| {
            closed.try_acquire().unwrap();
            closed.on_success();
        })
    });

    let open = CircuitBreaker::new("bench-open", BreakerConfig::default());
    for _ in 0..5 {
        open.on_failure();
    }
    c.bench_function("breaker_open_reject", |b| b.iter(|| open.try_acquire().is_err()));
}

fn event_hashing(c: &mut Criterion) {
    let payload = EventPayload::Detected(DetectedPayload {
        source_ids: vec!["cloudwatch".to_string()],
        signals: Default::default(),
        severity: Severity::Critical,
        service_tier: "tier-1".to_string(),
        affected_services: Default::default(),
        affected_users: 500,
        recommendation: None,
        idempotency_key: "bench-key".to_string(),
    });
    c.bench_function("chain_hash_detected", |b| {
        b.iter(|| chain_hash(GENESIS_HASH, 1, EventKind::Detected, &payload))
    });
}

criterion_group!(benches, consensus_evaluate, breaker_fast_path, event_hashing);
criterion_main!(benches);
