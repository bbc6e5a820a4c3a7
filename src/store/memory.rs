//! In-memory event log.
//!
//! Reference implementation used by tests and single-process deployments.
//! Appends serialize through one lock, which trivially provides the
//! per-incident total order; the chain hash is computed at admission
//! exactly as the file-backed store does.

use crate::incident::{EventEnvelope, GENESIS_HASH};
use crate::store::{EventLog, ProposedEvent, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, Vec<EventEnvelope>>>,
    /// Chaos toggle: while set, every append fails as unavailable. Used by
    /// outage drills and the store-outage tests.
    offline: AtomicBool,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage. Reads keep working; appends fail.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Overwrite a stored event in place, bypassing every integrity check.
    /// Exists so corruption-detection tests can tamper with history.
    pub async fn tamper(&self, incident_id: &str, sequence: u64, mutate: impl FnOnce(&mut EventEnvelope)) {
        let mut streams = self.streams.lock().await;
        if let Some(events) = streams.get_mut(incident_id) {
            if let Some(event) = events.get_mut((sequence - 1) as usize) {
                mutate(event);
            }
        }
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, proposed: ProposedEvent) -> Result<EventEnvelope, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }

        let mut streams = self.streams.lock().await;
        let events = streams.entry(proposed.incident_id.clone()).or_default();

        let (tail_seq, prev_hash) = match events.last() {
            Some(last) => (last.sequence_number, last.integrity_hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        if proposed.sequence_number != tail_seq + 1 {
            return Err(StoreError::OrderingConflict {
                incident_id: proposed.incident_id,
                tail: tail_seq,
                got: proposed.sequence_number,
            });
        }

        let now_ns = current_time_ns();
        let timestamp_ns = match events.last() {
            Some(last) => now_ns.max(last.timestamp_ns + 1),
            None => now_ns,
        };

        let envelope = EventEnvelope::link(
            proposed.incident_id,
            proposed.sequence_number,
            timestamp_ns,
            proposed.agent_id,
            proposed.payload,
            &prev_hash,
        );
        events.push(envelope.clone());
        Ok(envelope)
    }

    async fn read(
        &self,
        incident_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let streams = self.streams.lock().await;
        let events = streams
            .get(incident_id)
            .ok_or_else(|| StoreError::UnknownIncident(incident_id.to_string()))?;
        Ok(events
            .iter()
            .filter(|e| e.sequence_number >= from_sequence.max(1))
            .cloned()
            .collect())
    }

    async fn tail(&self, incident_id: &str) -> Result<Option<(u64, String)>, StoreError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(incident_id)
            .and_then(|events| events.last())
            .map(|e| (e.sequence_number, e.integrity_hash.clone())))
    }

    async fn incident_ids(&self) -> Result<Vec<String>, StoreError> {
        let streams = self.streams.lock().await;
        Ok(streams.keys().cloned().collect())
    }
}

/// Nanoseconds since the epoch.
pub(crate) fn current_time_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
