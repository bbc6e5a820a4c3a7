//! Ordered event store.
//!
//! Durable, append-only, per-incident totally ordered log. The store
//! assigns dense sequence numbers, computes the integrity chain hash at
//! admission, and persists before acknowledging. Cross-incident ordering is
//! deliberately not guaranteed; each incident serializes through its own
//! logical partition.

pub mod file;
pub mod memory;
pub mod replay;

use crate::incident::{EventEnvelope, EventPayload, ReducerError};
use std::fmt;

pub use file::FileEventLog;
pub use memory::MemoryEventLog;
pub use replay::{replay, verify_chain, ChainStatus};

/// An event proposed for append. The caller supplies the sequence number it
/// believes is next (optimistic concurrency); the store rejects anything
/// that is not exactly `tail + 1`.
#[derive(Debug, Clone)]
pub struct ProposedEvent {
    pub incident_id: String,
    pub sequence_number: u64,
    pub agent_id: String,
    pub payload: EventPayload,
}

/// Errors surfaced by event log implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Ordering conflict for incident '{incident_id}': proposed {got}, tail is {tail}")]
    OrderingConflict { incident_id: String, tail: u64, got: u64 },

    #[error("Unknown incident: {0}")]
    UnknownIncident(String),

    #[error("Chain corruption in incident '{incident_id}' at sequence {first_broken_sequence}")]
    CorruptionDetected { incident_id: String, first_broken_sequence: u64 },

    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Reducer rejected event stream: {0}")]
    Reducer(#[from] ReducerError),
}

impl StoreError {
    pub fn class(&self) -> crate::error::ErrorClass {
        use crate::error::ErrorClass;
        match self {
            StoreError::Unavailable(_) | StoreError::Io(_) => ErrorClass::TransientUpstream,
            // Conflicts resolve by retrying with the latest tail.
            StoreError::OrderingConflict { .. } => ErrorClass::TransientUpstream,
            StoreError::CorruptionDetected { .. } => ErrorClass::IntegrityViolation,
            StoreError::UnknownIncident(_)
            | StoreError::Serde(_)
            | StoreError::Reducer(_) => ErrorClass::LogicViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), crate::error::ErrorClass::TransientUpstream)
    }
}

/// Append-only, per-incident totally ordered event log.
#[async_trait::async_trait]
pub trait EventLog: Send + Sync + fmt::Debug {
    /// Admit one event at the proposed sequence, durably. Returns the
    /// stored envelope with its assigned timestamp and chain hash.
    async fn append(&self, proposed: ProposedEvent) -> Result<EventEnvelope, StoreError>;

    /// Events for one incident in ascending sequence order, starting at
    /// `from_sequence` (inclusive; 0 or 1 reads from the beginning).
    async fn read(
        &self,
        incident_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    /// Latest `(sequence, integrity_hash)` for an incident, if any events
    /// exist.
    async fn tail(&self, incident_id: &str) -> Result<Option<(u64, String)>, StoreError>;

    /// All incident ids known to the store, in unspecified order.
    async fn incident_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Append with automatic tail discovery, retrying on ordering
    /// conflicts. This is the common path for a single logical writer
    /// racing occasional duplicates.
    async fn append_next(
        &self,
        incident_id: &str,
        agent_id: &str,
        payload: EventPayload,
    ) -> Result<EventEnvelope, StoreError> {
        const MAX_CONFLICT_RETRIES: usize = 8;
        let mut attempt = 0;
        loop {
            let next = match self.tail(incident_id).await? {
                Some((seq, _)) => seq + 1,
                None => 1,
            };
            let proposed = ProposedEvent {
                incident_id: incident_id.to_string(),
                sequence_number: next,
                agent_id: agent_id.to_string(),
                payload: payload.clone(),
            };
            match self.append(proposed).await {
                Ok(envelope) => return Ok(envelope),
                Err(StoreError::OrderingConflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
