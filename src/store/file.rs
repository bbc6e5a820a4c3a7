//! File-backed event log.
//!
//! One JSON-lines file per incident, placed in a partition directory chosen
//! by `sha256(incident_id) mod K` so hot keys spread across directories.
//! Appends go through a single critical section holding the tail cache and
//! are fsynced before the call returns. A `cold/` sibling tier receives
//! whole incident files during archival, unchanged: sequence numbers and
//! hashes move as-is.

use crate::incident::{EventEnvelope, GENESIS_HASH};
use crate::store::{EventLog, ProposedEvent, StoreError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Tail {
    sequence: u64,
    hash: String,
    timestamp_ns: u64,
}

#[derive(Debug)]
pub struct FileEventLog {
    root: PathBuf,
    partitions: u32,
    /// Tail cache and append critical section in one lock.
    tails: Mutex<HashMap<String, Tail>>,
}

impl FileEventLog {
    pub async fn new<P: AsRef<Path>>(root: P, partitions: u32) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let partitions = partitions.max(1);
        for tier in ["hot", "cold"] {
            for p in 0..partitions {
                fs::create_dir_all(root.join(tier).join(format!("p{p:02}"))).await?;
            }
        }
        Ok(Self { root, partitions, tails: Mutex::new(HashMap::new()) })
    }

    fn partition_of(&self, incident_id: &str) -> u32 {
        let digest = Sha256::digest(incident_id.as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head % self.partitions
    }

    fn path_in(&self, tier: &str, incident_id: &str) -> PathBuf {
        self.root
            .join(tier)
            .join(format!("p{:02}", self.partition_of(incident_id)))
            .join(format!("{incident_id}.jsonl"))
    }

    /// Find an incident's file, preferring the hot tier.
    async fn locate(&self, incident_id: &str) -> Option<PathBuf> {
        let hot = self.path_in("hot", incident_id);
        if fs::try_exists(&hot).await.unwrap_or(false) {
            return Some(hot);
        }
        let cold = self.path_in("cold", incident_id);
        if fs::try_exists(&cold).await.unwrap_or(false) {
            return Some(cold);
        }
        None
    }

    async fn load_events(&self, incident_id: &str) -> Result<Vec<EventEnvelope>, StoreError> {
        let path = self
            .locate(incident_id)
            .await
            .ok_or_else(|| StoreError::UnknownIncident(incident_id.to_string()))?;
        let data = fs::read_to_string(&path).await?;
        let mut events = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            events.push(serde_json::from_str::<EventEnvelope>(line)?);
        }
        // Physical partitions preserve order, but reads re-sort regardless.
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    /// Move incidents whose last event predates `cutoff_ns` to the cold
    /// tier. Files move unmodified; sequence numbers and hashes survive.
    pub async fn archive_older_than(&self, cutoff_ns: u64) -> Result<Vec<String>, StoreError> {
        let mut archived = Vec::new();
        for incident_id in self.scan_tier("hot").await? {
            let events = self.load_events(&incident_id).await?;
            let last_ns = events.last().map(|e| e.timestamp_ns).unwrap_or(0);
            if last_ns < cutoff_ns {
                let from = self.path_in("hot", &incident_id);
                let to = self.path_in("cold", &incident_id);
                fs::rename(&from, &to).await?;
                info!(incident_id, "archived incident to cold tier");
                archived.push(incident_id);
            }
        }
        Ok(archived)
    }

    async fn scan_tier(&self, tier: &str) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for p in 0..self.partitions {
            let dir = self.root.join(tier).join(format!("p{p:02}"));
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) == Some("jsonl") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl EventLog for FileEventLog {
    async fn append(&self, proposed: ProposedEvent) -> Result<EventEnvelope, StoreError> {
        let mut tails = self.tails.lock().await;

        let tail = match tails.get(&proposed.incident_id) {
            Some(tail) => Some(tail.clone()),
            None => match self.locate(&proposed.incident_id).await {
                Some(_) => {
                    let events = self.load_events(&proposed.incident_id).await?;
                    events.last().map(|e| Tail {
                        sequence: e.sequence_number,
                        hash: e.integrity_hash.clone(),
                        timestamp_ns: e.timestamp_ns,
                    })
                }
                None => None,
            },
        };

        let (tail_seq, prev_hash, prev_ts) = match &tail {
            Some(t) => (t.sequence, t.hash.clone(), t.timestamp_ns),
            None => (0, GENESIS_HASH.to_string(), 0),
        };
        if proposed.sequence_number != tail_seq + 1 {
            return Err(StoreError::OrderingConflict {
                incident_id: proposed.incident_id,
                tail: tail_seq,
                got: proposed.sequence_number,
            });
        }

        let timestamp_ns = crate::store::memory::current_time_ns().max(prev_ts + 1);
        let envelope = EventEnvelope::link(
            proposed.incident_id.clone(),
            proposed.sequence_number,
            timestamp_ns,
            proposed.agent_id,
            proposed.payload,
            &prev_hash,
        );

        let path = self.path_in("hot", &proposed.incident_id);
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(&line).await?;
        // Durable before acknowledging.
        file.sync_all().await?;

        tails.insert(
            proposed.incident_id.clone(),
            Tail {
                sequence: envelope.sequence_number,
                hash: envelope.integrity_hash.clone(),
                timestamp_ns: envelope.timestamp_ns,
            },
        );
        debug!(
            incident_id = %envelope.incident_id,
            sequence = envelope.sequence_number,
            kind = %envelope.kind,
            "appended event"
        );
        Ok(envelope)
    }

    async fn read(
        &self,
        incident_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let events = self.load_events(incident_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.sequence_number >= from_sequence.max(1))
            .collect())
    }

    async fn tail(&self, incident_id: &str) -> Result<Option<(u64, String)>, StoreError> {
        {
            let tails = self.tails.lock().await;
            if let Some(tail) = tails.get(incident_id) {
                return Ok(Some((tail.sequence, tail.hash.clone())));
            }
        }
        match self.locate(incident_id).await {
            None => Ok(None),
            Some(_) => {
                let events = self.load_events(incident_id).await?;
                Ok(events.last().map(|e| (e.sequence_number, e.integrity_hash.clone())))
            }
        }
    }

    async fn incident_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = self.scan_tier("hot").await?;
        ids.extend(self.scan_tier("cold").await?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
