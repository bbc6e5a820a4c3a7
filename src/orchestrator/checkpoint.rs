//! Checkpoint store and per-incident leases.
//!
//! A checkpoint is a small durable record `(phase, projection_digest,
//! last_applied_sequence, lease)` keyed by incident id. It lets a
//! replacement orchestrator resume by replaying only the tail after
//! `last_applied_sequence`, and its embedded lease enforces the
//! one-owner-task-per-incident rule.

use crate::incident::Phase;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Durable per-incident recovery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub incident_id: String,
    pub phase: Phase,
    pub projection_digest: String,
    pub last_applied_sequence: u64,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        matches!(
            (&self.lease_owner, &self.lease_expiry),
            (Some(_), Some(expiry)) if *expiry > now
        )
    }
}

/// Storage for checkpoints and leases.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), std::io::Error>;
    async fn load(&self, incident_id: &str) -> Result<Option<Checkpoint>, std::io::Error>;
    async fn list(&self) -> Result<Vec<Checkpoint>, std::io::Error>;
    async fn delete(&self, incident_id: &str) -> Result<(), std::io::Error>;

    /// Try to take (or renew) the lease. Succeeds when the lease is free,
    /// expired, or already held by `owner`.
    async fn acquire_lease(
        &self,
        incident_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, std::io::Error> {
        let now = Utc::now();
        let mut checkpoint = match self.load(incident_id).await? {
            Some(cp) => cp,
            None => Checkpoint {
                incident_id: incident_id.to_string(),
                phase: Phase::Detected,
                projection_digest: String::new(),
                last_applied_sequence: 0,
                lease_owner: None,
                lease_expiry: None,
                updated_at: now,
            },
        };

        let held_by_other = checkpoint.lease_is_live(now)
            && checkpoint.lease_owner.as_deref() != Some(owner);
        if held_by_other {
            return Ok(false);
        }

        checkpoint.lease_owner = Some(owner.to_string());
        checkpoint.lease_expiry =
            Some(now + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::seconds(600)));
        checkpoint.updated_at = now;
        self.save(&checkpoint).await?;
        Ok(true)
    }

    /// Release the lease if `owner` still holds it.
    async fn release_lease(&self, incident_id: &str, owner: &str) -> Result<(), std::io::Error> {
        if let Some(mut checkpoint) = self.load(incident_id).await? {
            if checkpoint.lease_owner.as_deref() == Some(owner) {
                checkpoint.lease_owner = None;
                checkpoint.lease_expiry = None;
                checkpoint.updated_at = Utc::now();
                self.save(&checkpoint).await?;
            }
        }
        Ok(())
    }
}

/// In-memory checkpoint store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), std::io::Error> {
        let mut records = self.records.lock().await;
        records.insert(checkpoint.incident_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, incident_id: &str) -> Result<Option<Checkpoint>, std::io::Error> {
        Ok(self.records.lock().await.get(incident_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, std::io::Error> {
        let mut all: Vec<Checkpoint> = self.records.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.incident_id.cmp(&b.incident_id));
        Ok(all)
    }

    async fn delete(&self, incident_id: &str) -> Result<(), std::io::Error> {
        self.records.lock().await.remove(incident_id);
        Ok(())
    }
}

/// File-per-incident checkpoint store.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self, std::io::Error> {
        let path = root.as_ref().to_path_buf();
        fs::create_dir_all(&path).await?;
        Ok(Self { root: path })
    }

    fn path_for(&self, incident_id: &str) -> PathBuf {
        self.root.join(format!("{incident_id}.json"))
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), std::io::Error> {
        let path = self.path_for(&checkpoint.incident_id);
        let data = serde_json::to_vec_pretty(checkpoint).expect("serialize checkpoint");
        let mut file = fs::File::create(&path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn load(&self, incident_id: &str) -> Result<Option<Checkpoint>, std::io::Error> {
        let path = self.path_for(incident_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).await?;
        let checkpoint: Checkpoint = serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(checkpoint))
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, std::io::Error> {
        let mut out = Vec::new();
        let mut rd = fs::read_dir(&self.root).await?;
        while let Some(entry) = rd.next_entry().await? {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("json") {
                if let Ok(data) = fs::read(entry.path()).await {
                    if let Ok(checkpoint) = serde_json::from_slice::<Checkpoint>(&data) {
                        out.push(checkpoint);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.incident_id.cmp(&b.incident_id));
        Ok(out)
    }

    async fn delete(&self, incident_id: &str) -> Result<(), std::io::Error> {
        let path = self.path_for(incident_id);
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}
