use crate::adapter::RelationshipStore;
use crate::config::OutboxConfig;
use crate::error::Result;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One tuple mutation batch: deletes are applied before writes so that a
/// moved edge never coexists with its replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TupleBatch {
    pub deletes: Vec<TupleKey>,
    pub writes: Vec<TupleWrite>,
}

impl TupleBatch {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.writes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    /// Claimed by a drain worker; blocks later entries for the same
    /// object so per-object ordering holds.
    Sending,
    Sent,
    Failed,
    /// Past the retry ceiling; waits for manual intervention.
    Dead,
}

/// Durable record of one tuple mutation batch, appended in the same
/// transaction as the triggering record mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub sequence: u64,
    pub object: ObjectRef,
    pub batch: TupleBatch,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Storage contract for the outbox. The in-memory implementation backs
/// tests; a SQL-backed one lives with the record-store collaborator.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append(&self, object: ObjectRef, batch: TupleBatch) -> Result<u64>;

    /// Claims the oldest sendable entry, transitioning it to `Sending`.
    /// Entries for an object with an earlier unsent entry are skipped so
    /// a single object's edges stay ordered; ordering across objects is
    /// not guaranteed. A `Dead` entry blocks its object too: sending a
    /// newer batch over a lost older one would reorder that object's
    /// mutations, so the object stalls until the dead entry is repaired.
    async fn claim(&self) -> Result<Option<OutboxEntry>>;

    async fn mark_sent(&self, sequence: u64) -> Result<()>;

    /// Records a failed attempt; past `retry_ceiling` the entry is
    /// parked as `Dead`.
    async fn mark_failed(&self, sequence: u64, error: &str, retry_ceiling: u32) -> Result<()>;

    async fn entries(&self) -> Result<Vec<OutboxEntry>>;
}

#[derive(Default)]
pub struct InMemoryOutbox {
    entries: Mutex<BTreeMap<u64, OutboxEntry>>,
    next_sequence: AtomicU64,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn append(&self, object: ObjectRef, batch: TupleBatch) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.lock().insert(
            sequence,
            OutboxEntry {
                sequence,
                object,
                batch,
                status: OutboxStatus::Pending,
                attempts: 0,
                last_error: None,
                created_at: Utc::now(),
            },
        );
        Ok(sequence)
    }

    async fn claim(&self) -> Result<Option<OutboxEntry>> {
        let mut entries = self.entries.lock();
        let mut blocked: HashSet<ObjectRef> = HashSet::new();
        let mut claim_sequence = None;
        for entry in entries.values() {
            match entry.status {
                OutboxStatus::Sent => continue,
                OutboxStatus::Sending | OutboxStatus::Dead => {
                    blocked.insert(entry.object.clone());
                }
                OutboxStatus::Pending | OutboxStatus::Failed => {
                    if blocked.contains(&entry.object) {
                        continue;
                    }
                    claim_sequence = Some(entry.sequence);
                    break;
                }
            }
        }
        if let Some(sequence) = claim_sequence {
            if let Some(entry) = entries.get_mut(&sequence) {
                entry.status = OutboxStatus::Sending;
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    async fn mark_sent(&self, sequence: u64) -> Result<()> {
        if let Some(entry) = self.entries.lock().get_mut(&sequence) {
            entry.status = OutboxStatus::Sent;
        }
        Ok(())
    }

    async fn mark_failed(&self, sequence: u64, error: &str, retry_ceiling: u32) -> Result<()> {
        if let Some(entry) = self.entries.lock().get_mut(&sequence) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            if entry.attempts >= retry_ceiling {
                warn!(sequence, attempts = entry.attempts, "outbox entry parked as dead");
                entry.status = OutboxStatus::Dead;
            } else {
                entry.status = OutboxStatus::Failed;
            }
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.entries.lock().values().cloned().collect())
    }
}

/// Background drain loop forwarding outbox entries to the relationship
/// store. Multiple drain workers may run concurrently; claiming prevents
/// double-send in the common case, and the store's idempotent tuple keys
/// absorb the rest.
pub struct OutboxDrain {
    outbox: Arc<dyn OutboxStore>,
    store: Arc<dyn RelationshipStore>,
    config: OutboxConfig,
}

impl OutboxDrain {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        store: Arc<dyn RelationshipStore>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            outbox,
            store,
            config,
        }
    }

    /// Sends every currently claimable entry once; returns how many were
    /// acknowledged.
    pub async fn drain_once(&self) -> Result<usize> {
        let mut sent = 0;
        while let Some(entry) = self.outbox.claim().await? {
            match self.send(&entry).await {
                Ok(()) => {
                    self.outbox.mark_sent(entry.sequence).await?;
                    sent += 1;
                }
                Err(err) => {
                    warn!(sequence = entry.sequence, error = %err, "outbox send failed");
                    self.outbox
                        .mark_failed(entry.sequence, &err.to_string(), self.config.retry_ceiling)
                        .await?;
                }
            }
        }
        if sent > 0 {
            debug!(sent, "outbox drained");
        }
        Ok(sent)
    }

    /// Polling loop; run inside a spawned task and abort on shutdown.
    pub async fn run(self) {
        loop {
            if let Err(err) = self.drain_once().await {
                warn!(error = %err, "outbox drain pass failed");
            }
            tokio::time::sleep(self.config.drain_interval).await;
        }
    }

    async fn send(&self, entry: &OutboxEntry) -> Result<()> {
        if !entry.batch.deletes.is_empty() {
            self.store.delete_tuples(&entry.batch.deletes).await?;
        }
        if !entry.batch.writes.is_empty() {
            self.store.write_tuples(&entry.batch.writes).await?;
        }
        Ok(())
    }
}
