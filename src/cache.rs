use crate::config::CacheConfig;
use crate::graph::PolicyGraph;
use crate::models::*;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    subject: String,
    object: String,
    permission: String,
    epoch: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    allowed: bool,
    inserted_at: Instant,
}

/// Process-wide decision cache shared across evaluation scopes.
///
/// Entries are keyed with the epoch current at insertion; bumping the
/// epoch invalidates everything at once without per-key deletion.
/// Entries also expire by TTL, which is the only invalidation when the
/// store offers no watch stream. Races on a key are harmless: entries
/// are derived, not authoritative, so last-writer-wins.
pub struct DecisionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    epoch: AtomicU64,
    ttl: Duration,
    capacity: usize,
}

impl DecisionCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            epoch: AtomicU64::new(0),
            ttl: config.ttl,
            capacity: config.capacity.max(1),
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Invalidates every cached decision. Returns the new epoch.
    pub fn bump_epoch(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "decision cache epoch bumped");
        epoch
    }

    pub fn get(&self, subject: &SubjectRef, permission: &str, object: &ObjectRef) -> Option<bool> {
        let key = self.key(subject, permission, object);
        let entry = self.entries.get(&key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.allowed)
    }

    pub fn insert(&self, subject: &SubjectRef, permission: &str, object: &ObjectRef, allowed: bool) {
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        let key = self.key(subject, permission, object);
        self.entries.insert(
            key,
            CacheEntry {
                allowed,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(&self, subject: &SubjectRef, permission: &str, object: &ObjectRef) -> CacheKey {
        CacheKey {
            subject: subject.to_string(),
            object: object.to_string(),
            permission: permission.to_string(),
            epoch: self.current_epoch(),
        }
    }

    /// Drops stale-epoch and expired entries first; if the map is still
    /// full, evicts oldest-inserted entries until there is room. Keeps
    /// `len()` bounded by `capacity` even under sustained fresh traffic.
    fn evict(&self) {
        let epoch = self.current_epoch();
        let ttl = self.ttl;
        self.entries
            .retain(|key, entry| key.epoch == epoch && entry.inserted_at.elapsed() < ttl);
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().inserted_at)
                .map(|entry| entry.key().clone());
            let Some(key) = oldest else {
                break;
            };
            self.entries.remove(&key);
        }
    }
}

/// Consumes the store's watch stream on its own long-lived task, bumping
/// the cache epoch for any mutation touching a registered type. Runs
/// until the stream closes.
pub fn spawn_watch_invalidator(
    cache: Arc<DecisionCache>,
    graph: Arc<PolicyGraph>,
    mut stream: broadcast::Receiver<TupleChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match stream.recv().await {
                Ok(event) => {
                    if graph.get(&event.key.object.object_type).is_some() {
                        cache.bump_epoch();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed events may have touched anything; invalidate.
                    warn!(missed, "watch stream lagged");
                    cache.bump_epoch();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
