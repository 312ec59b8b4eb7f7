//! In-memory cache backend with a subject index.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use classmark_core::{
    Clock, ClassmarkResult, InvalidationEvent, SubjectKind, SystemClock, TenantId, Timestamp,
    ViewKey,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::{CacheBackend, CacheLookup, CacheStats, PutOutcome, VersionStamp};

type SubjectIndexKey = (TenantId, SubjectKind, String);

#[derive(Debug, Clone)]
struct CachedView {
    value: Value,
    version: u64,
    expires_at: Timestamp,
    stale: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<ViewKey, CachedView>,
    /// Entries grouped by the subject they were computed for.
    subject_index: HashMap<SubjectIndexKey, HashSet<ViewKey>>,
    /// Generation of every subject invalidated while it still has entries
    /// or has not been purged yet. Values come from `last_generation`.
    subject_generations: HashMap<SubjectIndexKey, u64>,
    /// Highest subject generation dropped per tenant. Subjects without an
    /// entry report it, so a stamp taken before a dropped bump still fails.
    generation_floors: HashMap<TenantId, u64>,
    tenant_generations: HashMap<TenantId, u64>,
    last_generation: u64,
    next_version: u64,
}

impl CacheState {
    fn stamp_for(&self, key: &ViewKey, prior_version: Option<u64>) -> VersionStamp {
        VersionStamp {
            prior_version,
            tenant_generation: self.tenant_generation(key.tenant_id),
            subject_generation: self.subject_generation(&subject_index_key(key)),
        }
    }

    fn tenant_generation(&self, tenant_id: TenantId) -> u64 {
        self.tenant_generations.get(&tenant_id).copied().unwrap_or(0)
    }

    fn subject_generation(&self, subject: &SubjectIndexKey) -> u64 {
        match self.subject_generations.get(subject) {
            Some(generation) => *generation,
            None => self.generation_floors.get(&subject.0).copied().unwrap_or(0),
        }
    }

    fn bump_subject(&mut self, subject: SubjectIndexKey) {
        self.last_generation += 1;
        self.subject_generations.insert(subject, self.last_generation);
    }

    /// Drop generations of subjects with no cached entry left.
    fn prune_generations(&mut self) -> usize {
        let idle: Vec<SubjectIndexKey> = self
            .subject_generations
            .keys()
            .filter(|subject| !self.subject_index.contains_key(*subject))
            .cloned()
            .collect();
        for subject in &idle {
            if let Some(generation) = self.subject_generations.remove(subject) {
                let floor = self.generation_floors.entry(subject.0).or_insert(0);
                *floor = (*floor).max(generation);
            }
        }
        idle.len()
    }

    fn remove_entry(&mut self, key: &ViewKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        let subject = subject_index_key(key);
        if let Some(keys) = self.subject_index.get_mut(&subject) {
            keys.remove(key);
            if keys.is_empty() {
                self.subject_index.remove(&subject);
            }
        }
        removed
    }
}

fn subject_index_key(key: &ViewKey) -> SubjectIndexKey {
    (key.tenant_id, key.subject.kind.clone(), key.subject.id.clone())
}

/// In-memory [`CacheBackend`].
///
/// Entries are found for invalidation through a subject index, never by
/// scanning. Generation counters per subject and per tenant make the
/// check-and-set in `put` reject values computed before an invalidation.
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    state: RwLock<CacheState>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_reads: AtomicU64,
    invalidated: AtomicU64,
    rejected: AtomicU64,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_reads: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &ViewKey) -> ClassmarkResult<CacheLookup> {
        let now = self.clock.now();
        let state = self.state.read().await;

        match state.entries.get(key) {
            Some(entry) if !entry.stale && entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(CacheLookup::Hit {
                    value: entry.value.clone(),
                    version: entry.version,
                })
            }
            Some(entry) => {
                self.stale_reads.fetch_add(1, Ordering::Relaxed);
                Ok(CacheLookup::Stale {
                    stamp: state.stamp_for(key, Some(entry.version)),
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(CacheLookup::Miss {
                    stamp: state.stamp_for(key, None),
                })
            }
        }
    }

    async fn put(
        &self,
        key: &ViewKey,
        value: Value,
        ttl: Duration,
        expected: VersionStamp,
    ) -> ClassmarkResult<PutOutcome> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let current_version = state.entries.get(key).map(|e| e.version);
        if state.stamp_for(key, current_version) != expected {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(PutOutcome::Rejected);
        }

        state.next_version += 1;
        let version = state.next_version;
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        state.entries.insert(
            key.clone(),
            CachedView {
                value,
                version,
                expires_at: now + ttl,
                stale: false,
            },
        );
        state
            .subject_index
            .entry(subject_index_key(key))
            .or_default()
            .insert(key.clone());

        Ok(PutOutcome::Committed { version })
    }

    async fn invalidate(
        &self,
        tenant_id: TenantId,
        event: &InvalidationEvent,
    ) -> ClassmarkResult<u64> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let mut affected = 0u64;

        for subject_id in &event.subject_ids {
            let subject = (tenant_id, event.subject_kind.clone(), subject_id.clone());
            // Bumped even when nothing is cached so in-flight recomputes lose.
            state.bump_subject(subject.clone());

            let keys: Vec<ViewKey> = match state.subject_index.get(&subject) {
                Some(keys) => keys.iter().filter(|k| event.matches(k)).cloned().collect(),
                None => continue,
            };
            for key in keys {
                if let Some(entry) = state.entries.get_mut(&key) {
                    if !entry.stale {
                        entry.stale = true;
                        entry.expires_at = now;
                        affected += 1;
                    }
                }
            }
        }

        self.invalidated.fetch_add(affected, Ordering::Relaxed);
        Ok(affected)
    }

    async fn invalidate_tenant(&self, tenant_id: TenantId) -> ClassmarkResult<u64> {
        let mut state = self.state.write().await;
        *state.tenant_generations.entry(tenant_id).or_insert(0) += 1;
        // The tenant bump already fails every stamp taken before it.
        state
            .subject_generations
            .retain(|(tenant, _, _), _| *tenant != tenant_id);

        let keys: Vec<ViewKey> = state
            .entries
            .keys()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect();
        let mut removed = 0u64;
        for key in keys {
            if state.remove_entry(&key) {
                removed += 1;
            }
        }

        self.invalidated.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    async fn purge_expired(&self) -> ClassmarkResult<u64> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let expired: Vec<ViewKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.stale || e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = 0u64;
        for key in expired {
            if state.remove_entry(&key) {
                removed += 1;
            }
        }
        let pruned = state.prune_generations();
        if removed > 0 || pruned > 0 {
            debug!(removed, pruned_generations = pruned, "Purged view cache");
        }
        Ok(removed)
    }

    async fn stats(&self) -> ClassmarkResult<CacheStats> {
        let state = self.state.read().await;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            invalidated_entries: self.invalidated.load(Ordering::Relaxed),
            rejected_puts: self.rejected.load(Ordering::Relaxed),
            entry_count: state.entries.len(),
        })
    }
}
