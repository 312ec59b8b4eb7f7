//! Read-through aggregated view cache.
//!
//! Routes reads to the backend, recomputes on miss or staleness, and commits
//! the recomputed value with the stamp observed at lookup time.

use std::sync::Arc;
use std::time::Duration;

use classmark_core::{CacheConfig, ClassmarkResult, InvalidationEvent, TenantId, ViewKey};
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::{CacheBackend, CacheLookup, CacheStats, PutOutcome, VersionStamp, ViewComputer};

/// Where a [`CacheRead`] value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Served from a fresh entry.
    Cache { version: u64 },
    /// Recomputed. `committed` is false when the check-and-set rejected the
    /// write because the subject changed during computation.
    Computed { committed: bool },
}

/// Result of a cache read, carrying provenance metadata.
#[derive(Debug, Clone)]
pub struct CacheRead {
    value: Value,
    source: ReadSource,
}

impl CacheRead {
    pub fn from_cache(value: Value, version: u64) -> Self {
        Self {
            value,
            source: ReadSource::Cache { version },
        }
    }

    pub fn computed(value: Value, committed: bool) -> Self {
        Self {
            value,
            source: ReadSource::Computed { committed },
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Cache { .. })
    }
}

/// Aggregated view cache.
///
/// # Type Parameters
///
/// - `C`: The cache backend storing computed views
pub struct AggregatedViewCache<C>
where
    C: CacheBackend,
{
    backend: Arc<C>,
    config: CacheConfig,
}

impl<C> AggregatedViewCache<C>
where
    C: CacheBackend,
{
    pub fn new(backend: Arc<C>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    /// Create a cache with default configuration.
    pub fn with_defaults(backend: Arc<C>) -> Self {
        Self::new(backend, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &C {
        &self.backend
    }

    pub async fn get(&self, key: &ViewKey) -> ClassmarkResult<CacheLookup> {
        self.backend.get(key).await
    }

    /// Check-and-set write using the view kind's TTL.
    pub async fn put(
        &self,
        key: &ViewKey,
        value: Value,
        expected: VersionStamp,
    ) -> ClassmarkResult<PutOutcome> {
        let ttl = self.ttl_for(key);
        self.backend.put(key, value, ttl, expected).await
    }

    /// Return the cached view, recomputing on miss or staleness.
    ///
    /// Compute errors are returned unchanged and nothing is cached. When the
    /// write is rejected the freshly computed value is still returned to this
    /// caller; the next reader recomputes.
    pub async fn get_or_compute<V>(&self, key: &ViewKey, computer: &V) -> ClassmarkResult<CacheRead>
    where
        V: ViewComputer + ?Sized,
    {
        let stamp = match self.backend.get(key).await? {
            CacheLookup::Hit { value, version } => {
                return Ok(CacheRead::from_cache(value, version));
            }
            CacheLookup::Stale { stamp } | CacheLookup::Miss { stamp } => stamp,
        };

        let value = computer.compute(key).await?;
        let outcome = self.put(key, value.clone(), stamp).await?;
        match outcome {
            PutOutcome::Committed { version } => {
                debug!(view = %key, version, "View recomputed and cached");
            }
            PutOutcome::Rejected => {
                debug!(view = %key, "Recomputed view discarded, subject changed during compute");
            }
        }
        Ok(CacheRead::computed(value, outcome.is_committed()))
    }

    /// Mark the views derived from the event's subjects stale.
    pub async fn invalidate(
        &self,
        tenant_id: TenantId,
        event: &InvalidationEvent,
    ) -> ClassmarkResult<u64> {
        self.backend.invalidate(tenant_id, event).await
    }

    /// Drop every view for a tenant. Administrative escape hatch.
    pub async fn admin_flush(&self, tenant_id: TenantId) -> ClassmarkResult<u64> {
        let removed = self.backend.invalidate_tenant(tenant_id).await?;
        warn!(tenant_id = %tenant_id, removed, "Administrative cache flush");
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> ClassmarkResult<u64> {
        self.backend.purge_expired().await
    }

    pub async fn stats(&self) -> ClassmarkResult<CacheStats> {
        self.backend.stats().await
    }

    fn ttl_for(&self, key: &ViewKey) -> Duration {
        self.config.ttl_for(&key.view_kind)
    }
}

impl<C> Clone for AggregatedViewCache<C>
where
    C: CacheBackend,
{
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}
