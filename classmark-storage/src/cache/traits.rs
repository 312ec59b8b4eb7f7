//! Cache backend and view computer traits.

use std::time::Duration;

use async_trait::async_trait;
use classmark_core::{CacheStatsResponse, ClassmarkResult, InvalidationEvent, TenantId, ViewKey};
use serde_json::Value;

/// Opaque token captured at miss time and presented on `put`.
///
/// Holds the version of the entry that was seen (if any) plus the tenant and
/// subject generations at lookup time. Any invalidation of the subject, flush
/// of the tenant, or competing commit changes at least one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
    pub prior_version: Option<u64>,
    pub tenant_generation: u64,
    pub subject_generation: u64,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Fresh entry.
    Hit { value: Value, version: u64 },
    /// Entry exists but was invalidated or has expired.
    Stale { stamp: VersionStamp },
    /// No entry.
    Miss { stamp: VersionStamp },
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    /// Stamp to present when writing a recomputed value.
    pub fn stamp(&self) -> Option<VersionStamp> {
        match self {
            CacheLookup::Hit { .. } => None,
            CacheLookup::Stale { stamp } | CacheLookup::Miss { stamp } => Some(*stamp),
        }
    }
}

/// Outcome of a check-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Committed { version: u64 },
    /// The stamp no longer matched. The value was discarded.
    Rejected,
}

impl PutOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, PutOutcome::Committed { .. })
    }
}

/// Cache backend trait for pluggable view stores.
///
/// Implementations must be safe under concurrent readers and writers. The
/// check-and-set in [`CacheBackend::put`] is the only coordination between
/// recomputation and invalidation.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Look up an entry.
    async fn get(&self, key: &ViewKey) -> ClassmarkResult<CacheLookup>;

    /// Commit a value if `expected` still describes the entry.
    async fn put(
        &self,
        key: &ViewKey,
        value: Value,
        ttl: Duration,
        expected: VersionStamp,
    ) -> ClassmarkResult<PutOutcome>;

    /// Mark every entry derived from the event's subjects stale.
    ///
    /// Returns the number of entries affected.
    async fn invalidate(&self, tenant_id: TenantId, event: &InvalidationEvent)
        -> ClassmarkResult<u64>;

    /// Drop every entry for a tenant. Administrative only.
    async fn invalidate_tenant(&self, tenant_id: TenantId) -> ClassmarkResult<u64>;

    /// Physically remove expired and stale entries.
    async fn purge_expired(&self) -> ClassmarkResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> ClassmarkResult<CacheStats>;
}

/// Computes an aggregated view from the source of truth.
#[async_trait]
pub trait ViewComputer: Send + Sync {
    async fn compute(&self, key: &ViewKey) -> ClassmarkResult<Value>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found an invalidated or expired entry.
    pub stale_reads: u64,
    pub invalidated_entries: u64,
    /// Recomputed values discarded by the check-and-set guard.
    pub rejected_puts: u64,
    pub entry_count: usize,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.stale_reads;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl From<CacheStats> for CacheStatsResponse {
    fn from(stats: CacheStats) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            stale_reads: stats.stale_reads,
            invalidated_entries: stats.invalidated_entries,
            rejected_puts: stats.rejected_puts,
            entry_count: stats.entry_count,
        }
    }
}
