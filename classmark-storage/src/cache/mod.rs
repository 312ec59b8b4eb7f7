//! Aggregated view cache with check-and-set writes.
//!
//! Dashboards and report cards are expensive to compute, so the server caches
//! them per `(tenant, view kind, subject, scope, params)`. Staleness is made
//! explicit: a lookup returns a [`CacheLookup`] that either carries the value
//! or an opaque [`VersionStamp`]. A recomputed value may only be committed
//! with the stamp observed at miss time, so an invalidation that lands while
//! the recompute is in flight wins.
//!
//! # Example
//!
//! ```ignore
//! let read = cache.get_or_compute(&key, &summary_computer).await?;
//! if !read.was_cache_hit() {
//!     tracing::debug!(view = %key, "recomputed");
//! }
//!
//! // On a write to student 42:
//! gateway.invalidate(tenant, &InvalidationEvent::students(["42"])).await?;
//! ```

pub mod gateway;
pub mod memory;
pub mod read_through;
pub mod traits;

pub use gateway::{CacheInvalidationGateway, InvalidationGateway, NoopInvalidationGateway};
pub use memory::InMemoryCacheBackend;
pub use read_through::{AggregatedViewCache, CacheRead, ReadSource};
pub use traits::{CacheBackend, CacheLookup, CacheStats, PutOutcome, VersionStamp, ViewComputer};
