//! Invalidation gateway.
//!
//! Write paths depend only on [`InvalidationGateway`]. They never see the
//! cache itself.

use std::sync::Arc;

use async_trait::async_trait;
use classmark_core::{ClassmarkResult, InvalidateCacheRequest, InvalidationEvent, TenantId};
use tracing::debug;

use super::read_through::AggregatedViewCache;
use super::traits::CacheBackend;

/// Entry point for domain writes that should drop derived views.
#[async_trait]
pub trait InvalidationGateway: Send + Sync {
    /// Apply one event. Returns the number of entries marked stale.
    async fn invalidate(&self, tenant_id: TenantId, event: &InvalidationEvent)
        -> ClassmarkResult<u64>;

    /// Translate an HTTP invalidation body and apply the resulting events.
    async fn invalidate_request(
        &self,
        tenant_id: TenantId,
        request: &InvalidateCacheRequest,
    ) -> ClassmarkResult<u64> {
        let mut total = 0;
        for event in request.to_events() {
            total += self.invalidate(tenant_id, &event).await?;
        }
        Ok(total)
    }
}

/// Gateway backed by an [`AggregatedViewCache`].
pub struct CacheInvalidationGateway<C>
where
    C: CacheBackend,
{
    cache: AggregatedViewCache<C>,
}

impl<C> CacheInvalidationGateway<C>
where
    C: CacheBackend,
{
    pub fn new(cache: AggregatedViewCache<C>) -> Self {
        Self { cache }
    }

    pub fn into_shared(self) -> Arc<dyn InvalidationGateway>
    where
        C: 'static,
    {
        Arc::new(self)
    }
}

#[async_trait]
impl<C> InvalidationGateway for CacheInvalidationGateway<C>
where
    C: CacheBackend,
{
    async fn invalidate(
        &self,
        tenant_id: TenantId,
        event: &InvalidationEvent,
    ) -> ClassmarkResult<u64> {
        let affected = self.cache.invalidate(tenant_id, event).await?;
        debug!(
            tenant_id = %tenant_id,
            subject_kind = %event.subject_kind,
            subjects = event.subject_ids.len(),
            affected,
            "Cache invalidated"
        );
        Ok(affected)
    }
}

/// Gateway that drops every event. For deployments without a view cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidationGateway;

#[async_trait]
impl InvalidationGateway for NoopInvalidationGateway {
    async fn invalidate(
        &self,
        _tenant_id: TenantId,
        _event: &InvalidationEvent,
    ) -> ClassmarkResult<u64> {
        Ok(0)
    }
}
