//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use classmark_storage::{
    AggregatedViewCache, CacheInvalidationGateway, ChangeFeed, InMemoryCacheBackend,
    InMemoryChangeFeed, InvalidationGateway, MemoryRecordRepository, RecordRepository,
    SyncService,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::error::ApiResult;
use crate::views::ViewRegistry;

/// View cache used by the API.
pub type ApiCache = AggregatedViewCache<InMemoryCacheBackend>;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
    /// Aggregated views, read through on `/views`.
    pub cache: ApiCache,
    /// Invalidation entry point shared with the sync service.
    pub gateway: Arc<dyn InvalidationGateway>,
    pub views: Arc<ViewRegistry>,
    pub max_push_items: usize,
    pub start_time: Instant,
}

impl AppState {
    /// Wire the in-memory repository, change feed and view cache together.
    ///
    /// Pushed writes invalidate the cache through the same gateway the
    /// `/cache/invalidate` endpoint uses.
    pub fn in_memory(config: &ApiConfig) -> ApiResult<Self> {
        config.validate()?;

        let repository: Arc<dyn RecordRepository> = Arc::new(MemoryRecordRepository::new());
        let feed: Arc<dyn ChangeFeed> = Arc::new(InMemoryChangeFeed::new());
        let cache = AggregatedViewCache::new(
            Arc::new(InMemoryCacheBackend::new()),
            config.cache_config(),
        );
        let gateway = CacheInvalidationGateway::new(cache.clone()).into_shared();

        let sync = SyncService::new(Arc::clone(&repository), feed, Arc::clone(&gateway))
            .with_pull_page_size(config.pull_page_size);
        let views = ViewRegistry::school_defaults(repository);

        Ok(Self::from_parts(
            Arc::new(sync),
            cache,
            gateway,
            views,
            config.max_push_items,
        ))
    }

    pub fn from_parts(
        sync: Arc<SyncService>,
        cache: ApiCache,
        gateway: Arc<dyn InvalidationGateway>,
        views: ViewRegistry,
        max_push_items: usize,
    ) -> Self {
        Self {
            sync,
            cache,
            gateway,
            views: Arc::new(views),
            max_push_items,
            start_time: Instant::now(),
        }
    }

    /// One housekeeping pass: purge expired views, compact the change feed
    /// and prune old push outcomes.
    pub async fn housekeeping(&self, ledger_retention: Duration) {
        match self.cache.purge_expired().await {
            Ok(purged) if purged > 0 => debug!(purged, "Purged expired views"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "View purge failed"),
        }

        if let Err(e) = self.sync.compact_feed().await {
            warn!(error = %e, "Change feed compaction failed");
        }

        let retention = chrono::Duration::from_std(ledger_retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let pruned = self.sync.ledger().prune(Utc::now() - retention).await;
        if pruned > 0 {
            debug!(pruned, "Pruned idempotency ledger");
        }
    }

    /// Run [`AppState::housekeeping`] every `interval` until `shutdown`
    /// flips to true.
    pub fn spawn_housekeeping(
        &self,
        interval: Duration,
        ledger_retention: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => state.housekeeping(ledger_retention).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Housekeeping stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classmark_core::{CacheConfig, Payload, TenantId};
    use classmark_storage::NoopInvalidationGateway;
    use serde_json::json;

    fn record(id: &str, version: i64) -> Payload {
        let mut record = Payload::new();
        record.insert("id".into(), json!(id));
        record.insert("value".into(), json!(version));
        record
    }

    #[tokio::test]
    async fn test_housekeeping_compacts_change_feed() {
        let repository: Arc<dyn RecordRepository> = Arc::new(MemoryRecordRepository::new());
        let feed = Arc::new(InMemoryChangeFeed::new());
        let gateway: Arc<dyn InvalidationGateway> = Arc::new(NoopInvalidationGateway);
        let sync = SyncService::new(
            Arc::clone(&repository),
            Arc::clone(&feed) as Arc<dyn ChangeFeed>,
            Arc::clone(&gateway),
        );
        let state = AppState::from_parts(
            Arc::new(sync),
            AggregatedViewCache::new(Arc::new(InMemoryCacheBackend::new()), CacheConfig::default()),
            gateway,
            ViewRegistry::school_defaults(repository),
            100,
        );

        let tenant = TenantId::now_v7();
        for version in 1..=3 {
            feed.record_change(tenant, "student", record("s1", version))
                .await
                .unwrap();
        }

        state.housekeeping(Duration::from_secs(3600)).await;
        assert_eq!(feed.compact().await.unwrap(), 0);
        let batch = feed.changes_since(tenant, None, 100).await.unwrap();
        assert_eq!(batch.updates["student"].len(), 1);
    }
}
