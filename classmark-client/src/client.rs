//! Sync client facade.
//!
//! Wires the outbox, both engines and the connectivity monitor together and
//! runs them on reconnection and on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use classmark_core::{ClassmarkResult, MutationAction, Payload, StreamKey, SyncConfig, TempId};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::ClientConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::http::RestTransport;
use crate::local_state::LocalRecordStore;
use crate::outbox::{CursorStore, LmdbOutboxStore, Outbox, OutboxStore};
use crate::pull::{PullEngine, PullReport};
use crate::push::{PushEngine, PushReport};
use crate::transport::SyncTransport;

/// Outcome of one push-then-pull round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub push: PushReport,
    pub pull: PullReport,
}

/// Entry point for application code.
pub struct SyncClient {
    outbox: Arc<Outbox>,
    push: PushEngine,
    pull: PullEngine,
    connectivity: ConnectivityMonitor,
}

impl SyncClient {
    pub fn new(
        outbox: Arc<Outbox>,
        transport: Arc<dyn SyncTransport>,
        cursor_store: Arc<dyn CursorStore>,
        local: Arc<dyn LocalRecordStore>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        let push = PushEngine::new(
            Arc::clone(&outbox),
            Arc::clone(&transport),
            connectivity.clone(),
            config.clone(),
        );
        let pull = PullEngine::new(
            Arc::clone(&outbox),
            transport,
            cursor_store,
            local,
            connectivity.clone(),
            config,
        );
        Self {
            outbox,
            push,
            pull,
            connectivity,
        }
    }

    /// Build a client from file configuration: LMDB outbox under
    /// `data_dir` and the REST transport.
    pub async fn from_config(
        config: &ClientConfig,
        local: Arc<dyn LocalRecordStore>,
        connectivity: ConnectivityMonitor,
    ) -> ClassmarkResult<Self> {
        config.validate()?;
        let sync_config = config.sync_config();
        sync_config.validate()?;

        let store = Arc::new(LmdbOutboxStore::open(
            config.outbox_path(),
            config.outbox_max_size_mb,
        )?);
        let outbox_store: Arc<dyn OutboxStore> = store.clone();
        let outbox = Arc::new(Outbox::open(outbox_store, sync_config.backoff.clone()).await?);
        let transport = Arc::new(RestTransport::new(config)?);

        Ok(Self::new(
            outbox,
            transport,
            store,
            local,
            connectivity,
            sync_config,
        ))
    }

    /// Ask for at most `limit` records per pull page.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.pull = self.pull.with_page_limit(limit);
        self
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn push_engine(&self) -> &PushEngine {
        &self.push
    }

    pub fn pull_engine(&self) -> &PullEngine {
        &self.pull
    }

    /// Record a write locally. Returns as soon as it is durable.
    pub async fn enqueue(
        &self,
        entity_type: impl Into<String>,
        action: MutationAction,
        payload: Payload,
        stream_key: StreamKey,
    ) -> ClassmarkResult<TempId> {
        self.outbox
            .enqueue(entity_type, action, payload, stream_key)
            .await
    }

    /// Push pending writes, then pull server changes.
    pub async fn sync_now(&self, cancel: &CancelToken) -> ClassmarkResult<SyncReport> {
        let push = self.push.run_push_cycle(cancel).await?;
        let pull = self.pull.run_pull_cycle(cancel).await?;
        Ok(SyncReport { push, pull })
    }

    /// Run sync rounds whenever connectivity returns and every `interval`
    /// while online, until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut online = self.connectivity.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Sync loop stopped");
                        break;
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = *online.borrow_and_update();
                        if connected {
                            self.run_round(&shutdown).await;
                        }
                    }
                    _ = ticker.tick() => {
                        if self.connectivity.is_connected() {
                            self.run_round(&shutdown).await;
                        }
                    }
                }
            }
        })
    }

    async fn run_round(&self, cancel: &CancelToken) {
        if let Err(err) = self.sync_now(cancel).await {
            warn!(error = %err, "Sync round failed");
        }
    }
}
