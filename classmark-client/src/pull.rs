//! Pull Engine
//!
//! Fetches server changes since the stored cursor and merges them into the
//! local record store. The cursor is saved only after a page has been fully
//! merged, so an interrupted pull resumes from the last complete page.
//!
//! Records targeted by a pending outbox mutation are held back instead of
//! applied, so that server state never overwrites a local write the server
//! has not seen yet. Held records are written to the [`CursorStore`] in the
//! same step as the cursor that moves past them, and are released by
//! [`PullEngine::reconcile_held`] once their mutations settle.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use classmark_core::{
    ClassmarkResult, PullQuery, PullResponse, SyncConfig, SyncCursor, TransportError,
    RECORD_ID_FIELD,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::connectivity::ConnectivityMonitor;
use crate::flight::FlightGuard;
use crate::local_state::{record_version, LocalRecordStore};
use crate::outbox::{CursorStore, HeldRecord, Outbox, RecordRef};
use crate::transport::SyncTransport;

/// Outcome of one pull cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    /// Records written to the local store.
    pub applied: usize,
    /// Records already present at the same or a newer version.
    pub unchanged: usize,
    /// Records held back because a local write to them is pending.
    pub held: usize,
    /// Previously held records applied during this cycle.
    pub released: usize,
    /// Records without an object body or an id.
    pub malformed: usize,
    /// Cursor saved at the end of the last merged page.
    pub new_cursor: Option<SyncCursor>,
    pub aborted: bool,
    pub skipped: bool,
}

impl PullReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Merges server changes into local state.
pub struct PullEngine {
    outbox: Arc<Outbox>,
    transport: Arc<dyn SyncTransport>,
    cursor_store: Arc<dyn CursorStore>,
    local: Arc<dyn LocalRecordStore>,
    connectivity: ConnectivityMonitor,
    config: SyncConfig,
    page_limit: Option<usize>,
    in_flight: AtomicBool,
}

impl PullEngine {
    pub fn new(
        outbox: Arc<Outbox>,
        transport: Arc<dyn SyncTransport>,
        cursor_store: Arc<dyn CursorStore>,
        local: Arc<dyn LocalRecordStore>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        Self {
            outbox,
            transport,
            cursor_store,
            local,
            connectivity,
            config,
            page_limit: None,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Ask the server for at most `limit` records per page.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = Some(limit);
        self
    }

    /// Number of records currently held back.
    pub async fn held_count(&self) -> ClassmarkResult<usize> {
        Ok(self.cursor_store.load_held().await?.len())
    }

    /// Pull pages until the server reports no more changes.
    ///
    /// A failed request or merge leaves the cursor at the last fully merged
    /// page and returns the error.
    pub async fn run_pull_cycle(&self, cancel: &CancelToken) -> ClassmarkResult<PullReport> {
        let Some(_guard) = FlightGuard::try_acquire(&self.in_flight) else {
            debug!("Pull cycle already running");
            return Ok(PullReport::skipped());
        };
        if !self.connectivity.is_connected() {
            return Ok(PullReport::skipped());
        }

        let mut report = PullReport {
            released: self.reconcile_held().await?,
            ..PullReport::default()
        };
        let mut cursor = self.cursor_store.load_cursor().await?;
        let mut held: HashMap<RecordRef, HeldRecord> = self
            .cursor_store
            .load_held()
            .await?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();

        loop {
            if cancel.is_cancelled() || !self.connectivity.is_connected() {
                report.aborted = true;
                break;
            }

            let query = PullQuery {
                last_synced_at: cursor.clone(),
                limit: self.page_limit,
            };
            let response = self.fetch(&query).await?;
            let has_more = response.has_more;
            let token = response.new_sync_token.clone();
            report.pages += 1;

            let page_held = self.merge(response, &held, &mut report).await?;
            self.cursor_store.commit_page(&token, &page_held).await?;
            for record in page_held {
                held.insert(record.key(), record);
            }
            debug!(cursor = %token, has_more, "Pull page merged");
            cursor = Some(token);
            report.new_cursor = cursor.clone();

            if !has_more {
                break;
            }
        }

        info!(
            pages = report.pages,
            applied = report.applied,
            held = report.held,
            released = report.released,
            aborted = report.aborted,
            "Pull cycle finished"
        );
        Ok(report)
    }

    async fn fetch(&self, query: &PullQuery) -> ClassmarkResult<PullResponse> {
        match tokio::time::timeout(self.config.request_timeout, self.transport.pull(query)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                warn!(error = %err, "Pull call failed");
                Err(err.into())
            }
            Err(_) => {
                warn!(timeout = ?self.config.request_timeout, "Pull call timed out");
                Err(TransportError::Timeout(self.config.request_timeout).into())
            }
        }
    }

    /// Apply a page and return the records it holds back.
    ///
    /// A held record only replaces one held earlier if its version is newer.
    async fn merge(
        &self,
        response: PullResponse,
        held: &HashMap<RecordRef, HeldRecord>,
        report: &mut PullReport,
    ) -> ClassmarkResult<Vec<HeldRecord>> {
        let pending = self.outbox.pending_targets().await;
        let mut page_held: HashMap<RecordRef, HeldRecord> = HashMap::new();

        for (entity_type, records) in response.updates {
            for value in records {
                let Value::Object(record) = value else {
                    warn!(entity_type = %entity_type, "Skipping non-object record");
                    report.malformed += 1;
                    continue;
                };
                let Some(record_id) = record.get(RECORD_ID_FIELD).and_then(Value::as_str) else {
                    warn!(entity_type = %entity_type, "Skipping record without id");
                    report.malformed += 1;
                    continue;
                };

                let key = RecordRef::new(entity_type.clone(), record_id);
                if pending.contains(&key) {
                    debug!(entity_type = %entity_type, record_id = %key.record_id, "Holding record with pending local write");
                    let newer = page_held
                        .get(&key)
                        .or_else(|| held.get(&key))
                        .map_or(true, |h| record_version(&record) > record_version(&h.record));
                    if newer {
                        page_held.insert(
                            key.clone(),
                            HeldRecord {
                                entity_type: key.entity_type,
                                record_id: key.record_id,
                                record,
                            },
                        );
                    }
                    report.held += 1;
                    continue;
                }

                if self.local.upsert(&entity_type, record).await? {
                    report.applied += 1;
                } else {
                    report.unchanged += 1;
                }
            }
        }
        Ok(page_held.into_values().collect())
    }

    /// Apply held records whose local writes are no longer pending.
    ///
    /// Returns the number of records released.
    pub async fn reconcile_held(&self) -> ClassmarkResult<usize> {
        let pending = self.outbox.pending_targets().await;
        let mut released = 0;
        for held in self.cursor_store.load_held().await? {
            let key = held.key();
            if pending.contains(&key) {
                continue;
            }
            self.local.upsert(&held.entity_type, held.record).await?;
            self.cursor_store.release_held(&key).await?;
            released += 1;
        }
        if released > 0 {
            debug!(released, "Released held records");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::MemoryOutboxStore;
    use crate::local_state::MemoryLocalStore;
    use async_trait::async_trait;
    use classmark_core::{
        ClassmarkError, FailureClass, FailureKind, MutationAction, Payload, PushRequest,
        PushResponse, ServerId, StorageError, StreamKey,
    };
    use serde_json::json;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PagedTransport {
        pages: std::sync::Mutex<VecDeque<Result<PullResponse, TransportError>>>,
        queries: std::sync::Mutex<Vec<PullQuery>>,
    }

    impl PagedTransport {
        fn new(pages: Vec<Result<PullResponse, TransportError>>) -> Self {
            Self {
                pages: std::sync::Mutex::new(pages.into()),
                queries: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<PullQuery> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncTransport for PagedTransport {
        async fn push(&self, _request: &PushRequest) -> Result<PushResponse, TransportError> {
            Ok(PushResponse { results: vec![] })
        }

        async fn pull(&self, query: &PullQuery) -> Result<PullResponse, TransportError> {
            self.queries.lock().unwrap().push(query.clone());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(page(&[], "end", false)))
        }
    }

    /// Fails every upsert after the first `allowed`.
    struct FlakyStore {
        inner: MemoryLocalStore,
        allowed: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LocalRecordStore for FlakyStore {
        async fn upsert(&self, entity_type: &str, record: Payload) -> ClassmarkResult<bool> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(StorageError::WriteFailed {
                    target: entity_type.to_string(),
                    reason: "disk full".into(),
                }
                .into());
            }
            self.inner.upsert(entity_type, record).await
        }

        async fn get(&self, entity_type: &str, id: &str) -> ClassmarkResult<Option<Payload>> {
            self.inner.get(entity_type, id).await
        }

        async fn count(&self, entity_type: &str) -> ClassmarkResult<usize> {
            self.inner.count(entity_type).await
        }
    }

    fn page(records: &[(&str, u64, &str)], token: &str, has_more: bool) -> PullResponse {
        let mut updates: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (id, version, name) in records {
            updates
                .entry("student".to_string())
                .or_default()
                .push(json!({"id": id, "_version": version, "name": name}));
        }
        PullResponse {
            updates,
            new_sync_token: SyncCursor::new(token),
            has_more,
        }
    }

    struct Harness {
        outbox: Arc<Outbox>,
        store: MemoryOutboxStore,
        local: Arc<dyn LocalRecordStore>,
        transport: Arc<PagedTransport>,
        connectivity: ConnectivityMonitor,
        engine: PullEngine,
    }

    async fn harness(
        pages: Vec<Result<PullResponse, TransportError>>,
        local: Arc<dyn LocalRecordStore>,
    ) -> Harness {
        let store = MemoryOutboxStore::new();
        let outbox = Arc::new(
            Outbox::open(Arc::new(store.clone()), Default::default())
                .await
                .unwrap(),
        );
        let transport = Arc::new(PagedTransport::new(pages));
        let connectivity = ConnectivityMonitor::new(true);
        let engine = PullEngine::new(
            Arc::clone(&outbox),
            transport.clone(),
            Arc::new(store.clone()),
            Arc::clone(&local),
            connectivity.clone(),
            SyncConfig::default(),
        )
        .with_page_limit(2);
        Harness {
            outbox,
            store,
            local,
            transport,
            connectivity,
            engine,
        }
    }

    #[tokio::test]
    async fn test_pages_are_merged_and_cursor_saved() {
        let h = harness(
            vec![
                Ok(page(&[("s1", 1, "a"), ("s2", 2, "b")], "c2", true)),
                Ok(page(&[("s3", 3, "c")], "c3", false)),
            ],
            Arc::new(MemoryLocalStore::new()),
        )
        .await;

        let report = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(report.applied, 3);
        assert_eq!(report.new_cursor, Some(SyncCursor::new("c3")));
        assert_eq!(h.store.load_cursor().await.unwrap(), Some(SyncCursor::new("c3")));
        assert_eq!(h.local.count("student").await.unwrap(), 3);

        let queries = h.transport.queries();
        assert_eq!(queries[0].last_synced_at, None);
        assert_eq!(queries[0].limit, Some(2));
        assert_eq!(queries[1].last_synced_at, Some(SyncCursor::new("c2")));
    }

    #[tokio::test]
    async fn test_record_with_pending_write_is_held_until_synced() {
        let h = harness(
            vec![Ok(page(&[("s1", 5, "server")], "c5", false))],
            Arc::new(MemoryLocalStore::new()),
        )
        .await;
        let mut body = Payload::new();
        body.insert("id".into(), json!("s1"));
        body.insert("name".into(), json!("local"));
        let temp_id = h
            .outbox
            .enqueue("student", MutationAction::Update, body, StreamKey::new("student:s1"))
            .await
            .unwrap();

        let report = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap();
        assert_eq!(report.held, 1);
        assert_eq!(report.applied, 0);
        assert!(h.local.get("student", "s1").await.unwrap().is_none());

        h.outbox.mark_sending(&[temp_id.clone()]).await.unwrap();
        h.outbox
            .mark_synced(&temp_id, &ServerId::new("s1"))
            .await
            .unwrap();

        assert_eq!(h.engine.reconcile_held().await.unwrap(), 1);
        assert_eq!(h.engine.held_count().await.unwrap(), 0);
        let stored = h.local.get("student", "s1").await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("server"));
    }

    #[tokio::test]
    async fn test_held_record_survives_restart_and_terminal_failure() {
        let h = harness(
            vec![Ok(page(&[("s1", 5, "server")], "c5", false))],
            Arc::new(MemoryLocalStore::new()),
        )
        .await;
        let mut body = Payload::new();
        body.insert("id".into(), json!("s1"));
        body.insert("name".into(), json!("local"));
        let temp_id = h
            .outbox
            .enqueue("student", MutationAction::Update, body, StreamKey::new("student:s1"))
            .await
            .unwrap();

        let report = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap();
        assert_eq!(report.held, 1);
        assert_eq!(h.store.load_cursor().await.unwrap(), Some(SyncCursor::new("c5")));
        drop(h.engine);

        // Reopen everything over the same stores.
        let outbox = Arc::new(
            Outbox::open(Arc::new(h.store.clone()), Default::default())
                .await
                .unwrap(),
        );
        let engine = PullEngine::new(
            Arc::clone(&outbox),
            h.transport.clone(),
            Arc::new(h.store.clone()),
            Arc::clone(&h.local),
            h.connectivity.clone(),
            SyncConfig::default(),
        );
        assert_eq!(engine.held_count().await.unwrap(), 1);

        outbox
            .mark_failed(&temp_id, FailureClass::Terminal, FailureKind::Validation, "rejected")
            .await
            .unwrap();
        let report = engine.run_pull_cycle(&CancelToken::new()).await.unwrap();

        assert_eq!(report.released, 1);
        assert_eq!(engine.held_count().await.unwrap(), 0);
        let stored = h.local.get("student", "s1").await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("server"));
        assert_eq!(
            h.transport.queries()[1].last_synced_at,
            Some(SyncCursor::new("c5"))
        );
    }

    #[tokio::test]
    async fn test_newer_held_version_replaces_older() {
        let h = harness(
            vec![
                Ok(page(&[("s1", 3, "older")], "c3", true)),
                Ok(page(&[("s1", 7, "newer"), ("s1", 4, "stale")], "c7", false)),
            ],
            Arc::new(MemoryLocalStore::new()),
        )
        .await;
        let mut body = Payload::new();
        body.insert("id".into(), json!("s1"));
        let temp_id = h
            .outbox
            .enqueue("student", MutationAction::Update, body, StreamKey::new("student:s1"))
            .await
            .unwrap();

        let report = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap();
        assert_eq!(report.held, 3);
        let held = h.store.load_held().await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].record["name"], json!("newer"));

        h.outbox.mark_sending(&[temp_id.clone()]).await.unwrap();
        h.outbox.mark_synced(&temp_id, &ServerId::new("s1")).await.unwrap();
        assert_eq!(h.engine.reconcile_held().await.unwrap(), 1);
        let stored = h.local.get("student", "s1").await.unwrap().unwrap();
        assert_eq!(stored["name"], json!("newer"));
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_cursor() {
        let flaky = Arc::new(FlakyStore {
            inner: MemoryLocalStore::new(),
            allowed: 3,
            calls: AtomicUsize::new(0),
        });
        let h = harness(
            vec![
                Ok(page(&[("s1", 1, "a"), ("s2", 2, "b")], "c2", true)),
                Ok(page(&[("s3", 3, "c"), ("s4", 4, "d")], "c4", false)),
            ],
            flaky,
        )
        .await;

        let err = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ClassmarkError::Storage(_)));
        assert_eq!(h.store.load_cursor().await.unwrap(), Some(SyncCursor::new("c2")));
    }

    #[tokio::test]
    async fn test_transport_error_leaves_cursor_untouched() {
        let h = harness(
            vec![Err(TransportError::Http {
                status: 503,
                message: "down".into(),
            })],
            Arc::new(MemoryLocalStore::new()),
        )
        .await;

        let err = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, ClassmarkError::Transport(_)));
        assert_eq!(h.store.load_cursor().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_offline_pull_is_skipped() {
        let h = harness(vec![], Arc::new(MemoryLocalStore::new())).await;
        h.connectivity.set_connected(false);

        let report = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap();
        assert!(report.skipped);
        assert!(h.transport.queries().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_records_are_counted() {
        let mut bad = page(&[("s1", 1, "a")], "c1", false);
        bad.updates
            .get_mut("student")
            .unwrap()
            .extend([json!(42), json!({"name": "no id"})]);
        let h = harness(vec![Ok(bad)], Arc::new(MemoryLocalStore::new())).await;

        let report = h.engine.run_pull_cycle(&CancelToken::new()).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.malformed, 2);
    }
}
