//! CLASSMARK Test Utilities
//!
//! Shared test infrastructure for the CLASSMARK workspace:
//! - A loopback transport that connects a sync client to an in-process
//!   sync service, with fault injection
//! - Server and client harnesses driven by a manual clock
//! - Proptest generators for mutations and push items
//! - Fixtures and custom assertions

pub use classmark_client::{
    CancelToken, ConnectivityMonitor, CursorStore, LocalRecordStore, MemoryLocalStore,
    MemoryOutboxStore, Outbox, OutboxStore, PullReport, PushReport, SyncClient, SyncReport,
    SyncTransport,
};
pub use classmark_core::{
    BackoffPolicy, CacheConfig, ClassmarkError, ClassmarkResult, Clock, FailureKind,
    InvalidateCacheRequest, ManualClock, MutationAction, MutationStatus, Payload, PullQuery,
    PullResponse, PushItem, PushRequest, PushResponse, QueuedMutation, ServerId, StreamKey,
    SubjectRef, SyncConfig, SyncCursor, TempId, TenantId, TransportError, ViewKey,
};
pub use classmark_storage::{
    AggregatedViewCache, CacheInvalidationGateway, InMemoryCacheBackend, InMemoryChangeFeed,
    InvalidationGateway, MemoryRecordRepository, MutationValidator, SyncService, ViewComputer,
};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

// ============================================================================
// LOOPBACK TRANSPORT
// ============================================================================

const DISABLED: usize = usize::MAX;

/// Decrement `counter` if it is positive. Returns whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn server_error(err: ClassmarkError) -> TransportError {
    let status = match err {
        ClassmarkError::Validation(_) => 400,
        ClassmarkError::Conflict { .. } => 409,
        _ => 500,
    };
    TransportError::Http {
        status,
        message: err.to_string(),
    }
}

/// [`SyncTransport`] that calls a [`SyncService`] in-process for one tenant.
///
/// Faults are armed ahead of time and consumed by the next matching call.
pub struct LoopbackTransport {
    service: Arc<SyncService>,
    tenant_id: TenantId,
    offline: AtomicBool,
    failing_pushes: AtomicUsize,
    dropped_push_responses: AtomicUsize,
    pull_failure_at: AtomicUsize,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    requests: Mutex<Vec<PushRequest>>,
    delivered: Mutex<Vec<TempId>>,
}

impl LoopbackTransport {
    pub fn new(service: Arc<SyncService>, tenant_id: TenantId) -> Self {
        Self {
            service,
            tenant_id,
            offline: AtomicBool::new(false),
            failing_pushes: AtomicUsize::new(0),
            dropped_push_responses: AtomicUsize::new(0),
            pull_failure_at: AtomicUsize::new(DISABLED),
            push_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// While offline every call fails with a connectivity error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Answer the next `count` pushes with a 503 without applying them.
    pub fn fail_next_pushes(&self, count: usize) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    /// Apply the next `count` pushes but lose the responses, as if the
    /// connection dropped on the way back.
    pub fn drop_next_push_responses(&self, count: usize) {
        self.dropped_push_responses.store(count, Ordering::SeqCst);
    }

    /// Let `successes` more pulls through, then fail exactly one with a 503.
    pub fn fail_pull_after(&self, successes: usize) {
        let at = self.pull_calls.load(Ordering::SeqCst) + successes;
        self.pull_failure_at.store(at, Ordering::SeqCst);
    }

    /// Push calls made while online.
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Every push request received while online, failed ones included.
    pub async fn push_requests(&self) -> Vec<PushRequest> {
        self.requests.lock().await.clone()
    }

    /// Temp ids in the order the server applied them. Replays appear again.
    pub async fn delivered(&self) -> Vec<TempId> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connectivity("loopback offline".to_string()));
        }
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        if take_one(&self.failing_pushes) {
            return Err(TransportError::Http {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }

        let response = self
            .service
            .apply_push(self.tenant_id, request.clone())
            .await
            .map_err(server_error)?;
        self.delivered
            .lock()
            .await
            .extend(request.items.iter().map(|item| item.temp_id.clone()));

        if take_one(&self.dropped_push_responses) {
            return Err(TransportError::Timeout(Duration::from_secs(30)));
        }
        Ok(response)
    }

    async fn pull(&self, query: &PullQuery) -> Result<PullResponse, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connectivity("loopback offline".to_string()));
        }
        let call = self.pull_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .pull_failure_at
            .compare_exchange(call, DISABLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(TransportError::Http {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }

        self.service
            .pull(self.tenant_id, query)
            .await
            .map_err(server_error)
    }
}

// ============================================================================
// HARNESSES
// ============================================================================

pub type TestCache = AggregatedViewCache<InMemoryCacheBackend>;

/// In-process sync server: repository, change feed, view cache and
/// invalidation gateway wired the way the API server wires them.
pub struct ServerHarness {
    pub clock: ManualClock,
    pub repository: Arc<MemoryRecordRepository>,
    pub feed: Arc<InMemoryChangeFeed>,
    pub cache: TestCache,
    pub gateway: Arc<dyn InvalidationGateway>,
    pub service: Arc<SyncService>,
}

impl ServerHarness {
    pub fn new(clock: ManualClock) -> Self {
        Self::build(clock, None)
    }

    /// Server that runs `validator` on every pushed item.
    pub fn with_validator(clock: ManualClock, validator: Arc<dyn MutationValidator>) -> Self {
        Self::build(clock, Some(validator))
    }

    fn build(clock: ManualClock, validator: Option<Arc<dyn MutationValidator>>) -> Self {
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let repository = Arc::new(MemoryRecordRepository::new());
        let feed = Arc::new(InMemoryChangeFeed::with_clock(Arc::clone(&shared)));
        let cache = AggregatedViewCache::new(
            Arc::new(InMemoryCacheBackend::with_clock(Arc::clone(&shared))),
            CacheConfig::default(),
        );
        let gateway = CacheInvalidationGateway::new(cache.clone()).into_shared();

        let mut service = SyncService::new(repository.clone(), feed.clone(), Arc::clone(&gateway))
            .with_clock(shared);
        if let Some(validator) = validator {
            service = service.with_validator(validator);
        }

        Self {
            clock,
            repository,
            feed,
            cache,
            gateway,
            service: Arc::new(service),
        }
    }

    pub fn transport(&self, tenant_id: TenantId) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport::new(Arc::clone(&self.service), tenant_id))
    }

    /// Apply items directly, bypassing any client.
    pub async fn push(&self, tenant_id: TenantId, items: Vec<PushItem>) -> ClassmarkResult<PushResponse> {
        self.service.apply_push(tenant_id, PushRequest { items }).await
    }
}

/// A device: sync client over in-memory outbox and local stores.
///
/// [`ClientHarness::restart`] reopens everything over the same stores, the
/// way an app relaunch would.
pub struct ClientHarness {
    pub store: MemoryOutboxStore,
    pub local: Arc<MemoryLocalStore>,
    pub transport: Arc<dyn SyncTransport>,
    pub clock: ManualClock,
    pub config: SyncConfig,
    pub page_limit: Option<usize>,
    pub client: SyncClient,
}

impl ClientHarness {
    pub async fn new(
        transport: Arc<dyn SyncTransport>,
        clock: ManualClock,
        config: SyncConfig,
        connected: bool,
    ) -> ClassmarkResult<Self> {
        let store = MemoryOutboxStore::new();
        let local = Arc::new(MemoryLocalStore::new());
        let client = open_client(&store, &local, &transport, &clock, &config, None, connected).await?;
        Ok(Self {
            store,
            local,
            transport,
            clock,
            config,
            page_limit: None,
            client,
        })
    }

    /// Pull at most `limit` records per page, also after a restart.
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = Some(limit);
        self.client = self.client.with_page_limit(limit);
        self
    }

    /// Drop the running client and open a new one over the same stores.
    pub async fn restart(self, connected: bool) -> ClassmarkResult<Self> {
        let Self {
            store,
            local,
            transport,
            clock,
            config,
            page_limit,
            client,
        } = self;
        drop(client);
        let client =
            open_client(&store, &local, &transport, &clock, &config, page_limit, connected).await?;
        Ok(Self {
            store,
            local,
            transport,
            clock,
            config,
            page_limit,
            client,
        })
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        self.client.outbox()
    }

    pub async fn sync_now(&self) -> ClassmarkResult<SyncReport> {
        self.client.sync_now(&CancelToken::new()).await
    }

    pub async fn push_cycle(&self) -> ClassmarkResult<PushReport> {
        self.client
            .push_engine()
            .run_push_cycle(&CancelToken::new())
            .await
    }

    pub async fn pull_cycle(&self) -> ClassmarkResult<PullReport> {
        self.client
            .pull_engine()
            .run_pull_cycle(&CancelToken::new())
            .await
    }

    /// Move the clock past the longest retry delay.
    pub fn skip_backoff(&self) {
        self.clock.advance(self.config.backoff.max + Duration::from_secs(1));
    }
}

async fn open_client(
    store: &MemoryOutboxStore,
    local: &Arc<MemoryLocalStore>,
    transport: &Arc<dyn SyncTransport>,
    clock: &ManualClock,
    config: &SyncConfig,
    page_limit: Option<usize>,
    connected: bool,
) -> ClassmarkResult<SyncClient> {
    let outbox_store: Arc<dyn OutboxStore> = Arc::new(store.clone());
    let outbox = Outbox::open_with_clock(
        outbox_store,
        config.backoff.clone(),
        Arc::new(clock.clone()),
    )
    .await?;
    let local_store: Arc<dyn LocalRecordStore> = local.clone();
    let client = SyncClient::new(
        Arc::new(outbox),
        Arc::clone(transport),
        Arc::new(store.clone()),
        local_store,
        ConnectivityMonitor::new(connected),
        config.clone(),
    );
    Ok(match page_limit {
        Some(limit) => client.with_page_limit(limit),
        None => client,
    })
}

// ============================================================================
// MOCK VIEW COMPUTER
// ============================================================================

/// View computer that counts its invocations.
///
/// The value records which computation produced it, so tests can tell a
/// recomputed view from a cached one by value alone.
#[derive(Debug, Default)]
pub struct CountingComputer {
    computes: AtomicUsize,
}

impl CountingComputer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn computes(&self) -> usize {
        self.computes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ViewComputer for CountingComputer {
    async fn compute(&self, key: &ViewKey) -> ClassmarkResult<Value> {
        let computation = self.computes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({
            "viewKind": key.view_kind,
            "subject": key.subject.id,
            "computation": computation,
        }))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for sync types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        any::<[u8; 16]>().prop_map(|bytes| TenantId::new(Uuid::from_bytes(bytes)))
    }

    /// Every draw is a fresh id.
    pub fn arb_temp_id() -> impl Strategy<Value = TempId> {
        Just(()).prop_map(|_| TempId::generate())
    }

    pub fn arb_entity_type() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("attendance".to_string()),
            Just("fee-payment".to_string()),
            Just("library-loan".to_string()),
        ]
    }

    pub fn arb_student_id() -> impl Strategy<Value = String> {
        (1u32..500).prop_map(|n| n.to_string())
    }

    pub fn arb_date() -> impl Strategy<Value = String> {
        (1u32..=28).prop_map(|day| format!("2024-05-{day:02}"))
    }

    /// Attendance-shaped payload without an id.
    pub fn arb_payload() -> impl Strategy<Value = Payload> {
        (
            arb_student_id(),
            "[0-9][A-D]",
            arb_date(),
            prop_oneof![Just("present"), Just("absent"), Just("late")],
        )
            .prop_map(|(student, section, date, status)| {
                fixtures::payload(json!({
                    "student_id": student,
                    "section_id": section,
                    "date": date,
                    "status": status,
                }))
            })
    }

    pub fn arb_stream_key() -> impl Strategy<Value = StreamKey> {
        ("[0-9][A-D]", arb_date())
            .prop_map(|(section, date)| {
            StreamKey::from_parts("attendance", &[section.as_str(), date.as_str()])
        })
    }

    /// A CREATE push item with a fresh temp id.
    pub fn arb_push_item() -> impl Strategy<Value = PushItem> {
        (arb_temp_id(), arb_entity_type(), arb_payload()).prop_map(|(temp_id, entity, data)| {
            PushItem {
                temp_id,
                entity,
                action: MutationAction::Create,
                data,
            }
        })
    }

    pub fn arb_backoff_policy() -> impl Strategy<Value = BackoffPolicy> {
        (1u64..10, 0u64..120, 1.0f64..4.0, 1u32..12).prop_map(
            |(initial, extra, multiplier, max_attempts)| BackoffPolicy {
                initial: Duration::from_secs(initial),
                max: Duration::from_secs(initial + extra),
                multiplier,
                max_attempts,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common setups for sync tests.

    use super::*;

    /// Convert a JSON object literal into a payload. Non-objects give an
    /// empty payload.
    pub fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    pub fn attendance(student_id: &str, section_id: &str, date: &str, status: &str) -> Payload {
        payload(json!({
            "student_id": student_id,
            "section_id": section_id,
            "date": date,
            "status": status,
        }))
    }

    /// Partial update of an existing record.
    pub fn status_update(record_id: &ServerId, status: &str) -> Payload {
        payload(json!({
            "id": record_id.as_str(),
            "status": status,
        }))
    }

    pub fn section_day_stream(section_id: &str, date: &str) -> StreamKey {
        StreamKey::from_parts("attendance", &[section_id, date])
    }

    pub fn create_item(entity: &str, data: Payload) -> PushItem {
        PushItem {
            temp_id: TempId::generate(),
            entity: entity.to_string(),
            action: MutationAction::Create,
            data,
        }
    }

    /// Short retry schedule: 1s, 2s, 4s, then terminal after 4 attempts.
    pub fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
            multiplier: 2.0,
            max_attempts: 4,
        }
    }

    pub fn fast_sync_config() -> SyncConfig {
        SyncConfig::default()
            .with_backoff(fast_backoff())
            .with_request_timeout(Duration::from_secs(5))
    }

    pub fn test_clock() -> ManualClock {
        ManualClock::starting_now()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over outbox and server state.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &ClassmarkResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert a mutation is queued with the given status.
    pub async fn assert_status(outbox: &Outbox, temp_id: &TempId, expected: MutationStatus) {
        match outbox.get(temp_id).await {
            Some(mutation) => assert_eq!(
                mutation.status, expected,
                "Mutation {} has status {:?}, expected {:?}",
                temp_id, mutation.status, expected
            ),
            None => panic!("Mutation {} is not in the outbox", temp_id),
        }
    }

    /// Assert a mutation failed terminally with the given kind and a
    /// message containing `needle`.
    pub async fn assert_terminal(outbox: &Outbox, temp_id: &TempId, kind: FailureKind, needle: &str) {
        let Some(mutation) = outbox.get(temp_id).await else {
            panic!("Mutation {} is not in the outbox", temp_id);
        };
        assert_eq!(mutation.status, MutationStatus::FailedTerminal);
        match &mutation.last_error {
            Some(failure) => {
                assert_eq!(failure.kind, kind, "Wrong failure kind for {}", temp_id);
                assert!(
                    failure.message.contains(needle),
                    "Failure message {:?} does not mention {:?}",
                    failure.message,
                    needle
                );
            }
            None => panic!("Mutation {} has no recorded failure", temp_id),
        }
    }

    /// Assert that, within every stream, `delivered` preserves the order
    /// given by `enqueued`. Replays of an already delivered id are allowed.
    #[track_caller]
    pub fn assert_stream_order(enqueued: &[(TempId, StreamKey)], delivered: &[TempId]) {
        let mut streams: Vec<&StreamKey> = enqueued.iter().map(|(_, s)| s).collect();
        streams.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        streams.dedup();

        for stream in streams {
            let expected: Vec<&TempId> = enqueued
                .iter()
                .filter(|(_, s)| s == stream)
                .map(|(t, _)| t)
                .collect();
            let mut seen: Vec<&TempId> = Vec::new();
            for temp_id in delivered.iter().filter(|t| expected.contains(t)) {
                if !seen.contains(&temp_id) {
                    seen.push(temp_id);
                }
            }
            assert_eq!(
                seen,
                expected[..seen.len()].to_vec(),
                "Stream {} delivered out of order",
                stream
            );
        }
    }

    /// Assert a cached read was served from cache.
    #[track_caller]
    pub fn assert_cache_hit(read: &classmark_storage::CacheRead) {
        assert!(
            read.was_cache_hit(),
            "Expected cache hit, got {:?}",
            read.source()
        );
    }

    #[track_caller]
    pub fn assert_recomputed(read: &classmark_storage::CacheRead) {
        assert!(
            !read.was_cache_hit(),
            "Expected recomputation, got {:?}",
            read.source()
        );
    }
}
