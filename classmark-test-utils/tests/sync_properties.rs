//! Delivery guarantees of the sync layer: idempotent push, per-stream
//! ordering, resumable pulls and a durable outbox.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use classmark_client::LmdbOutboxStore;
use classmark_core::PushItem;
use classmark_storage::RecordRepository;
use classmark_test_utils::assertions::assert_stream_order;
use classmark_test_utils::fixtures::{
    attendance, create_item, fast_backoff, fast_sync_config, payload, section_day_stream,
    status_update, test_clock,
};
use classmark_test_utils::generators::{arb_payload, arb_push_item, arb_stream_key};
use classmark_test_utils::{
    CancelToken, ClientHarness, ConnectivityMonitor, CursorStore, LocalRecordStore,
    MemoryLocalStore, MemoryOutboxStore, MutationAction, MutationStatus, Outbox, OutboxStore,
    ServerHarness, SyncClient, SyncCursor, TempId, TenantId,
};
use proptest::prelude::*;
use serde_json::json;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn fail(err: impl Display) -> TestCaseError {
    TestCaseError::fail(err.to_string())
}

// ============================================================================
// IDEMPOTENT PUSH
// ============================================================================

#[tokio::test]
async fn test_lost_push_response_is_replayed_not_reapplied() {
    let clock = test_clock();
    let server = ServerHarness::new(clock.clone());
    let tenant = TenantId::now_v7();
    let transport = server.transport(tenant);
    let device = ClientHarness::new(transport.clone(), clock, fast_sync_config(), true)
        .await
        .unwrap();

    let t1 = device
        .client
        .enqueue(
            "attendance",
            MutationAction::Create,
            attendance("42", "7", "2024-05-01", "present"),
            section_day_stream("7", "2024-05-01"),
        )
        .await
        .unwrap();

    transport.drop_next_push_responses(1);
    let report = device.push_cycle().await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.retrying, 1);
    assert_eq!(server.repository.count(tenant, "attendance").await, 1);

    device.skip_backoff();
    let report = device.push_cycle().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(transport.delivered().await, vec![t1.clone(), t1.clone()]);

    let records = server.repository.list(tenant, "attendance").await.unwrap();
    assert_eq!(records.len(), 1);
    let server_id = device.outbox().resolve_id(&t1).await.unwrap();
    assert_eq!(records[0]["id"], json!(server_id.as_str()));
}

#[tokio::test]
async fn test_reused_temp_id_with_other_payload_is_conflict() {
    let server = ServerHarness::new(test_clock());
    let tenant = TenantId::now_v7();
    let original = create_item("attendance", attendance("42", "7", "2024-05-01", "present"));
    let tampered = PushItem {
        data: attendance("42", "7", "2024-05-01", "absent"),
        ..original.clone()
    };

    let first = server.push(tenant, vec![original]).await.unwrap();
    assert!(first.results[0].is_success());
    let second = server.push(tenant, vec![tampered]).await.unwrap();
    assert!(!second.results[0].is_success());
    assert_eq!(server.repository.count(tenant, "attendance").await, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_replayed_pushes_apply_once(
        items in proptest::collection::vec(arb_push_item(), 1..8),
        replays in 1usize..4,
    ) {
        runtime().block_on(async {
            let server = ServerHarness::new(test_clock());
            let tenant = TenantId::now_v7();

            let first = server.push(tenant, items.clone()).await.map_err(fail)?;
            for _ in 0..replays {
                let again = server.push(tenant, items.clone()).await.map_err(fail)?;
                prop_assert_eq!(&again.results, &first.results);
            }

            let mut per_entity: HashMap<&str, usize> = HashMap::new();
            for item in &items {
                *per_entity.entry(item.entity.as_str()).or_insert(0) += 1;
            }
            for (entity, expected) in per_entity {
                prop_assert_eq!(server.repository.count(tenant, entity).await, expected);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ============================================================================
// PER-STREAM ORDERING
// ============================================================================

#[tokio::test]
async fn test_stream_order_across_cycles() {
    let clock = test_clock();
    let server = ServerHarness::new(clock.clone());
    let tenant = TenantId::now_v7();
    let transport = server.transport(tenant);
    let config = fast_sync_config().with_max_batches_per_cycle(1);
    let device = ClientHarness::new(transport.clone(), clock, config, true)
        .await
        .unwrap();

    let mut enqueued = Vec::new();
    for (student, section) in [("1", "7A"), ("2", "7B"), ("3", "7A"), ("4", "7A")] {
        let stream = section_day_stream(section, "2024-05-01");
        let temp_id = device
            .client
            .enqueue(
                "attendance",
                MutationAction::Create,
                attendance(student, section, "2024-05-01", "present"),
                stream.clone(),
            )
            .await
            .unwrap();
        enqueued.push((temp_id, stream));
    }

    let mut cycles = 0;
    while device.outbox().pending_count().await > 0 {
        device.push_cycle().await.unwrap();
        cycles += 1;
        assert!(cycles <= 4, "outbox did not drain");
    }
    // One item per stream per batch: 7A needs three batches.
    assert_eq!(cycles, 3);
    assert_stream_order(&enqueued, &transport.delivered().await);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_stream_order_survives_batching_and_retries(
        streams in proptest::collection::vec(0usize..3, 1..12),
        batch_size in 1usize..4,
        failures in 0usize..3,
    ) {
        runtime().block_on(async {
            let clock = test_clock();
            let server = ServerHarness::new(clock.clone());
            let tenant = TenantId::now_v7();
            let transport = server.transport(tenant);
            let config = fast_sync_config()
                .with_max_batch_size(batch_size)
                .with_max_batches_per_cycle(1);
            let device = ClientHarness::new(transport.clone(), clock, config, true)
                .await
                .map_err(fail)?;

            let mut enqueued = Vec::new();
            for (i, s) in streams.iter().enumerate() {
                let section = format!("{s}A");
                let stream = section_day_stream(&section, "2024-05-01");
                let temp_id = device
                    .client
                    .enqueue(
                        "attendance",
                        MutationAction::Create,
                        attendance(&i.to_string(), &section, "2024-05-01", "present"),
                        stream.clone(),
                    )
                    .await
                    .map_err(fail)?;
                enqueued.push((temp_id, stream));
            }

            transport.fail_next_pushes(failures);
            for _ in 0..64 {
                if device.outbox().pending_count().await == 0 {
                    break;
                }
                device.push_cycle().await.map_err(fail)?;
                device.skip_backoff();
            }

            prop_assert_eq!(device.outbox().pending_count().await, 0);
            assert_stream_order(&enqueued, &transport.delivered().await);
            prop_assert_eq!(
                server.repository.count(tenant, "attendance").await,
                streams.len()
            );
            Ok::<(), TestCaseError>(())
        })?;
    }
}

// ============================================================================
// CURSOR RESUMABILITY
// ============================================================================

/// Five attendance marks, two fee payments, then one mark edited.
async fn seed_changes(server: &ServerHarness, tenant: TenantId) {
    let mut items: Vec<PushItem> = (0..5)
        .map(|i| {
            create_item(
                "attendance",
                attendance(&i.to_string(), "7", "2024-05-01", "present"),
            )
        })
        .collect();
    items.push(create_item("fee-payment", payload(json!({ "student_id": "1", "amount": 250 }))));
    items.push(create_item("fee-payment", payload(json!({ "student_id": "2", "amount": 400 }))));
    let response = server.push(tenant, items).await.unwrap();

    let first = response.results[0].server_id.clone().unwrap();
    let edit = PushItem {
        temp_id: TempId::generate(),
        entity: "attendance".to_string(),
        action: MutationAction::Update,
        data: status_update(&first, "late"),
    };
    server.push(tenant, vec![edit]).await.unwrap();
}

#[tokio::test]
async fn test_interrupted_pull_resumes_to_same_state() {
    let clock = test_clock();
    let server = ServerHarness::new(clock.clone());
    let tenant = TenantId::now_v7();
    seed_changes(&server, tenant).await;

    let transport = server.transport(tenant);
    let interrupted = ClientHarness::new(transport.clone(), clock.clone(), fast_sync_config(), true)
        .await
        .unwrap()
        .with_page_limit(2);

    transport.fail_pull_after(1);
    assert!(interrupted.pull_cycle().await.is_err());
    assert_eq!(
        interrupted.store.load_cursor().await.unwrap(),
        Some(SyncCursor::new("c2"))
    );
    assert_eq!(interrupted.local.count("attendance").await.unwrap(), 2);

    let resumed = interrupted.restart(true).await.unwrap();
    let report = resumed.pull_cycle().await.unwrap();
    assert_eq!(report.pages, 3);
    assert_eq!(report.new_cursor, Some(SyncCursor::new("c8")));

    let reference = ClientHarness::new(server.transport(tenant), clock, fast_sync_config(), true)
        .await
        .unwrap()
        .with_page_limit(3);
    reference.pull_cycle().await.unwrap();

    for entity in ["attendance", "fee-payment"] {
        let records = server.repository.list(tenant, entity).await.unwrap();
        assert_eq!(resumed.local.count(entity).await.unwrap(), records.len());
        assert_eq!(reference.local.count(entity).await.unwrap(), records.len());
        for record in records {
            let Some(id) = record["id"].as_str() else {
                panic!("server record without id");
            };
            let ours = resumed.local.get(entity, id).await.unwrap();
            let theirs = reference.local.get(entity, id).await.unwrap();
            assert!(ours.is_some());
            assert_eq!(ours, theirs);
        }
    }
}

#[tokio::test]
async fn test_repeated_pull_after_lost_cursor_is_harmless() {
    let clock = test_clock();
    let server = ServerHarness::new(clock.clone());
    let tenant = TenantId::now_v7();
    seed_changes(&server, tenant).await;

    let device = ClientHarness::new(server.transport(tenant), clock, fast_sync_config(), true)
        .await
        .unwrap();
    let first = device.pull_cycle().await.unwrap();
    assert_eq!(first.applied, 7);

    // Replaying the whole feed over an up-to-date store changes nothing.
    device.store.save_cursor(&SyncCursor::new("c0")).await.unwrap();
    let second = device.pull_cycle().await.unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.unchanged, 7);
}

// ============================================================================
// OUTBOX DURABILITY
// ============================================================================

#[tokio::test]
async fn test_offline_mutations_survive_restart_on_disk() {
    let dir = tempfile::TempDir::new().unwrap();

    let enqueued: Vec<TempId> = {
        let store = Arc::new(LmdbOutboxStore::open(dir.path(), 10).unwrap());
        let outbox = Outbox::open(store, fast_backoff()).await.unwrap();
        let mut ids = Vec::new();
        for student in ["41", "42", "43"] {
            let temp_id = outbox
                .enqueue(
                    "attendance",
                    MutationAction::Create,
                    attendance(student, "7", "2024-05-01", "present"),
                    section_day_stream("7", "2024-05-01"),
                )
                .await
                .unwrap();
            ids.push(temp_id);
        }
        // The process dies while the first item is on the wire.
        outbox.mark_sending(&ids[..1]).await.unwrap();
        ids
    };

    let store = Arc::new(LmdbOutboxStore::open(dir.path(), 10).unwrap());
    let outbox = Outbox::open(store.clone(), fast_backoff()).await.unwrap();
    let snapshot = outbox.snapshot().await;
    let recovered: Vec<TempId> = snapshot.iter().map(|m| m.temp_id.clone()).collect();
    assert_eq!(recovered, enqueued);
    assert!(snapshot.iter().all(|m| m.status == MutationStatus::Enqueued));
    assert_eq!(snapshot[0].attempts, 1);

    // The recovered queue drains normally once a server is reachable.
    let server = ServerHarness::new(test_clock());
    let tenant = TenantId::now_v7();
    let client = SyncClient::new(
        Arc::new(outbox),
        server.transport(tenant),
        store,
        Arc::new(MemoryLocalStore::new()),
        ConnectivityMonitor::new(true),
        fast_sync_config(),
    );
    let report = client.sync_now(&CancelToken::new()).await.unwrap();
    assert_eq!(report.push.synced, 3);
    assert_eq!(server.repository.count(tenant, "attendance").await, 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_outbox_restart_preserves_queue(
        writes in proptest::collection::vec((arb_payload(), arb_stream_key()), 1..10),
    ) {
        runtime().block_on(async {
            let store = MemoryOutboxStore::new();
            let shared: Arc<dyn OutboxStore> = Arc::new(store.clone());
            let before = {
                let outbox = Outbox::open(Arc::clone(&shared), fast_backoff())
                    .await
                    .map_err(fail)?;
                for (data, stream) in &writes {
                    outbox
                        .enqueue("attendance", MutationAction::Create, data.clone(), stream.clone())
                        .await
                        .map_err(fail)?;
                }
                outbox.snapshot().await
            };

            let reopened = Outbox::open(shared, fast_backoff()).await.map_err(fail)?;
            let after = reopened.snapshot().await;
            prop_assert_eq!(&after, &before);
            prop_assert_eq!(after.len(), writes.len());
            prop_assert!(after.iter().all(|m| m.status == MutationStatus::Enqueued));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
