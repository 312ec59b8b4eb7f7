//! Sync service: applies pushes and serves pulls.

use std::collections::HashMap;
use std::sync::Arc;

use classmark_core::{
    Clock, ClassmarkError, ClassmarkResult, InvalidationEvent, MutationAction, Payload,
    PullQuery, PullResponse, PushErrorKind, PushItem, PushItemResult, PushRequest, PushResponse,
    ScopeKey, ServerId, SubjectKind, SystemClock, TenantId, RECORD_ID_FIELD,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::feed::ChangeFeed;
use super::ledger::{IdempotencyLedger, LedgerLookup};
use super::repository::{record_id, RecordRepository};
use super::validator::{AcceptAll, MutationValidator};
use crate::cache::InvalidationGateway;

/// Default number of changes returned per pull.
pub const DEFAULT_PULL_PAGE_SIZE: usize = 500;

/// Derives the cache subjects a written record touches.
#[derive(Debug, Clone)]
pub struct SubjectExtractor {
    /// Payload field -> subject kind it references.
    reference_fields: Vec<(String, SubjectKind)>,
    /// Entity type -> subject kind the record itself is.
    entity_subjects: HashMap<String, SubjectKind>,
    /// Payload field carrying the scope, usually a date.
    scope_field: Option<String>,
}

impl Default for SubjectExtractor {
    fn default() -> Self {
        Self::empty()
            .with_reference("student_id", SubjectKind::student())
            .with_reference("section_id", SubjectKind::section())
            .with_entity_subject("student", SubjectKind::student())
            .with_entity_subject("section", SubjectKind::section())
            .with_scope_field("date")
    }
}

impl SubjectExtractor {
    pub fn empty() -> Self {
        Self {
            reference_fields: Vec::new(),
            entity_subjects: HashMap::new(),
            scope_field: None,
        }
    }

    pub fn with_reference(mut self, field: impl Into<String>, kind: SubjectKind) -> Self {
        self.reference_fields.push((field.into(), kind));
        self
    }

    pub fn with_entity_subject(mut self, entity_type: impl Into<String>, kind: SubjectKind) -> Self {
        self.entity_subjects.insert(entity_type.into(), kind);
        self
    }

    pub fn with_scope_field(mut self, field: impl Into<String>) -> Self {
        self.scope_field = Some(field.into());
        self
    }

    /// Invalidation events for a record version.
    pub fn events(&self, entity_type: &str, record: &Payload) -> Vec<InvalidationEvent> {
        let scope = self
            .scope_field
            .as_ref()
            .and_then(|field| record.get(field))
            .and_then(Value::as_str)
            .map(ScopeKey::new);

        let mut by_kind: Vec<(SubjectKind, Vec<String>)> = Vec::new();
        let mut push = |kind: &SubjectKind, id: &str| match by_kind.iter_mut().find(|(k, _)| k == kind) {
            Some((_, ids)) => {
                if !ids.iter().any(|i| i == id) {
                    ids.push(id.to_string());
                }
            }
            None => by_kind.push((kind.clone(), vec![id.to_string()])),
        };

        if let Some(kind) = self.entity_subjects.get(entity_type) {
            if let Some(id) = record.get(RECORD_ID_FIELD).and_then(Value::as_str) {
                push(kind, id);
            }
        }
        for (field, kind) in &self.reference_fields {
            match record.get(field) {
                Some(Value::String(id)) => push(kind, id.as_str()),
                Some(Value::Array(ids)) => {
                    for id in ids.iter().filter_map(Value::as_str) {
                        push(kind, id);
                    }
                }
                _ => {}
            }
        }

        by_kind
            .into_iter()
            .map(|(kind, ids)| {
                let event = InvalidationEvent::new(kind, ids);
                match &scope {
                    Some(scope) => event.with_scope(scope.clone()),
                    None => event,
                }
            })
            .collect()
    }
}

/// Server side of the sync protocol.
pub struct SyncService {
    repository: Arc<dyn RecordRepository>,
    feed: Arc<dyn ChangeFeed>,
    gateway: Arc<dyn InvalidationGateway>,
    validator: Arc<dyn MutationValidator>,
    extractor: SubjectExtractor,
    ledger: IdempotencyLedger,
    clock: Arc<dyn Clock>,
    pull_page_size: usize,
    tenant_locks: Mutex<HashMap<TenantId, Arc<Mutex<()>>>>,
}

impl SyncService {
    pub fn new(
        repository: Arc<dyn RecordRepository>,
        feed: Arc<dyn ChangeFeed>,
        gateway: Arc<dyn InvalidationGateway>,
    ) -> Self {
        Self {
            repository,
            feed,
            gateway,
            validator: Arc::new(AcceptAll),
            extractor: SubjectExtractor::default(),
            ledger: IdempotencyLedger::new(),
            clock: Arc::new(SystemClock),
            pull_page_size: DEFAULT_PULL_PAGE_SIZE,
            tenant_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn MutationValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_extractor(mut self, extractor: SubjectExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    pub fn ledger(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    pub fn repository(&self) -> &Arc<dyn RecordRepository> {
        &self.repository
    }

    /// Drop feed entries superseded by newer versions of the same record.
    pub async fn compact_feed(&self) -> ClassmarkResult<u64> {
        self.feed.compact().await
    }

    async fn tenant_lock(&self, tenant_id: TenantId) -> Arc<Mutex<()>> {
        let mut locks = self.tenant_locks.lock().await;
        Arc::clone(locks.entry(tenant_id).or_default())
    }

    /// Apply a push request.
    ///
    /// Items are applied in request order under a per-tenant lock. Each item
    /// is independent: one failing does not affect the others.
    pub async fn apply_push(
        &self,
        tenant_id: TenantId,
        request: PushRequest,
    ) -> ClassmarkResult<PushResponse> {
        let lock = self.tenant_lock(tenant_id).await;
        let _guard = lock.lock().await;

        let mut results = Vec::with_capacity(request.items.len());
        for item in &request.items {
            results.push(self.apply_item(tenant_id, item).await);
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            tenant_id = %tenant_id,
            items = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            "Push applied"
        );
        Ok(PushResponse { results })
    }

    async fn apply_item(&self, tenant_id: TenantId, item: &PushItem) -> PushItemResult {
        match self.ledger.lookup(tenant_id, item).await {
            LedgerLookup::Replay(result) => {
                debug!(temp_id = %item.temp_id, "Replayed push item");
                return result;
            }
            LedgerLookup::Mismatch => {
                warn!(temp_id = %item.temp_id, "Temp id reused with a different payload");
                return PushItemResult::error(
                    item.temp_id.clone(),
                    PushErrorKind::Conflict,
                    "temp id was already used for a different mutation",
                );
            }
            LedgerLookup::New => {}
        }

        let result = match self.write(tenant_id, item).await {
            Ok((server_id, record)) => {
                self.invalidate_for(tenant_id, &item.entity, &record).await;
                PushItemResult::success(item.temp_id.clone(), server_id, self.clock.now())
            }
            Err(err) => {
                let kind = error_kind(&err);
                debug!(temp_id = %item.temp_id, error = %err, ?kind, "Push item rejected");
                PushItemResult::error(item.temp_id.clone(), kind, err.to_string())
            }
        };

        // Server faults are not remembered so a retry re-applies.
        if result.error_kind != Some(PushErrorKind::Server) {
            self.ledger
                .record(tenant_id, item, result.clone(), self.clock.now())
                .await;
        }
        result
    }

    /// Validate and write one item. Returns the server id and every record
    /// version whose subjects must be invalidated.
    async fn write(
        &self,
        tenant_id: TenantId,
        item: &PushItem,
    ) -> ClassmarkResult<(ServerId, Vec<Payload>)> {
        self.validator.validate(item)?;

        let mut touched = Vec::with_capacity(2);
        let written = match item.action {
            MutationAction::Create => {
                self.repository
                    .create(tenant_id, &item.entity, item.data.clone())
                    .await?
            }
            MutationAction::Update => {
                let id = record_id(&item.data)?;
                if let Some(prior) = self.repository.get(tenant_id, &item.entity, &id).await? {
                    touched.push(prior);
                }
                self.repository
                    .update(tenant_id, &item.entity, &id, item.data.clone())
                    .await?
            }
        };

        let server_id = record_id(&written)?;
        let stamped = self.feed.record_change(tenant_id, &item.entity, written).await?;
        touched.push(stamped);
        Ok((server_id, touched))
    }

    async fn invalidate_for(&self, tenant_id: TenantId, entity_type: &str, records: &[Payload]) {
        let mut events: Vec<InvalidationEvent> = Vec::new();
        for record in records {
            for event in self.extractor.events(entity_type, record) {
                if !events.contains(&event) {
                    events.push(event);
                }
            }
        }
        for event in &events {
            if let Err(err) = self.gateway.invalidate(tenant_id, event).await {
                warn!(
                    tenant_id = %tenant_id,
                    subject_kind = %event.subject_kind,
                    error = %err,
                    "Cache invalidation failed, entries expire by TTL"
                );
            }
        }
    }

    /// Changes since the query cursor.
    pub async fn pull(&self, tenant_id: TenantId, query: &PullQuery) -> ClassmarkResult<PullResponse> {
        let limit = query
            .limit
            .map_or(self.pull_page_size, |l| l.clamp(1, self.pull_page_size));
        let batch = self
            .feed
            .changes_since(tenant_id, query.last_synced_at.as_ref(), limit)
            .await?;

        debug!(
            tenant_id = %tenant_id,
            since = query.last_synced_at.as_ref().map(|c| c.as_str()).unwrap_or("baseline"),
            cursor = %batch.cursor,
            has_more = batch.has_more,
            "Pull served"
        );
        Ok(PullResponse {
            updates: batch.updates,
            new_sync_token: batch.cursor,
            has_more: batch.has_more,
        })
    }
}

fn error_kind(err: &ClassmarkError) -> PushErrorKind {
    match err {
        ClassmarkError::Validation(_) | ClassmarkError::Config(_) => PushErrorKind::Validation,
        ClassmarkError::Conflict { .. } => PushErrorKind::Conflict,
        ClassmarkError::Storage(_) | ClassmarkError::Transport(_) | ClassmarkError::Compute { .. } => {
            PushErrorKind::Server
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopInvalidationGateway;
    use crate::sync::feed::InMemoryChangeFeed;
    use crate::sync::repository::MemoryRecordRepository;
    use crate::sync::validator::RequiredFields;
    use async_trait::async_trait;
    use classmark_core::{PushStatus, TempId};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingGateway {
        events: Mutex<Vec<InvalidationEvent>>,
    }

    #[async_trait]
    impl InvalidationGateway for RecordingGateway {
        async fn invalidate(
            &self,
            _tenant_id: TenantId,
            event: &InvalidationEvent,
        ) -> ClassmarkResult<u64> {
            self.events.lock().await.push(event.clone());
            Ok(0)
        }
    }

    fn service_with(gateway: Arc<dyn InvalidationGateway>) -> SyncService {
        SyncService::new(
            Arc::new(MemoryRecordRepository::new()),
            Arc::new(InMemoryChangeFeed::new()),
            gateway,
        )
    }

    fn item(action: MutationAction, entity: &str, data: Value) -> PushItem {
        PushItem {
            temp_id: TempId::generate(),
            entity: entity.to_string(),
            action,
            data: data.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_same_temp_id_applies_once() {
        let service = service_with(Arc::new(NoopInvalidationGateway));
        let tenant = TenantId::now_v7();
        let create = item(MutationAction::Create, "fee-payment", json!({ "amount": 10 }));
        let request = PushRequest { items: vec![create.clone()] };

        let first = service.apply_push(tenant, request.clone()).await.unwrap();
        let second = service.apply_push(tenant, request).await.unwrap();

        assert_eq!(first.results[0].status, PushStatus::Success);
        assert_eq!(first.results[0].server_id, second.results[0].server_id);
        assert_eq!(
            service.repository().list(tenant, "fee-payment").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_items_are_independent() {
        let service = service_with(Arc::new(NoopInvalidationGateway)).with_validator(Arc::new(
            RequiredFields::new().require("attendance-record", ["student_id"]),
        ));
        let tenant = TenantId::now_v7();
        let good = item(MutationAction::Create, "attendance-record", json!({ "student_id": "42" }));
        let bad = item(MutationAction::Create, "attendance-record", json!({}));

        let response = service
            .apply_push(tenant, PushRequest { items: vec![bad, good] })
            .await
            .unwrap();

        assert_eq!(response.results[0].error_kind, Some(PushErrorKind::Validation));
        assert!(response.results[1].is_success());
    }

    #[tokio::test]
    async fn test_update_of_unknown_record_is_validation_error() {
        let service = service_with(Arc::new(NoopInvalidationGateway));
        let update = item(MutationAction::Update, "student", json!({ "id": "missing", "name": "x" }));
        let response = service
            .apply_push(TenantId::now_v7(), PushRequest { items: vec![update] })
            .await
            .unwrap();
        assert_eq!(response.results[0].error_kind, Some(PushErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_reused_temp_id_with_new_body_conflicts() {
        let service = service_with(Arc::new(NoopInvalidationGateway));
        let tenant = TenantId::now_v7();
        let original = item(MutationAction::Create, "fee-payment", json!({ "amount": 10 }));
        let mut tampered = original.clone();
        tampered.data.insert("amount".to_string(), json!(99));

        service
            .apply_push(tenant, PushRequest { items: vec![original] })
            .await
            .unwrap();
        let response = service
            .apply_push(tenant, PushRequest { items: vec![tampered] })
            .await
            .unwrap();

        assert_eq!(response.results[0].error_kind, Some(PushErrorKind::Conflict));
    }

    #[tokio::test]
    async fn test_write_invalidates_referenced_subjects() {
        let gateway = Arc::new(RecordingGateway::default());
        let service = service_with(gateway.clone());
        let create = item(
            MutationAction::Create,
            "attendance-record",
            json!({ "student_id": "42", "section_id": "7", "date": "2024-05-01" }),
        );

        service
            .apply_push(TenantId::now_v7(), PushRequest { items: vec![create] })
            .await
            .unwrap();

        let events = gateway.events.lock().await;
        let scope = Some(ScopeKey::new("2024-05-01"));
        assert!(events.iter().any(|e| e.subject_kind == SubjectKind::student()
            && e.subject_ids == vec!["42".to_string()]
            && e.scope_key == scope));
        assert!(events.iter().any(|e| e.subject_kind == SubjectKind::section()));
    }

    #[tokio::test]
    async fn test_pull_returns_applied_records() {
        let service = service_with(Arc::new(NoopInvalidationGateway));
        let tenant = TenantId::now_v7();
        let create = item(MutationAction::Create, "student", json!({ "name": "Ada" }));
        service
            .apply_push(tenant, PushRequest { items: vec![create] })
            .await
            .unwrap();

        let baseline = service.pull(tenant, &PullQuery::default()).await.unwrap();
        assert_eq!(baseline.record_count(), 1);

        let delta = service
            .pull(
                tenant,
                &PullQuery {
                    last_synced_at: Some(baseline.new_sync_token.clone()),
                    limit: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(delta.record_count(), 0);
        assert_eq!(delta.new_sync_token, baseline.new_sync_token);
    }

    #[test]
    fn test_extractor_default_rules() {
        let extractor = SubjectExtractor::default();
        let record = json!({ "id": "s-1", "section_id": "7" }).as_object().cloned().unwrap();
        let events = extractor.events("student", &record);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].subject_kind, SubjectKind::student());
        assert_eq!(events[0].subject_ids, vec!["s-1".to_string()]);
        assert!(events.iter().all(|e| e.scope_key.is_none()));
    }
}
