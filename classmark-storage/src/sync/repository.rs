//! Authoritative record storage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use classmark_core::{
    ClassmarkResult, Payload, ServerId, StorageError, TenantId, ValidationError, RECORD_ID_FIELD,
};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Record store behind the sync service.
///
/// Records are open field maps. The server id lives in the `id` field.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Insert a new record and assign its server id.
    async fn create(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        fields: Payload,
    ) -> ClassmarkResult<Payload>;

    /// Merge `fields` into an existing record.
    ///
    /// A missing record is a validation error: the client referenced
    /// something the server never accepted.
    async fn update(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        id: &ServerId,
        fields: Payload,
    ) -> ClassmarkResult<Payload>;

    async fn get(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        id: &ServerId,
    ) -> ClassmarkResult<Option<Payload>>;

    /// All records of an entity type, ordered by id.
    async fn list(&self, tenant_id: TenantId, entity_type: &str) -> ClassmarkResult<Vec<Payload>>;
}

type TableKey = (TenantId, String);

/// In-memory [`RecordRepository`].
#[derive(Debug, Default)]
pub struct MemoryRecordRepository {
    tables: RwLock<HashMap<TableKey, BTreeMap<ServerId, Payload>>>,
}

impl MemoryRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of an entity type for a tenant.
    pub async fn count(&self, tenant_id: TenantId, entity_type: &str) -> usize {
        self.tables
            .read()
            .await
            .get(&(tenant_id, entity_type.to_string()))
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl RecordRepository for MemoryRecordRepository {
    async fn create(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        mut fields: Payload,
    ) -> ClassmarkResult<Payload> {
        let id = ServerId::new(Uuid::now_v7().to_string());
        fields.insert(RECORD_ID_FIELD.to_string(), Value::String(id.to_string()));

        let mut tables = self.tables.write().await;
        tables
            .entry((tenant_id, entity_type.to_string()))
            .or_default()
            .insert(id, fields.clone());
        Ok(fields)
    }

    async fn update(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        id: &ServerId,
        fields: Payload,
    ) -> ClassmarkResult<Payload> {
        let mut tables = self.tables.write().await;
        let record = tables
            .get_mut(&(tenant_id, entity_type.to_string()))
            .and_then(|table| table.get_mut(id))
            .ok_or_else(|| ValidationError::InvalidValue {
                field: RECORD_ID_FIELD.to_string(),
                reason: format!("{entity_type} {id} does not exist"),
            })?;

        for (field, value) in fields {
            if field == RECORD_ID_FIELD {
                continue;
            }
            record.insert(field, value);
        }
        Ok(record.clone())
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        id: &ServerId,
    ) -> ClassmarkResult<Option<Payload>> {
        Ok(self
            .tables
            .read()
            .await
            .get(&(tenant_id, entity_type.to_string()))
            .and_then(|table| table.get(id))
            .cloned())
    }

    async fn list(&self, tenant_id: TenantId, entity_type: &str) -> ClassmarkResult<Vec<Payload>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&(tenant_id, entity_type.to_string()))
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Server id named by a record's `id` field.
pub(crate) fn record_id(record: &Payload) -> ClassmarkResult<ServerId> {
    record
        .get(RECORD_ID_FIELD)
        .and_then(Value::as_str)
        .map(ServerId::new)
        .ok_or_else(|| {
            StorageError::Corrupt {
                target: "record".to_string(),
                reason: "record has no id".to_string(),
            }
            .into()
        })
}
