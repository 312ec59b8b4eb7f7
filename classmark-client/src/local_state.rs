//! Local record store fed by the pull engine.

use std::collections::HashMap;

use async_trait::async_trait;
use classmark_core::{
    ClassmarkResult, Payload, StorageError, RECORD_ID_FIELD, RECORD_VERSION_FIELD,
};
use serde_json::Value;
use tokio::sync::RwLock;

/// Server-authoritative records as seen by the device.
#[async_trait]
pub trait LocalRecordStore: Send + Sync {
    /// Apply a server record. Returns false when an equal or newer version
    /// is already stored, so re-applying a page is harmless.
    async fn upsert(&self, entity_type: &str, record: Payload) -> ClassmarkResult<bool>;

    async fn get(&self, entity_type: &str, record_id: &str) -> ClassmarkResult<Option<Payload>>;

    async fn count(&self, entity_type: &str) -> ClassmarkResult<usize>;
}

pub(crate) fn record_version(record: &Payload) -> Option<u64> {
    record.get(RECORD_VERSION_FIELD).and_then(Value::as_u64)
}

/// In-memory [`LocalRecordStore`].
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    records: RwLock<HashMap<(String, String), Payload>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalRecordStore for MemoryLocalStore {
    async fn upsert(&self, entity_type: &str, record: Payload) -> ClassmarkResult<bool> {
        let Some(id) = record.get(RECORD_ID_FIELD).and_then(Value::as_str) else {
            return Err(StorageError::WriteFailed {
                target: entity_type.to_string(),
                reason: "record has no id".to_string(),
            }
            .into());
        };
        let key = (entity_type.to_string(), id.to_string());

        let mut records = self.records.write().await;
        if let (Some(existing), Some(incoming)) = (
            records.get(&key).and_then(record_version),
            record_version(&record),
        ) {
            if existing >= incoming {
                return Ok(false);
            }
        }
        records.insert(key, record);
        Ok(true)
    }

    async fn get(&self, entity_type: &str, record_id: &str) -> ClassmarkResult<Option<Payload>> {
        let key = (entity_type.to_string(), record_id.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn count(&self, entity_type: &str) -> ClassmarkResult<usize> {
        let records = self.records.read().await;
        Ok(records.keys().filter(|(e, _)| e == entity_type).count())
    }
}
