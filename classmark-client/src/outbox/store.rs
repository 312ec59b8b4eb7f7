//! Durable storage seams for the outbox and the pull cursor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use classmark_core::{ClassmarkResult, Payload, QueuedMutation, ServerId, SyncCursor, TempId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::RecordRef;

/// Persistence for queued mutations and the temp-to-server id map.
///
/// Every call must be durable when it returns: the outbox writes through
/// before changing its in-memory view.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// All stored mutations, ordered by sequence.
    async fn load_mutations(&self) -> ClassmarkResult<Vec<QueuedMutation>>;

    /// Insert or replace the mutation stored under its sequence.
    async fn put_mutation(&self, mutation: &QueuedMutation) -> ClassmarkResult<()>;

    async fn remove_mutation(&self, sequence: u64) -> ClassmarkResult<()>;

    async fn load_id_map(&self) -> ClassmarkResult<HashMap<TempId, ServerId>>;

    async fn remove_id_mappings(&self, temp_ids: &[TempId]) -> ClassmarkResult<()>;

    /// Drop an acknowledged mutation and record its server id in one step.
    async fn commit_synced(
        &self,
        sequence: u64,
        temp_id: &TempId,
        server_id: &ServerId,
    ) -> ClassmarkResult<()>;
}

/// A pulled server record kept aside while a local write to it is pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldRecord {
    pub entity_type: String,
    pub record_id: String,
    pub record: Payload,
}

impl HeldRecord {
    pub fn key(&self) -> RecordRef {
        RecordRef::new(self.entity_type.clone(), self.record_id.clone())
    }
}

/// Persistence for the pull cursor and the records held back behind it.
///
/// A held record was on a page the cursor has already moved past, so it
/// must be stored together with that cursor or it would never be applied.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self) -> ClassmarkResult<Option<SyncCursor>>;

    async fn save_cursor(&self, cursor: &SyncCursor) -> ClassmarkResult<()>;

    async fn load_held(&self) -> ClassmarkResult<Vec<HeldRecord>>;

    /// Store `held` (replacing any record held under the same key) and
    /// advance the cursor in one step.
    async fn commit_page(&self, cursor: &SyncCursor, held: &[HeldRecord]) -> ClassmarkResult<()>;

    async fn release_held(&self, record: &RecordRef) -> ClassmarkResult<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    mutations: BTreeMap<u64, QueuedMutation>,
    id_map: HashMap<TempId, ServerId>,
    cursor: Option<SyncCursor>,
    held: HashMap<RecordRef, HeldRecord>,
}

/// Process-local store. Clones share state, which lets tests simulate an
/// app restart by opening a fresh outbox over the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutboxStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored mutations.
    pub async fn len(&self) -> usize {
        self.state.read().await.mutations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.mutations.is_empty()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn load_mutations(&self) -> ClassmarkResult<Vec<QueuedMutation>> {
        Ok(self.state.read().await.mutations.values().cloned().collect())
    }

    async fn put_mutation(&self, mutation: &QueuedMutation) -> ClassmarkResult<()> {
        self.state
            .write()
            .await
            .mutations
            .insert(mutation.sequence, mutation.clone());
        Ok(())
    }

    async fn remove_mutation(&self, sequence: u64) -> ClassmarkResult<()> {
        self.state.write().await.mutations.remove(&sequence);
        Ok(())
    }

    async fn load_id_map(&self) -> ClassmarkResult<HashMap<TempId, ServerId>> {
        Ok(self.state.read().await.id_map.clone())
    }

    async fn remove_id_mappings(&self, temp_ids: &[TempId]) -> ClassmarkResult<()> {
        let mut state = self.state.write().await;
        for temp_id in temp_ids {
            state.id_map.remove(temp_id);
        }
        Ok(())
    }

    async fn commit_synced(
        &self,
        sequence: u64,
        temp_id: &TempId,
        server_id: &ServerId,
    ) -> ClassmarkResult<()> {
        let mut state = self.state.write().await;
        state.mutations.remove(&sequence);
        state.id_map.insert(temp_id.clone(), server_id.clone());
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryOutboxStore {
    async fn load_cursor(&self) -> ClassmarkResult<Option<SyncCursor>> {
        Ok(self.state.read().await.cursor.clone())
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> ClassmarkResult<()> {
        self.state.write().await.cursor = Some(cursor.clone());
        Ok(())
    }

    async fn load_held(&self) -> ClassmarkResult<Vec<HeldRecord>> {
        Ok(self.state.read().await.held.values().cloned().collect())
    }

    async fn commit_page(&self, cursor: &SyncCursor, held: &[HeldRecord]) -> ClassmarkResult<()> {
        let mut state = self.state.write().await;
        for record in held {
            state.held.insert(record.key(), record.clone());
        }
        state.cursor = Some(cursor.clone());
        Ok(())
    }

    async fn release_held(&self, record: &RecordRef) -> ClassmarkResult<()> {
        self.state.write().await.held.remove(record);
        Ok(())
    }
}
