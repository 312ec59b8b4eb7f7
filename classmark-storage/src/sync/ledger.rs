//! Idempotency ledger for pushed mutations.
//!
//! The client's temp id is the idempotency key. The first outcome recorded
//! for `(tenant, temp_id)` is returned for every replay, so a retried push
//! never applies twice.

use std::collections::HashMap;

use classmark_core::{PushItem, PushItemResult, TempId, TenantId, Timestamp};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct LedgerEntry {
    request_hash: String,
    result: PushItemResult,
    recorded_at: Timestamp,
}

/// Result of checking an incoming item against the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerLookup {
    /// Never seen. Apply it.
    New,
    /// Seen with an identical body. Return the stored outcome.
    Replay(PushItemResult),
    /// Same temp id, different body. Must not be applied.
    Mismatch,
}

/// Per-tenant record of applied mutations.
#[derive(Debug, Default)]
pub struct IdempotencyLedger {
    entries: RwLock<HashMap<(TenantId, TempId), LedgerEntry>>,
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 of the item's entity, action and data.
    pub fn request_hash(item: &PushItem) -> String {
        let mut hasher = Sha256::new();
        hasher.update(item.entity.as_bytes());
        hasher.update([0u8]);
        hasher.update(item.action.as_str().as_bytes());
        hasher.update([0u8]);
        // serde_json::Map is ordered by key, so the encoding is canonical.
        hasher.update(serde_json::Value::Object(item.data.clone()).to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn lookup(&self, tenant_id: TenantId, item: &PushItem) -> LedgerLookup {
        let entries = self.entries.read().await;
        match entries.get(&(tenant_id, item.temp_id.clone())) {
            None => LedgerLookup::New,
            Some(entry) if entry.request_hash == Self::request_hash(item) => {
                LedgerLookup::Replay(entry.result.clone())
            }
            Some(_) => LedgerLookup::Mismatch,
        }
    }

    /// Store the outcome of the first application. Later records for the
    /// same key are ignored.
    pub async fn record(
        &self,
        tenant_id: TenantId,
        item: &PushItem,
        result: PushItemResult,
        recorded_at: Timestamp,
    ) {
        let mut entries = self.entries.write().await;
        entries
            .entry((tenant_id, item.temp_id.clone()))
            .or_insert_with(|| LedgerEntry {
                request_hash: Self::request_hash(item),
                result,
                recorded_at,
            });
    }

    /// Forget entries recorded before `before`. Returns the number removed.
    pub async fn prune(&self, before: Timestamp) -> u64 {
        let mut entries = self.entries.write().await;
        let len = entries.len();
        entries.retain(|_, e| e.recorded_at >= before);
        (len - entries.len()) as u64
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
