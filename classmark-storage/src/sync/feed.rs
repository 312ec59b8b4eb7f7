//! Change feed backing the pull endpoint.
//!
//! Every committed record version is appended with a per-tenant sequence.
//! The sequence doubles as the record's `_version` and as the cursor handed
//! to clients.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use classmark_core::{
    Clock, ClassmarkResult, Payload, SyncCursor, SystemClock, TenantId, Timestamp,
    ValidationError, RECORD_VERSION_FIELD,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const CURSOR_PREFIX: char = 'c';

/// One entry of the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub sequence: u64,
    pub entity_type: String,
    pub record_id: String,
    pub record: Payload,
    pub changed_at: Timestamp,
}

/// A page of changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Latest version of each changed record, grouped by entity type.
    pub updates: BTreeMap<String, Vec<Value>>,
    pub cursor: SyncCursor,
    pub has_more: bool,
}

/// Change feed for serving pulls.
///
/// # Implementation Notes
///
/// - Sequences are monotonically increasing per tenant.
/// - `changes_since` with the same cursor returns the same changes or a
///   superset, never fewer.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Append a committed record version. Stamps `_version` on the record
    /// and returns the stamped copy.
    async fn record_change(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        record: Payload,
    ) -> ClassmarkResult<Payload>;

    /// Changes after `cursor`. No cursor means from the beginning.
    async fn changes_since(
        &self,
        tenant_id: TenantId,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> ClassmarkResult<ChangeBatch>;

    /// Cursor pointing at the newest change.
    async fn current_cursor(&self, tenant_id: TenantId) -> ClassmarkResult<SyncCursor>;

    /// Drop entries superseded by a newer version of the same record, across
    /// every tenant. Returns the number of entries dropped.
    async fn compact(&self) -> ClassmarkResult<u64>;
}

pub(crate) fn encode_cursor(sequence: u64) -> SyncCursor {
    SyncCursor::new(format!("{CURSOR_PREFIX}{sequence}"))
}

pub(crate) fn decode_cursor(cursor: &SyncCursor) -> ClassmarkResult<u64> {
    cursor
        .as_str()
        .strip_prefix(CURSOR_PREFIX)
        .and_then(|rest| rest.parse::<u64>().ok())
        .ok_or_else(|| {
            ValidationError::InvalidValue {
                field: "last_synced_at".to_string(),
                reason: format!("unrecognised sync token '{cursor}'"),
            }
            .into()
        })
}

#[derive(Debug, Default)]
struct TenantFeed {
    sequence: u64,
    log: Vec<ChangeRecord>,
}

/// In-memory change feed.
///
/// Uses tokio::sync::RwLock for safe async access.
#[derive(Debug)]
pub struct InMemoryChangeFeed {
    feeds: RwLock<HashMap<TenantId, TenantFeed>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            feeds: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn record_change(
        &self,
        tenant_id: TenantId,
        entity_type: &str,
        mut record: Payload,
    ) -> ClassmarkResult<Payload> {
        let record_id = super::repository::record_id(&record)?;
        let mut feeds = self.feeds.write().await;
        let feed = feeds.entry(tenant_id).or_default();

        feed.sequence += 1;
        record.insert(RECORD_VERSION_FIELD.to_string(), Value::from(feed.sequence));
        feed.log.push(ChangeRecord {
            sequence: feed.sequence,
            entity_type: entity_type.to_string(),
            record_id: record_id.to_string(),
            record: record.clone(),
            changed_at: self.clock.now(),
        });
        Ok(record)
    }

    async fn changes_since(
        &self,
        tenant_id: TenantId,
        cursor: Option<&SyncCursor>,
        limit: usize,
    ) -> ClassmarkResult<ChangeBatch> {
        let mut after = match cursor {
            Some(cursor) => decode_cursor(cursor)?,
            None => 0,
        };

        let feeds = self.feeds.read().await;
        let (current, log) = match feeds.get(&tenant_id) {
            Some(feed) => (feed.sequence, feed.log.as_slice()),
            None => (0, &[][..]),
        };
        if after > current {
            warn!(tenant_id = %tenant_id, after, current, "Sync token ahead of feed, sending full baseline");
            after = 0;
        }

        let pending: Vec<&ChangeRecord> = log.iter().filter(|c| c.sequence > after).collect();
        let limit = limit.max(1);
        let page = &pending[..pending.len().min(limit)];
        let has_more = pending.len() > page.len();
        let cursor_seq = match page.last() {
            Some(change) if has_more => change.sequence,
            _ => current,
        };

        // Keep only the newest version of each record inside the page.
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        let mut newest_first: Vec<&ChangeRecord> = Vec::new();
        for change in page.iter().rev() {
            if seen.insert((change.entity_type.as_str(), change.record_id.as_str())) {
                newest_first.push(change);
            }
        }

        let mut updates: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for change in newest_first.into_iter().rev() {
            updates
                .entry(change.entity_type.clone())
                .or_default()
                .push(Value::Object(change.record.clone()));
        }

        Ok(ChangeBatch {
            updates,
            cursor: encode_cursor(cursor_seq),
            has_more,
        })
    }

    async fn current_cursor(&self, tenant_id: TenantId) -> ClassmarkResult<SyncCursor> {
        let feeds = self.feeds.read().await;
        Ok(encode_cursor(feeds.get(&tenant_id).map_or(0, |f| f.sequence)))
    }

    async fn compact(&self) -> ClassmarkResult<u64> {
        let mut feeds = self.feeds.write().await;
        let mut dropped = 0u64;
        for (tenant_id, feed) in feeds.iter_mut() {
            let mut newest: HashMap<(String, String), u64> = HashMap::new();
            for change in &feed.log {
                newest.insert(
                    (change.entity_type.clone(), change.record_id.clone()),
                    change.sequence,
                );
            }
            let before = feed.log.len();
            feed.log.retain(|c| {
                newest.get(&(c.entity_type.clone(), c.record_id.clone())) == Some(&c.sequence)
            });
            let removed = (before - feed.log.len()) as u64;
            if removed > 0 {
                debug!(tenant_id = %tenant_id, removed, "Compacted change feed");
            }
            dropped += removed;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classmark_core::RECORD_ID_FIELD;
    use serde_json::json;

    fn record_version(record: &Value) -> Option<u64> {
        record.get(RECORD_VERSION_FIELD).and_then(Value::as_u64)
    }

    fn record_id_of(record: &Value) -> Option<&str> {
        record.get(RECORD_ID_FIELD).and_then(Value::as_str)
    }

    fn record(id: &str, value: i64) -> Payload {
        json!({ "id": id, "value": value }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_baseline_then_incremental() {
        let feed = InMemoryChangeFeed::new();
        let tenant = TenantId::now_v7();
        feed.record_change(tenant, "student", record("a", 1)).await.unwrap();
        feed.record_change(tenant, "student", record("b", 1)).await.unwrap();

        let baseline = feed.changes_since(tenant, None, 100).await.unwrap();
        assert_eq!(baseline.updates["student"].len(), 2);
        assert!(!baseline.has_more);

        feed.record_change(tenant, "student", record("a", 2)).await.unwrap();
        let delta = feed
            .changes_since(tenant, Some(&baseline.cursor), 100)
            .await
            .unwrap();
        assert_eq!(delta.updates["student"].len(), 1);
        assert_eq!(delta.updates["student"][0]["value"], json!(2));
        assert_eq!(record_version(&delta.updates["student"][0]), Some(3));
    }

    #[tokio::test]
    async fn test_latest_version_per_record() {
        let feed = InMemoryChangeFeed::new();
        let tenant = TenantId::now_v7();
        for v in 1..=3 {
            feed.record_change(tenant, "fee", record("x", v)).await.unwrap();
        }

        let batch = feed.changes_since(tenant, None, 100).await.unwrap();
        assert_eq!(batch.updates["fee"].len(), 1);
        assert_eq!(batch.updates["fee"][0]["value"], json!(3));
        assert_eq!(batch.cursor, encode_cursor(3));
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_stable() {
        let feed = InMemoryChangeFeed::new();
        let tenant = TenantId::now_v7();
        feed.record_change(tenant, "student", record("a", 1)).await.unwrap();
        let cursor = feed.current_cursor(tenant).await.unwrap();
        feed.record_change(tenant, "student", record("b", 1)).await.unwrap();

        let first = feed.changes_since(tenant, Some(&cursor), 100).await.unwrap();
        let second = feed.changes_since(tenant, Some(&cursor), 100).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_paging_sets_has_more() {
        let feed = InMemoryChangeFeed::new();
        let tenant = TenantId::now_v7();
        for id in ["a", "b", "c"] {
            feed.record_change(tenant, "student", record(id, 1)).await.unwrap();
        }

        let page = feed.changes_since(tenant, None, 2).await.unwrap();
        assert!(page.has_more);
        assert_eq!(page.cursor, encode_cursor(2));

        let rest = feed.changes_since(tenant, Some(&page.cursor), 2).await.unwrap();
        assert!(!rest.has_more);
        assert_eq!(rest.updates["student"].len(), 1);
        assert_eq!(record_id_of(&rest.updates["student"][0]), Some("c"));
    }

    #[tokio::test]
    async fn test_empty_feed_and_bad_token() {
        let feed = InMemoryChangeFeed::new();
        let tenant = TenantId::now_v7();

        let batch = feed.changes_since(tenant, None, 10).await.unwrap();
        assert!(batch.updates.is_empty());
        assert_eq!(batch.cursor, encode_cursor(0));

        let err = feed
            .changes_since(tenant, Some(&SyncCursor::new("garbage")), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, classmark_core::ClassmarkError::Validation(_)));
    }

    #[tokio::test]
    async fn test_compact_keeps_latest_versions() {
        let feed = InMemoryChangeFeed::new();
        let tenant = TenantId::now_v7();
        feed.record_change(tenant, "student", record("a", 1)).await.unwrap();
        feed.record_change(tenant, "student", record("a", 2)).await.unwrap();
        feed.record_change(tenant, "student", record("b", 1)).await.unwrap();
        let other = TenantId::now_v7();
        feed.record_change(other, "student", record("a", 1)).await.unwrap();
        feed.record_change(other, "student", record("a", 2)).await.unwrap();
        let cursor = feed.current_cursor(tenant).await.unwrap();

        assert_eq!(feed.compact().await.unwrap(), 2);
        let batch = feed.changes_since(tenant, None, 100).await.unwrap();
        assert_eq!(batch.updates["student"].len(), 2);
        let batch = feed.changes_since(other, None, 100).await.unwrap();
        assert_eq!(batch.updates["student"].len(), 1);
        assert_eq!(feed.current_cursor(tenant).await.unwrap(), cursor);
    }

    fn latest_by_record(batches: &[ChangeBatch]) -> BTreeMap<String, Value> {
        let mut latest = BTreeMap::new();
        for batch in batches {
            for record in batch.updates.values().flatten() {
                if let Some(id) = record_id_of(record) {
                    latest.insert(id.to_string(), record["value"].clone());
                }
            }
        }
        latest
    }

    proptest::proptest! {
        #[test]
        fn prop_paged_pull_matches_single_pull(
            writes in proptest::collection::vec((0u8..6, 0i64..100), 1..40),
            limit in 1usize..8,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (paged, whole) = runtime.block_on(async {
                let feed = InMemoryChangeFeed::new();
                let tenant = TenantId::now_v7();
                for (id, value) in &writes {
                    let id = format!("r{id}");
                    feed.record_change(tenant, "student", record(&id, *value)).await.unwrap();
                }

                let mut pages = Vec::new();
                let mut cursor = None;
                loop {
                    let page = feed.changes_since(tenant, cursor.as_ref(), limit).await.unwrap();
                    let more = page.has_more;
                    cursor = Some(page.cursor.clone());
                    pages.push(page);
                    if !more {
                        break;
                    }
                }
                let whole = feed.changes_since(tenant, None, usize::MAX).await.unwrap();
                (pages, whole)
            });

            proptest::prop_assert_eq!(latest_by_record(&paged), latest_by_record(&[whole]));
            proptest::prop_assert!(paged.len() <= writes.len().div_ceil(limit) + 1);
        }
    }
}
