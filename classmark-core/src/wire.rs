//! Request and response bodies exchanged between client and server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::identity::{ServerId, TempId, Timestamp};
use crate::mutation::{MutationAction, Payload};

// =============================================================================
// PUSH
// =============================================================================

/// One mutation as sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    pub temp_id: TempId,
    pub entity: String,
    pub action: MutationAction,
    pub data: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub items: Vec<PushItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushStatus {
    Success,
    Error,
}

/// Server-side classification of an item error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushErrorKind {
    Validation,
    Conflict,
    Server,
}

/// Per-item outcome of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItemResult {
    pub temp_id: TempId,
    pub status: PushStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<PushErrorKind>,
}

impl PushItemResult {
    pub fn success(temp_id: TempId, server_id: ServerId, synced_at: Timestamp) -> Self {
        Self {
            temp_id,
            status: PushStatus::Success,
            server_id: Some(server_id),
            synced_at: Some(synced_at),
            error: None,
            error_kind: None,
        }
    }

    pub fn error(temp_id: TempId, kind: PushErrorKind, message: impl Into<String>) -> Self {
        Self {
            temp_id,
            status: PushStatus::Error,
            server_id: None,
            synced_at: None,
            error: Some(message.into()),
            error_kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PushStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<PushItemResult>,
}

// =============================================================================
// PULL
// =============================================================================

/// Opaque change-feed position issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Query string of `GET /sync/pull`. No cursor means full snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<SyncCursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Server changes since a cursor, grouped by entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub updates: BTreeMap<String, Vec<Value>>,
    pub new_sync_token: SyncCursor,
    /// More changes remain past `new_sync_token`.
    #[serde(default)]
    pub has_more: bool,
}

impl PullResponse {
    pub fn record_count(&self) -> usize {
        self.updates.values().map(Vec::len).sum()
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// Body of `POST /cache/invalidate`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateCacheRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl InvalidateCacheRequest {
    pub fn is_empty(&self) -> bool {
        self.student_id.is_none()
            && self.student_ids.as_ref().map_or(true, Vec::is_empty)
            && self.section_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateCacheResponse {
    /// Entries marked stale by this request.
    pub invalidated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub stale_reads: u64,
    pub invalidated_entries: u64,
    pub rejected_puts: u64,
    pub entry_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_push_item_wire_shape() {
        let item = PushItem {
            temp_id: TempId::from_raw("tmp-1"),
            entity: "attendance-record".to_string(),
            action: MutationAction::Create,
            data: Payload::new(),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["tempId"], json!("tmp-1"));
        assert_eq!(value["action"], json!("CREATE"));
    }

    #[test]
    fn test_push_result_omits_absent_fields() {
        let ok = PushItemResult::success(TempId::from_raw("tmp-1"), ServerId::new("s1"), Utc::now());
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], json!("SUCCESS"));
        assert!(value.get("error").is_none());

        let err = PushItemResult::error(TempId::from_raw("tmp-2"), PushErrorKind::Validation, "bad");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["errorKind"], json!("validation"));
        assert!(value.get("serverId").is_none());
    }

    #[test]
    fn test_invalidate_request_accepts_partial_body() {
        let req: InvalidateCacheRequest =
            serde_json::from_value(json!({ "sectionId": "section-7", "date": "2024-05-01" })).unwrap();
        assert_eq!(req.section_id.as_deref(), Some("section-7"));
        assert!(req.student_id.is_none());
        assert!(!req.is_empty());

        let empty: InvalidateCacheRequest = serde_json::from_value(json!({})).unwrap();
        assert!(empty.is_empty());
    }
}
