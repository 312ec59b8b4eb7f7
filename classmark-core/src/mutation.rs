//! Queued mutation envelope and payload helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::identity::{ServerId, StreamKey, TempId, Timestamp};
use crate::wire::PushItem;

/// Opaque entity payload. Its schema belongs to the entity type.
pub type Payload = serde_json::Map<String, Value>;

/// Payload field that carries the target record id of an UPDATE.
pub const RECORD_ID_FIELD: &str = "id";

/// Payload field the server stamps with the record's change-feed version.
pub const RECORD_VERSION_FIELD: &str = "_version";

/// Kind of change a mutation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationAction {
    Create,
    Update,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "CREATE",
            MutationAction::Update => "UPDATE",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queued mutation.
///
/// `Synced` and `FailedTerminal` are final. Only the push engine moves items
/// into `Sending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    Enqueued,
    Sending,
    Synced,
    FailedRetryable,
    FailedTerminal,
}

impl MutationStatus {
    /// Not yet acknowledged and not given up on.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            MutationStatus::Enqueued | MutationStatus::Sending | MutationStatus::FailedRetryable
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, MutationStatus::Synced | MutationStatus::FailedTerminal)
    }
}

/// Why the last send attempt of a mutation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, timeout or other indeterminate outcome.
    Transport,
    /// Server refused the payload.
    Validation,
    /// Server detected a conflicting write.
    Conflict,
    /// Server hit an internal error for this item.
    Server,
    /// A mutation this one depends on failed terminally.
    Dependency,
    /// Retry budget used up.
    Exhausted,
}

/// Last failure recorded against a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationFailure {
    pub kind: FailureKind,
    pub message: String,
    pub at: Timestamp,
}

/// A user action recorded locally, waiting to be delivered to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub temp_id: TempId,
    pub entity_type: String,
    pub action: MutationAction,
    pub payload: Payload,
    pub enqueued_at: Timestamp,
    pub attempts: u32,
    pub status: MutationStatus,
    pub stream_key: StreamKey,
    /// Outbox-local monotonic insertion order.
    pub sequence: u64,
    /// Temp ids of earlier CREATEs referenced from this payload.
    #[serde(default)]
    pub depends_on: Vec<TempId>,
    #[serde(default)]
    pub next_attempt_at: Option<Timestamp>,
    #[serde(default)]
    pub last_error: Option<MutationFailure>,
}

impl QueuedMutation {
    pub fn new(
        sequence: u64,
        entity_type: impl Into<String>,
        action: MutationAction,
        payload: Payload,
        stream_key: StreamKey,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            temp_id: TempId::generate(),
            entity_type: entity_type.into(),
            action,
            payload,
            enqueued_at,
            attempts: 0,
            status: MutationStatus::Enqueued,
            stream_key,
            sequence,
            depends_on: Vec::new(),
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Record id this mutation targets, if the payload names one.
    pub fn target_record_id(&self) -> Option<&str> {
        self.payload.get(RECORD_ID_FIELD).and_then(Value::as_str)
    }

    /// Whether the item may be sent at `now`, ignoring stream order and
    /// dependencies.
    pub fn is_sendable_at(&self, now: Timestamp) -> bool {
        match self.status {
            MutationStatus::Enqueued => true,
            MutationStatus::FailedRetryable => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    pub fn to_push_item(&self) -> PushItem {
        PushItem {
            temp_id: self.temp_id.clone(),
            entity: self.entity_type.clone(),
            action: self.action,
            data: self.payload.clone(),
        }
    }
}

/// Collect every temp id referenced anywhere in the payload.
///
/// Nested objects and arrays are walked. Duplicates are returned once, in
/// first-seen order.
pub fn collect_temp_refs(payload: &Payload) -> Vec<TempId> {
    let mut found = Vec::new();
    for value in payload.values() {
        collect_value(value, &mut found);
    }
    found
}

fn collect_value(value: &Value, found: &mut Vec<TempId>) {
    match value {
        Value::String(s) if TempId::is_temp_id(s) => {
            if !found.iter().any(|t| t.as_str() == s) {
                found.push(TempId::from_raw(s.clone()));
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_value(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_value(v, found)),
        _ => {}
    }
}

/// Replace temp id references with the server ids `resolve` knows about.
///
/// Returns the number of replaced values.
pub fn remap_temp_refs<F>(payload: &mut Payload, resolve: F) -> usize
where
    F: Fn(&str) -> Option<ServerId>,
{
    let mut replaced = 0;
    for value in payload.values_mut() {
        replaced += remap_value(value, &resolve);
    }
    replaced
}

fn remap_value<F>(value: &mut Value, resolve: &F) -> usize
where
    F: Fn(&str) -> Option<ServerId>,
{
    match value {
        Value::String(s) => {
            if !TempId::is_temp_id(s) {
                return 0;
            }
            match resolve(s) {
                Some(server_id) => {
                    *s = server_id.as_str().to_string();
                    1
                }
                None => 0,
            }
        }
        Value::Array(items) => items.iter_mut().map(|v| remap_value(v, resolve)).sum(),
        Value::Object(map) => map.values_mut().map(|v| remap_value(v, resolve)).sum(),
        _ => 0,
    }
}
