//! Durable Outbox
//!
//! Ordered queue of mutations that have not been acknowledged by the server.
//! The outbox writes every state change to its [`OutboxStore`] before
//! updating its in-memory view, so a crash at any point loses nothing that
//! `enqueue` already returned for.
//!
//! Ordering works per stream: only the oldest pending mutation of a stream
//! is ever handed to the push engine, and a mutation that references the
//! temp id of an unacknowledged CREATE waits until that CREATE has a server
//! id. Terminal failures leave the queue's pending set and do not block
//! their stream.

mod lmdb;
mod store;

pub use lmdb::{LmdbOutboxError, LmdbOutboxStore};
pub use store::{CursorStore, HeldRecord, MemoryOutboxStore, OutboxStore};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use classmark_core::{
    collect_temp_refs, remap_temp_refs, BackoffPolicy, ClassmarkResult, Clock, FailureClass,
    FailureKind, MutationAction, MutationFailure, MutationStatus, Payload, QueuedMutation,
    ServerId, StorageError, StreamKey, SystemClock, TempId, Timestamp,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A server record identified by entity type and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub entity_type: String,
    pub record_id: String,
}

impl RecordRef {
    pub fn new(entity_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            record_id: record_id.into(),
        }
    }
}

/// What happened to a mutation reported as failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Will be offered again once `next_attempt_at` passes.
    RetryScheduled {
        attempts: u32,
        next_attempt_at: Timestamp,
    },
    /// Given up on. `cascaded` lists dependents failed along with it.
    Terminal { cascaded: Vec<TempId> },
}

#[derive(Debug, Default)]
struct OutboxState {
    items: BTreeMap<u64, QueuedMutation>,
    by_temp_id: HashMap<TempId, u64>,
    id_map: HashMap<TempId, ServerId>,
    next_sequence: u64,
}

impl OutboxState {
    fn sequence_of(&self, temp_id: &TempId) -> ClassmarkResult<u64> {
        self.by_temp_id.get(temp_id).copied().ok_or_else(|| {
            StorageError::MutationNotFound {
                temp_id: temp_id.to_string(),
            }
            .into()
        })
    }

    fn is_unresolved(&self, temp_id: &TempId) -> bool {
        self.by_temp_id
            .get(temp_id)
            .and_then(|seq| self.items.get(seq))
            .is_some_and(|m| m.status.is_pending())
    }

    fn is_terminal(&self, temp_id: &TempId) -> bool {
        self.by_temp_id
            .get(temp_id)
            .and_then(|seq| self.items.get(seq))
            .is_some_and(|m| m.status == MutationStatus::FailedTerminal)
    }
}

/// Durable, ordered queue of unacknowledged mutations.
pub struct Outbox {
    state: Mutex<OutboxState>,
    store: Arc<dyn OutboxStore>,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Outbox {
    /// Open the outbox over `store`, resuming whatever it holds.
    ///
    /// Items left in `Sending` by a crash are returned to `Enqueued`.
    /// Temp-to-server id mappings no queued mutation refers to any more are
    /// dropped.
    pub async fn open(store: Arc<dyn OutboxStore>, backoff: BackoffPolicy) -> ClassmarkResult<Self> {
        Self::open_with_clock(store, backoff, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        store: Arc<dyn OutboxStore>,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> ClassmarkResult<Self> {
        backoff.validate()?;

        let mut state = OutboxState {
            id_map: store.load_id_map().await?,
            ..OutboxState::default()
        };
        for mutation in store.load_mutations().await? {
            state.next_sequence = state.next_sequence.max(mutation.sequence + 1);
            state
                .by_temp_id
                .insert(mutation.temp_id.clone(), mutation.sequence);
            state.items.insert(mutation.sequence, mutation);
        }

        let referenced: HashSet<TempId> = state
            .items
            .values()
            .flat_map(|m| collect_temp_refs(&m.payload))
            .collect();
        let stale: Vec<TempId> = state
            .id_map
            .keys()
            .filter(|temp_id| !referenced.contains(*temp_id))
            .cloned()
            .collect();
        if !stale.is_empty() {
            store.remove_id_mappings(&stale).await?;
            for temp_id in &stale {
                state.id_map.remove(temp_id);
            }
        }

        let outbox = Self {
            state: Mutex::new(state),
            store,
            backoff,
            clock,
        };
        let recovered = outbox.reset_in_flight().await?;
        let pending = outbox.pending_count().await;
        info!(pending, recovered, pruned_ids = stale.len(), "Outbox opened");
        Ok(outbox)
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Record a user action. Never touches the network.
    ///
    /// Temp ids of pending CREATEs referenced in `payload` become
    /// dependencies. Temp ids already acknowledged are rewritten to their
    /// server ids right away. If a referenced CREATE has already failed
    /// terminally, the new mutation is failed with it.
    pub async fn enqueue(
        &self,
        entity_type: impl Into<String>,
        action: MutationAction,
        mut payload: Payload,
        stream_key: StreamKey,
    ) -> ClassmarkResult<TempId> {
        let entity_type = entity_type.into();
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        remap_temp_refs(&mut payload, |raw| {
            state.id_map.get(&TempId::from_raw(raw)).cloned()
        });
        let refs = collect_temp_refs(&payload);

        let mut mutation = QueuedMutation::new(
            state.next_sequence,
            entity_type,
            action,
            payload,
            stream_key,
            now,
        );
        mutation.depends_on = refs
            .iter()
            .filter(|t| state.is_unresolved(t))
            .cloned()
            .collect();

        if let Some(failed) = refs.iter().find(|t| state.is_terminal(t)) {
            mutation.status = MutationStatus::FailedTerminal;
            mutation.last_error = Some(MutationFailure {
                kind: FailureKind::Dependency,
                message: format!("depends on failed mutation {failed}"),
                at: now,
            });
        }

        self.store.put_mutation(&mutation).await?;

        let temp_id = mutation.temp_id.clone();
        debug!(
            temp_id = %temp_id,
            entity_type = %mutation.entity_type,
            stream = %mutation.stream_key,
            sequence = mutation.sequence,
            "Mutation enqueued"
        );
        state.next_sequence += 1;
        state.by_temp_id.insert(temp_id.clone(), mutation.sequence);
        state.items.insert(mutation.sequence, mutation);
        Ok(temp_id)
    }

    /// Next mutations the push engine may send, at most one per stream.
    ///
    /// An item is offered only if it is the oldest non-terminal mutation of
    /// its stream, its retry deadline has passed, and all of its
    /// dependencies have server ids. Returned payloads have known temp ids
    /// replaced by server ids.
    pub async fn peek_batch(&self, max: usize) -> Vec<QueuedMutation> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let mut claimed: HashSet<&StreamKey> = HashSet::new();
        let mut batch = Vec::new();

        for mutation in state.items.values() {
            if batch.len() >= max {
                break;
            }
            if mutation.status == MutationStatus::FailedTerminal {
                continue;
            }
            if !claimed.insert(&mutation.stream_key) {
                continue;
            }
            if !mutation.is_sendable_at(now) {
                continue;
            }
            if mutation.depends_on.iter().any(|d| state.is_unresolved(d)) {
                continue;
            }

            let mut ready = mutation.clone();
            remap_temp_refs(&mut ready.payload, |raw| {
                state.id_map.get(&TempId::from_raw(raw)).cloned()
            });
            batch.push(ready);
        }
        batch
    }

    /// Move items to `Sending` and count the attempt.
    pub async fn mark_sending(&self, temp_ids: &[TempId]) -> ClassmarkResult<()> {
        let mut state = self.state.lock().await;
        for temp_id in temp_ids {
            let seq = state.sequence_of(temp_id)?;
            let Some(current) = state.items.get(&seq) else {
                continue;
            };
            if !matches!(
                current.status,
                MutationStatus::Enqueued | MutationStatus::FailedRetryable
            ) {
                warn!(temp_id = %temp_id, status = ?current.status, "Refusing to send mutation");
                continue;
            }
            let mut updated = current.clone();
            updated.status = MutationStatus::Sending;
            updated.attempts += 1;
            self.store.put_mutation(&updated).await?;
            state.items.insert(seq, updated);
        }
        Ok(())
    }

    /// Record the server id for an acknowledged mutation and drop it.
    ///
    /// Acknowledging an id that is no longer queued is a no-op, so a
    /// duplicate acknowledgement is harmless.
    pub async fn mark_synced(&self, temp_id: &TempId, server_id: &ServerId) -> ClassmarkResult<()> {
        let mut state = self.state.lock().await;
        let Some(seq) = state.by_temp_id.get(temp_id).copied() else {
            debug!(temp_id = %temp_id, "Ignoring acknowledgement for unknown mutation");
            return Ok(());
        };

        self.store.commit_synced(seq, temp_id, server_id).await?;

        state.items.remove(&seq);
        state.by_temp_id.remove(temp_id);
        state.id_map.insert(temp_id.clone(), server_id.clone());
        debug!(temp_id = %temp_id, server_id = %server_id, "Mutation synced");
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Retryable failures are rescheduled with backoff until the retry
    /// budget is spent, after which they turn terminal. A terminal failure
    /// also fails every pending mutation that depends on it, transitively.
    pub async fn mark_failed(
        &self,
        temp_id: &TempId,
        class: FailureClass,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> ClassmarkResult<FailureOutcome> {
        let message = message.into();
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let seq = state.sequence_of(temp_id)?;
        let Some(mut updated) = state.items.get(&seq).cloned() else {
            return Err(StorageError::MutationNotFound {
                temp_id: temp_id.to_string(),
            }
            .into());
        };

        if class == FailureClass::Retryable && !self.backoff.is_exhausted(updated.attempts) {
            let delay = self.backoff.delay_for(updated.attempts);
            let next_attempt_at =
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            updated.status = MutationStatus::FailedRetryable;
            updated.next_attempt_at = Some(next_attempt_at);
            updated.last_error = Some(MutationFailure { kind, message, at: now });
            let attempts = updated.attempts;
            self.store.put_mutation(&updated).await?;
            state.items.insert(seq, updated);
            debug!(temp_id = %temp_id, attempts, ?delay, "Mutation scheduled for retry");
            return Ok(FailureOutcome::RetryScheduled {
                attempts,
                next_attempt_at,
            });
        }

        let failure = if class == FailureClass::Retryable {
            MutationFailure {
                kind: FailureKind::Exhausted,
                message: format!(
                    "sync failed after {} attempts, needs attention: {}",
                    updated.attempts, message
                ),
                at: now,
            }
        } else {
            MutationFailure { kind, message, at: now }
        };
        warn!(
            temp_id = %temp_id,
            entity_type = %updated.entity_type,
            kind = ?failure.kind,
            reason = %failure.message,
            "Mutation failed terminally"
        );
        updated.status = MutationStatus::FailedTerminal;
        updated.next_attempt_at = None;
        updated.last_error = Some(failure);
        self.store.put_mutation(&updated).await?;
        state.items.insert(seq, updated);

        let cascaded = self.cascade_failure(&mut state, temp_id, now).await?;
        Ok(FailureOutcome::Terminal { cascaded })
    }

    async fn cascade_failure(
        &self,
        state: &mut OutboxState,
        root: &TempId,
        now: Timestamp,
    ) -> ClassmarkResult<Vec<TempId>> {
        let mut failed: HashSet<TempId> = HashSet::from([root.clone()]);
        let mut cascaded = Vec::new();
        // Dependents always have a later sequence, so one ordered pass is enough.
        let dependents: Vec<u64> = state
            .items
            .iter()
            .filter(|(_, m)| m.status.is_pending())
            .map(|(seq, _)| *seq)
            .collect();
        for seq in dependents {
            let Some(mutation) = state.items.get(&seq) else {
                continue;
            };
            let Some(parent) = mutation.depends_on.iter().find(|d| failed.contains(*d)) else {
                continue;
            };
            let mut updated = mutation.clone();
            updated.status = MutationStatus::FailedTerminal;
            updated.next_attempt_at = None;
            updated.last_error = Some(MutationFailure {
                kind: FailureKind::Dependency,
                message: format!("depends on failed mutation {parent}"),
                at: now,
            });
            self.store.put_mutation(&updated).await?;
            failed.insert(updated.temp_id.clone());
            cascaded.push(updated.temp_id.clone());
            state.items.insert(seq, updated);
        }
        Ok(cascaded)
    }

    /// Put items back to `Enqueued` without charging an attempt.
    ///
    /// Used when a request provably never reached the server.
    pub async fn requeue(&self, temp_ids: &[TempId]) -> ClassmarkResult<()> {
        let mut state = self.state.lock().await;
        for temp_id in temp_ids {
            let Some(seq) = state.by_temp_id.get(temp_id).copied() else {
                continue;
            };
            let Some(current) = state.items.get(&seq) else {
                continue;
            };
            if current.status != MutationStatus::Sending {
                continue;
            }
            let mut updated = current.clone();
            updated.status = MutationStatus::Enqueued;
            updated.attempts = updated.attempts.saturating_sub(1);
            self.store.put_mutation(&updated).await?;
            state.items.insert(seq, updated);
        }
        Ok(())
    }

    /// Return every `Sending` item to `Enqueued`. Returns how many moved.
    pub async fn reset_in_flight(&self) -> ClassmarkResult<usize> {
        let mut state = self.state.lock().await;
        let in_flight: Vec<u64> = state
            .items
            .iter()
            .filter(|(_, m)| m.status == MutationStatus::Sending)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &in_flight {
            if let Some(current) = state.items.get(seq) {
                let mut updated = current.clone();
                updated.status = MutationStatus::Enqueued;
                self.store.put_mutation(&updated).await?;
                state.items.insert(*seq, updated);
            }
        }
        Ok(in_flight.len())
    }

    pub async fn get(&self, temp_id: &TempId) -> Option<QueuedMutation> {
        let state = self.state.lock().await;
        state
            .by_temp_id
            .get(temp_id)
            .and_then(|seq| state.items.get(seq))
            .cloned()
    }

    /// Mutations not yet acknowledged and not given up on.
    pub async fn pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state.items.values().filter(|m| m.status.is_pending()).count()
    }

    /// Every queued mutation in sequence order, terminal ones included.
    pub async fn snapshot(&self) -> Vec<QueuedMutation> {
        self.state.lock().await.items.values().cloned().collect()
    }

    /// Mutations that need user attention.
    pub async fn terminal_failures(&self) -> Vec<QueuedMutation> {
        let state = self.state.lock().await;
        state
            .items
            .values()
            .filter(|m| m.status == MutationStatus::FailedTerminal)
            .cloned()
            .collect()
    }

    /// Remove a terminally failed mutation once the user has seen it.
    ///
    /// Returns false if the mutation is unknown or still pending.
    pub async fn dismiss(&self, temp_id: &TempId) -> ClassmarkResult<bool> {
        let mut state = self.state.lock().await;
        let Some(seq) = state.by_temp_id.get(temp_id).copied() else {
            return Ok(false);
        };
        let is_terminal = state
            .items
            .get(&seq)
            .is_some_and(|m| m.status == MutationStatus::FailedTerminal);
        if !is_terminal {
            return Ok(false);
        }
        self.store.remove_mutation(seq).await?;
        state.items.remove(&seq);
        state.by_temp_id.remove(temp_id);
        Ok(true)
    }

    /// Server id assigned to a temp id, once its CREATE was acknowledged.
    ///
    /// Known for the rest of the session, and across restarts for as long as
    /// a queued mutation still refers to the temp id.
    pub async fn resolve_id(&self, temp_id: &TempId) -> Option<ServerId> {
        self.state.lock().await.id_map.get(temp_id).cloned()
    }

    /// Records touched by pending mutations.
    ///
    /// The pull engine must not overwrite these with server state until the
    /// local writes are acknowledged.
    pub async fn pending_targets(&self) -> HashSet<RecordRef> {
        let state = self.state.lock().await;
        let mut targets = HashSet::new();
        for mutation in state.items.values().filter(|m| m.status.is_pending()) {
            let Some(raw) = mutation.target_record_id() else {
                continue;
            };
            let record_id = match state.id_map.get(&TempId::from_raw(raw)) {
                Some(server_id) => server_id.as_str().to_string(),
                None => raw.to_string(),
            };
            targets.insert(RecordRef::new(mutation.entity_type.clone(), record_id));
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classmark_core::ManualClock;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    fn backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }

    async fn open(store: &MemoryOutboxStore, clock: &ManualClock) -> Outbox {
        Outbox::open_with_clock(Arc::new(store.clone()), backoff(), Arc::new(clock.clone()))
            .await
            .expect("outbox should open")
    }

    async fn create(outbox: &Outbox, stream: &str, body: Value) -> TempId {
        outbox
            .enqueue("attendance", MutationAction::Create, payload(body), StreamKey::new(stream))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_is_durable_before_returning() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;

        let temp_id = create(&outbox, "attendance:s1", json!({"status": "present"})).await;

        assert!(temp_id.as_str().starts_with("tmp-"));
        assert_eq!(store.len().await, 1);
        assert_eq!(outbox.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_peek_offers_one_head_per_stream_in_order() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;

        let a1 = create(&outbox, "a", json!({"n": 1})).await;
        let a2 = create(&outbox, "a", json!({"n": 2})).await;
        let b1 = create(&outbox, "b", json!({"n": 1})).await;

        let batch: Vec<TempId> = outbox.peek_batch(10).await.into_iter().map(|m| m.temp_id).collect();
        assert_eq!(batch, vec![a1.clone(), b1.clone()]);

        outbox.mark_sending(&[a1.clone(), b1]).await.unwrap();
        assert!(outbox.peek_batch(10).await.is_empty());

        outbox.mark_synced(&a1, &ServerId::new("srv-a1")).await.unwrap();
        let batch: Vec<TempId> = outbox.peek_batch(10).await.into_iter().map(|m| m.temp_id).collect();
        assert_eq!(batch, vec![a2]);
    }

    #[tokio::test]
    async fn test_peek_respects_max() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;
        for stream in ["a", "b", "c"] {
            create(&outbox, stream, json!({})).await;
        }
        assert_eq!(outbox.peek_batch(2).await.len(), 2);
    }

    #[tokio::test]
    async fn test_dependency_waits_and_payload_is_remapped() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;

        let student = outbox
            .enqueue(
                "student",
                MutationAction::Create,
                payload(json!({"name": "Ada"})),
                StreamKey::new("student"),
            )
            .await
            .unwrap();
        let mark = create(&outbox, "attendance:x", json!({"student_id": student.as_str()})).await;

        let queued = outbox.get(&mark).await.unwrap();
        assert_eq!(queued.depends_on, vec![student.clone()]);

        let batch: Vec<TempId> = outbox.peek_batch(10).await.into_iter().map(|m| m.temp_id).collect();
        assert_eq!(batch, vec![student.clone()]);

        outbox.mark_sending(&[student.clone()]).await.unwrap();
        outbox.mark_synced(&student, &ServerId::new("stu-1")).await.unwrap();

        let batch = outbox.peek_batch(10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].temp_id, mark);
        assert_eq!(batch[0].payload["student_id"], json!("stu-1"));
        assert_eq!(outbox.resolve_id(&student).await, Some(ServerId::new("stu-1")));
    }

    #[tokio::test]
    async fn test_reopen_prunes_unreferenced_id_mappings() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;

        let lone = create(&outbox, "lone", json!({})).await;
        let parent = create(&outbox, "p", json!({})).await;
        let child = create(&outbox, "c", json!({"parent": parent.as_str()})).await;
        outbox.mark_sending(&[lone.clone(), parent.clone()]).await.unwrap();
        outbox.mark_synced(&lone, &ServerId::new("srv-lone")).await.unwrap();
        outbox.mark_synced(&parent, &ServerId::new("srv-p")).await.unwrap();

        let outbox = open(&store, &clock).await;
        assert_eq!(outbox.resolve_id(&lone).await, None);
        assert_eq!(outbox.resolve_id(&parent).await, Some(ServerId::new("srv-p")));
        assert_eq!(outbox.peek_batch(10).await[0].payload["parent"], json!("srv-p"));

        outbox.mark_sending(&[child.clone()]).await.unwrap();
        outbox.mark_synced(&child, &ServerId::new("srv-c")).await.unwrap();
        let outbox = open(&store, &clock).await;
        assert_eq!(outbox.resolve_id(&parent).await, None);
        assert!(store.load_id_map().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_parent_synced_rewrites_reference() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;

        let parent = create(&outbox, "p", json!({})).await;
        outbox.mark_sending(&[parent.clone()]).await.unwrap();
        outbox.mark_synced(&parent, &ServerId::new("srv-p")).await.unwrap();

        let child = create(&outbox, "c", json!({"parent": parent.as_str()})).await;
        let queued = outbox.get(&child).await.unwrap();
        assert!(queued.depends_on.is_empty());
        assert_eq!(queued.payload["parent"], json!("srv-p"));
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_exhausts() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;
        let id = create(&outbox, "a", json!({})).await;

        outbox.mark_sending(&[id.clone()]).await.unwrap();
        let outcome = outbox
            .mark_failed(&id, FailureClass::Retryable, FailureKind::Transport, "timeout")
            .await
            .unwrap();
        assert!(matches!(outcome, FailureOutcome::RetryScheduled { attempts: 1, .. }));
        assert!(outbox.peek_batch(10).await.is_empty());

        clock.advance(Duration::from_secs(2));
        assert_eq!(outbox.peek_batch(10).await.len(), 1);

        outbox.mark_sending(&[id.clone()]).await.unwrap();
        outbox
            .mark_failed(&id, FailureClass::Retryable, FailureKind::Transport, "timeout")
            .await
            .unwrap();
        clock.advance(Duration::from_secs(3));
        assert!(outbox.peek_batch(10).await.is_empty(), "second delay is 4s");
        clock.advance(Duration::from_secs(1));

        outbox.mark_sending(&[id.clone()]).await.unwrap();
        let outcome = outbox
            .mark_failed(&id, FailureClass::Retryable, FailureKind::Server, "503")
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Terminal { cascaded: vec![] });

        let failed = outbox.get(&id).await.unwrap();
        assert_eq!(failed.status, MutationStatus::FailedTerminal);
        let error = failed.last_error.unwrap();
        assert_eq!(error.kind, FailureKind::Exhausted);
        assert!(error.message.contains("needs attention"));
    }

    #[tokio::test]
    async fn test_terminal_failure_cascades_and_unblocks_stream() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;

        let parent = create(&outbox, "student", json!({"name": ""})).await;
        let child = create(&outbox, "attendance", json!({"student_id": parent.as_str()})).await;
        let grandchild = create(&outbox, "note", json!({"attendance_id": child.as_str()})).await;
        let sibling = create(&outbox, "student", json!({"name": "Grace"})).await;

        outbox.mark_sending(&[parent.clone()]).await.unwrap();
        let outcome = outbox
            .mark_failed(&parent, FailureClass::Terminal, FailureKind::Validation, "name required")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Terminal {
                cascaded: vec![child.clone(), grandchild.clone()]
            }
        );

        let batch: Vec<TempId> = outbox.peek_batch(10).await.into_iter().map(|m| m.temp_id).collect();
        assert_eq!(batch, vec![sibling]);
        assert_eq!(outbox.terminal_failures().await.len(), 3);
        assert_eq!(outbox.pending_count().await, 1);

        let late = create(&outbox, "note", json!({"student_id": parent.as_str()})).await;
        assert_eq!(outbox.get(&late).await.unwrap().status, MutationStatus::FailedTerminal);
    }

    #[tokio::test]
    async fn test_reopen_resets_in_flight_and_keeps_order() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let first;
        let second;
        {
            let outbox = open(&store, &clock).await;
            first = create(&outbox, "a", json!({})).await;
            second = create(&outbox, "a", json!({})).await;
            outbox.mark_sending(&[first.clone()]).await.unwrap();
        }

        let outbox = open(&store, &clock).await;
        let head = outbox.get(&first).await.unwrap();
        assert_eq!(head.status, MutationStatus::Enqueued);
        assert_eq!(head.attempts, 1);

        let third = create(&outbox, "a", json!({})).await;
        let order: Vec<TempId> = outbox.snapshot().await.into_iter().map(|m| m.temp_id).collect();
        assert_eq!(order, vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_requeue_refunds_attempt() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;
        let id = create(&outbox, "a", json!({})).await;

        outbox.mark_sending(&[id.clone()]).await.unwrap();
        outbox.requeue(&[id.clone()]).await.unwrap();

        let m = outbox.get(&id).await.unwrap();
        assert_eq!(m.status, MutationStatus::Enqueued);
        assert_eq!(m.attempts, 0);
    }

    #[tokio::test]
    async fn test_dismiss_only_terminal() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;
        let id = create(&outbox, "a", json!({})).await;

        assert!(!outbox.dismiss(&id).await.unwrap());
        outbox
            .mark_failed(&id, FailureClass::Terminal, FailureKind::Validation, "bad")
            .await
            .unwrap();
        assert!(outbox.dismiss(&id).await.unwrap());
        assert!(outbox.get(&id).await.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_pending_targets_resolve_temp_ids() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;

        let created = create(&outbox, "s", json!({})).await;
        outbox
            .enqueue(
                "student",
                MutationAction::Update,
                payload(json!({"id": created.as_str(), "name": "B"})),
                StreamKey::new("student:x"),
            )
            .await
            .unwrap();
        outbox
            .enqueue(
                "student",
                MutationAction::Update,
                payload(json!({"id": "stu-9", "name": "C"})),
                StreamKey::new("student:9"),
            )
            .await
            .unwrap();

        outbox.mark_sending(&[created.clone()]).await.unwrap();
        outbox.mark_synced(&created, &ServerId::new("stu-1")).await.unwrap();

        let targets = outbox.pending_targets().await;
        assert!(targets.contains(&RecordRef::new("student", "stu-1")));
        assert!(targets.contains(&RecordRef::new("student", "stu-9")));
        assert_eq!(targets.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let store = MemoryOutboxStore::new();
        let clock = ManualClock::starting_now();
        let outbox = open(&store, &clock).await;
        let ghost = TempId::generate();

        outbox.mark_synced(&ghost, &ServerId::new("x")).await.unwrap();
        let err = outbox
            .mark_failed(&ghost, FailureClass::Retryable, FailureKind::Transport, "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            classmark_core::ClassmarkError::Storage(StorageError::MutationNotFound { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_drain_preserves_per_stream_order(
            streams in proptest::collection::vec(0u8..4, 1..30),
            max in 1usize..5,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (enqueued, drained, duplicates) = runtime.block_on(async {
                let store = MemoryOutboxStore::new();
                let clock = ManualClock::starting_now();
                let outbox = open(&store, &clock).await;

                let mut enqueued: Vec<(String, TempId)> = Vec::new();
                for (n, stream) in streams.iter().enumerate() {
                    let stream = format!("s{stream}");
                    let temp_id = create(&outbox, &stream, json!({ "n": n })).await;
                    enqueued.push((stream, temp_id));
                }

                let mut drained: Vec<(String, TempId)> = Vec::new();
                let mut duplicates = 0;
                loop {
                    let batch = outbox.peek_batch(max).await;
                    if batch.is_empty() {
                        break;
                    }
                    let streams: HashSet<&StreamKey> = batch.iter().map(|m| &m.stream_key).collect();
                    duplicates = duplicates.max(batch.len() - streams.len());
                    let ids: Vec<TempId> = batch.iter().map(|m| m.temp_id.clone()).collect();
                    outbox.mark_sending(&ids).await.unwrap();
                    for mutation in &batch {
                        let server_id = ServerId::new(format!("srv-{}", mutation.temp_id));
                        outbox.mark_synced(&mutation.temp_id, &server_id).await.unwrap();
                        drained.push((mutation.stream_key.as_str().to_string(), mutation.temp_id.clone()));
                    }
                }
                (enqueued, drained, duplicates)
            });

            proptest::prop_assert_eq!(duplicates, 0);
            proptest::prop_assert_eq!(drained.len(), enqueued.len());
            for stream in 0u8..4 {
                let name = format!("s{stream}");
                let expected: Vec<&TempId> =
                    enqueued.iter().filter(|(s, _)| *s == name).map(|(_, t)| t).collect();
                let actual: Vec<&TempId> =
                    drained.iter().filter(|(s, _)| *s == name).map(|(_, t)| t).collect();
                proptest::prop_assert_eq!(expected, actual);
            }
        }
    }
}
