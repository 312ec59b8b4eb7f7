//! LMDB-backed outbox store.
//!
//! Uses the heed crate so that queued mutations survive app restarts and
//! crashes. Four named databases live in one environment:
//!
//! - `mutations`: big-endian sequence -> JSON-encoded [`QueuedMutation`]
//! - `id_map`: temp id -> server id
//! - `held`: entity type and record id -> JSON-encoded [`HeldRecord`]
//! - `meta`: small named values such as the pull cursor
//!
//! Each trait call runs in its own LMDB transaction and is committed before
//! returning.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use classmark_core::{
    ClassmarkError, ClassmarkResult, QueuedMutation, ServerId, StorageError, SyncCursor, TempId,
};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use super::store::{CursorStore, HeldRecord, OutboxStore};
use super::RecordRef;

const MUTATIONS_DB: &str = "mutations";
const ID_MAP_DB: &str = "id_map";
const HELD_DB: &str = "held";
const META_DB: &str = "meta";
const CURSOR_KEY: &str = "sync_cursor";

/// Error type for LMDB outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbOutboxError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbOutboxError> for ClassmarkError {
    fn from(e: LmdbOutboxError) -> Self {
        let target = "outbox".to_string();
        let reason = e.to_string();
        match e {
            LmdbOutboxError::Deserialization(_) => {
                ClassmarkError::Storage(StorageError::Corrupt { target, reason })
            }
            _ => ClassmarkError::Storage(StorageError::WriteFailed { target, reason }),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbOutboxError {
    LmdbOutboxError::Transaction(e.to_string())
}

/// Durable outbox and cursor store on LMDB.
pub struct LmdbOutboxStore {
    env: Env,
    mutations: Database<Bytes, Bytes>,
    id_map: Database<Str, Str>,
    held: Database<Str, Bytes>,
    meta: Database<Str, Str>,
}

impl std::fmt::Debug for LmdbOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbOutboxStore")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbOutboxStore {
    /// Open or create the store under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the LMDB
    /// environment or one of its databases cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbOutboxError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(4)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbOutboxError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let mutations = env
            .create_database(&mut wtxn, Some(MUTATIONS_DB))
            .map_err(|e| LmdbOutboxError::DbOpen(e.to_string()))?;
        let id_map = env
            .create_database(&mut wtxn, Some(ID_MAP_DB))
            .map_err(|e| LmdbOutboxError::DbOpen(e.to_string()))?;
        let held = env
            .create_database(&mut wtxn, Some(HELD_DB))
            .map_err(|e| LmdbOutboxError::DbOpen(e.to_string()))?;
        let meta = env
            .create_database(&mut wtxn, Some(META_DB))
            .map_err(|e| LmdbOutboxError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            mutations,
            id_map,
            held,
            meta,
        })
    }

    fn sequence_key(sequence: u64) -> [u8; 8] {
        sequence.to_be_bytes()
    }

    /// Entity types and record ids never contain the unit separator.
    fn held_key(record: &RecordRef) -> String {
        format!("{}\u{1f}{}", record.entity_type, record.record_id)
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, LmdbOutboxError> {
        serde_json::to_vec(value).map_err(|e| LmdbOutboxError::Serialization(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbOutboxError> {
        serde_json::from_slice(bytes).map_err(|e| LmdbOutboxError::Deserialization(e.to_string()))
    }
}

#[async_trait]
impl OutboxStore for LmdbOutboxStore {
    async fn load_mutations(&self) -> ClassmarkResult<Vec<QueuedMutation>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = Vec::new();
        for entry in self.mutations.iter(&rtxn).map_err(txn_err)? {
            let (_, bytes) = entry.map_err(txn_err)?;
            out.push(Self::decode(bytes)?);
        }
        Ok(out)
    }

    async fn put_mutation(&self, mutation: &QueuedMutation) -> ClassmarkResult<()> {
        let bytes = Self::encode(mutation)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.mutations
            .put(&mut wtxn, &Self::sequence_key(mutation.sequence), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn remove_mutation(&self, sequence: u64) -> ClassmarkResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.mutations
            .delete(&mut wtxn, &Self::sequence_key(sequence))
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn load_id_map(&self) -> ClassmarkResult<HashMap<TempId, ServerId>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = HashMap::new();
        for entry in self.id_map.iter(&rtxn).map_err(txn_err)? {
            let (temp, server) = entry.map_err(txn_err)?;
            out.insert(TempId::from_raw(temp), ServerId::new(server));
        }
        Ok(out)
    }

    async fn remove_id_mappings(&self, temp_ids: &[TempId]) -> ClassmarkResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for temp_id in temp_ids {
            self.id_map
                .delete(&mut wtxn, temp_id.as_str())
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn commit_synced(
        &self,
        sequence: u64,
        temp_id: &TempId,
        server_id: &ServerId,
    ) -> ClassmarkResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.mutations
            .delete(&mut wtxn, &Self::sequence_key(sequence))
            .map_err(txn_err)?;
        self.id_map
            .put(&mut wtxn, temp_id.as_str(), server_id.as_str())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for LmdbOutboxStore {
    async fn load_cursor(&self) -> ClassmarkResult<Option<SyncCursor>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let cursor = self
            .meta
            .get(&rtxn, CURSOR_KEY)
            .map_err(txn_err)?
            .map(SyncCursor::new);
        Ok(cursor)
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> ClassmarkResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.meta
            .put(&mut wtxn, CURSOR_KEY, cursor.as_str())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn load_held(&self) -> ClassmarkResult<Vec<HeldRecord>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut out = Vec::new();
        for entry in self.held.iter(&rtxn).map_err(txn_err)? {
            let (_, bytes) = entry.map_err(txn_err)?;
            out.push(Self::decode(bytes)?);
        }
        Ok(out)
    }

    async fn commit_page(&self, cursor: &SyncCursor, held: &[HeldRecord]) -> ClassmarkResult<()> {
        let mut encoded = Vec::with_capacity(held.len());
        for record in held {
            encoded.push((Self::held_key(&record.key()), Self::encode(record)?));
        }

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for (key, bytes) in &encoded {
            self.held.put(&mut wtxn, key, bytes).map_err(txn_err)?;
        }
        self.meta
            .put(&mut wtxn, CURSOR_KEY, cursor.as_str())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn release_held(&self, record: &RecordRef) -> ClassmarkResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.held
            .delete(&mut wtxn, &Self::held_key(record))
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }
}
