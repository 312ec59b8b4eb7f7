//! CLASSMARK Core - Sync and Cache Data Types
//!
//! Pure data structures shared by the mobile sync client, the sync server and
//! the aggregated-view cache. This crate contains no I/O.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod mutation;
pub mod view;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffPolicy, CacheConfig, SyncConfig};
pub use error::{
    ClassmarkError, ClassmarkResult, ConfigError, FailureClass, StorageError, TransportError,
    ValidationError,
};
pub use identity::{ServerId, StreamKey, TempId, TenantId, Timestamp, TEMP_ID_PREFIX};
pub use mutation::{
    collect_temp_refs, remap_temp_refs, FailureKind, MutationAction, MutationFailure,
    MutationStatus, Payload, QueuedMutation, RECORD_ID_FIELD, RECORD_VERSION_FIELD,
};
pub use view::{InvalidationEvent, ScopeKey, SubjectKind, SubjectRef, ViewKey};
pub use wire::{
    CacheStatsResponse, InvalidateCacheRequest, InvalidateCacheResponse, PullQuery, PullResponse,
    PushErrorKind, PushItem, PushItemResult, PushRequest, PushResponse, PushStatus, SyncCursor,
};
