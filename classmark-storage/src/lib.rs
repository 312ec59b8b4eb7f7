//! CLASSMARK Storage - Server-Side Cache and Sync Application
//!
//! Two halves live here:
//!
//! - [`cache`]: the aggregated view cache with check-and-set writes and the
//!   invalidation gateway that write paths call into.
//! - [`sync`]: idempotent application of pushed mutations, the change feed
//!   that serves pulls, and the record repository behind both.

pub mod cache;
pub mod sync;

pub use cache::{
    AggregatedViewCache, CacheBackend, CacheLookup, CacheRead, CacheStats, CacheInvalidationGateway,
    InMemoryCacheBackend, InvalidationGateway, NoopInvalidationGateway, PutOutcome, ReadSource,
    VersionStamp, ViewComputer,
};
pub use sync::{
    AcceptAll, ChangeFeed, ChangeRecord, IdempotencyLedger, InMemoryChangeFeed, LedgerLookup,
    MemoryRecordRepository, MutationValidator, RecordRepository, RequiredFields, SubjectExtractor,
    SyncService,
};
