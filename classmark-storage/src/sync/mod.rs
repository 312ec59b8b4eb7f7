//! Server-side application of client sync traffic.
//!
//! Pushed mutations pass through the idempotency ledger, the domain
//! validator and the record repository, then land in the change feed that
//! later pulls read from. Every committed write notifies the invalidation
//! gateway with the subjects it touched.

pub mod feed;
pub mod ledger;
pub mod repository;
pub mod service;
pub mod validator;

pub use feed::{ChangeBatch, ChangeFeed, ChangeRecord, InMemoryChangeFeed};
pub use ledger::{IdempotencyLedger, LedgerLookup};
pub use repository::{MemoryRecordRepository, RecordRepository};
pub use service::{SubjectExtractor, SyncService};
pub use validator::{AcceptAll, MutationValidator, RequiredFields};
