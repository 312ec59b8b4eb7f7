//! CLASSMARK Client - Offline-First Sync
//!
//! Every write is recorded in a durable [`Outbox`] first and returns
//! immediately. The [`PushEngine`] drains the outbox when the device is
//! online; the [`PullEngine`] merges server changes into local state
//! without clobbering writes that have not been acknowledged yet.

pub mod cancel;
pub mod client;
pub mod config;
pub mod connectivity;
mod flight;
pub mod http;
pub mod local_state;
pub mod outbox;
pub mod pull;
pub mod push;
pub mod transport;

pub use cancel::CancelToken;
pub use client::{SyncClient, SyncReport};
pub use config::{ClientConfig, ClientConfigError};
pub use connectivity::{ConnectivityMonitor, ReachabilityProbe};
pub use http::RestTransport;
pub use local_state::{LocalRecordStore, MemoryLocalStore};
pub use outbox::{
    CursorStore, FailureOutcome, HeldRecord, LmdbOutboxStore, MemoryOutboxStore, Outbox,
    OutboxStore, RecordRef,
};
pub use pull::{PullEngine, PullReport};
pub use push::{PushEngine, PushReport, TerminalFailure};
pub use transport::SyncTransport;
