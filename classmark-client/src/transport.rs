//! Transport seam between the sync engines and the server.

use async_trait::async_trait;
use classmark_core::{PullQuery, PullResponse, PushRequest, PushResponse, TransportError};

/// Carries push batches and pull requests to the sync server.
///
/// Implementations report whole-call failures as [`TransportError`]; the
/// engines decide what they mean for each queued item.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError>;

    async fn pull(&self, query: &PullQuery) -> Result<PullResponse, TransportError>;
}
