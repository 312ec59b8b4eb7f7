//! Sync endpoints used by the mobile client.
//!
//! - POST /sync/push - apply a batch of queued mutations
//! - GET  /sync/pull - changes since a sync token

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use classmark_core::{PullQuery, PullResponse, PushRequest, PushResponse};

use crate::error::{ApiError, ApiResult};
use crate::extractors::Tenant;
use crate::state::AppState;

/// POST /sync/push
///
/// Per-item failures are reported in the body with status 200. Only a
/// request that cannot be processed at all is an error response.
pub async fn push(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Json(request): Json<PushRequest>,
) -> ApiResult<Json<PushResponse>> {
    let items = request.items.len();
    if items > state.max_push_items {
        return Err(ApiError::payload_too_large(items, state.max_push_items));
    }

    let response = state.sync.apply_push(tenant_id, request).await?;
    Ok(Json(response))
}

/// GET /sync/pull?last_synced_at=<token>&limit=<n>
pub async fn pull(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Query(query): Query<PullQuery>,
) -> ApiResult<Json<PullResponse>> {
    let response = state.sync.pull(tenant_id, &query).await?;
    Ok(Json(response))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/push", post(push))
        .route("/pull", get(pull))
        .with_state(state)
}
