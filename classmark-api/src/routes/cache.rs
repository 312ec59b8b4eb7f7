//! View cache administration.
//!
//! - POST /cache/invalidate - mark views of the named subjects stale
//! - POST /cache/flush - drop every view of the tenant
//! - GET  /cache/stats - diagnostic counters

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use classmark_core::{CacheStatsResponse, InvalidateCacheRequest, InvalidateCacheResponse};
use tracing::info;

use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::extractors::Tenant;
use crate::state::AppState;

/// POST /cache/invalidate
///
/// At least one subject must be named. Flushing everything goes through
/// `/cache/flush` instead.
pub async fn invalidate(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Json(request): Json<InvalidateCacheRequest>,
) -> ApiResult<Json<InvalidateCacheResponse>> {
    if request.is_empty() {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            "Name at least one of studentId, studentIds or sectionId",
        ));
    }
    let invalidated = state.gateway.invalidate_request(tenant_id, &request).await?;
    Ok(Json(InvalidateCacheResponse {
        invalidated: invalidated as usize,
    }))
}

/// POST /cache/flush
pub async fn flush(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
) -> ApiResult<Json<InvalidateCacheResponse>> {
    let removed = state.cache.admin_flush(tenant_id).await?;
    info!(tenant_id = %tenant_id, removed, "Cache flushed on request");
    Ok(Json(InvalidateCacheResponse {
        invalidated: removed as usize,
    }))
}

/// GET /cache/stats
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<CacheStatsResponse>> {
    let stats = state.cache.stats().await?;
    Ok(Json(stats.into()))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/invalidate", post(invalidate))
        .route("/flush", post(flush))
        .route("/stats", get(stats))
        .with_state(state)
}
