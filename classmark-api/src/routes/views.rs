//! Aggregated view reads.
//!
//! GET /views/:view_kind/:subject_id?as_of=<scope>&<param>=<value>
//!
//! Served through the read-through cache: a fresh entry is returned as is,
//! a missing or stale one is recomputed and committed with check-and-set.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use classmark_core::{ScopeKey, SubjectRef, ViewKey};
use classmark_storage::ReadSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::extractors::Tenant;
use crate::state::AppState;

/// Query parameter naming the view scope.
const SCOPE_PARAM: &str = "as_of";

/// Response header reporting whether the view came from the cache.
pub const VIEW_SOURCE_HEADER: &str = "x-view-source";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewResponse {
    pub view_kind: String,
    pub subject_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<String>,
    pub value: Value,
}

fn source_label(source: ReadSource) -> &'static str {
    match source {
        ReadSource::Cache { .. } => "cache",
        ReadSource::Computed { committed: true } => "computed",
        ReadSource::Computed { committed: false } => "computed-uncached",
    }
}

/// GET /views/:view_kind/:subject_id
pub async fn get_view(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Path((view_kind, subject_id)): Path<(String, String)>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    let definition = state
        .views
        .get(&view_kind)
        .ok_or_else(|| ApiError::view_not_found(&view_kind))?;

    let subject_id = subject_id.trim().to_string();
    if subject_id.is_empty() {
        return Err(ApiError::missing_field("subject_id"));
    }

    let as_of = params
        .remove(SCOPE_PARAM)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let mut key = ViewKey::new(
        tenant_id,
        view_kind.clone(),
        SubjectRef::new(definition.subject_kind.clone(), subject_id.clone()),
    )
    .with_params(&params);
    if let Some(scope) = &as_of {
        key = key.with_scope(ScopeKey::new(scope.clone()));
    }

    let read = state
        .cache
        .get_or_compute(&key, definition.computer.as_ref())
        .await?;
    let label = source_label(read.source());

    let body = ViewResponse {
        view_kind,
        subject_id,
        as_of,
        value: read.into_value(),
    };
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(VIEW_SOURCE_HEADER, HeaderValue::from_static(label));
    Ok(response)
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/:view_kind/:subject_id", get(get_view))
        .with_state(state)
}
