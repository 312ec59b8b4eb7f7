//! Request extractors.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use classmark_core::TenantId;

use crate::error::ApiError;

/// Header carrying the school the request acts for.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant resolved from the `x-tenant-id` header.
///
/// A missing header or a value that is not a UUID rejects the request with
/// 400 before the handler runs.
///
/// ```rust,ignore
/// async fn handler(Tenant(tenant_id): Tenant) -> ApiResult<Json<Value>> { .. }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenant(pub TenantId);

#[async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .ok_or_else(|| ApiError::missing_field(TENANT_HEADER))?
            .to_str()
            .map_err(|_| ApiError::invalid_format(TENANT_HEADER, "UUID"))?;

        raw.trim()
            .parse::<TenantId>()
            .map(Tenant)
            .map_err(|_| ApiError::invalid_format(TENANT_HEADER, "UUID"))
    }
}
