//! CLASSMARK API - REST Layer for Sync and Aggregated Views
//!
//! Exposes the server side of the offline-first sync protocol (push and
//! pull), the aggregated view cache, and the invalidation gateway over HTTP.
//! Every tenant-scoped route reads the school from the `x-tenant-id` header.

pub mod config;
pub mod error;
pub mod extractors;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod views;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use extractors::{Tenant, TENANT_HEADER};
pub use routes::create_api_router;
pub use state::{ApiCache, AppState};
pub use views::{RecordTallyComputer, ViewDefinition, ViewRegistry};
