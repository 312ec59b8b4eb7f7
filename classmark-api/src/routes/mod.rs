//! REST API Routes Module
//!
//! - Sync push and pull under /api/v1/sync
//! - View cache administration under /api/v1/cache
//! - Aggregated views under /api/v1/views
//! - Health checks under /health (no tenant header)

pub mod cache;
pub mod health;
pub mod sync;
pub mod views;

use std::time::Duration;

use axum::{
    http::{header, header::HeaderName, HeaderValue, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ApiConfig;
use crate::state::AppState;

/// Empty `cors_origins` allows every origin. Exposes the view source header.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(crate::extractors::TENANT_HEADER),
        ])
        .expose_headers([HeaderName::from_static(views::VIEW_SOURCE_HEADER)])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!(origins = ?config.cors_origins, "CORS: restricted origins");
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

/// Full router: `/api/v1/{sync,cache,views}` plus `/health`.
///
/// Layers, outermost first: CORS, request tracing, request timeout.
pub fn create_api_router(state: AppState, config: &ApiConfig) -> Router {
    let api_routes = Router::new()
        .nest("/sync", sync::create_router(state.clone()))
        .nest("/cache", cache::create_router(state.clone()))
        .nest("/views", views::create_router(state.clone()));

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health::create_router(state))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(config))
}
