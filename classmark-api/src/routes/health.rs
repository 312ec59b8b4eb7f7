//! Liveness and readiness probes. No tenant header required.
//!
//! - GET /health/ping - process is up
//! - GET /health/ready - view cache answers; reports what it serves

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Body of `/health/ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Readiness {
    pub status: HealthStatus,
    /// Why the service is not ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ReadinessDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessDetails {
    pub version: String,
    pub uptime_seconds: u64,
    pub cached_views: usize,
    pub view_kinds: Vec<String>,
}

impl Readiness {
    fn ready(details: ReadinessDetails) -> Self {
        Self {
            status: HealthStatus::Healthy,
            reason: None,
            details: Some(details),
        }
    }

    fn unavailable(reason: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            reason: Some(reason),
            details: None,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.status {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

pub async fn ping() -> &'static str {
    "pong"
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let readiness = match state.cache.stats().await {
        Ok(stats) => Readiness::ready(ReadinessDetails {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            cached_views: stats.entry_count,
            view_kinds: state.views.kinds().into_iter().map(String::from).collect(),
        }),
        Err(e) => Readiness::unavailable(format!("View cache unavailable: {e}")),
    };
    (readiness.status_code(), Json(readiness))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/ready", get(readiness))
        .with_state(state)
}
