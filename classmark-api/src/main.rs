//! CLASSMARK API Server Entry Point
//!
//! Bootstraps configuration, wires the sync service and view cache, and
//! starts the Axum HTTP server.

use std::net::SocketAddr;

use axum::Router;
use classmark_api::telemetry::init_tracing;
use classmark_api::{create_api_router, ApiConfig, ApiError, ApiResult, AppState};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing()?;

    let config = ApiConfig::from_env();
    let state = AppState::in_memory(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let housekeeping = state.spawn_housekeeping(
        config.housekeeping_interval,
        config.ledger_retention,
        shutdown_rx,
    );

    let app: Router = create_api_router(state, &config);

    let addr = resolve_bind_addr()?;
    tracing::info!(%addr, "Starting CLASSMARK API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = housekeeping.await {
        tracing::warn!(error = %e, "Housekeeping task ended abnormally");
    }
    Ok(())
}

fn resolve_bind_addr() -> ApiResult<SocketAddr> {
    let host = std::env::var("CLASSMARK_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("CLASSMARK_API_PORT").ok())
        .unwrap_or_else(|| "3000".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ApiError::invalid_input(format!("Invalid port value: {}", port_str)))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e)))
}
