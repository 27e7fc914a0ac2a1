//! Route definitions for the FlightSurety API

use axum::{routing::get, Router};

use crate::app_state::AppState;
use crate::handlers::*;

// Service routes
pub fn service_routes() -> Router<AppState> {
    Router::new()
        .route("/api", get(get_service_info))
        .route("/health", get(health_check))
}

// Flight catalog routes
pub fn flight_routes() -> Router<AppState> {
    Router::new().route("/api/flights", get(list_flights))
}

// Oracle request routes
pub fn oracle_routes() -> Router<AppState> {
    Router::new().route("/api/events/index", get(get_request_index))
}

/// Full API router with state attached.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .merge(service_routes())
        .merge(flight_routes())
        .merge(oracle_routes())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
