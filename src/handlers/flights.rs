use std::sync::Arc;

use axum::{extract::State, Json};

use crate::app_state::ServiceInfo;
use crate::models::{flight_catalog, ApiResponse, CatalogFlight};

pub async fn get_service_info(
    State(info): State<Arc<ServiceInfo>>,
) -> Json<ApiResponse<ServiceInfo>> {
    Json(ApiResponse::ok((*info).clone()))
}

/// The flights a passenger can pick from on the dashboard.
pub async fn list_flights() -> Json<ApiResponse<Vec<CatalogFlight>>> {
    Json(ApiResponse::ok(flight_catalog()))
}
