use axum::{extract::State, Json};
use serde::Serialize;

use crate::models::{ApiResponse, RequestIndex};
use crate::services::LatestIndex;

#[derive(Debug, Serialize)]
pub struct RequestIndexResponse {
    pub index: Option<RequestIndex>,
}

/// Index of the most recent status request seen on the ledger, `null`
/// until one has been observed.
pub async fn get_request_index(
    State(latest_index): State<LatestIndex>,
) -> Json<ApiResponse<RequestIndexResponse>> {
    let index = *latest_index.read().await;
    Json(ApiResponse::ok(RequestIndexResponse { index }))
}
