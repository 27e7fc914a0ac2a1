//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;
use serde::Serialize;

use crate::services::LatestIndex;

/// Static description of the running service, served by `GET /api`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub message: String,
    pub ledger_mode: String,
    pub oracles: usize,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub latest_index: LatestIndex,
    pub service_info: Arc<ServiceInfo>,
}

impl AppState {
    pub fn new(latest_index: LatestIndex, service_info: ServiceInfo) -> Self {
        Self {
            latest_index,
            service_info: Arc::new(service_info),
        }
    }
}

impl FromRef<AppState> for LatestIndex {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.latest_index.clone()
    }
}

impl FromRef<AppState> for Arc<ServiceInfo> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.service_info.clone()
    }
}
