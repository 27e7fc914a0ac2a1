//! Sources of flight status for oracle submissions

use rand::seq::SliceRandom;

use crate::models::{Address, StatusCode, StatusRequest};

/// Decides which status an oracle reports for a request.
///
/// Consulted once per eligible submission.
pub trait StatusSource: Send + Sync {
    fn status_for(&self, request: &StatusRequest, oracle: &Address) -> StatusCode;
}

/// Uniform choice over every status code, for simulated oracles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStatusSource;

impl StatusSource for RandomStatusSource {
    fn status_for(&self, _request: &StatusRequest, _oracle: &Address) -> StatusCode {
        StatusCode::ALL
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(StatusCode::Unknown)
    }
}

/// Always reports the same status.
#[derive(Debug, Clone, Copy)]
pub struct FixedStatusSource(pub StatusCode);

impl StatusSource for FixedStatusSource {
    fn status_for(&self, _request: &StatusRequest, _oracle: &Address) -> StatusCode {
        self.0
    }
}
