//! Ledger boundary
//!
//! The ledger is the source of truth for balances, flags and emitted events.
//! Everything in this crate reaches it through the [`Ledger`] trait; the
//! JSON-RPC gateway client and the in-process simulator both implement it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::models::{Address, Amount, FlightKey, IndexSet, StatusResponse};

pub mod memory;
pub mod rpc;

pub use memory::MemoryLedger;
pub use rpc::RpcLedger;

pub type SharedLedger = Arc<dyn Ledger>;

/// Result of a ledger call that can legitimately leave state unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Applied,
    NotApplied,
}

/// Event as emitted by the ledger, before decoding into typed notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum LedgerEvent {
    StatusRequest {
        index: u8,
        airline: Address,
        flight_id: String,
        timestamp: u64,
    },
    StatusReportSubmitted {
        index: u8,
        airline: Address,
        flight_id: String,
        timestamp: u64,
        status_code: u8,
    },
    StatusFinalized {
        airline: Address,
        flight_id: String,
        timestamp: u64,
        status_code: u8,
    },
    FundingReceived {
        airline: Address,
    },
    AirlineRegistered {
        airline: Address,
    },
    PassengerInsured {
        passenger: Address,
        flight: FlightKey,
        premium: String,
    },
}

/// A ledger event with its position in the ledger's event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub event: LedgerEvent,
}

/// Call and query primitives the ledger exposes
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn registration_fee(&self) -> Result<Amount, LedgerError>;

    async fn register_oracle(&self, oracle: &Address, fee: Amount) -> Result<(), LedgerError>;

    async fn assigned_indexes(&self, oracle: &Address) -> Result<IndexSet, LedgerError>;

    async fn submit_status_response(&self, response: &StatusResponse) -> Result<(), LedgerError>;

    /// Opens a status request; the ledger announces it with a `StatusRequest` event.
    async fn request_flight_status(
        &self,
        airline: &Address,
        flight_id: &str,
        timestamp: u64,
    ) -> Result<(), LedgerError>;

    async fn fund(&self, airline: &Address, amount: Amount) -> Result<(), LedgerError>;

    async fn register_airline(
        &self,
        candidate: &Address,
        proposer: &Address,
    ) -> Result<LedgerOutcome, LedgerError>;

    async fn approve_for_admission(
        &self,
        candidate: &Address,
        voter: &Address,
    ) -> Result<(), LedgerError>;

    async fn is_registered(&self, airline: &Address) -> Result<bool, LedgerError>;

    async fn is_funded(&self, airline: &Address) -> Result<bool, LedgerError>;

    async fn registered_airline_count(&self) -> Result<usize, LedgerError>;

    async fn approval_count(&self, candidate: &Address) -> Result<usize, LedgerError>;

    async fn is_operational(&self) -> Result<bool, LedgerError>;

    async fn set_operating_status(
        &self,
        caller: &Address,
        operational: bool,
    ) -> Result<(), LedgerError>;

    async fn register_flight(&self, flight: &FlightKey) -> Result<(), LedgerError>;

    async fn buy_insurance(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        premium: Amount,
    ) -> Result<(), LedgerError>;

    async fn credit_insuree(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        amount: Amount,
    ) -> Result<(), LedgerError>;

    async fn passenger_credits(&self, passenger: &Address) -> Result<Amount, LedgerError>;

    /// Transfers the passenger's whole withdrawable balance and returns it.
    async fn withdraw(&self, passenger: &Address) -> Result<Amount, LedgerError>;

    /// Events with `sequence >= cursor`, oldest first, at most `limit` of them.
    async fn events_since(&self, cursor: u64, limit: usize)
        -> Result<Vec<EventRecord>, LedgerError>;
}

/// Bounds a ledger call so that an unconfirmed call counts as a failed attempt.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit)),
    }
}

/// Retry policy for idempotent reads.
///
/// State-changing calls are never retried automatically.
#[derive(Debug, Clone)]
pub struct ReadRetry {
    pub max_attempts: usize,
    pub delay: Duration,
    pub call_timeout: Duration,
}

impl ReadRetry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(100),
            call_timeout,
        }
    }

    pub async fn read<T, F, Fut>(&self, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0;
        loop {
            match bounded(self.call_timeout, op()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    tracing::debug!(error = %err, attempt, "retrying ledger read");
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
