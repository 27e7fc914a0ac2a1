//! Error types for the coordination core
//!
//! `LedgerError` describes what went wrong at the ledger boundary.
//! `CoreError` is what the registry, governance and insurance services
//! report to their callers. Calls that were valid but changed nothing are
//! not errors; they come back as `Outcome::NotApplied` or `Admission::Pending`.

use std::time::Duration;

use thiserror::Error;

use crate::models::{Address, Amount, FlightKey};

/// Result type for the coordination core
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure of a single ledger call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The call did not confirm within the allowed interval
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),

    /// Network or gateway failure
    #[error("ledger transport error: {0}")]
    Transport(String),

    /// The ledger answered with something we could not read
    #[error("undecodable ledger response: {0}")]
    Decode(String),

    /// The ledger refused the call
    #[error("rejected by ledger: {0}")]
    Rejected(String),

    /// The ledger already holds this exact state transition
    #[error("duplicate refused by ledger: {0}")]
    Duplicate(String),

    /// The ledger's operational flag is off
    #[error("ledger is paused")]
    Paused,
}

impl LedgerError {
    /// Whether a read may be attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Timeout(_) | LedgerError::Transport(_))
    }
}

/// Caller precondition violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("proposer {0} is not a registered airline")]
    ProposerNotRegistered(Address),

    #[error("proposer {0} has not funded its stake")]
    ProposerNotFunded(Address),

    #[error("airline {0} is already registered")]
    AlreadyRegistered(Address),

    #[error("funding of {provided} is below the minimum stake of {required}")]
    InsufficientFunding { provided: Amount, required: Amount },

    #[error("premium of {premium} exceeds the ceiling of {ceiling}")]
    PremiumAboveCeiling { premium: Amount, ceiling: Amount },

    #[error("premium must be greater than zero")]
    ZeroPremium,

    #[error("passenger {passenger} already holds a policy on {flight}")]
    AlreadyInsured { passenger: Address, flight: FlightKey },

    #[error("flight {0} is already registered")]
    FlightAlreadyRegistered(FlightKey),

    #[error("unknown policy {0}")]
    UnknownPolicy(String),
}

/// Error type for the coordination core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("ledger is not operational")]
    NotOperational,

    #[error("oracle {oracle} failed to register: {reason}")]
    Registration { oracle: Address, reason: String },

    #[error("flight {flight} is not eligible for insurance")]
    IneligibleFlight { flight: FlightKey },

    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for CoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Paused => CoreError::NotOperational,
            other => CoreError::Ledger(other),
        }
    }
}
