//! Data models for the FlightSurety coordination server

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod airline;
pub mod flight;
pub mod insurance;
pub mod oracle;

pub use airline::*;
pub use flight::*;
pub use insurance::*;
pub use oracle::*;

/// Value amounts are carried in wei.
pub type Amount = u128;

pub const ETHER: Amount = 1_000_000_000_000_000_000;

/// Fee the ledger charges an oracle to register.
pub const REGISTRATION_FEE: Amount = ETHER;
/// Minimum stake an airline transfers before it may take part in governance.
pub const AIRLINE_FUNDING: Amount = 10 * ETHER;
/// Largest premium a passenger may pay for a single policy.
pub const PREMIUM_CEILING: Amount = ETHER;
/// Registered airlines below this count admit new airlines without a vote.
pub const DIRECT_ADMISSION_LIMIT: usize = 4;
/// Matching responses the ledger needs before it fixes a flight status.
pub const MIN_RESPONSES: usize = 3;

/// Ledger account identity (`0x` followed by 40 hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

/// Address parsing error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address {0:?}: expected 0x followed by 40 hex characters")]
pub struct InvalidAddress(pub String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, InvalidAddress> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| InvalidAddress(raw.to_string()))?;

        match hex::decode(body) {
            Ok(bytes) if bytes.len() == 20 => Ok(Self(format!("0x{}", hex::encode(bytes)))),
            _ => Err(InvalidAddress(raw.to_string())),
        }
    }

    /// Deterministic account address for simulated participants.
    pub fn derived(label: &str) -> Self {
        let digest = Sha256::digest(label.as_bytes());
        Self(format!("0x{}", hex::encode(&digest[..20])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Outcome of a valid call that may or may not have changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    NotApplied,
}

impl Outcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_address_is_normalized() {
        let address = Address::parse("0xABCDEFabcdef0123456789abcdef0123456789AB").unwrap();
        assert_eq!(address.as_str(), "0xabcdefabcdef0123456789abcdef0123456789ab");
    }

    #[test]
    fn test_address_rejects_bad_input() {
        assert!(Address::parse("abcdef").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xzzcdefabcdef0123456789abcdef0123456789ab").is_err());
    }

    #[test]
    fn test_derived_addresses_are_stable_and_distinct() {
        assert_eq!(Address::derived("oracle-1"), Address::derived("oracle-1"));
        assert_ne!(Address::derived("oracle-1"), Address::derived("oracle-2"));
        assert!(Address::parse(Address::derived("oracle-1").as_str()).is_ok());
    }
}
