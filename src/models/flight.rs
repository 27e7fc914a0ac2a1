use std::fmt;

use serde::{Deserialize, Serialize};

use super::Address;

/// Identifies a scheduled flight on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlightKey {
    pub airline: Address,
    pub flight_id: String,
    pub timestamp: u64,
}

impl FlightKey {
    pub fn new(airline: Address, flight_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            airline,
            flight_id: flight_id.into(),
            timestamp,
        }
    }
}

impl fmt::Display for FlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.flight_id, self.timestamp, self.airline)
    }
}

/// A flight registered by an airline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flight {
    pub key: FlightKey,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// Entry of the static flight catalog served to the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFlight {
    pub id: u32,
    pub name: String,
}

pub fn flight_catalog() -> Vec<CatalogFlight> {
    ["KAL496946", "LTH446466", "KLM467454", "LTH674545", "KLM452333"]
        .into_iter()
        .enumerate()
        .map(|(position, name)| CatalogFlight {
            id: position as u32 + 1,
            name: name.to_string(),
        })
        .collect()
}
