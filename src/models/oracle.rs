use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Address, FlightKey};

/// Indices are drawn from `0..INDEX_SPACE`.
pub const INDEX_SPACE: u8 = 10;
pub const INDEXES_PER_ORACLE: usize = 3;

pub type RequestIndex = u8;

/// Flight status reported by oracles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StatusCode {
    Unknown = 0,
    OnTime = 10,
    LateAirline = 20,
    LateWeather = 30,
    LateTechnical = 40,
    LateOther = 50,
}

impl StatusCode {
    pub const ALL: [StatusCode; 6] = [
        StatusCode::Unknown,
        StatusCode::OnTime,
        StatusCode::LateAirline,
        StatusCode::LateWeather,
        StatusCode::LateTechnical,
        StatusCode::LateOther,
    ];

    /// Codes that entitle insured passengers to a payout.
    pub fn is_delay(self) -> bool {
        matches!(
            self,
            StatusCode::LateAirline
                | StatusCode::LateWeather
                | StatusCode::LateTechnical
                | StatusCode::LateOther
        )
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown flight status code {0}")]
pub struct UnknownStatusCode(pub u8);

impl TryFrom<u8> for StatusCode {
    type Error = UnknownStatusCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        StatusCode::ALL
            .into_iter()
            .find(|status| status.code() == value)
            .ok_or(UnknownStatusCode(value))
    }
}

impl From<StatusCode> for u8 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Unknown => "unknown",
            StatusCode::OnTime => "on_time",
            StatusCode::LateAirline => "late_airline",
            StatusCode::LateWeather => "late_weather",
            StatusCode::LateTechnical => "late_technical",
            StatusCode::LateOther => "late_other",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// The fixed set of request indices an oracle may answer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct IndexSet([RequestIndex; INDEXES_PER_ORACLE]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidIndexSet {
    #[error("expected {INDEXES_PER_ORACLE} indexes, got {0}")]
    Cardinality(usize),
    #[error("index {0} is outside the index space")]
    OutOfRange(RequestIndex),
    #[error("index {0} appears more than once")]
    Repeated(RequestIndex),
}

impl IndexSet {
    pub fn new(indexes: [RequestIndex; INDEXES_PER_ORACLE]) -> Result<Self, InvalidIndexSet> {
        let mut sorted = indexes;
        sorted.sort_unstable();
        for (position, index) in sorted.iter().enumerate() {
            if *index >= INDEX_SPACE {
                return Err(InvalidIndexSet::OutOfRange(*index));
            }
            if position > 0 && sorted[position - 1] == *index {
                return Err(InvalidIndexSet::Repeated(*index));
            }
        }
        Ok(Self(sorted))
    }

    pub fn contains(&self, index: RequestIndex) -> bool {
        self.0.contains(&index)
    }

    pub fn indexes(&self) -> [RequestIndex; INDEXES_PER_ORACLE] {
        self.0
    }
}

impl TryFrom<Vec<u8>> for IndexSet {
    type Error = InvalidIndexSet;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let array: [RequestIndex; INDEXES_PER_ORACLE] = value
            .as_slice()
            .try_into()
            .map_err(|_| InvalidIndexSet::Cardinality(value.len()))?;
        IndexSet::new(array)
    }
}

impl From<IndexSet> for Vec<u8> {
    fn from(set: IndexSet) -> Self {
        set.0.to_vec()
    }
}

impl fmt::Display for IndexSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{},{},{}}}", self.0[0], self.0[1], self.0[2])
    }
}

/// A ledger request for oracles to report a flight's status
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusRequest {
    /// Position of the announcing event in the ledger's event log. A
    /// re-request for the same flight may draw the same index; this tells
    /// the two apart.
    pub sequence: u64,
    pub index: RequestIndex,
    pub airline: Address,
    pub flight_id: String,
    pub timestamp: u64,
}

impl StatusRequest {
    pub fn flight(&self) -> FlightKey {
        FlightKey::new(self.airline.clone(), self.flight_id.clone(), self.timestamp)
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            index: self.index,
            flight: self.flight(),
        }
    }
}

/// Identifies one status request: its index plus the flight it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub index: RequestIndex,
    pub flight: FlightKey,
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.index, self.flight)
    }
}

/// One oracle's answer to a status request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub index: RequestIndex,
    pub airline: Address,
    pub flight_id: String,
    pub timestamp: u64,
    pub status: StatusCode,
    pub oracle: Address,
}

impl StatusResponse {
    pub fn answering(request: &StatusRequest, oracle: Address, status: StatusCode) -> Self {
        Self {
            index: request.index,
            airline: request.airline.clone(),
            flight_id: request.flight_id.clone(),
            timestamp: request.timestamp,
            status,
            oracle,
        }
    }
}

/// A report the ledger accepted and counted toward finalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub index: RequestIndex,
    pub flight: FlightKey,
    pub status: StatusCode,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_code_round_trip_and_delay_classification() {
        for status in StatusCode::ALL {
            assert_eq!(StatusCode::try_from(status.code()), Ok(status));
        }
        assert_eq!(StatusCode::try_from(15), Err(UnknownStatusCode(15)));

        let delayed: Vec<_> = StatusCode::ALL.into_iter().filter(|s| s.is_delay()).collect();
        assert_eq!(delayed.iter().map(|s| s.code()).collect::<Vec<_>>(), vec![20, 30, 40, 50]);
    }

    #[test]
    fn test_index_set_validation() {
        let set = IndexSet::new([9, 3, 7]).unwrap();
        assert_eq!(set.indexes(), [3, 7, 9]);
        assert!(set.contains(7));
        assert!(!set.contains(4));

        assert_eq!(IndexSet::new([1, 1, 2]), Err(InvalidIndexSet::Repeated(1)));
        assert_eq!(IndexSet::new([1, 2, 10]), Err(InvalidIndexSet::OutOfRange(10)));
        assert_eq!(IndexSet::try_from(vec![1, 2]), Err(InvalidIndexSet::Cardinality(2)));
    }

    #[test]
    fn test_wire_forms() {
        let status: StatusCode = serde_json::from_str("40").unwrap();
        assert_eq!(status, StatusCode::LateTechnical);
        assert!(serde_json::from_str::<StatusCode>("41").is_err());

        let set: IndexSet = serde_json::from_str("[4,0,2]").unwrap();
        assert_eq!(serde_json::to_string(&set).unwrap(), "[0,2,4]");
    }
}
