use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Address, Amount, FlightKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyHandle(pub Uuid);

impl PolicyHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PolicyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Payout multiplier as an exact ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiplier {
    pub numerator: u32,
    pub denominator: u32,
}

/// 1.5x
pub const PAYOUT_MULTIPLIER: Multiplier = Multiplier {
    numerator: 3,
    denominator: 2,
};

impl Multiplier {
    pub fn apply(self, premium: Amount) -> Amount {
        premium.saturating_mul(Amount::from(self.numerator)) / Amount::from(self.denominator.max(1))
    }
}

/// A purchased flight-delay policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsurancePolicy {
    pub handle: PolicyHandle,
    pub passenger: Address,
    pub flight: FlightKey,
    pub premium: Amount,
    pub multiplier: Multiplier,
    pub claimed: bool,
}

impl InsurancePolicy {
    pub fn payout(&self) -> Amount {
        self.multiplier.apply(self.premium)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::ETHER;

    #[test]
    fn test_payout_is_one_and_a_half_premium() {
        assert_eq!(PAYOUT_MULTIPLIER.apply(ETHER), 3 * ETHER / 2);
        assert_eq!(PAYOUT_MULTIPLIER.apply(200), 300);
        assert_eq!(PAYOUT_MULTIPLIER.apply(0), 0);
    }
}
