use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{Address, DIRECT_ADMISSION_LIMIT};

/// Locally observed governance state of one airline.
///
/// Flags only move from `false` to `true` and the approval set only grows;
/// there is no API to undo either.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirlineRecord {
    registered: bool,
    funded: bool,
    approvals: BTreeSet<Address>,
}

impl AirlineRecord {
    pub fn registered(&self) -> bool {
        self.registered
    }

    pub fn funded(&self) -> bool {
        self.funded
    }

    pub fn approvals(&self) -> &BTreeSet<Address> {
        &self.approvals
    }

    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    pub fn mark_funded(&mut self) {
        self.funded = true;
    }

    /// Returns `false` when the voter had already approved.
    pub fn add_approval(&mut self, voter: Address) -> bool {
        self.approvals.insert(voter)
    }
}

/// Admission rule in force for a given registered population
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdmissionRule {
    Direct,
    Quorum { required: usize },
}

impl AdmissionRule {
    pub fn for_population(registered: usize) -> Self {
        if registered < DIRECT_ADMISSION_LIMIT {
            AdmissionRule::Direct
        } else {
            AdmissionRule::Quorum {
                required: required_approvals(registered),
            }
        }
    }
}

/// Half the registered airlines, rounded up.
pub fn required_approvals(registered: usize) -> usize {
    registered.div_ceil(2)
}

/// Result of an admission attempt that reached a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Admission {
    Registered,
    Pending { approvals: usize, required: usize },
}
