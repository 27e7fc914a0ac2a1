//! Coordination services

pub mod coordinator;
pub mod dispatcher;
pub mod governance;
pub mod insurance;
pub mod oracle_registry;
pub mod status_source;

pub use coordinator::{Coordinator, LatestIndex};
pub use dispatcher::{DispatchSummary, RequestState, ResponseDispatcher, SubmissionResult};
pub use governance::GovernanceVoter;
pub use insurance::InsuranceCoordinator;
pub use oracle_registry::OracleRegistry;
pub use status_source::{FixedStatusSource, RandomStatusSource, StatusSource};
