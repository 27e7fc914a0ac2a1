//! FlightSurety coordination server library
//!
//! Off-ledger coordination for a flight-delay insurance marketplace: the
//! oracle pool that answers flight-status requests, airline admission and
//! funding, and the insurance payouts tied to finalized statuses.

pub mod app_state;
pub mod config;
pub mod error;
pub mod event_listener;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod routes;
pub mod services;
pub mod simulation;
