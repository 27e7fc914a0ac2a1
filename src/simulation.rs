//! Simulated ledger bootstrap
//!
//! Seeds an in-process ledger with the demo pool the dashboard expects:
//! five funded airlines, the catalog flights, a passenger holding policies
//! and a funded oracle pool. Afterwards status requests for the catalog
//! flights are raised on an interval, standing in for the dashboard's
//! "fetch flight status" button.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{LedgerError, Result};
use crate::ledger::{Ledger, MemoryLedger};
use crate::models::{
    flight_catalog, Address, Admission, Amount, FlightKey, AIRLINE_FUNDING, ETHER, REGISTRATION_FEE,
};
use crate::services::{GovernanceVoter, InsuranceCoordinator};

const SIMULATED_AIRLINES: usize = 5;
const PASSENGER_PREMIUM: Amount = ETHER / 2;

/// What the bootstrap put on the simulated ledger
#[derive(Debug, Clone)]
pub struct SimulatedPool {
    pub airlines: Vec<Address>,
    pub flights: Vec<FlightKey>,
    pub passenger: Address,
}

pub async fn bootstrap(
    ledger: &MemoryLedger,
    governance: &GovernanceVoter,
    insurance: &InsuranceCoordinator,
    first_airline: &Address,
    oracles: &[Address],
) -> Result<SimulatedPool> {
    let mut airlines = vec![first_airline.clone()];
    airlines.extend((2..=SIMULATED_AIRLINES).map(|n| Address::derived(&format!("airline-{n}"))));
    let passenger = Address::derived("passenger-1");

    for airline in &airlines {
        ledger.deposit(airline, 2 * AIRLINE_FUNDING).await;
    }
    for oracle in oracles {
        ledger.deposit(oracle, 2 * REGISTRATION_FEE).await;
    }
    ledger.deposit(&passenger, 10 * ETHER).await;

    governance.fund(first_airline, AIRLINE_FUNDING).await?;
    for candidate in &airlines[1..] {
        let mut admission = governance.register_airline(candidate, first_airline).await?;

        if let Admission::Pending { required, .. } = admission {
            // Past the direct-admission threshold: gather votes from the pool.
            for voter in airlines.iter().filter(|voter| *voter != candidate).take(required) {
                governance.approve_for_admission(candidate, voter).await?;
            }
            admission = governance.register_airline(candidate, first_airline).await?;
        }
        debug!(%candidate, ?admission, "simulated airline admission");
        governance.fund(candidate, AIRLINE_FUNDING).await?;
    }

    let departure = chrono::Utc::now().timestamp().max(0) as u64;
    let mut flights = Vec::new();
    for entry in flight_catalog() {
        let flight = insurance
            .register_flight(first_airline, &entry.name, departure)
            .await?;
        insurance
            .buy(&passenger, &flight.key, PASSENGER_PREMIUM)
            .await?;
        flights.push(flight.key);
    }

    info!(
        airlines = airlines.len(),
        flights = flights.len(),
        %passenger,
        "simulated ledger seeded"
    );
    Ok(SimulatedPool {
        airlines,
        flights,
        passenger,
    })
}

/// Raises a status request for each flight in turn until every flight has a
/// final status.
pub async fn drive_status_requests(
    ledger: Arc<dyn Ledger>,
    insurance: Arc<InsuranceCoordinator>,
    flights: Vec<FlightKey>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        let mut unresolved = Vec::new();
        for flight in &flights {
            if insurance.flight_status(flight).await.is_none() {
                unresolved.push(flight);
            }
        }
        if unresolved.is_empty() {
            info!(flights = flights.len(), "every simulated flight is finalized; request driver stopping");
            return;
        }

        for flight in unresolved {
            ticker.tick().await;
            // May have finalized while waiting for the tick.
            if insurance.flight_status(flight).await.is_some() {
                continue;
            }
            request_status(ledger.as_ref(), flight).await;
        }
    }
}

async fn request_status(ledger: &dyn Ledger, flight: &FlightKey) {
    match ledger
        .request_flight_status(&flight.airline, &flight.flight_id, flight.timestamp)
        .await
    {
        Ok(()) => info!(%flight, "simulated status request raised"),
        Err(LedgerError::Duplicate(_)) => debug!(%flight, "status request still open"),
        Err(err) => debug!(%flight, error = %err, "simulated status request refused"),
    }
}
