//! Insurance coordinator
//!
//! Sells flight-delay policies on flights of funded airlines, credits
//! payouts once the ledger has finalized a delay status and lets
//! passengers withdraw what they have been credited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CoreError, LedgerError, Result, ValidationError};
use crate::ledger::{bounded, Ledger, ReadRetry, SharedLedger};
use crate::models::{
    Address, Amount, Flight, FlightKey, InsurancePolicy, Outcome, PolicyHandle, StatusCode,
    PAYOUT_MULTIPLIER, PREMIUM_CEILING,
};
use crate::services::governance::GovernanceVoter;

#[derive(Debug, Default)]
struct PolicyBook {
    flights: HashMap<FlightKey, Flight>,
    policies: HashMap<PolicyHandle, InsurancePolicy>,
    holdings: HashMap<(Address, FlightKey), PolicyHandle>,
    statuses: HashMap<FlightKey, StatusCode>,
}

impl PolicyBook {
    fn insert(&mut self, policy: InsurancePolicy) {
        self.holdings.insert(
            (policy.passenger.clone(), policy.flight.clone()),
            policy.handle,
        );
        self.policies.insert(policy.handle, policy);
    }

    fn holds(&self, passenger: &Address, flight: &FlightKey) -> bool {
        self.holdings
            .contains_key(&(passenger.clone(), flight.clone()))
    }
}

pub struct InsuranceCoordinator {
    ledger: SharedLedger,
    governance: Arc<GovernanceVoter>,
    call_timeout: Duration,
    reads: ReadRetry,
    book: RwLock<PolicyBook>,
}

impl InsuranceCoordinator {
    pub fn new(ledger: SharedLedger, governance: Arc<GovernanceVoter>, call_timeout: Duration) -> Self {
        Self {
            ledger,
            governance,
            call_timeout,
            reads: ReadRetry::new(call_timeout),
            book: RwLock::new(PolicyBook::default()),
        }
    }

    /// Registers a flight of `airline` so that passengers can insure it.
    pub async fn register_flight(
        &self,
        airline: &Address,
        flight_id: &str,
        timestamp: u64,
    ) -> Result<Flight> {
        let key = FlightKey::new(airline.clone(), flight_id, timestamp);
        if !self.governance.is_active(airline).await? {
            return Err(CoreError::IneligibleFlight { flight: key });
        }
        if self.book.read().await.flights.contains_key(&key) {
            return Err(ValidationError::FlightAlreadyRegistered(key).into());
        }

        match bounded(self.call_timeout, self.ledger.register_flight(&key)).await {
            Ok(()) => {}
            Err(LedgerError::Duplicate(_)) => {
                return Err(ValidationError::FlightAlreadyRegistered(key).into())
            }
            Err(err) => return Err(err.into()),
        }

        let flight = Flight {
            key: key.clone(),
            registered_at: Utc::now(),
        };
        self.book.write().await.flights.insert(key, flight.clone());
        info!(flight = %flight.key, "flight registered");
        Ok(flight)
    }

    /// Buys a policy for `passenger` on `flight`.
    pub async fn buy(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        premium: Amount,
    ) -> Result<PolicyHandle> {
        if premium == 0 {
            return Err(ValidationError::ZeroPremium.into());
        }
        if premium > PREMIUM_CEILING {
            return Err(ValidationError::PremiumAboveCeiling {
                premium,
                ceiling: PREMIUM_CEILING,
            }
            .into());
        }
        if !self.governance.is_active(&flight.airline).await? {
            return Err(CoreError::IneligibleFlight {
                flight: flight.clone(),
            });
        }
        if self.book.read().await.holds(passenger, flight) {
            return Err(already_insured(passenger, flight));
        }

        match bounded(
            self.call_timeout,
            self.ledger.buy_insurance(passenger, flight, premium),
        )
        .await
        {
            Ok(()) => {}
            Err(LedgerError::Duplicate(_)) => return Err(already_insured(passenger, flight)),
            Err(err) => return Err(err.into()),
        }

        let policy = InsurancePolicy {
            handle: PolicyHandle::new(),
            passenger: passenger.clone(),
            flight: flight.clone(),
            premium,
            multiplier: PAYOUT_MULTIPLIER,
            claimed: false,
        };
        let handle = policy.handle;

        let mut book = self.book.write().await;
        // The purchase event may have been observed before this write.
        if let Some(existing) = book.holdings.get(&(passenger.clone(), flight.clone())) {
            return Ok(*existing);
        }
        book.insert(policy);
        info!(%passenger, %flight, premium = %premium, policy = %handle, "insurance purchased");
        Ok(handle)
    }

    /// Records a finalized status and credits every policy on the flight.
    /// Returns how many policies were credited by this call.
    pub async fn on_flight_finalized(&self, flight: &FlightKey, status: StatusCode) -> usize {
        let handles: Vec<PolicyHandle> = {
            let mut book = self.book.write().await;
            book.statuses.insert(flight.clone(), status);
            book.policies
                .values()
                .filter(|policy| policy.flight == *flight)
                .map(|policy| policy.handle)
                .collect()
        };

        if !status.is_delay() {
            debug!(%flight, %status, policies = handles.len(), "no payout for status");
            return 0;
        }

        let mut credited = 0;
        for handle in handles {
            match self.credit(handle).await {
                Ok(Outcome::Applied) => credited += 1,
                Ok(Outcome::NotApplied) => {}
                Err(err) => warn!(policy = %handle, error = %err, "crediting policy failed"),
            }
        }
        info!(%flight, %status, credited, "flight payouts processed");
        credited
    }

    /// Credits a policy's payout if its flight finalized with a delay status.
    ///
    /// Not-yet-finalized, non-delay and already-claimed policies come back
    /// as `Outcome::NotApplied`.
    pub async fn credit(&self, handle: PolicyHandle) -> Result<Outcome> {
        let (policy, status) = {
            let book = self.book.read().await;
            let policy = book
                .policies
                .get(&handle)
                .cloned()
                .ok_or_else(|| ValidationError::UnknownPolicy(handle.to_string()))?;
            let status = book.statuses.get(&policy.flight).copied();
            (policy, status)
        };

        if policy.claimed {
            return Ok(Outcome::NotApplied);
        }
        match status {
            Some(status) if status.is_delay() => {}
            _ => return Ok(Outcome::NotApplied),
        }

        let payout = policy.payout();
        let outcome = match bounded(
            self.call_timeout,
            self.ledger
                .credit_insuree(&policy.passenger, &policy.flight, payout),
        )
        .await
        {
            Ok(()) => Outcome::Applied,
            Err(LedgerError::Duplicate(_)) => Outcome::NotApplied,
            Err(err) => return Err(err.into()),
        };

        if let Some(policy) = self.book.write().await.policies.get_mut(&handle) {
            policy.claimed = true;
        }
        if outcome.is_applied() {
            info!(policy = %handle, passenger = %policy.passenger, payout = %payout, "policy credited");
        }
        Ok(outcome)
    }

    /// Pays out the passenger's whole credited balance. A zero balance is a
    /// no-op that returns zero.
    pub async fn withdraw(&self, passenger: &Address) -> Result<Amount> {
        if self.credits_of(passenger).await? == 0 {
            return Ok(0);
        }

        let amount = bounded(self.call_timeout, self.ledger.withdraw(passenger)).await?;
        info!(%passenger, amount = %amount, "credits withdrawn");
        Ok(amount)
    }

    pub async fn credits_of(&self, passenger: &Address) -> Result<Amount> {
        let ledger: &dyn Ledger = self.ledger.as_ref();
        Ok(self
            .reads
            .read(move || ledger.passenger_credits(passenger))
            .await?)
    }

    /// Policies held by `passenger`, in no particular order.
    pub async fn policies_of(&self, passenger: &Address) -> Vec<InsurancePolicy> {
        self.book
            .read()
            .await
            .policies
            .values()
            .filter(|policy| policy.passenger == *passenger)
            .cloned()
            .collect()
    }

    pub async fn policy(&self, handle: PolicyHandle) -> Option<InsurancePolicy> {
        self.book.read().await.policies.get(&handle).cloned()
    }

    pub async fn flight_status(&self, flight: &FlightKey) -> Option<StatusCode> {
        self.book.read().await.statuses.get(flight).copied()
    }

    /// Tracks a purchase seen on the ledger that this process did not make.
    pub async fn on_passenger_insured(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        premium: Amount,
    ) -> Option<PolicyHandle> {
        let mut book = self.book.write().await;
        if book.holds(passenger, flight) {
            return None;
        }

        let policy = InsurancePolicy {
            handle: PolicyHandle::new(),
            passenger: passenger.clone(),
            flight: flight.clone(),
            premium,
            multiplier: PAYOUT_MULTIPLIER,
            claimed: false,
        };
        let handle = policy.handle;
        book.insert(policy);
        debug!(%passenger, %flight, policy = %handle, "tracking policy bought elsewhere");
        Some(handle)
    }
}

fn already_insured(passenger: &Address, flight: &FlightKey) -> CoreError {
    ValidationError::AlreadyInsured {
        passenger: passenger.clone(),
        flight: flight.clone(),
    }
    .into()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::{IndexSet, StatusResponse, AIRLINE_FUNDING, ETHER};

    const DEPARTURE: u64 = 1_700_000_000;

    struct Desk {
        ledger: Arc<MemoryLedger>,
        insurance: InsuranceCoordinator,
        airline: Address,
        passenger: Address,
    }

    async fn desk(fund_airline: bool) -> Desk {
        let owner = Address::derived("owner");
        let airline = Address::derived("airline-1");
        let passenger = Address::derived("passenger-1");
        let ledger = Arc::new(MemoryLedger::new(owner, airline.clone(), 9));
        ledger.deposit(&airline, 20 * ETHER).await;
        ledger.deposit(&passenger, 5 * ETHER).await;

        let governance = Arc::new(GovernanceVoter::new(ledger.clone(), Duration::from_secs(1)));
        if fund_airline {
            governance.fund(&airline, AIRLINE_FUNDING).await.unwrap();
        }
        let insurance = InsuranceCoordinator::new(ledger.clone(), governance, Duration::from_secs(1));

        Desk {
            ledger,
            insurance,
            airline,
            passenger,
        }
    }

    /// Drives three matching oracle answers through the ledger.
    async fn finalize_on_ledger(ledger: &MemoryLedger, flight: &FlightKey, status: StatusCode) {
        let oracles: Vec<_> = (0..3)
            .map(|n| Address::derived(&format!("finalizer-{n}")))
            .collect();
        for oracle in &oracles {
            ledger.deposit(oracle, ETHER).await;
            ledger.preset_indexes(oracle, IndexSet::new([0, 1, 2]).unwrap()).await;
            ledger.register_oracle(oracle, ETHER).await.unwrap();
        }
        ledger.force_next_request_index(1).await;
        ledger
            .request_flight_status(&flight.airline, &flight.flight_id, flight.timestamp)
            .await
            .unwrap();
        for oracle in oracles {
            let response = StatusResponse {
                index: 1,
                airline: flight.airline.clone(),
                flight_id: flight.flight_id.clone(),
                timestamp: flight.timestamp,
                status,
                oracle,
            };
            ledger.submit_status_response(&response).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_delayed_flight_pays_one_and_a_half_premium_once() {
        let desk = desk(true).await;
        let flight = desk
            .insurance
            .register_flight(&desk.airline, "KAL496946", DEPARTURE)
            .await
            .unwrap()
            .key;
        let premium = 2 * ETHER / 5;
        let handle = desk.insurance.buy(&desk.passenger, &flight, premium).await.unwrap();

        finalize_on_ledger(&desk.ledger, &flight, StatusCode::LateAirline).await;
        assert_eq!(
            desk.insurance
                .on_flight_finalized(&flight, StatusCode::LateAirline)
                .await,
            1
        );
        assert_eq!(desk.insurance.credit(handle).await, Ok(Outcome::NotApplied));
        assert_eq!(
            desk.insurance.on_flight_finalized(&flight, StatusCode::LateAirline).await,
            0
        );

        assert_eq!(desk.insurance.credits_of(&desk.passenger).await, Ok(3 * premium / 2));
        assert_eq!(desk.insurance.withdraw(&desk.passenger).await, Ok(3 * premium / 2));
        assert_eq!(desk.insurance.withdraw(&desk.passenger).await, Ok(0));
        assert!(desk.insurance.policy(handle).await.unwrap().claimed);
    }

    #[tokio::test]
    async fn test_on_time_flight_credits_nothing() {
        let desk = desk(true).await;
        let flight = FlightKey::new(desk.airline.clone(), "LTH446466", DEPARTURE);
        let handle = desk.insurance.buy(&desk.passenger, &flight, ETHER).await.unwrap();

        assert_eq!(desk.insurance.credit(handle).await, Ok(Outcome::NotApplied));

        finalize_on_ledger(&desk.ledger, &flight, StatusCode::OnTime).await;
        assert_eq!(desk.insurance.on_flight_finalized(&flight, StatusCode::OnTime).await, 0);
        assert_eq!(desk.insurance.credit(handle).await, Ok(Outcome::NotApplied));
        assert_eq!(desk.insurance.withdraw(&desk.passenger).await, Ok(0));
    }

    #[tokio::test]
    async fn test_premium_bounds_are_enforced() {
        let desk = desk(true).await;
        let flight = FlightKey::new(desk.airline.clone(), "KLM467454", DEPARTURE);

        assert_eq!(
            desk.insurance.buy(&desk.passenger, &flight, 0).await,
            Err(CoreError::Validation(ValidationError::ZeroPremium))
        );
        assert_eq!(
            desk.insurance
                .buy(&desk.passenger, &flight, PREMIUM_CEILING + 1)
                .await,
            Err(CoreError::Validation(ValidationError::PremiumAboveCeiling {
                premium: PREMIUM_CEILING + 1,
                ceiling: PREMIUM_CEILING,
            }))
        );
        assert_eq!(desk.ledger.balance_of(&desk.passenger).await, 5 * ETHER);

        desk.insurance
            .buy(&desk.passenger, &flight, PREMIUM_CEILING)
            .await
            .unwrap();
        assert!(matches!(
            desk.insurance.buy(&desk.passenger, &flight, ETHER / 2).await,
            Err(CoreError::Validation(ValidationError::AlreadyInsured { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unfunded_airline_flights_are_ineligible() {
        let desk = desk(false).await;
        let flight = FlightKey::new(desk.airline.clone(), "LTH674545", DEPARTURE);

        assert_eq!(
            desk.insurance.buy(&desk.passenger, &flight, ETHER).await,
            Err(CoreError::IneligibleFlight {
                flight: flight.clone()
            })
        );
        assert!(matches!(
            desk.insurance
                .register_flight(&desk.airline, "LTH674545", DEPARTURE)
                .await,
            Err(CoreError::IneligibleFlight { .. })
        ));
    }

    #[tokio::test]
    async fn test_flights_register_once() {
        let desk = desk(true).await;
        desk.insurance
            .register_flight(&desk.airline, "KLM452333", DEPARTURE)
            .await
            .unwrap();

        assert!(matches!(
            desk.insurance
                .register_flight(&desk.airline, "KLM452333", DEPARTURE)
                .await,
            Err(CoreError::Validation(ValidationError::FlightAlreadyRegistered(_)))
        ));
    }

    #[tokio::test]
    async fn test_observed_purchases_are_tracked_once() {
        let desk = desk(true).await;
        let flight = FlightKey::new(desk.airline.clone(), "KAL496946", DEPARTURE);
        let elsewhere = Address::derived("passenger-2");

        let handle = desk
            .insurance
            .on_passenger_insured(&elsewhere, &flight, ETHER / 4)
            .await
            .unwrap();
        assert!(desk
            .insurance
            .on_passenger_insured(&elsewhere, &flight, ETHER / 4)
            .await
            .is_none());

        let policies = desk.insurance.policies_of(&elsewhere).await;
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].handle, handle);
        assert_eq!(policies[0].payout(), 3 * ETHER / 8);
    }

    #[tokio::test]
    async fn test_unknown_policy_is_a_validation_error() {
        let desk = desk(true).await;
        assert!(matches!(
            desk.insurance.credit(PolicyHandle::new()).await,
            Err(CoreError::Validation(ValidationError::UnknownPolicy(_)))
        ));
    }
}
