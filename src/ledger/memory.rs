//! In-process ledger
//!
//! Enforces the same rules as the deployed FlightSurety program: registration
//! fees, oracle index assignment, matching-response finalization, airline
//! admission and funding, insurance purchase, crediting and withdrawal.
//! Backs the simulated mode of the server and the test-suite.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use super::{EventRecord, Ledger, LedgerEvent, LedgerOutcome};
use crate::error::LedgerError;
use crate::models::{
    required_approvals, Address, Amount, FlightKey, IndexSet, RequestIndex, RequestKey,
    StatusCode, StatusResponse, AIRLINE_FUNDING, DIRECT_ADMISSION_LIMIT, INDEXES_PER_ORACLE,
    INDEX_SPACE, MIN_RESPONSES, PAYOUT_MULTIPLIER, PREMIUM_CEILING, REGISTRATION_FEE,
};

#[derive(Debug, Default)]
struct AirlineEntry {
    registered: bool,
    funded: bool,
    stake: Amount,
    approvals: HashSet<Address>,
}

#[derive(Debug, Default)]
struct OpenRequest {
    open: bool,
    responders: HashSet<Address>,
    tallies: HashMap<StatusCode, usize>,
}

struct LedgerState {
    admin: Address,
    operational: bool,
    rng: StdRng,
    balances: HashMap<Address, Amount>,
    oracles: HashMap<Address, IndexSet>,
    preset_indexes: HashMap<Address, IndexSet>,
    forced_request_indexes: VecDeque<RequestIndex>,
    refused_admissions: VecDeque<String>,
    airlines: HashMap<Address, AirlineEntry>,
    requests: HashMap<RequestKey, OpenRequest>,
    flights: HashSet<FlightKey>,
    flight_statuses: HashMap<FlightKey, StatusCode>,
    premiums: HashMap<(Address, FlightKey), Amount>,
    credited: HashSet<(Address, FlightKey)>,
    credits: HashMap<Address, Amount>,
    submission_calls: Vec<StatusResponse>,
    events: Vec<LedgerEvent>,
}

impl LedgerState {
    fn require_operational(&self) -> Result<(), LedgerError> {
        if self.operational {
            Ok(())
        } else {
            Err(LedgerError::Paused)
        }
    }

    fn debit(&mut self, account: &Address, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.balances.entry(account.clone()).or_default();
        if *balance < amount {
            return Err(LedgerError::Rejected(format!(
                "insufficient funds in {account}: balance {balance}, required {amount}"
            )));
        }
        *balance -= amount;
        Ok(())
    }

    fn airline_active(&self, airline: &Address) -> bool {
        self.airlines
            .get(airline)
            .map(|entry| entry.registered && entry.funded)
            .unwrap_or(false)
    }

    fn registered_count(&self) -> usize {
        self.airlines.values().filter(|entry| entry.registered).count()
    }

    fn emit(&mut self, event: LedgerEvent) {
        self.events.push(event);
    }

    fn draw_indexes(&mut self) -> Result<IndexSet, LedgerError> {
        let picked = rand::seq::index::sample(&mut self.rng, INDEX_SPACE as usize, INDEXES_PER_ORACLE)
            .into_vec();
        let mut indexes = [0u8; INDEXES_PER_ORACLE];
        for (slot, index) in indexes.iter_mut().zip(picked) {
            *slot = index as RequestIndex;
        }
        IndexSet::new(indexes).map_err(|err| LedgerError::Rejected(err.to_string()))
    }
}

/// Ledger kept entirely in process memory
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    submit_latency: Mutex<Option<Duration>>,
    admission_latency: Mutex<Option<Duration>>,
}

impl MemoryLedger {
    /// Deploys a ledger owned by `admin` with `first_airline` registered.
    pub fn new(admin: Address, first_airline: Address, seed: u64) -> Self {
        let mut airlines = HashMap::new();
        airlines.insert(
            first_airline,
            AirlineEntry {
                registered: true,
                ..AirlineEntry::default()
            },
        );

        Self {
            state: Mutex::new(LedgerState {
                admin,
                operational: true,
                rng: StdRng::seed_from_u64(seed),
                balances: HashMap::new(),
                oracles: HashMap::new(),
                preset_indexes: HashMap::new(),
                forced_request_indexes: VecDeque::new(),
                refused_admissions: VecDeque::new(),
                airlines,
                requests: HashMap::new(),
                flights: HashSet::new(),
                flight_statuses: HashMap::new(),
                premiums: HashMap::new(),
                credited: HashSet::new(),
                credits: HashMap::new(),
                submission_calls: Vec::new(),
                events: Vec::new(),
            }),
            submit_latency: Mutex::new(None),
            admission_latency: Mutex::new(None),
        }
    }

    /// Adds value to an account's wallet balance.
    pub async fn deposit(&self, account: &Address, amount: Amount) {
        let mut state = self.state.lock().await;
        *state.balances.entry(account.clone()).or_default() += amount;
    }

    pub async fn balance_of(&self, account: &Address) -> Amount {
        let state = self.state.lock().await;
        state.balances.get(account).copied().unwrap_or_default()
    }

    /// Indexes handed to `oracle` when it registers, instead of random ones.
    pub async fn preset_indexes(&self, oracle: &Address, indexes: IndexSet) {
        let mut state = self.state.lock().await;
        state.preset_indexes.insert(oracle.clone(), indexes);
    }

    /// Index used by the next status request, instead of a random one.
    pub async fn force_next_request_index(&self, index: RequestIndex) {
        let mut state = self.state.lock().await;
        state.forced_request_indexes.push_back(index);
    }

    /// Delay applied to every status submission before it is processed.
    pub async fn set_submit_latency(&self, latency: Option<Duration>) {
        *self.submit_latency.lock().await = latency;
    }

    /// Delay applied to every admission call before it is processed.
    pub async fn set_admission_latency(&self, latency: Option<Duration>) {
        *self.admission_latency.lock().await = latency;
    }

    /// Makes the next admission call fail with `LedgerError::Rejected`.
    pub async fn refuse_next_admission(&self, reason: &str) {
        let mut state = self.state.lock().await;
        state.refused_admissions.push_back(reason.to_string());
    }

    /// Every submission call that reached the ledger, accepted or not.
    pub async fn submission_calls(&self) -> Vec<StatusResponse> {
        self.state.lock().await.submission_calls.clone()
    }

    pub async fn flight_status(&self, flight: &FlightKey) -> Option<StatusCode> {
        self.state.lock().await.flight_statuses.get(flight).copied()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn registration_fee(&self) -> Result<Amount, LedgerError> {
        Ok(REGISTRATION_FEE)
    }

    async fn register_oracle(&self, oracle: &Address, fee: Amount) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        if fee < REGISTRATION_FEE {
            return Err(LedgerError::Rejected(format!(
                "registration fee of {REGISTRATION_FEE} is required, got {fee}"
            )));
        }
        if state.oracles.contains_key(oracle) {
            return Err(LedgerError::Duplicate(format!("oracle {oracle} already registered")));
        }
        state.debit(oracle, fee)?;

        let indexes = match state.preset_indexes.remove(oracle) {
            Some(indexes) => indexes,
            None => state.draw_indexes()?,
        };
        state.oracles.insert(oracle.clone(), indexes);
        Ok(())
    }

    async fn assigned_indexes(&self, oracle: &Address) -> Result<IndexSet, LedgerError> {
        let state = self.state.lock().await;
        state
            .oracles
            .get(oracle)
            .copied()
            .ok_or_else(|| LedgerError::Rejected(format!("{oracle} is not a registered oracle")))
    }

    async fn submit_status_response(&self, response: &StatusResponse) -> Result<(), LedgerError> {
        let latency = *self.submit_latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        state.submission_calls.push(response.clone());
        state.require_operational()?;

        let holds_index = state
            .oracles
            .get(&response.oracle)
            .map(|indexes| indexes.contains(response.index))
            .unwrap_or(false);
        if !holds_index {
            return Err(LedgerError::Rejected(
                "index does not match oracle request".to_string(),
            ));
        }

        let flight = FlightKey::new(
            response.airline.clone(),
            response.flight_id.clone(),
            response.timestamp,
        );
        let key = RequestKey {
            index: response.index,
            flight: flight.clone(),
        };

        let request = state
            .requests
            .get_mut(&key)
            .filter(|request| request.open)
            .ok_or_else(|| LedgerError::Rejected(format!("no open request {key}")))?;

        if !request.responders.insert(response.oracle.clone()) {
            return Err(LedgerError::Duplicate(format!(
                "oracle {} already answered {key}",
                response.oracle
            )));
        }
        let tally = request.tallies.entry(response.status).or_default();
        *tally += 1;
        let finalized = *tally >= MIN_RESPONSES;
        if finalized {
            request.open = false;
        }

        state.emit(LedgerEvent::StatusReportSubmitted {
            index: response.index,
            airline: response.airline.clone(),
            flight_id: response.flight_id.clone(),
            timestamp: response.timestamp,
            status_code: response.status.code(),
        });

        if finalized {
            state.flight_statuses.insert(flight, response.status);
            state.emit(LedgerEvent::StatusFinalized {
                airline: response.airline.clone(),
                flight_id: response.flight_id.clone(),
                timestamp: response.timestamp,
                status_code: response.status.code(),
            });
        }
        Ok(())
    }

    async fn request_flight_status(
        &self,
        airline: &Address,
        flight_id: &str,
        timestamp: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        let flight = FlightKey::new(airline.clone(), flight_id, timestamp);
        let already_open = state
            .requests
            .iter()
            .any(|(key, request)| key.flight == flight && request.open);
        if already_open {
            return Err(LedgerError::Duplicate(format!("a request for {flight} is already open")));
        }

        let index = match state.forced_request_indexes.pop_front() {
            Some(index) => index,
            None => state.rng.gen_range(0..INDEX_SPACE),
        };
        state.requests.insert(
            RequestKey { index, flight },
            OpenRequest {
                open: true,
                ..OpenRequest::default()
            },
        );
        state.emit(LedgerEvent::StatusRequest {
            index,
            airline: airline.clone(),
            flight_id: flight_id.to_string(),
            timestamp,
        });
        Ok(())
    }

    async fn fund(&self, airline: &Address, amount: Amount) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        if amount < AIRLINE_FUNDING {
            return Err(LedgerError::Rejected(format!(
                "funding of {AIRLINE_FUNDING} is required, got {amount}"
            )));
        }
        state.debit(airline, amount)?;

        let entry = state.airlines.entry(airline.clone()).or_default();
        entry.funded = true;
        entry.stake += amount;
        state.emit(LedgerEvent::FundingReceived {
            airline: airline.clone(),
        });
        Ok(())
    }

    async fn register_airline(
        &self,
        candidate: &Address,
        proposer: &Address,
    ) -> Result<LedgerOutcome, LedgerError> {
        let latency = *self.admission_latency.lock().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        state.require_operational()?;
        if let Some(reason) = state.refused_admissions.pop_front() {
            return Err(LedgerError::Rejected(reason));
        }

        if !state.airline_active(proposer) {
            return Err(LedgerError::Rejected(format!(
                "{proposer} must be a registered, funded airline"
            )));
        }
        if state
            .airlines
            .get(candidate)
            .map(|entry| entry.registered)
            .unwrap_or(false)
        {
            return Err(LedgerError::Duplicate(format!("{candidate} is already registered")));
        }

        let registered = state.registered_count();
        let admitted = registered < DIRECT_ADMISSION_LIMIT
            || state
                .airlines
                .get(candidate)
                .map(|entry| entry.approvals.len() >= required_approvals(registered))
                .unwrap_or(false);
        if !admitted {
            return Ok(LedgerOutcome::NotApplied);
        }

        state.airlines.entry(candidate.clone()).or_default().registered = true;
        state.emit(LedgerEvent::AirlineRegistered {
            airline: candidate.clone(),
        });
        Ok(LedgerOutcome::Applied)
    }

    async fn approve_for_admission(
        &self,
        candidate: &Address,
        voter: &Address,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        if !state.airline_active(voter) {
            return Err(LedgerError::Rejected(format!(
                "{voter} must be a registered, funded airline"
            )));
        }
        let entry = state.airlines.entry(candidate.clone()).or_default();
        if entry.registered {
            return Err(LedgerError::Rejected(format!("{candidate} is already registered")));
        }
        if !entry.approvals.insert(voter.clone()) {
            return Err(LedgerError::Duplicate(format!("{voter} already approved {candidate}")));
        }
        Ok(())
    }

    async fn is_registered(&self, airline: &Address) -> Result<bool, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.airlines.get(airline).map(|e| e.registered).unwrap_or(false))
    }

    async fn is_funded(&self, airline: &Address) -> Result<bool, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.airlines.get(airline).map(|e| e.funded).unwrap_or(false))
    }

    async fn registered_airline_count(&self) -> Result<usize, LedgerError> {
        Ok(self.state.lock().await.registered_count())
    }

    async fn approval_count(&self, candidate: &Address) -> Result<usize, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.airlines.get(candidate).map(|e| e.approvals.len()).unwrap_or(0))
    }

    async fn is_operational(&self) -> Result<bool, LedgerError> {
        Ok(self.state.lock().await.operational)
    }

    async fn set_operating_status(
        &self,
        caller: &Address,
        operational: bool,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if *caller != state.admin {
            return Err(LedgerError::Rejected("caller is not the contract owner".to_string()));
        }
        state.operational = operational;
        Ok(())
    }

    async fn register_flight(&self, flight: &FlightKey) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        if !state.airline_active(&flight.airline) {
            return Err(LedgerError::Rejected(format!(
                "{} must be a registered, funded airline",
                flight.airline
            )));
        }
        if !state.flights.insert(flight.clone()) {
            return Err(LedgerError::Duplicate(format!("flight {flight} already registered")));
        }
        Ok(())
    }

    async fn buy_insurance(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        premium: Amount,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        if !state.airline_active(&flight.airline) {
            return Err(LedgerError::Rejected(format!(
                "{} is not a registered, funded airline",
                flight.airline
            )));
        }
        if premium == 0 || premium > PREMIUM_CEILING {
            return Err(LedgerError::Rejected(format!(
                "premium must be between 1 and {PREMIUM_CEILING}, got {premium}"
            )));
        }
        let policy = (passenger.clone(), flight.clone());
        if state.premiums.contains_key(&policy) {
            return Err(LedgerError::Duplicate(format!(
                "{passenger} already insured on {flight}"
            )));
        }
        state.debit(passenger, premium)?;
        state.premiums.insert(policy, premium);
        state.emit(LedgerEvent::PassengerInsured {
            passenger: passenger.clone(),
            flight: flight.clone(),
            premium: premium.to_string(),
        });
        Ok(())
    }

    async fn credit_insuree(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        let policy = (passenger.clone(), flight.clone());
        let premium = state
            .premiums
            .get(&policy)
            .copied()
            .ok_or_else(|| LedgerError::Rejected(format!("{passenger} holds no policy on {flight}")))?;

        match state.flight_statuses.get(flight) {
            Some(status) if status.is_delay() => {}
            _ => {
                return Err(LedgerError::Rejected(format!("{flight} has no delay status")));
            }
        }
        if amount > PAYOUT_MULTIPLIER.apply(premium) {
            return Err(LedgerError::Rejected(format!(
                "credit of {amount} exceeds the policy payout"
            )));
        }
        if !state.credited.insert(policy) {
            return Err(LedgerError::Duplicate(format!(
                "{passenger} already credited for {flight}"
            )));
        }
        *state.credits.entry(passenger.clone()).or_default() += amount;
        Ok(())
    }

    async fn passenger_credits(&self, passenger: &Address) -> Result<Amount, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.credits.get(passenger).copied().unwrap_or_default())
    }

    async fn withdraw(&self, passenger: &Address) -> Result<Amount, LedgerError> {
        let mut state = self.state.lock().await;
        state.require_operational()?;

        let amount = state.credits.remove(passenger).unwrap_or_default();
        if amount > 0 {
            *state.balances.entry(passenger.clone()).or_default() += amount;
        }
        Ok(amount)
    }

    async fn events_since(
        &self,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .enumerate()
            .skip(cursor as usize)
            .take(limit)
            .map(|(sequence, event)| EventRecord {
                sequence: sequence as u64,
                event: event.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::ETHER;

    fn deploy() -> (MemoryLedger, Address, Address) {
        let admin = Address::derived("owner");
        let first = Address::derived("airline-1");
        (MemoryLedger::new(admin.clone(), first.clone(), 7), admin, first)
    }

    #[tokio::test]
    async fn test_oracle_registration_charges_fee_and_assigns_indexes() {
        let (ledger, _, _) = deploy();
        let oracle = Address::derived("oracle-1");
        ledger.deposit(&oracle, 2 * ETHER).await;

        assert!(matches!(
            ledger.register_oracle(&oracle, ETHER / 2).await,
            Err(LedgerError::Rejected(_))
        ));
        ledger.register_oracle(&oracle, ETHER).await.unwrap();
        assert_eq!(ledger.balance_of(&oracle).await, ETHER);

        let indexes = ledger.assigned_indexes(&oracle).await.unwrap();
        assert!(indexes.indexes().iter().all(|i| *i < INDEX_SPACE));
        assert!(matches!(
            ledger.register_oracle(&oracle, ETHER).await,
            Err(LedgerError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_three_matching_responses_finalize() {
        let (ledger, _, first) = deploy();
        let oracles: Vec<_> = (0..4).map(|i| Address::derived(&format!("oracle-{i}"))).collect();
        for oracle in &oracles {
            ledger.deposit(oracle, ETHER).await;
            ledger.preset_indexes(oracle, IndexSet::new([2, 5, 8]).unwrap()).await;
            ledger.register_oracle(oracle, ETHER).await.unwrap();
        }
        ledger.force_next_request_index(5).await;
        ledger.request_flight_status(&first, "KAL496946", 1_700_000_000).await.unwrap();

        let answer = |oracle: &Address, status| StatusResponse {
            index: 5,
            airline: first.clone(),
            flight_id: "KAL496946".to_string(),
            timestamp: 1_700_000_000,
            status,
            oracle: oracle.clone(),
        };

        ledger.submit_status_response(&answer(&oracles[0], StatusCode::LateAirline)).await.unwrap();
        ledger.submit_status_response(&answer(&oracles[1], StatusCode::OnTime)).await.unwrap();
        assert!(matches!(
            ledger.submit_status_response(&answer(&oracles[0], StatusCode::LateAirline)).await,
            Err(LedgerError::Duplicate(_))
        ));
        ledger.submit_status_response(&answer(&oracles[2], StatusCode::LateAirline)).await.unwrap();

        let flight = FlightKey::new(first.clone(), "KAL496946", 1_700_000_000);
        assert_eq!(ledger.flight_status(&flight).await, None);

        ledger.submit_status_response(&answer(&oracles[3], StatusCode::LateAirline)).await.unwrap();
        assert_eq!(ledger.flight_status(&flight).await, Some(StatusCode::LateAirline));

        let events = ledger.events_since(0, 100).await.unwrap();
        assert!(matches!(
            events.last().map(|record| &record.event),
            Some(LedgerEvent::StatusFinalized { status_code: 20, .. })
        ));
    }

    #[tokio::test]
    async fn test_only_owner_toggles_operating_status() {
        let (ledger, admin, first) = deploy();

        assert!(ledger.set_operating_status(&first, false).await.is_err());
        assert!(ledger.is_operational().await.unwrap());

        ledger.set_operating_status(&admin, false).await.unwrap();
        assert!(!ledger.is_operational().await.unwrap());
        assert_eq!(ledger.fund(&first, 10 * ETHER).await, Err(LedgerError::Paused));
    }

    #[tokio::test]
    async fn test_events_since_respects_cursor_and_limit() {
        let (ledger, _, first) = deploy();
        ledger.deposit(&first, 50 * ETHER).await;
        for _ in 0..3 {
            ledger.fund(&first, 10 * ETHER).await.unwrap();
        }

        let tail = ledger.events_since(1, 10).await.unwrap();
        assert_eq!(tail.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ledger.events_since(0, 1).await.unwrap().len(), 1);
        assert!(ledger.events_since(3, 10).await.unwrap().is_empty());
    }
}
