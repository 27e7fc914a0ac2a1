//! Response dispatcher
//!
//! Reacts to status-request notifications by submitting one response per
//! eligible oracle, and follows the request until the ledger finalizes it.
//! The dispatcher is owned by the coordinator task and mutated only there.
//!
//! Requests are identified by the sequence of the ledger event that
//! announced them, so a later request for the same flight is always a new
//! request even when it draws the same index. Only the current request's
//! submissions are remembered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::ledger::{bounded, Ledger, ReadRetry, SharedLedger};
use crate::models::{
    Address, FlightKey, RequestKey, StatusCode, StatusReport, StatusRequest, StatusResponse,
};
use crate::services::oracle_registry::OracleRegistry;
use crate::services::status_source::StatusSource;

/// Lifecycle of a tracked status request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Open,
    Finalized,
    Expired,
}

#[derive(Debug)]
struct TrackedRequest {
    request: StatusRequest,
    state: RequestState,
    opened_at: Instant,
    reports: usize,
    deferred: bool,
}

impl TrackedRequest {
    fn open(request: StatusRequest) -> Self {
        Self {
            request,
            state: RequestState::Open,
            opened_at: Instant::now(),
            reports: 0,
            deferred: false,
        }
    }
}

/// What happened to one oracle's submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    Accepted { oracle: Address },
    /// The ledger already holds this oracle's answer.
    Suppressed { oracle: Address },
    Rejected { oracle: Address, reason: String },
    Failed { oracle: Address, error: LedgerError },
}

/// Summary of one dispatch pass over the eligible oracles
#[derive(Debug)]
pub struct DispatchSummary {
    pub eligible: usize,
    pub launched: usize,
    pub suppressed: usize,
    pub deferred: bool,
    /// Resolves once every launched submission has settled.
    pub handle: Option<JoinHandle<Vec<SubmissionResult>>>,
}

impl DispatchSummary {
    fn idle(eligible: usize, deferred: bool) -> Self {
        Self {
            eligible,
            launched: 0,
            suppressed: 0,
            deferred,
            handle: None,
        }
    }
}

pub struct ResponseDispatcher {
    ledger: SharedLedger,
    registry: Arc<OracleRegistry>,
    source: Arc<dyn StatusSource>,
    call_timeout: Duration,
    reads: ReadRetry,
    request_ttl: Option<Duration>,
    current: Option<TrackedRequest>,
    /// Oracles already submitted for the current request
    submitted: HashSet<Address>,
}

impl ResponseDispatcher {
    pub fn new(
        ledger: SharedLedger,
        registry: Arc<OracleRegistry>,
        source: Arc<dyn StatusSource>,
        call_timeout: Duration,
        request_ttl: Option<Duration>,
    ) -> Self {
        Self {
            ledger,
            registry,
            source,
            call_timeout,
            reads: ReadRetry::new(call_timeout),
            request_ttl,
            current: None,
            submitted: HashSet::new(),
        }
    }

    /// Makes `request` the current one and submits for every eligible oracle.
    ///
    /// Replays of the current request only submit for oracles not yet
    /// submitted; replays of older requests are ignored.
    pub async fn on_status_requested(&mut self, request: StatusRequest) -> DispatchSummary {
        let eligible = self.registry.eligible_for(request.index).count();

        match self.current.as_ref().map(|tracked| tracked.request.sequence) {
            Some(current) if request.sequence < current => {
                debug!(
                    request = %request.key(),
                    sequence = request.sequence,
                    current,
                    "ignoring replay of a superseded request"
                );
                return DispatchSummary::idle(eligible, false);
            }
            Some(current) if request.sequence == current => {}
            _ => self.track(request),
        }

        match self.current.as_ref().map(|tracked| tracked.state) {
            Some(RequestState::Open) => self.dispatch_current().await,
            _ => DispatchSummary::idle(eligible, false),
        }
    }

    /// Counts a ledger-accepted report toward the current request.
    ///
    /// Returns `false` for reports that belong to any other request.
    pub fn on_report_submitted(&mut self, report: &StatusReport) -> bool {
        match self.current.as_mut() {
            Some(tracked)
                if tracked.state == RequestState::Open
                    && tracked.request.index == report.index
                    && tracked.request.flight() == report.flight =>
            {
                tracked.reports += 1;
                debug!(
                    request = %tracked.request.key(),
                    status = %report.status,
                    reports = tracked.reports,
                    "status report observed"
                );
                true
            }
            _ => {
                debug!(index = report.index, flight = %report.flight, "discarding stale status report");
                false
            }
        }
    }

    /// Transitions the current request to `Finalized`.
    ///
    /// Returns `true` only on the first finalization of the current request.
    pub fn on_status_finalized(&mut self, flight: &FlightKey, status: StatusCode) -> bool {
        let Some(tracked) = self.current.as_mut() else {
            debug!(%flight, "finalization with no current request");
            return false;
        };

        if tracked.request.flight() != *flight {
            debug!(%flight, current = %tracked.request.key(), "discarding stale finalization");
            return false;
        }
        if tracked.state == RequestState::Finalized {
            return false;
        }

        tracked.state = RequestState::Finalized;
        tracked.deferred = false;
        info!(request = %tracked.request.key(), %status, reports = tracked.reports, "status request finalized");
        self.submitted.clear();
        true
    }

    /// Dispatches a request that arrived while the ledger was paused, once it
    /// is operational again.
    pub async fn resume_deferred(&mut self) -> Option<DispatchSummary> {
        let waiting = self
            .current
            .as_ref()
            .map(|tracked| tracked.state == RequestState::Open && tracked.deferred)
            .unwrap_or(false);
        if !waiting {
            return None;
        }

        let summary = self.dispatch_current().await;
        if summary.deferred {
            None
        } else {
            Some(summary)
        }
    }

    /// Marks the current request `Expired` when it has been open longer than
    /// the configured time-to-live. Without a time-to-live nothing expires.
    pub fn expire_stale(&mut self, now: Instant) -> Option<RequestKey> {
        let ttl = self.request_ttl?;
        let tracked = self.current.as_mut()?;

        if tracked.state != RequestState::Open || now.duration_since(tracked.opened_at) < ttl {
            return None;
        }

        tracked.state = RequestState::Expired;
        tracked.deferred = false;
        let key = tracked.request.key();
        warn!(request = %key, reports = tracked.reports, "status request expired before finalization");
        self.submitted.clear();
        Some(key)
    }

    pub fn current_request(&self) -> Option<&StatusRequest> {
        self.current.as_ref().map(|tracked| &tracked.request)
    }

    pub fn current_state(&self) -> Option<RequestState> {
        self.current.as_ref().map(|tracked| tracked.state)
    }

    pub fn current_reports(&self) -> usize {
        self.current.as_ref().map(|tracked| tracked.reports).unwrap_or(0)
    }

    pub fn is_deferred(&self) -> bool {
        self.current.as_ref().map(|tracked| tracked.deferred).unwrap_or(false)
    }

    /// Sequence of the current request while it is still open.
    pub fn open_sequence(&self) -> Option<u64> {
        self.current
            .as_ref()
            .filter(|tracked| tracked.state == RequestState::Open)
            .map(|tracked| tracked.request.sequence)
    }

    /// Number of oracle submissions remembered for duplicate suppression.
    pub fn recorded_submissions(&self) -> usize {
        self.submitted.len()
    }

    fn track(&mut self, request: StatusRequest) {
        if let Some(previous) = self.current.as_ref() {
            if previous.state == RequestState::Open {
                info!(previous = %previous.request.key(), request = %request.key(), "status request superseded");
            }
        }
        self.submitted.clear();
        self.current = Some(TrackedRequest::open(request));
    }

    async fn dispatch_current(&mut self) -> DispatchSummary {
        let ledger: &dyn Ledger = self.ledger.as_ref();
        let operational = match self.reads.read(move || ledger.is_operational()).await {
            Ok(operational) => operational,
            Err(err) => {
                warn!(error = %err, "could not read the operational flag; deferring dispatch");
                false
            }
        };

        let Some(tracked) = self.current.as_mut() else {
            return DispatchSummary::idle(0, false);
        };
        let request = tracked.request.clone();
        let key = request.key();
        let eligible: Vec<Address> = self.registry.eligible_for(request.index).cloned().collect();

        if !operational {
            if !tracked.deferred {
                info!(request = %key, "ledger paused; deferring status submissions");
            }
            tracked.deferred = true;
            return DispatchSummary::idle(eligible.len(), true);
        }
        tracked.deferred = false;

        let mut responses = Vec::with_capacity(eligible.len());
        let mut suppressed = 0;
        for oracle in &eligible {
            // Recorded before the call so a replayed request never submits twice.
            if !self.submitted.insert(oracle.clone()) {
                suppressed += 1;
                continue;
            }
            let status = self.source.status_for(&request, oracle);
            responses.push(StatusResponse::answering(&request, oracle.clone(), status));
        }

        if suppressed > 0 {
            debug!(request = %key, suppressed, "duplicate submissions suppressed");
        }

        let launched = responses.len();
        let handle = if launched > 0 {
            info!(request = %key, eligible = eligible.len(), launched, "submitting oracle responses");
            Some(spawn_submissions(self.ledger.clone(), responses, self.call_timeout))
        } else {
            None
        };

        DispatchSummary {
            eligible: eligible.len(),
            launched,
            suppressed,
            deferred: false,
            handle,
        }
    }
}

fn spawn_submissions(
    ledger: SharedLedger,
    responses: Vec<StatusResponse>,
    call_timeout: Duration,
) -> JoinHandle<Vec<SubmissionResult>> {
    tokio::spawn(async move {
        let submissions = responses
            .into_iter()
            .map(|response| submit_one(ledger.as_ref(), response, call_timeout));
        join_all(submissions).await
    })
}

async fn submit_one(
    ledger: &dyn Ledger,
    response: StatusResponse,
    call_timeout: Duration,
) -> SubmissionResult {
    let oracle = response.oracle.clone();
    match bounded(call_timeout, ledger.submit_status_response(&response)).await {
        Ok(()) => {
            debug!(%oracle, index = response.index, status = %response.status, "oracle response accepted");
            SubmissionResult::Accepted { oracle }
        }
        Err(LedgerError::Duplicate(reason)) => {
            debug!(%oracle, %reason, "ledger already holds this response");
            SubmissionResult::Suppressed { oracle }
        }
        Err(LedgerError::Rejected(reason)) => {
            warn!(%oracle, %reason, "oracle response rejected");
            SubmissionResult::Rejected { oracle, reason }
        }
        Err(error) => {
            warn!(%oracle, error = %error, "oracle response submission failed");
            SubmissionResult::Failed { oracle, error }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::{IndexSet, ETHER};
    use crate::services::status_source::FixedStatusSource;

    const DEPARTURE: u64 = 1_700_000_000;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        owner: Address,
        airline: Address,
        oracles: Vec<Address>,
    }

    async fn fixture(index_sets: &[[u8; 3]]) -> (Fixture, Arc<OracleRegistry>) {
        let owner = Address::derived("owner");
        let airline = Address::derived("airline-1");
        let ledger = Arc::new(MemoryLedger::new(owner.clone(), airline.clone(), 11));

        let mut oracles = Vec::new();
        for (n, indexes) in index_sets.iter().enumerate() {
            let oracle = Address::derived(&format!("oracle-{n}"));
            ledger.deposit(&oracle, ETHER).await;
            ledger.preset_indexes(&oracle, IndexSet::new(*indexes).unwrap()).await;
            oracles.push(oracle);
        }

        let (registry, failures) =
            OracleRegistry::populate(&*ledger, &oracles, ETHER, Duration::from_secs(1)).await;
        assert!(failures.is_empty());

        let fixture = Fixture {
            ledger,
            owner,
            airline,
            oracles,
        };
        (fixture, Arc::new(registry))
    }

    fn dispatcher(
        fixture: &Fixture,
        registry: Arc<OracleRegistry>,
        status: StatusCode,
        ttl: Option<Duration>,
    ) -> ResponseDispatcher {
        ResponseDispatcher::new(
            fixture.ledger.clone(),
            registry,
            Arc::new(FixedStatusSource(status)),
            Duration::from_millis(200),
            ttl,
        )
    }

    async fn open_request(fixture: &Fixture, index: u8, flight_id: &str) -> StatusRequest {
        fixture.ledger.force_next_request_index(index).await;
        fixture
            .ledger
            .request_flight_status(&fixture.airline, flight_id, DEPARTURE)
            .await
            .unwrap();
        let events = fixture.ledger.events_since(0, usize::MAX).await.unwrap();
        StatusRequest {
            sequence: events.last().unwrap().sequence,
            index,
            airline: fixture.airline.clone(),
            flight_id: flight_id.to_string(),
            timestamp: DEPARTURE,
        }
    }

    #[tokio::test]
    async fn test_only_oracles_holding_the_index_are_asked() {
        let (fixture, registry) = fixture(&[[3, 7, 9], [1, 2, 4]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, None);
        let request = open_request(&fixture, 7, "KAL496946").await;

        let summary = dispatcher.on_status_requested(request).await;
        assert_eq!(summary.eligible, 1);
        assert_eq!(summary.launched, 1);
        let results = summary.handle.unwrap().await.unwrap();
        assert_eq!(
            results,
            vec![SubmissionResult::Accepted {
                oracle: fixture.oracles[0].clone()
            }]
        );

        let calls = fixture.ledger.submission_calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].oracle, fixture.oracles[0]);
        assert!(calls.iter().all(|call| call.oracle != fixture.oracles[1]));
    }

    #[tokio::test]
    async fn test_replayed_request_is_suppressed_locally() {
        let (fixture, registry) = fixture(&[[0, 1, 2], [0, 3, 4]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, None);
        let request = open_request(&fixture, 0, "LTH446466").await;

        let first = dispatcher.on_status_requested(request.clone()).await;
        assert_eq!(first.launched, 2);
        first.handle.unwrap().await.unwrap();

        let replay = dispatcher.on_status_requested(request).await;
        assert_eq!(replay.launched, 0);
        assert_eq!(replay.suppressed, 2);
        assert!(replay.handle.is_none());
        assert_eq!(fixture.ledger.submission_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_finalization_happens_once_and_stops_replays() {
        let (fixture, registry) = fixture(&[[5, 6, 7], [5, 8, 9], [1, 5, 9]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::LateAirline, None);
        let request = open_request(&fixture, 5, "KLM467454").await;
        let flight = request.flight();

        let summary = dispatcher.on_status_requested(request.clone()).await;
        let results = summary.handle.unwrap().await.unwrap();
        assert!(results
            .iter()
            .all(|result| matches!(result, SubmissionResult::Accepted { .. })));
        assert_eq!(
            fixture.ledger.flight_status(&flight).await,
            Some(StatusCode::LateAirline)
        );

        assert!(dispatcher.on_status_finalized(&flight, StatusCode::LateAirline));
        assert!(!dispatcher.on_status_finalized(&flight, StatusCode::LateAirline));
        assert_eq!(dispatcher.current_state(), Some(RequestState::Finalized));

        let replay = dispatcher.on_status_requested(request).await;
        assert_eq!(replay.launched, 0);
        assert_eq!(fixture.ledger.submission_calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_reports_for_other_requests_are_stale() {
        let (fixture, registry) = fixture(&[[2, 4, 6]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, None);
        let request = open_request(&fixture, 4, "LTH674545").await;
        let flight = request.flight();
        dispatcher.on_status_requested(request).await;

        let current = StatusReport {
            index: 4,
            flight: flight.clone(),
            status: StatusCode::OnTime,
        };
        let other_index = StatusReport {
            index: 6,
            ..current.clone()
        };
        let other_flight = StatusReport {
            flight: FlightKey::new(fixture.airline.clone(), "KLM452333", DEPARTURE),
            ..current.clone()
        };

        assert!(dispatcher.on_report_submitted(&current));
        assert!(!dispatcher.on_report_submitted(&other_index));
        assert!(!dispatcher.on_report_submitted(&other_flight));
        assert_eq!(dispatcher.current_reports(), 1);
        assert!(!dispatcher.on_status_finalized(&other_flight.flight, StatusCode::OnTime));
    }

    #[tokio::test]
    async fn test_paused_ledger_defers_until_operational() {
        let (fixture, registry) = fixture(&[[1, 2, 3]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, None);
        let request = open_request(&fixture, 2, "KAL496946").await;

        fixture
            .ledger
            .set_operating_status(&fixture.owner, false)
            .await
            .unwrap();
        let summary = dispatcher.on_status_requested(request).await;
        assert!(summary.deferred);
        assert_eq!(summary.launched, 0);
        assert!(dispatcher.is_deferred());
        assert!(dispatcher.resume_deferred().await.is_none());
        assert!(fixture.ledger.submission_calls().await.is_empty());

        fixture
            .ledger
            .set_operating_status(&fixture.owner, true)
            .await
            .unwrap();
        let resumed = dispatcher.resume_deferred().await.unwrap();
        assert_eq!(resumed.launched, 1);
        resumed.handle.unwrap().await.unwrap();
        assert!(!dispatcher.is_deferred());
        assert_eq!(fixture.ledger.submission_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_slow_submissions_count_as_failures() {
        let (fixture, registry) = fixture(&[[0, 1, 2]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, None);
        let request = open_request(&fixture, 1, "KLM452333").await;
        fixture
            .ledger
            .set_submit_latency(Some(Duration::from_secs(2)))
            .await;

        let summary = dispatcher.on_status_requested(request.clone()).await;
        let results = summary.handle.unwrap().await.unwrap();
        assert!(matches!(
            results.as_slice(),
            [SubmissionResult::Failed {
                error: LedgerError::Timeout(_),
                ..
            }]
        ));

        // Failed attempts are not retried.
        assert_eq!(dispatcher.on_status_requested(request).await.launched, 0);
    }

    #[tokio::test]
    async fn test_open_request_expires_after_ttl() {
        let (fixture, registry) = fixture(&[[7, 8, 9]]).await;
        let ttl = Duration::from_secs(30);
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, Some(ttl));
        let request = open_request(&fixture, 9, "LTH446466").await;
        let key = request.key();
        dispatcher.on_status_requested(request).await;

        assert_eq!(dispatcher.expire_stale(Instant::now()), None);
        assert_eq!(dispatcher.expire_stale(Instant::now() + ttl), Some(key));
        assert_eq!(dispatcher.current_state(), Some(RequestState::Expired));
        assert_eq!(dispatcher.expire_stale(Instant::now() + ttl), None);
    }

    #[tokio::test]
    async fn test_new_request_supersedes_current() {
        let (fixture, registry) = fixture(&[[1, 3, 5]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, None);
        let first = open_request(&fixture, 1, "KAL496946").await;
        let second = open_request(&fixture, 3, "LTH446466").await;

        dispatcher.on_status_requested(first.clone()).await;
        dispatcher.on_status_requested(second.clone()).await;

        assert_eq!(dispatcher.current_request(), Some(&second));
        assert!(!dispatcher.on_status_finalized(&first.flight(), StatusCode::OnTime));

        // The superseded request arriving again does not take over.
        let replay = dispatcher.on_status_requested(first).await;
        assert_eq!(replay.launched, 0);
        assert_eq!(dispatcher.current_request(), Some(&second));
    }

    #[tokio::test]
    async fn test_re_request_reusing_a_finalized_index_is_answered() {
        let (fixture, registry) = fixture(&[[5, 6, 7], [5, 8, 9], [1, 5, 9]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::OnTime, None);
        let first = open_request(&fixture, 5, "KAL496946").await;
        let flight = first.flight();

        let summary = dispatcher.on_status_requested(first.clone()).await;
        summary.handle.unwrap().await.unwrap();
        assert!(dispatcher.on_status_finalized(&flight, StatusCode::OnTime));

        // Same flight, same index, new ledger request.
        let second = open_request(&fixture, 5, "KAL496946").await;
        assert_eq!(second.key(), first.key());
        assert!(second.sequence > first.sequence);

        let summary = dispatcher.on_status_requested(second).await;
        assert_eq!(summary.eligible, 3);
        assert_eq!(summary.launched, 3);
        let results = summary.handle.unwrap().await.unwrap();
        assert!(results
            .iter()
            .all(|result| matches!(result, SubmissionResult::Accepted { .. })));
        assert!(dispatcher.on_status_finalized(&flight, StatusCode::OnTime));

        // The ledger closed the request, so the flight can be asked about again.
        fixture
            .ledger
            .request_flight_status(&fixture.airline, "KAL496946", DEPARTURE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submission_memory_stays_bounded_across_requests() {
        let (fixture, registry) = fixture(&[[0, 1, 2], [0, 1, 3], [0, 2, 3]]).await;
        let mut dispatcher = dispatcher(&fixture, registry, StatusCode::LateWeather, None);

        for round in 0..25 {
            let request = open_request(&fixture, (round % 2) as u8, &format!("FS{round:03}")).await;
            let flight = request.flight();
            let summary = dispatcher.on_status_requested(request).await;
            assert!(summary.launched > 0);
            assert!(dispatcher.recorded_submissions() <= 3);
            summary.handle.unwrap().await.unwrap();

            if round % 3 == 0 {
                dispatcher.on_status_finalized(&flight, StatusCode::LateWeather);
                assert_eq!(dispatcher.recorded_submissions(), 0);
            }
        }
        assert!(dispatcher.recorded_submissions() <= 3);
    }
}
