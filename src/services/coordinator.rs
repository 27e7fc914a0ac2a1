//! Coordinator pipeline
//!
//! Single consumer of the listener's notification channel. Routes each
//! notification to the dispatcher, governance or insurance, and drives the
//! periodic work (deferred dispatch, request expiry) from a tick.
//!
//! Progress is checkpointed only once a notification has been handled. While
//! a status request is still open the checkpoint stays at that request, so
//! a restarted pipeline replays it and answers it again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::event_listener::{Delivery, Notification};
use crate::models::RequestIndex;
use crate::services::dispatcher::{DispatchSummary, ResponseDispatcher};
use crate::services::governance::GovernanceVoter;
use crate::services::insurance::InsuranceCoordinator;

/// Most recently observed request index, shared with the HTTP facade.
pub type LatestIndex = Arc<RwLock<Option<RequestIndex>>>;

pub struct Coordinator {
    dispatcher: ResponseDispatcher,
    governance: Arc<GovernanceVoter>,
    insurance: Arc<InsuranceCoordinator>,
    latest_index: LatestIndex,
    tick: Duration,
    checkpoint: Option<Arc<AtomicU64>>,
    last_handled: Option<u64>,
}

impl Coordinator {
    pub fn new(
        dispatcher: ResponseDispatcher,
        governance: Arc<GovernanceVoter>,
        insurance: Arc<InsuranceCoordinator>,
        latest_index: LatestIndex,
        tick: Duration,
    ) -> Self {
        Self {
            dispatcher,
            governance,
            insurance,
            latest_index,
            tick,
            checkpoint: None,
            last_handled: None,
        }
    }

    /// Stores into `checkpoint` the ledger cursor a restarted pipeline
    /// should resume from.
    pub fn with_checkpoint(mut self, checkpoint: Arc<AtomicU64>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Consumes notifications until every sender has gone away.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Delivery>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick.as_millis() as u64, "coordinator started");

        loop {
            tokio::select! {
                delivery = rx.recv() => match delivery {
                    Some(delivery) => {
                        self.handle(delivery).await;
                    }
                    None => {
                        info!("notification channel closed; stopping coordinator");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        }
    }

    /// Routes one delivery and checkpoints past it. Returns the dispatch
    /// started for a status request, if any.
    pub async fn handle(&mut self, delivery: Delivery) -> Option<DispatchSummary> {
        let summary = self.route(delivery.notification).await;
        self.last_handled = Some(delivery.sequence);
        self.save_checkpoint();
        summary
    }

    async fn route(&mut self, notification: Notification) -> Option<DispatchSummary> {
        match notification {
            Notification::StatusRequested(request) => {
                *self.latest_index.write().await = Some(request.index);
                let summary = self.dispatcher.on_status_requested(request).await;
                debug!(
                    eligible = summary.eligible,
                    launched = summary.launched,
                    suppressed = summary.suppressed,
                    deferred = summary.deferred,
                    "status request handled"
                );
                return Some(summary);
            }
            Notification::ReportSubmitted(report) => {
                self.dispatcher.on_report_submitted(&report);
            }
            Notification::StatusFinalized { flight, status } => {
                self.dispatcher.on_status_finalized(&flight, status);
                self.insurance.on_flight_finalized(&flight, status).await;
            }
            Notification::FundingReceived { airline } => {
                self.governance.on_funding_received(&airline).await;
            }
            Notification::AirlineRegistered { airline } => {
                self.governance.on_airline_registered(&airline).await;
            }
            Notification::PassengerInsured {
                passenger,
                flight,
                premium,
            } => {
                self.insurance
                    .on_passenger_insured(&passenger, &flight, premium)
                    .await;
            }
        }
        None
    }

    /// Periodic work: retries a deferred dispatch and applies request expiry.
    pub async fn on_tick(&mut self) -> Option<DispatchSummary> {
        let resumed = self.dispatcher.resume_deferred().await;
        if let Some(summary) = &resumed {
            info!(launched = summary.launched, "deferred status submissions dispatched");
        }
        if self.dispatcher.expire_stale(Instant::now()).is_some() {
            self.save_checkpoint();
        }
        resumed
    }

    fn save_checkpoint(&self) {
        let Some(checkpoint) = &self.checkpoint else {
            return;
        };
        let resume_from = self
            .dispatcher
            .open_sequence()
            .or(self.last_handled.map(|sequence| sequence + 1));
        if let Some(resume_from) = resume_from {
            checkpoint.store(resume_from, Ordering::SeqCst);
        }
    }

    pub fn dispatcher(&self) -> &ResponseDispatcher {
        &self.dispatcher
    }
}
