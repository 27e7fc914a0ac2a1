//! Airline governance
//!
//! Enforces who may join the airline pool: direct admission while fewer
//! than four airlines are registered, approval quorum afterwards, and the
//! funding stake that gates participation. The ledger stays the source of
//! truth; the local mirror only caches flags once they have been observed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CoreError, LedgerError, Result, ValidationError};
use crate::ledger::{bounded, Ledger, LedgerOutcome, ReadRetry, SharedLedger};
use crate::models::{
    required_approvals, Address, Admission, AdmissionRule, AirlineRecord, Amount, Outcome,
    AIRLINE_FUNDING,
};

pub struct GovernanceVoter {
    ledger: SharedLedger,
    call_timeout: Duration,
    reads: ReadRetry,
    airlines: RwLock<HashMap<Address, AirlineRecord>>,
}

impl GovernanceVoter {
    pub fn new(ledger: SharedLedger, call_timeout: Duration) -> Self {
        Self {
            ledger,
            call_timeout,
            reads: ReadRetry::new(call_timeout),
            airlines: RwLock::new(HashMap::new()),
        }
    }

    /// Attempts to admit `candidate` on behalf of `proposer`.
    ///
    /// Insufficient approvals is not an error: the attempt comes back as
    /// `Admission::Pending` and may be repeated once more approvals accrue.
    pub async fn register_airline(
        &self,
        candidate: &Address,
        proposer: &Address,
    ) -> Result<Admission> {
        self.require_operational().await?;
        self.require_member(proposer).await?;
        if self.is_registered(candidate).await? {
            return Err(ValidationError::AlreadyRegistered(candidate.clone()).into());
        }

        let ledger = self.ledger.as_ref();
        let registered = self
            .reads
            .read(move || ledger.registered_airline_count())
            .await?;
        let rule = AdmissionRule::for_population(registered);

        if let AdmissionRule::Quorum { required } = rule {
            let approvals = self.approvals_for(candidate).await?;
            if approvals < required {
                debug!(%candidate, approvals, required, "admission pending more approvals");
                return Ok(Admission::Pending { approvals, required });
            }
        }

        match bounded(self.call_timeout, ledger.register_airline(candidate, proposer)).await {
            Ok(LedgerOutcome::Applied) => {
                self.mirror(candidate, AirlineRecord::mark_registered).await;
                info!(%candidate, %proposer, ?rule, "airline registered");
                Ok(Admission::Registered)
            }
            Ok(LedgerOutcome::NotApplied) => self.pending(candidate).await,
            Err(LedgerError::Duplicate(reason)) => {
                // Another proposer got there first.
                debug!(%candidate, %reason, "airline admitted concurrently");
                self.mirror(candidate, AirlineRecord::mark_registered).await;
                Ok(Admission::Registered)
            }
            Err(LedgerError::Rejected(reason)) if matches!(rule, AdmissionRule::Quorum { .. }) => {
                warn!(%candidate, %reason, "admission refused by ledger; treating as pending");
                self.pending(candidate).await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Records `voter`'s approval of `candidate`. Repeat approvals are a no-op.
    pub async fn approve_for_admission(
        &self,
        candidate: &Address,
        voter: &Address,
    ) -> Result<Outcome> {
        self.require_operational().await?;
        self.require_member(voter).await?;
        if self.is_registered(candidate).await? {
            return Err(ValidationError::AlreadyRegistered(candidate.clone()).into());
        }

        let already_approved = self
            .airlines
            .read()
            .await
            .get(candidate)
            .map(|record| record.approvals().contains(voter))
            .unwrap_or(false);
        if already_approved {
            return Ok(Outcome::NotApplied);
        }

        let ledger = self.ledger.as_ref();
        let outcome = match bounded(self.call_timeout, ledger.approve_for_admission(candidate, voter)).await {
            Ok(()) => {
                info!(%candidate, %voter, "admission approval recorded");
                Outcome::Applied
            }
            Err(LedgerError::Duplicate(_)) => Outcome::NotApplied,
            Err(err) => return Err(err.into()),
        };

        let voter = voter.clone();
        self.mirror(candidate, move |record| {
            record.add_approval(voter);
        })
        .await;
        Ok(outcome)
    }

    /// Transfers the funding stake for `airline`.
    pub async fn fund(&self, airline: &Address, amount: Amount) -> Result<()> {
        if amount < AIRLINE_FUNDING {
            return Err(ValidationError::InsufficientFunding {
                provided: amount,
                required: AIRLINE_FUNDING,
            }
            .into());
        }
        self.require_operational().await?;

        bounded(self.call_timeout, self.ledger.fund(airline, amount)).await?;
        self.mirror(airline, AirlineRecord::mark_funded).await;
        info!(%airline, amount = %amount, "airline funded");
        Ok(())
    }

    /// Toggles the ledger's operational flag. Only the ledger administrator
    /// is accepted; the ledger refuses anyone else.
    pub async fn set_operating_status(&self, caller: &Address, operational: bool) -> Result<()> {
        bounded(
            self.call_timeout,
            self.ledger.set_operating_status(caller, operational),
        )
        .await?;
        info!(%caller, operational, "operating status changed");
        Ok(())
    }

    /// Whether `airline` is both registered and funded, i.e. may propose,
    /// vote and sell insurance.
    pub async fn is_active(&self, airline: &Address) -> Result<bool> {
        Ok(self.is_registered(airline).await? && self.is_funded(airline).await?)
    }

    pub async fn is_registered(&self, airline: &Address) -> Result<bool> {
        if self.known(airline, AirlineRecord::registered).await {
            return Ok(true);
        }
        let ledger = self.ledger.as_ref();
        let registered = self.reads.read(move || ledger.is_registered(airline)).await?;
        if registered {
            self.mirror(airline, AirlineRecord::mark_registered).await;
        }
        Ok(registered)
    }

    pub async fn is_funded(&self, airline: &Address) -> Result<bool> {
        if self.known(airline, AirlineRecord::funded).await {
            return Ok(true);
        }
        let ledger = self.ledger.as_ref();
        let funded = self.reads.read(move || ledger.is_funded(airline)).await?;
        if funded {
            self.mirror(airline, AirlineRecord::mark_funded).await;
        }
        Ok(funded)
    }

    pub async fn on_funding_received(&self, airline: &Address) {
        self.mirror(airline, AirlineRecord::mark_funded).await;
    }

    pub async fn on_airline_registered(&self, airline: &Address) {
        self.mirror(airline, AirlineRecord::mark_registered).await;
    }

    /// Locally observed state of `airline`, if any has been observed.
    pub async fn airline(&self, airline: &Address) -> Option<AirlineRecord> {
        self.airlines.read().await.get(airline).cloned()
    }

    async fn require_operational(&self) -> Result<()> {
        let ledger = self.ledger.as_ref();
        if self.reads.read(move || ledger.is_operational()).await? {
            Ok(())
        } else {
            Err(CoreError::NotOperational)
        }
    }

    async fn require_member(&self, airline: &Address) -> Result<()> {
        if !self.is_registered(airline).await? {
            return Err(ValidationError::ProposerNotRegistered(airline.clone()).into());
        }
        if !self.is_funded(airline).await? {
            return Err(ValidationError::ProposerNotFunded(airline.clone()).into());
        }
        Ok(())
    }

    async fn approvals_for(&self, candidate: &Address) -> Result<usize> {
        let ledger = self.ledger.as_ref();
        let on_ledger = self.reads.read(move || ledger.approval_count(candidate)).await?;
        let local = self
            .airline(candidate)
            .await
            .map(|record| record.approvals().len())
            .unwrap_or(0);
        Ok(on_ledger.max(local))
    }

    /// The ledger declined the admission. The population may have grown
    /// since the caller read it, so the quorum is recomputed from a fresh count.
    async fn pending(&self, candidate: &Address) -> Result<Admission> {
        let ledger = self.ledger.as_ref();
        let registered = self
            .reads
            .read(move || ledger.registered_airline_count())
            .await?;
        let approvals = self.approvals_for(candidate).await?;
        Ok(Admission::Pending {
            approvals,
            required: required_approvals(registered),
        })
    }

    async fn known(&self, airline: &Address, flag: fn(&AirlineRecord) -> bool) -> bool {
        self.airlines
            .read()
            .await
            .get(airline)
            .map(flag)
            .unwrap_or(false)
    }

    async fn mirror<F>(&self, airline: &Address, update: F)
    where
        F: FnOnce(&mut AirlineRecord),
    {
        let mut airlines = self.airlines.write().await;
        update(airlines.entry(airline.clone()).or_default());
    }
}
