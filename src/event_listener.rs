//! Event listener for ledger-emitted events
//!
//! Polls the ledger's event log, decodes each raw event into a typed
//! [`Notification`] and republishes it, tagged with its log position, on a
//! channel consumed by the coordinator.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::ledger::{bounded, EventRecord, LedgerEvent, SharedLedger};
use crate::models::{
    Address, Amount, FlightKey, StatusCode, StatusReport, StatusRequest, INDEX_SPACE,
};

const EVENT_BATCH_LIMIT: usize = 200;

/// Typed internal notification derived from a ledger event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StatusRequested(StatusRequest),
    ReportSubmitted(StatusReport),
    StatusFinalized { flight: FlightKey, status: StatusCode },
    FundingReceived { airline: Address },
    AirlineRegistered { airline: Address },
    PassengerInsured { passenger: Address, flight: FlightKey, premium: Amount },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("request index {0} is outside the index space")]
    IndexOutOfRange(u8),
    #[error(transparent)]
    Status(#[from] crate::models::UnknownStatusCode),
    #[error("invalid premium {0:?}")]
    Premium(String),
}

/// A notification together with the position of its event in the ledger log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sequence: u64,
    pub notification: Notification,
}

impl TryFrom<EventRecord> for Delivery {
    type Error = DecodeError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        let sequence = record.sequence;
        let notification = match record.event {
            LedgerEvent::StatusRequest {
                index,
                airline,
                flight_id,
                timestamp,
            } => Notification::StatusRequested(StatusRequest {
                sequence,
                index: checked_index(index)?,
                airline,
                flight_id,
                timestamp,
            }),
            LedgerEvent::StatusReportSubmitted {
                index,
                airline,
                flight_id,
                timestamp,
                status_code,
            } => Notification::ReportSubmitted(StatusReport {
                index: checked_index(index)?,
                flight: FlightKey::new(airline, flight_id, timestamp),
                status: StatusCode::try_from(status_code)?,
            }),
            LedgerEvent::StatusFinalized {
                airline,
                flight_id,
                timestamp,
                status_code,
            } => Notification::StatusFinalized {
                flight: FlightKey::new(airline, flight_id, timestamp),
                status: StatusCode::try_from(status_code)?,
            },
            LedgerEvent::FundingReceived { airline } => Notification::FundingReceived { airline },
            LedgerEvent::AirlineRegistered { airline } => {
                Notification::AirlineRegistered { airline }
            }
            LedgerEvent::PassengerInsured {
                passenger,
                flight,
                premium,
            } => Notification::PassengerInsured {
                passenger,
                flight,
                premium: premium
                    .parse()
                    .map_err(|_| DecodeError::Premium(premium.clone()))?,
            },
        };
        Ok(Delivery {
            sequence,
            notification,
        })
    }
}

fn checked_index(index: u8) -> Result<u8, DecodeError> {
    if index < INDEX_SPACE {
        Ok(index)
    } else {
        Err(DecodeError::IndexOutOfRange(index))
    }
}

/// Event listener service
pub struct EventListener {
    ledger: SharedLedger,
    cursor: u64,
    poll_interval: Duration,
    call_timeout: Duration,
    tx: mpsc::Sender<Delivery>,
}

impl EventListener {
    pub fn new(
        ledger: SharedLedger,
        start_cursor: u64,
        poll_interval: Duration,
        call_timeout: Duration,
        tx: mpsc::Sender<Delivery>,
    ) -> Self {
        Self {
            ledger,
            cursor: start_cursor,
            poll_interval,
            call_timeout,
            tx,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Polls until the receiving side of the channel goes away.
    pub async fn start(mut self) {
        info!(cursor = self.cursor, "ledger event listener started");

        loop {
            match self.poll_once().await {
                Ok(_) => {}
                Err(PollError::ReceiverClosed) => {
                    info!("notification receiver closed; stopping event listener");
                    return;
                }
                Err(PollError::Ledger(err)) => {
                    error!(error = %err, cursor = self.cursor, "event poll cycle failed");
                }
            }

            sleep(self.poll_interval).await;
        }
    }

    /// Fetches one batch and forwards it; returns how many notifications were sent.
    pub async fn poll_once(&mut self) -> Result<usize, PollError> {
        let ledger = self.ledger.clone();
        let records = bounded(
            self.call_timeout,
            ledger.events_since(self.cursor, EVENT_BATCH_LIMIT),
        )
        .await?;

        let mut forwarded = 0;
        for record in records {
            if record.sequence < self.cursor {
                continue;
            }

            let sequence = record.sequence;
            match Delivery::try_from(record) {
                Ok(delivery) => {
                    self.tx
                        .send(delivery)
                        .await
                        .map_err(|_| PollError::ReceiverClosed)?;
                    forwarded += 1;
                }
                Err(err) => {
                    warn!(error = %err, sequence, "dropping undecodable ledger event");
                }
            }

            // Only advanced once the event has been handed over.
            self.cursor = sequence + 1;
        }

        if forwarded > 0 {
            debug!(forwarded, cursor = self.cursor, "forwarded ledger notifications");
        }
        Ok(forwarded)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("notification receiver closed")]
    ReceiverClosed,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ledger::{Ledger, MemoryLedger};
    use crate::models::ETHER;
    use std::sync::Arc;

    #[test]
    fn test_decoding_rejects_unknown_codes_and_indexes() {
        let airline = Address::derived("airline");
        let bad_status = LedgerEvent::StatusFinalized {
            airline: airline.clone(),
            flight_id: "KLM452333".to_string(),
            timestamp: 1,
            status_code: 25,
        };
        assert!(matches!(
            Delivery::try_from(EventRecord {
                sequence: 3,
                event: bad_status
            }),
            Err(DecodeError::Status(_))
        ));

        let bad_index = LedgerEvent::StatusRequest {
            index: 12,
            airline,
            flight_id: "KLM452333".to_string(),
            timestamp: 1,
        };
        assert_eq!(
            Delivery::try_from(EventRecord {
                sequence: 4,
                event: bad_index
            }),
            Err(DecodeError::IndexOutOfRange(12))
        );
    }

    #[tokio::test]
    async fn test_poll_once_forwards_in_order_and_advances_cursor() {
        let first = Address::derived("airline-1");
        let ledger = Arc::new(MemoryLedger::new(Address::derived("owner"), first.clone(), 1));
        ledger.deposit(&first, 20 * ETHER).await;
        ledger.fund(&first, 10 * ETHER).await.unwrap();
        ledger.force_next_request_index(4).await;
        ledger.request_flight_status(&first, "LTH446466", 99).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let mut listener = EventListener::new(
            ledger.clone(),
            0,
            Duration::from_millis(10),
            Duration::from_secs(1),
            tx,
        );

        assert_eq!(listener.poll_once().await.unwrap(), 2);
        assert_eq!(listener.cursor(), 2);
        assert_eq!(
            rx.recv().await,
            Some(Delivery {
                sequence: 0,
                notification: Notification::FundingReceived { airline: first.clone() }
            })
        );
        assert!(matches!(
            rx.recv().await,
            Some(Delivery {
                sequence: 1,
                notification: Notification::StatusRequested(StatusRequest {
                    sequence: 1,
                    index: 4,
                    ..
                })
            })
        ));

        // Nothing new since the last poll.
        assert_eq!(listener.poll_once().await.unwrap(), 0);

        ledger.fund(&first, 10 * ETHER).await.unwrap();
        assert_eq!(listener.poll_once().await.unwrap(), 1);
        assert_eq!(listener.cursor(), 3);
    }

    #[tokio::test]
    async fn test_poll_once_reports_closed_receiver() {
        let first = Address::derived("airline-1");
        let ledger = Arc::new(MemoryLedger::new(Address::derived("owner"), first.clone(), 1));
        ledger.deposit(&first, 10 * ETHER).await;
        ledger.fund(&first, 10 * ETHER).await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut listener =
            EventListener::new(ledger, 0, Duration::from_millis(10), Duration::from_secs(1), tx);

        assert!(matches!(listener.poll_once().await, Err(PollError::ReceiverClosed)));
    }
}
