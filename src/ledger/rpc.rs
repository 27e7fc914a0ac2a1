//! JSON-RPC client for the ledger gateway

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{EventRecord, Ledger, LedgerOutcome};
use crate::error::LedgerError;
use crate::models::{Address, Amount, FlightKey, IndexSet, StatusResponse};

/// Gateway error codes carried in the JSON-RPC `error.code` field.
const CODE_REJECTED: i64 = -32010;
const CODE_DUPLICATE: i64 = -32011;
const CODE_PAUSED: i64 = -32012;

/// Ledger reached through a JSON-RPC 2.0 gateway
#[derive(Clone)]
pub struct RpcLedger {
    rpc_url: String,
    http: Client,
    call_timeout: Duration,
}

impl RpcLedger {
    pub fn new(rpc_url: impl Into<String>, call_timeout: Duration) -> Result<Self, LedgerError> {
        let http = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|err| LedgerError::Transport(err.to_string()))?;

        Ok(Self {
            rpc_url: rpc_url.into(),
            http,
            call_timeout,
        })
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": "flightsurety-server",
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|err| self.transport_error(err))?
            .error_for_status()
            .map_err(|err| self.transport_error(err))?
            .json::<Value>()
            .await
            .map_err(|err| LedgerError::Decode(format!("{method}: {err}")))?;

        if let Some(error) = response.get("error") {
            return Err(gateway_error(error));
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| LedgerError::Decode(format!("{method}: missing result")))
    }

    fn transport_error(&self, err: reqwest::Error) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout(self.call_timeout)
        } else {
            LedgerError::Transport(err.to_string())
        }
    }

    async fn call_unit(&self, method: &str, params: Value) -> Result<(), LedgerError> {
        self.rpc_call(method, params).await.map(|_| ())
    }

    async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let result = self.rpc_call(method, params).await?;
        serde_json::from_value(result).map_err(|err| LedgerError::Decode(format!("{method}: {err}")))
    }

    async fn call_amount(&self, method: &str, params: Value) -> Result<Amount, LedgerError> {
        let result = self.rpc_call(method, params).await?;
        parse_amount(&result).map_err(|err| LedgerError::Decode(format!("{method}: {err}")))
    }
}

fn gateway_error(error: &Value) -> LedgerError {
    let message = error
        .pointer("/message")
        .and_then(|value| value.as_str())
        .unwrap_or("unspecified ledger error")
        .to_string();

    match error.pointer("/code").and_then(|value| value.as_i64()) {
        Some(CODE_DUPLICATE) => LedgerError::Duplicate(message),
        Some(CODE_PAUSED) => LedgerError::Paused,
        Some(CODE_REJECTED) => LedgerError::Rejected(message),
        Some(code) if (-32099..=-32000).contains(&code) => LedgerError::Rejected(message),
        _ => LedgerError::Transport(message),
    }
}

/// Amounts travel as decimal strings; small values may arrive as plain numbers.
fn parse_amount(value: &Value) -> Result<Amount, String> {
    match value {
        Value::String(digits) => digits
            .parse::<Amount>()
            .map_err(|err| format!("invalid amount {digits:?}: {err}")),
        Value::Number(number) => number
            .as_u64()
            .map(Amount::from)
            .ok_or_else(|| format!("invalid amount {number}")),
        other => Err(format!("expected an amount, got {other}")),
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn registration_fee(&self) -> Result<Amount, LedgerError> {
        self.call_amount("registrationFee", json!({})).await
    }

    async fn register_oracle(&self, oracle: &Address, fee: Amount) -> Result<(), LedgerError> {
        self.call_unit(
            "registerOracle",
            json!({ "from": oracle, "value": fee.to_string() }),
        )
        .await
    }

    async fn assigned_indexes(&self, oracle: &Address) -> Result<IndexSet, LedgerError> {
        self.call_as("getMyIndexes", json!({ "from": oracle })).await
    }

    async fn submit_status_response(&self, response: &StatusResponse) -> Result<(), LedgerError> {
        self.call_unit(
            "submitOracleResponse",
            json!({
                "from": response.oracle,
                "index": response.index,
                "airline": response.airline,
                "flight": response.flight_id,
                "timestamp": response.timestamp,
                "statusCode": response.status,
            }),
        )
        .await
    }

    async fn request_flight_status(
        &self,
        airline: &Address,
        flight_id: &str,
        timestamp: u64,
    ) -> Result<(), LedgerError> {
        self.call_unit(
            "fetchFlightStatus",
            json!({ "airline": airline, "flight": flight_id, "timestamp": timestamp }),
        )
        .await
    }

    async fn fund(&self, airline: &Address, amount: Amount) -> Result<(), LedgerError> {
        self.call_unit("fund", json!({ "from": airline, "value": amount.to_string() }))
            .await
    }

    async fn register_airline(
        &self,
        candidate: &Address,
        proposer: &Address,
    ) -> Result<LedgerOutcome, LedgerError> {
        let applied: bool = self
            .call_as(
                "registerAirline",
                json!({ "from": proposer, "airline": candidate }),
            )
            .await?;

        Ok(if applied {
            LedgerOutcome::Applied
        } else {
            LedgerOutcome::NotApplied
        })
    }

    async fn approve_for_admission(
        &self,
        candidate: &Address,
        voter: &Address,
    ) -> Result<(), LedgerError> {
        self.call_unit(
            "approveAirline",
            json!({ "from": voter, "airline": candidate }),
        )
        .await
    }

    async fn is_registered(&self, airline: &Address) -> Result<bool, LedgerError> {
        self.call_as("isAirlineRegistered", json!({ "airline": airline })).await
    }

    async fn is_funded(&self, airline: &Address) -> Result<bool, LedgerError> {
        self.call_as("isFundedAirline", json!({ "airline": airline })).await
    }

    async fn registered_airline_count(&self) -> Result<usize, LedgerError> {
        self.call_as("registeredAirlineCount", json!({})).await
    }

    async fn approval_count(&self, candidate: &Address) -> Result<usize, LedgerError> {
        self.call_as("approvalCount", json!({ "airline": candidate })).await
    }

    async fn is_operational(&self) -> Result<bool, LedgerError> {
        self.call_as("isOperational", json!({})).await
    }

    async fn set_operating_status(
        &self,
        caller: &Address,
        operational: bool,
    ) -> Result<(), LedgerError> {
        self.call_unit(
            "setOperatingStatus",
            json!({ "from": caller, "mode": operational }),
        )
        .await
    }

    async fn register_flight(&self, flight: &FlightKey) -> Result<(), LedgerError> {
        self.call_unit(
            "registerFlight",
            json!({
                "from": flight.airline,
                "airline": flight.airline,
                "flight": flight.flight_id,
                "timestamp": flight.timestamp,
            }),
        )
        .await
    }

    async fn buy_insurance(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        premium: Amount,
    ) -> Result<(), LedgerError> {
        self.call_unit(
            "insurePassenger",
            json!({
                "from": passenger,
                "airline": flight.airline,
                "flight": flight.flight_id,
                "timestamp": flight.timestamp,
                "value": premium.to_string(),
            }),
        )
        .await
    }

    async fn credit_insuree(
        &self,
        passenger: &Address,
        flight: &FlightKey,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        self.call_unit(
            "creditInsuree",
            json!({
                "passenger": passenger,
                "airline": flight.airline,
                "flight": flight.flight_id,
                "timestamp": flight.timestamp,
                "amount": amount.to_string(),
            }),
        )
        .await
    }

    async fn passenger_credits(&self, passenger: &Address) -> Result<Amount, LedgerError> {
        self.call_amount("getPassengerCredits", json!({ "passenger": passenger }))
            .await
    }

    async fn withdraw(&self, passenger: &Address) -> Result<Amount, LedgerError> {
        self.call_amount("withdraw", json!({ "from": passenger })).await
    }

    async fn events_since(
        &self,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        let result = self
            .rpc_call(
                "getEvents",
                json!({ "cursor": cursor, "pagination": { "limit": limit } }),
            )
            .await?;

        let raw_events = result
            .pointer("/events")
            .and_then(|events| events.as_array().cloned())
            .unwrap_or_default();

        // One malformed event must not hide the rest of the batch.
        let mut records = Vec::with_capacity(raw_events.len());
        for raw in raw_events {
            match serde_json::from_value::<EventRecord>(raw) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!(error = %err, "skipping undecodable ledger event"),
            }
        }
        Ok(records)
    }
}
