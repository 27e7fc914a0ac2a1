//! Server configuration read from the environment

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::{Address, StatusCode};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 5000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_ORACLE_POOL_SIZE: usize = 20;
const DEFAULT_DEFERRED_RETRY_SECONDS: u64 = 5;
const DEFAULT_SIMULATION_SEED: u64 = 0x5eed;
const DEFAULT_SIMULATION_REQUEST_INTERVAL_SECONDS: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be set when LEDGER_MODE=rpc")]
    Missing(&'static str),
}

/// Where ledger calls go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerMode {
    /// JSON-RPC gateway at the given URL
    Rpc { url: String },
    /// In-process ledger seeded with a demo airline pool
    Simulated { seed: u64 },
}

/// Status answered by this process's oracles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    Random,
    Fixed(StatusCode),
}

/// Which identities make up the oracle pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OraclePool {
    Accounts(Vec<Address>),
    /// Derived simulated identities
    Derived(usize),
}

impl OraclePool {
    pub fn addresses(&self) -> Vec<Address> {
        match self {
            OraclePool::Accounts(accounts) => accounts.clone(),
            OraclePool::Derived(size) => (0..*size)
                .map(|n| Address::derived(&format!("oracle-{n}")))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
    pub ledger: LedgerMode,
    pub call_timeout: Duration,
    pub poll_interval: Duration,
    pub start_cursor: u64,
    pub admin: Address,
    pub first_airline: Address,
    pub oracle_pool: OraclePool,
    pub status_mode: StatusMode,
    pub request_ttl: Option<Duration>,
    pub deferred_retry: Duration,
    /// How often the simulated dashboard asks for a flight status
    pub simulation_request_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let ledger = match var("LEDGER_MODE").as_deref() {
            None | Some("simulated") => LedgerMode::Simulated {
                seed: parse_or(&var, "SIMULATION_SEED", DEFAULT_SIMULATION_SEED)?,
            },
            Some("rpc") => LedgerMode::Rpc {
                url: var("LEDGER_RPC_URL").ok_or(ConfigError::Missing("LEDGER_RPC_URL"))?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LEDGER_MODE",
                    value: other.to_string(),
                })
            }
        };

        let simulated = matches!(ledger, LedgerMode::Simulated { .. });
        let admin = address_or(&var, "LEDGER_ADMIN_ADDRESS", simulated, "owner")?;
        let first_airline = address_or(&var, "FIRST_AIRLINE_ADDRESS", simulated, "airline-1")?;

        let oracle_pool = match var("ORACLE_ACCOUNTS") {
            Some(accounts) => OraclePool::Accounts(
                accounts
                    .split(',')
                    .map(str::trim)
                    .filter(|account| !account.is_empty())
                    .map(|account| {
                        Address::parse(account).map_err(|_| ConfigError::Invalid {
                            name: "ORACLE_ACCOUNTS",
                            value: account.to_string(),
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            None => OraclePool::Derived(parse_or(&var, "ORACLE_POOL_SIZE", DEFAULT_ORACLE_POOL_SIZE)?),
        };

        let status_mode = match var("STATUS_SOURCE").as_deref() {
            None | Some("random") => StatusMode::Random,
            Some(code) => code
                .parse::<u8>()
                .ok()
                .and_then(|code| StatusCode::try_from(code).ok())
                .map(StatusMode::Fixed)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "STATUS_SOURCE",
                    value: code.to_string(),
                })?,
        };

        let request_ttl = match var("REQUEST_TTL_SECONDS") {
            Some(_) => Some(Duration::from_secs(parse_or(&var, "REQUEST_TTL_SECONDS", 0)?)),
            None => None,
        };

        Ok(Self {
            port: parse_or(&var, "PORT", DEFAULT_PORT)?,
            cors_allowed_origins: var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:8000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            ledger,
            call_timeout: Duration::from_millis(parse_or(
                &var,
                "LEDGER_CALL_TIMEOUT_MS",
                DEFAULT_CALL_TIMEOUT_MS,
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &var,
                "LEDGER_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            start_cursor: parse_or(&var, "LEDGER_START_CURSOR", 0)?,
            admin,
            first_airline,
            oracle_pool,
            status_mode,
            request_ttl,
            deferred_retry: Duration::from_secs(parse_or(
                &var,
                "DEFERRED_RETRY_SECONDS",
                DEFAULT_DEFERRED_RETRY_SECONDS,
            )?),
            simulation_request_interval: Duration::from_secs(parse_or(
                &var,
                "SIMULATION_REQUEST_INTERVAL_SECONDS",
                DEFAULT_SIMULATION_REQUEST_INTERVAL_SECONDS,
            )?),
        })
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self.ledger, LedgerMode::Simulated { .. })
    }
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Configured address, or a derived one when running simulated.
fn address_or<F>(
    var: &F,
    name: &'static str,
    simulated: bool,
    label: &str,
) -> Result<Address, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => Address::parse(&value).map_err(|_| ConfigError::Invalid { name, value }),
        None if simulated => Ok(Address::derived(label)),
        None => Err(ConfigError::Missing(name)),
    }
}
