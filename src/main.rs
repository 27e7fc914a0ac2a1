//! FlightSurety coordination server
//!
//! Registers the oracle pool, follows the ledger's event stream to answer
//! flight-status requests, and serves the dashboard's read API.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flightsurety_server::app_state::{AppState, ServiceInfo};
use flightsurety_server::config::{AppConfig, LedgerMode, StatusMode};
use flightsurety_server::event_listener::EventListener;
use flightsurety_server::ledger::{bounded, MemoryLedger, RpcLedger, SharedLedger};
use flightsurety_server::routes;
use flightsurety_server::services::{
    Coordinator, FixedStatusSource, GovernanceVoter, InsuranceCoordinator, LatestIndex,
    OracleRegistry, RandomStatusSource, ResponseDispatcher, StatusSource,
};
use flightsurety_server::simulation;

const PIPELINE_SUPERVISOR_MAX_BACKOFF_SECONDS: u64 = 30;
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Everything a (re)started event pipeline needs
#[derive(Clone)]
struct Pipeline {
    ledger: SharedLedger,
    registry: Arc<OracleRegistry>,
    source: Arc<dyn StatusSource>,
    governance: Arc<GovernanceVoter>,
    insurance: Arc<InsuranceCoordinator>,
    latest_index: LatestIndex,
    /// Ledger cursor to resume from, advanced by the coordinator
    checkpoint: Arc<AtomicU64>,
    config: Arc<AppConfig>,
}

impl Pipeline {
    /// Runs listener and coordinator until the listener stops.
    async fn run(self) -> Result<(), tokio::task::JoinError> {
        let config = &self.config;
        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let listener = EventListener::new(
            self.ledger.clone(),
            self.checkpoint.load(Ordering::SeqCst),
            config.poll_interval,
            config.call_timeout,
            tx,
        );

        let dispatcher = ResponseDispatcher::new(
            self.ledger.clone(),
            self.registry.clone(),
            self.source.clone(),
            config.call_timeout,
            config.request_ttl,
        );
        let coordinator = Coordinator::new(
            dispatcher,
            self.governance.clone(),
            self.insurance.clone(),
            self.latest_index.clone(),
            config.deferred_retry,
        )
        .with_checkpoint(self.checkpoint.clone());

        let listener_task = tokio::spawn(listener.start());
        let coordinator_task = tokio::spawn(coordinator.run(rx));

        coordinator_task.await?;
        listener_task.await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env().context("invalid configuration")?);

    let (ledger, simulated): (SharedLedger, Option<Arc<MemoryLedger>>) = match &config.ledger {
        LedgerMode::Rpc { url } => {
            info!(%url, "using ledger gateway");
            let ledger = RpcLedger::new(url.clone(), config.call_timeout)
                .context("building the ledger client")?;
            (Arc::new(ledger), None)
        }
        LedgerMode::Simulated { seed } => {
            info!(seed, "using simulated in-process ledger");
            let ledger = Arc::new(MemoryLedger::new(
                config.admin.clone(),
                config.first_airline.clone(),
                *seed,
            ));
            (ledger.clone(), Some(ledger))
        }
    };

    let governance = Arc::new(GovernanceVoter::new(ledger.clone(), config.call_timeout));
    let insurance = Arc::new(InsuranceCoordinator::new(
        ledger.clone(),
        governance.clone(),
        config.call_timeout,
    ));

    let oracles = config.oracle_pool.addresses();
    if let Some(memory) = &simulated {
        let pool = simulation::bootstrap(
            memory,
            &governance,
            &insurance,
            &config.first_airline,
            &oracles,
        )
        .await
        .context("seeding the simulated ledger")?;

        tokio::spawn(simulation::drive_status_requests(
            ledger.clone(),
            insurance.clone(),
            pool.flights,
            config.simulation_request_interval,
        ));
    }

    let fee = bounded(config.call_timeout, ledger.registration_fee())
        .await
        .context("reading the oracle registration fee")?;
    let (registry, failures) =
        OracleRegistry::populate(ledger.as_ref(), &oracles, fee, config.call_timeout).await;
    if registry.is_empty() && !oracles.is_empty() {
        warn!(failed = failures.len(), "no oracle registered; status requests will go unanswered");
    }
    let registry = Arc::new(registry);

    let source: Arc<dyn StatusSource> = match config.status_mode {
        StatusMode::Random => Arc::new(RandomStatusSource),
        StatusMode::Fixed(status) => Arc::new(FixedStatusSource(status)),
    };

    let latest_index = LatestIndex::default();
    let pipeline = Pipeline {
        ledger: ledger.clone(),
        registry: registry.clone(),
        source,
        governance,
        insurance,
        latest_index: latest_index.clone(),
        checkpoint: Arc::new(AtomicU64::new(config.start_cursor)),
        config: config.clone(),
    };

    // Start and supervise the ledger event pipeline.
    tokio::spawn(async move {
        let mut restart_count: u32 = 0;
        loop {
            let handle = tokio::spawn(pipeline.clone().run());

            match handle.await {
                Ok(Ok(())) => {
                    info!("event pipeline exited cleanly; stopping supervisor");
                    break;
                }
                Ok(Err(join_error)) | Err(join_error) => {
                    if join_error.is_panic() {
                        error!("event pipeline panicked; restarting");
                    } else {
                        error!(error = %join_error, "event pipeline task failed; restarting");
                    }
                }
            }

            restart_count = restart_count.saturating_add(1);
            let backoff_seconds = (2u64.saturating_pow(restart_count.min(5)))
                .min(PIPELINE_SUPERVISOR_MAX_BACKOFF_SECONDS);
            warn!(restart_count, backoff_seconds, "event pipeline restart backoff");
            sleep(Duration::from_secs(backoff_seconds)).await;
        }
    });

    let service_info = ServiceInfo {
        message: "An API for use with your Dapp!".to_string(),
        ledger_mode: if config.is_simulated() { "simulated" } else { "rpc" }.to_string(),
        oracles: registry.len(),
    };

    // Create the app router
    let app = routes::api_router(AppState::new(latest_index, service_info))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&config.cors_allowed_origins));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).await.context("serving the API")?;
    Ok(())
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allowed_origins = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(false)
}
