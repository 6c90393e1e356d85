//! Engine assembly.
//!
//! Wires the stores, admission pipeline, executor and the long-running
//! workers (price monitor, position watcher, orchestrator, dashboard
//! broadcast) from a validated config plus the four ports, and owns the
//! coordinated shutdown: signal all tickers, drain in-flight sells
//! against a hard deadline, then force-stop whatever is left.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::ports::oracle::PriceOracle;
use crate::ports::prediction::PredictionService;
use crate::ports::stream::{EventStream, StreamError};
use crate::ports::swap::SwapBackend;
use crate::store::{EngineState, KeyValueStore, PositionStore, PriceCache, StoreError};

use super::admission::AdmissionPipeline;
use super::broadcast::Broadcaster;
use super::executor::{ExecutorSettings, TradeExecutor};
use super::orchestrator::Orchestrator;
use super::paper::PaperLedger;
use super::price_monitor::PriceMonitor;
use super::watcher::PositionWatcher;

/// Shutdown drains in-flight sells for at most this long.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The four external collaborators, already constructed by the caller.
pub struct Ports {
    pub stream: Arc<dyn EventStream>,
    pub oracle: Arc<dyn PriceOracle>,
    pub prediction: Arc<dyn PredictionService>,
    pub swap: Arc<dyn SwapBackend>,
}

/// Point-in-time engine status.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub simulation: bool,
    pub open_positions: usize,
    pub closed_positions: usize,
    pub sells_in_flight: usize,
    pub paper: super::paper::LedgerStats,
}

pub struct Engine {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    watcher: Arc<PositionWatcher>,
    ledger: Arc<PaperLedger>,
    positions: Arc<PositionStore>,
    simulation: bool,
}

impl Engine {
    /// Build every component and spawn the workers.
    pub async fn start(
        config: &Config,
        ports: Ports,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, EngineError> {
        let positions = Arc::new(PositionStore::new(store.clone()));
        let prices = Arc::new(PriceCache::new(store.clone()));
        let state = Arc::new(EngineState::new(store));
        let ledger = Arc::new(PaperLedger::new(
            &config.tokens.native_quote_mint,
            config.simulation.initial_balance,
        ));

        let admission = Arc::new(AdmissionPipeline::new(
            config.filter_thresholds(),
            ports.oracle.clone(),
            ports.prediction.clone(),
            state.clone(),
        ));
        let executor = Arc::new(TradeExecutor::new(
            ExecutorSettings::from(config),
            ports.swap.clone(),
            ports.oracle.clone(),
            positions.clone(),
            prices.clone(),
            state.clone(),
            ledger.clone(),
        ));
        let orchestrator = Orchestrator::new(
            state,
            admission,
            executor.clone(),
            config.sell_conditions(),
            config.tokens.native_quote_mint.clone(),
        );
        let monitor = PriceMonitor::new(ports.oracle.clone(), prices.clone());
        let watcher = PositionWatcher::new(positions.clone(), prices, executor);

        let actors = if config.monitoring.mode == "subscribed" {
            config.monitoring.actors.clone()
        } else {
            Vec::new()
        };
        let events = ports.stream.subscribe(actors).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(monitor.run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(
            Arc::clone(&watcher).run(shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            orchestrator.run(events, shutdown_rx.clone()),
        ));
        if let Some(bind) = &config.api.dashboard_bind {
            let broadcaster = Broadcaster::new(positions.clone(), bind.clone());
            tasks.push(tokio::spawn(broadcaster.run(shutdown_rx)));
        }

        info!(
            simulation = config.simulation.enabled,
            "engine started ({} workers)",
            tasks.len()
        );
        Ok(Self {
            shutdown,
            tasks,
            watcher,
            ledger,
            positions,
            simulation: config.simulation.enabled,
        })
    }

    pub fn positions(&self) -> Arc<PositionStore> {
        self.positions.clone()
    }

    /// Point-in-time status snapshot for the CLI surface.
    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let stats = self.positions.stats().await?;
        Ok(EngineStatus {
            simulation: self.simulation,
            open_positions: stats.open,
            closed_positions: stats.closed,
            sells_in_flight: self.watcher.in_flight_count(),
            paper: self.ledger.stats().await,
        })
    }

    /// Signal shutdown and drain. Exceeding the deadline aborts the
    /// remaining workers (the forced disconnect).
    pub async fn stop(self) {
        info!("engine stopping");
        let _ = self.shutdown.send(true);

        let drain_start = std::time::Instant::now();
        while self.watcher.in_flight_count() > 0 {
            if drain_start.elapsed() >= DRAIN_DEADLINE {
                warn!(
                    remaining = self.watcher.in_flight_count(),
                    "drain deadline exceeded, forcing disconnect"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for mut task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!("worker did not stop in time, aborting");
                task.abort();
            }
        }

        if self.simulation {
            self.ledger.print_summary().await;
        }
        info!("engine stopped");
    }
}
