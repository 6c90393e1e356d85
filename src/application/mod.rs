//! Application layer - the engine workers and their assembly.

pub mod admission;
pub mod broadcast;
pub mod engine;
pub mod executor;
pub mod orchestrator;
pub mod paper;
pub mod price_monitor;
pub mod watcher;

pub use admission::{AdmissionDecision, AdmissionPipeline};
pub use broadcast::Broadcaster;
pub use engine::{Engine, EngineError, EngineStatus, Ports};
pub use executor::{ExecutorSettings, TradeError, TradeExecutor};
pub use orchestrator::Orchestrator;
pub use paper::{LedgerError, LedgerStats, PaperLedger};
pub use price_monitor::PriceMonitor;
pub use watcher::PositionWatcher;
