//! Ports layer - trait definitions for external collaborators.
//!
//! Following hexagonal architecture, these traits abstract:
//! - On-chain price discovery (the price oracle)
//! - The ML prediction service
//! - The swap execution backend
//! - The inbound social-signal event stream

pub mod mocks;
pub mod oracle;
pub mod prediction;
pub mod stream;
pub mod swap;

pub use oracle::{
    CurveBatch, DiscoveredRoute, OracleError, PriceOracle, RouteHint, RouteKind, RouteStage,
    VaultsRequest,
};
pub use prediction::{Prediction, PredictionError, PredictionOutcome, PredictionService};
pub use stream::{EventStream, StreamError};
pub use swap::{SwapBackend, SwapError, SwapResult};
