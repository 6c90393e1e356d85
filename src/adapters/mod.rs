//! Adapters layer - concrete implementations of the ports.
//!
//! - `stream_ws`: WebSocket client for the inbound social-signal stream
//! - `swap_http`: engine API swap backend
//! - `prediction_http`: ML prediction service client
//! - `oracle_http`: price-oracle service client

pub mod oracle_http;
pub mod prediction_http;
pub mod stream_ws;
pub mod swap_http;

pub use oracle_http::HttpPriceOracle;
pub use prediction_http::HttpPredictionService;
pub use stream_ws::{WsEventStream, WsStreamConfig};
pub use swap_http::HttpSwapBackend;
