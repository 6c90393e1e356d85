//! Price oracle port.
//!
//! On-chain price discovery is a black box behind this trait: a fast
//! batched path for tokens still on their bonding curve, a fast path over
//! cached pool vault blobs for graduated tokens, and a slow discovery path
//! that classifies a token's pricing regime from scratch.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TokenId;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle network error: {0}")]
    Network(String),
    #[error("oracle API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("oracle response parse error: {0}")]
    Parse(String),
}

impl OracleError {
    /// Transport failures and server-side errors are retryable; malformed
    /// payloads and client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Network(_) => true,
            OracleError::Api { status, .. } => *status >= 500 || *status == 429,
            OracleError::Parse(_) => false,
        }
    }
}

/// Venue kind a token's price is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteKind {
    #[serde(rename = "ammA")]
    AmmA,
    #[serde(rename = "ammB")]
    AmmB,
    #[serde(rename = "cpmm")]
    Cpmm,
    #[serde(rename = "bondingCurve")]
    BondingCurve,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::AmmA => "ammA",
            RouteKind::AmmB => "ammB",
            RouteKind::Cpmm => "cpmm",
            RouteKind::BondingCurve => "bondingCurve",
        }
    }
}

/// Pricing regime: before or after graduation off the bonding curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStage {
    Pre,
    Post,
}

/// Cached routing hint for a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteHint {
    pub kind: RouteKind,
    pub stage: RouteStage,
}

/// Result of the batched bonding-curve fast path.
#[derive(Debug, Clone, Default)]
pub struct CurveBatch {
    /// Tokens the curve program still prices.
    pub resolved: HashMap<TokenId, f64>,
    /// Tokens the curve reports as migrated or unknown.
    pub missing: Vec<TokenId>,
}

/// One cached-vaults pricing request for the graduated fast path.
#[derive(Debug, Clone)]
pub struct VaultsRequest {
    pub kind: RouteKind,
    pub token: TokenId,
    /// Opaque reserve-account blob cached at discovery time.
    pub blob: String,
}

/// Outcome of slow-path discovery for one token.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredRoute {
    pub price: f64,
    pub kind: RouteKind,
    pub stage: RouteStage,
    pub route_blob: Option<String>,
}

impl DiscoveredRoute {
    pub fn hint(&self) -> RouteHint {
        RouteHint {
            kind: self.kind,
            stage: self.stage,
        }
    }
}

/// Black-box on-chain price discovery.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Batched fast path for tokens without a post-graduation hint.
    async fn fast_batch_curve(&self, tokens: &[TokenId]) -> Result<CurveBatch, OracleError>;

    /// Batched fast path over cached vault blobs for graduated tokens.
    async fn fast_batch_vaults(
        &self,
        requests: &[VaultsRequest],
    ) -> Result<HashMap<TokenId, f64>, OracleError>;

    /// Slow-path discovery; `None` when the token cannot be priced.
    async fn discover(&self, token: &str) -> Result<Option<DiscoveredRoute>, OracleError>;

    /// Recent priority-fee samples in the fee asset, newest first.
    async fn recent_priority_fees(&self) -> Result<Vec<f64>, OracleError>;

    /// Circulating supply for market-cap verification.
    async fn token_supply(&self, token: &str) -> Result<f64, OracleError>;

    /// USD price of the quote asset.
    async fn quote_usd_price(&self) -> Result<f64, OracleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_status() {
        assert!(OracleError::Network("timeout".into()).is_retryable());
        assert!(OracleError::Api {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(OracleError::Api {
            status: 429,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(!OracleError::Api {
            status: 404,
            message: "unknown".into()
        }
        .is_retryable());
        assert!(!OracleError::Parse("bad json".into()).is_retryable());
    }

    #[test]
    fn route_hint_serde_uses_wire_names() {
        let hint = RouteHint {
            kind: RouteKind::BondingCurve,
            stage: RouteStage::Pre,
        };
        let json = serde_json::to_string(&hint).unwrap();
        assert!(json.contains("bondingCurve"));
        assert!(json.contains("pre"));
        let back: RouteHint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hint);
    }
}
