//! Swap execution backend port.
//!
//! The backend performs the actual on-chain swap; signing, routing and
//! confirmation are its problem. The engine only sees the fill.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("swap network error: {0}")]
    Network(String),
    #[error("swap API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("swap response parse error: {0}")]
    Parse(String),
}

/// Fill report for a buy or sell.
///
/// `amount` is the token amount received on a buy and the token amount
/// spent on a sell. A backend-level rejection comes back as
/// `success = false` with the reason in `message`; transport failures are
/// [`SwapError`]s instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapResult {
    pub success: bool,
    #[serde(default)]
    pub execution_price: f64,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub tx_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SwapResult {
    /// True when the failure message indicates the wallet no longer holds
    /// the token. The watcher force-closes on this instead of retrying
    /// forever.
    pub fn is_missing_balance(&self) -> bool {
        match &self.message {
            Some(message) => {
                let lower = message.to_lowercase();
                lower.contains("no balance") || lower.contains("insufficient funds")
            }
            None => false,
        }
    }
}

#[async_trait]
pub trait SwapBackend: Send + Sync {
    /// Swap `amount` of the quote asset into `mint`.
    async fn buy(
        &self,
        mint: &str,
        amount: f64,
        slippage_bps: u16,
        priority_fee: f64,
    ) -> Result<SwapResult, SwapError>;

    /// Swap `amount` of `mint` back into the quote asset.
    async fn sell(
        &self,
        mint: &str,
        amount: f64,
        slippage_bps: u16,
        priority_fee: f64,
    ) -> Result<SwapResult, SwapError>;

    /// Spendable quote-asset balance.
    async fn balance(&self) -> Result<f64, SwapError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(message: &str) -> SwapResult {
        SwapResult {
            success: false,
            execution_price: 0.0,
            amount: 0.0,
            tx_id: None,
            message: Some(message.to_string()),
        }
    }

    #[test]
    fn missing_balance_detection() {
        assert!(failed("account has no balance").is_missing_balance());
        assert!(failed("Insufficient Funds for swap").is_missing_balance());
        assert!(!failed("slippage tolerance exceeded").is_missing_balance());
        assert!(!SwapResult {
            success: true,
            execution_price: 1.0,
            amount: 10.0,
            tx_id: Some("tx".into()),
            message: None,
        }
        .is_missing_balance());
    }
}
