//! Paper-trading ledger.
//!
//! Balance keeping for dry runs: a token-to-balance map with atomic
//! deposit/withdraw, plus running stats for the shutdown summary. The
//! trade executor swaps against this instead of the backend when the
//! engine runs in simulation mode.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::TokenId;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance for {token}: have {have:.6}, need {need:.6}")]
    InsufficientBalance {
        token: TokenId,
        have: f64,
        need: f64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerStats {
    pub trades: u64,
    pub realized_pnl: f64,
}

struct LedgerInner {
    balances: HashMap<TokenId, f64>,
    stats: LedgerStats,
}

pub struct PaperLedger {
    inner: Mutex<LedgerInner>,
    quote_mint: TokenId,
    initial_balance: f64,
}

impl PaperLedger {
    /// A ledger seeded with `initial_balance` of the quote asset.
    pub fn new(quote_mint: &str, initial_balance: f64) -> Self {
        let mut balances = HashMap::new();
        balances.insert(quote_mint.to_string(), initial_balance);
        Self {
            inner: Mutex::new(LedgerInner {
                balances,
                stats: LedgerStats::default(),
            }),
            quote_mint: quote_mint.to_string(),
            initial_balance,
        }
    }

    pub async fn deposit(&self, token: &str, amount: f64) {
        let mut inner = self.inner.lock().await;
        *inner.balances.entry(token.to_string()).or_insert(0.0) += amount;
    }

    pub async fn withdraw(&self, token: &str, amount: f64) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let have = inner.balances.get(token).copied().unwrap_or(0.0);
        if have < amount {
            return Err(LedgerError::InsufficientBalance {
                token: token.to_string(),
                have,
                need: amount,
            });
        }
        inner.balances.insert(token.to_string(), have - amount);
        Ok(())
    }

    pub async fn balance(&self, token: &str) -> f64 {
        self.inner
            .lock()
            .await
            .balances
            .get(token)
            .copied()
            .unwrap_or(0.0)
    }

    pub async fn quote_balance(&self) -> f64 {
        self.balance(&self.quote_mint).await
    }

    pub async fn get_all(&self) -> HashMap<TokenId, f64> {
        self.inner.lock().await.balances.clone()
    }

    /// Record a completed round trip for the summary.
    pub async fn record_trade(&self, realized_pnl: f64) {
        let mut inner = self.inner.lock().await;
        inner.stats.trades += 1;
        inner.stats.realized_pnl += realized_pnl;
    }

    pub async fn stats(&self) -> LedgerStats {
        self.inner.lock().await.stats
    }

    /// Reset to the initial quote balance, dropping all holdings.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.balances.clear();
        inner
            .balances
            .insert(self.quote_mint.clone(), self.initial_balance);
        inner.stats = LedgerStats::default();
        info!(balance = self.initial_balance, "paper ledger reset");
    }

    pub async fn print_summary(&self) {
        let inner = self.inner.lock().await;
        info!("paper trading summary:");
        info!(
            "  quote balance: {:.4} (started with {:.4})",
            inner.balances.get(&self.quote_mint).copied().unwrap_or(0.0),
            self.initial_balance
        );
        info!("  round trips: {}", inner.stats.trades);
        info!("  realized PnL: {:+.4}", inner.stats.realized_pnl);
        let holdings = inner
            .balances
            .iter()
            .filter(|(token, amount)| **token != self.quote_mint && **amount > 0.0)
            .count();
        if holdings > 0 {
            info!("  open holdings: {holdings}");
        }
    }
}
