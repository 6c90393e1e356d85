//! Trade execution.
//!
//! One buy per token fingerprint: an in-process guard stops redundant
//! lock traffic, the store-level lock stops duplicate buys across
//! processes and restarts, and the open-position check enforces the
//! fingerprint invariant. Buys are never retried; a failed swap surfaces
//! to the orchestrator. Sells are only issued by the position watcher.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::position::{OpenPositionParams, Position, SellConditions};
use crate::domain::TokenId;
use crate::ports::oracle::PriceOracle;
use crate::ports::swap::{SwapBackend, SwapResult};
use crate::store::{EngineState, PositionStore, PriceCache, StoreError};

use super::paper::PaperLedger;

/// Priority-fee clamp bounds, in the fee asset.
const FEE_FLOOR: f64 = 0.0001;
const FEE_CEILING: f64 = 0.01;
/// Fee samples considered for the percentile.
const FEE_SAMPLE_WINDOW: usize = 20;
/// Computed fee is reused for this long.
const FEE_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TradeError {
    #[error("buy already in progress for {0}")]
    Duplicate(TokenId),
    #[error("insufficient balance: have {have:.6}, need {need:.6}")]
    InsufficientBalance { have: f64, need: f64 },
    #[error("swap failed: {0}")]
    Swap(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Removes the token from the in-process set when the buy finishes,
/// whatever path it takes out.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<TokenId>>>,
    token: TokenId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.token);
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub buy_amount: f64,
    pub slippage_bps: u16,
    pub agent_id: String,
    pub simulation: bool,
    pub allow_additional_entries: bool,
    pub max_entries_per_token: Option<u32>,
    pub quote_mint: TokenId,
}

impl From<&Config> for ExecutorSettings {
    fn from(config: &Config) -> Self {
        Self {
            buy_amount: config.trading.buy_amount,
            slippage_bps: config.trading.slippage_bps,
            agent_id: config.trading.agent_id.clone(),
            simulation: config.simulation.enabled,
            allow_additional_entries: config.trading.allow_additional_entries,
            max_entries_per_token: config.trading.max_entries_per_token,
            quote_mint: config.tokens.native_quote_mint.clone(),
        }
    }
}

pub struct TradeExecutor {
    settings: ExecutorSettings,
    swap: Arc<dyn SwapBackend>,
    oracle: Arc<dyn PriceOracle>,
    positions: Arc<PositionStore>,
    prices: Arc<PriceCache>,
    state: Arc<EngineState>,
    ledger: Arc<PaperLedger>,
    in_process: Arc<Mutex<HashSet<TokenId>>>,
    fee_cache: Mutex<Option<(f64, Instant)>>,
    /// Lock-owner id so a lease can be traced back to its process.
    instance_id: String,
}

impl TradeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ExecutorSettings,
        swap: Arc<dyn SwapBackend>,
        oracle: Arc<dyn PriceOracle>,
        positions: Arc<PositionStore>,
        prices: Arc<PriceCache>,
        state: Arc<EngineState>,
        ledger: Arc<PaperLedger>,
    ) -> Self {
        let suffix: u32 = rand::thread_rng().gen();
        Self {
            settings,
            swap,
            oracle,
            positions,
            prices,
            state,
            ledger,
            in_process: Arc::new(Mutex::new(HashSet::new())),
            fee_cache: Mutex::new(None),
            instance_id: format!("exec-{suffix:08x}"),
        }
    }

    /// Open a position in `token`, spending the configured buy amount.
    pub async fn buy(
        &self,
        token: &str,
        prediction: Option<f64>,
        sell_conditions: SellConditions,
    ) -> Result<Position, TradeError> {
        let _guard = {
            let mut in_process = self.in_process.lock().unwrap();
            if !in_process.insert(token.to_string()) {
                return Err(TradeError::Duplicate(token.to_string()));
            }
            InFlightGuard {
                set: self.in_process.clone(),
                token: token.to_string(),
            }
        };

        if !self
            .state
            .acquire_buy_lock(token, &self.instance_id)
            .await?
        {
            return Err(TradeError::Duplicate(token.to_string()));
        }

        let result = self.buy_locked(token, prediction, sell_conditions).await;

        if let Err(err) = self.state.release_buy_lock(token).await {
            warn!(token, error = %err, "failed to release buy lock");
        }
        result
    }

    async fn buy_locked(
        &self,
        token: &str,
        prediction: Option<f64>,
        sell_conditions: SellConditions,
    ) -> Result<Position, TradeError> {
        self.check_fingerprint(token).await?;
        self.check_balance().await?;

        let priority_fee = self.priority_fee().await;
        let fill = if self.settings.simulation {
            self.paper_buy(token).await?
        } else {
            let fill = self
                .swap
                .buy(
                    token,
                    self.settings.buy_amount,
                    self.settings.slippage_bps,
                    priority_fee,
                )
                .await
                .map_err(|e| TradeError::Swap(e.to_string()))?;
            if !fill.success {
                return Err(TradeError::Swap(
                    fill.message.unwrap_or_else(|| "buy rejected".to_string()),
                ));
            }
            fill
        };

        let position = self
            .positions
            .create_open(OpenPositionParams {
                agent_id: self.settings.agent_id.clone(),
                token_mint: token.to_string(),
                is_simulation: self.settings.simulation,
                prediction,
                entry_price: fill.execution_price,
                entry_amount: fill.amount,
                buy_tx_id: fill.tx_id,
                sell_conditions,
                ..Default::default()
            })
            .await?;

        self.state.mark_processed(token).await?;
        // The snapshot served its purpose; the next full update rebuilds it.
        if let Err(err) = self.state.drop_snapshot(token).await {
            warn!(token, error = %err, "failed to drop mindmap snapshot");
        }

        info!(
            token,
            id = %position.id,
            price = position.entry_price,
            amount = position.entry_amount,
            simulation = position.is_simulation,
            "position opened"
        );
        Ok(position)
    }

    /// Close out a position through the backend (or the paper ledger).
    /// Only the position watcher calls this.
    pub async fn sell(&self, position: &Position, reason: &str) -> Result<SwapResult, TradeError> {
        let priority_fee = self.priority_fee().await;
        if self.settings.simulation {
            return self.paper_sell(position).await;
        }

        self.swap
            .sell(
                &position.token_mint,
                position.entry_amount,
                self.settings.slippage_bps,
                priority_fee,
            )
            .await
            .map_err(|e| {
                warn!(token = %position.token_mint, reason, error = %e, "sell transport error");
                TradeError::Swap(e.to_string())
            })
    }

    /// Enforce the one-open-position-per-fingerprint invariant.
    async fn check_fingerprint(&self, token: &str) -> Result<(), TradeError> {
        let open: Vec<Position> = self
            .positions
            .get_by_token(token, Some(crate::domain::position::PositionStatus::Open))
            .await?
            .into_iter()
            .filter(|p| p.agent_id == self.settings.agent_id)
            .collect();

        if open.is_empty() {
            return Ok(());
        }
        if !self.settings.allow_additional_entries {
            return Err(TradeError::Duplicate(token.to_string()));
        }
        if let Some(max) = self.settings.max_entries_per_token {
            if open.len() >= max as usize {
                return Err(TradeError::Duplicate(token.to_string()));
            }
        }
        Ok(())
    }

    async fn check_balance(&self) -> Result<(), TradeError> {
        let have = if self.settings.simulation {
            self.ledger.quote_balance().await
        } else {
            self.swap
                .balance()
                .await
                .map_err(|e| TradeError::Swap(e.to_string()))?
        };
        if have < self.settings.buy_amount {
            return Err(TradeError::InsufficientBalance {
                have,
                need: self.settings.buy_amount,
            });
        }
        Ok(())
    }

    /// Dynamic priority fee: 75th percentile of the last 20 non-zero
    /// samples, clamped, cached for 5 seconds.
    async fn priority_fee(&self) -> f64 {
        if let Some((fee, at)) = *self.fee_cache.lock().unwrap() {
            if at.elapsed() < FEE_CACHE_TTL {
                return fee;
            }
        }

        let fee = match self.oracle.recent_priority_fees().await {
            Ok(samples) => compute_priority_fee(&samples),
            Err(err) => {
                warn!(error = %err, "fee sample fetch failed, using floor");
                FEE_FLOOR
            }
        };

        *self.fee_cache.lock().unwrap() = Some((fee, Instant::now()));
        fee
    }

    async fn paper_buy(&self, token: &str) -> Result<SwapResult, TradeError> {
        let price = self
            .prices
            .get_price(token)
            .await?
            .ok_or_else(|| TradeError::Swap(format!("no cached price for {token}")))?;
        if price <= 0.0 {
            return Err(TradeError::Swap(format!("non-positive price for {token}")));
        }

        self.ledger
            .withdraw(&self.settings.quote_mint, self.settings.buy_amount)
            .await
            .map_err(|e| TradeError::Swap(e.to_string()))?;

        let amount = self.settings.buy_amount / price;
        self.ledger.deposit(token, amount).await;

        Ok(SwapResult {
            success: true,
            execution_price: price,
            amount,
            tx_id: Some(format!("paper-{}", Utc::now().timestamp_millis())),
            message: None,
        })
    }

    async fn paper_sell(&self, position: &Position) -> Result<SwapResult, TradeError> {
        let price = self
            .prices
            .get_price(&position.token_mint)
            .await?
            .unwrap_or(position.current_price);

        if let Err(err) = self
            .ledger
            .withdraw(&position.token_mint, position.entry_amount)
            .await
        {
            // Mirror the backend's missing-balance report so the watcher
            // force-closes instead of retrying forever.
            return Ok(SwapResult {
                success: false,
                execution_price: 0.0,
                amount: 0.0,
                tx_id: None,
                message: Some(format!("no balance: {err}")),
            });
        }

        let proceeds = position.entry_amount * price;
        self.ledger
            .deposit(&self.settings.quote_mint, proceeds)
            .await;
        self.ledger
            .record_trade(proceeds - position.entry_value)
            .await;

        Ok(SwapResult {
            success: true,
            execution_price: price,
            amount: position.entry_amount,
            tx_id: Some(format!("paper-{}", Utc::now().timestamp_millis())),
            message: None,
        })
    }
}

/// 75th percentile of the newest non-zero samples, clamped to the fee
/// band.
fn compute_priority_fee(samples: &[f64]) -> f64 {
    let mut window: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|fee| *fee > 0.0)
        .take(FEE_SAMPLE_WINDOW)
        .collect();
    if window.is_empty() {
        return FEE_FLOOR;
    }
    window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = ((window.len() as f64) * 0.75).ceil() as usize;
    let fee = window[rank.saturating_sub(1).min(window.len() - 1)];
    fee.clamp(FEE_FLOOR, FEE_CEILING)
}
