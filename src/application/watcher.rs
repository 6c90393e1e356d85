//! Position watcher.
//!
//! The 100 ms loop that walks every open position: registers pricing
//! interest, applies the freshest cached price, advances the stepped
//! trailing ladder, evaluates the exit conditions and drives the sell to
//! completion. Sells run as spawned tasks guarded by an in-flight set so
//! a slow backend call can never stall the tick or double-sell a
//! position.
//!
//! Event ordering note: the price write (and its `position_update`) is
//! persisted before exit evaluation, so a position that closes in the
//! same tick emits a second `position_update` for the close. Subscribers
//! must treat events as last-write-wins snapshots per position id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::position::{ExitReason, Position, PositionId, TrailingTransition};
use crate::store::{PositionStore, PriceCache};

use super::executor::TradeExecutor;

const TICK_PERIOD: Duration = Duration::from_millis(100);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

pub struct PositionWatcher {
    positions: Arc<PositionStore>,
    prices: Arc<PriceCache>,
    executor: Arc<TradeExecutor>,
    in_flight: Mutex<HashSet<PositionId>>,
}

impl PositionWatcher {
    pub fn new(
        positions: Arc<PositionStore>,
        prices: Arc<PriceCache>,
        executor: Arc<TradeExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            positions,
            prices,
            executor,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Run until the stop signal flips. The ticker halts within one
    /// period of the signal.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);

        info!("position watcher started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "watcher tick failed");
                    }
                }
                _ = heartbeat.tick() => {
                    match self.positions.stats().await {
                        Ok(stats) => info!(open = stats.open, "watching positions"),
                        Err(err) => warn!(error = %err, "heartbeat stats failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("position watcher stopped");
    }

    /// One pass over all open positions.
    pub async fn tick(self: &Arc<Self>) -> Result<(), crate::store::StoreError> {
        let open = self.positions.list_open(None).await?;

        for position in &open {
            self.prices.add_interest(&position.token_mint, None).await?;
        }

        for position in open {
            let busy = self.in_flight.lock().unwrap().contains(&position.id);
            if busy {
                continue;
            }
            if let Err(err) = self.process_position(position).await {
                warn!(error = %err, "position processing failed");
            }
        }
        Ok(())
    }

    /// Sells currently being executed. Drained on shutdown.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    async fn process_position(
        self: &Arc<Self>,
        position: Position,
    ) -> Result<(), crate::store::StoreError> {
        let token = position.token_mint.clone();

        // Max-hold runs before the price fetch: stale pricing must never
        // delay a time-based exit.
        if position.max_hold_reached(Utc::now()) {
            self.spawn_exit(position, ExitReason::MaxHold);
            return Ok(());
        }

        let price = match self.prices.get_price(&token).await? {
            Some(price) => price,
            None => {
                if self.prices.has_error(&token).await? {
                    warn!(
                        id = %position.id,
                        token = %token,
                        "pricing permanently failing, force closing"
                    );
                    self.positions
                        .close(
                            &position.id,
                            0.0,
                            position.entry_amount,
                            None,
                            Some(ExitReason::PricingError.as_str().to_string()),
                        )
                        .await?;
                }
                return Ok(());
            }
        };

        // Write the observation through the store (monotone high/low),
        // then advance the trailing ladder on the returned snapshot.
        let mut position = match self.positions.update_price(&position.id, price).await? {
            Some(position) if position.is_open() => position,
            _ => return Ok(()),
        };

        match position.advance_trailing(price) {
            Some(TrailingTransition::Activated { stop, target }) => {
                info!(
                    id = %position.id,
                    token = %token,
                    stop,
                    target,
                    "trailing stop activated"
                );
                self.positions.replace(&position).await?;
            }
            Some(TrailingTransition::SteppedUp { level, stop, target }) => {
                info!(
                    id = %position.id,
                    token = %token,
                    level,
                    stop,
                    target,
                    "trailing stop stepped up"
                );
                self.positions.replace(&position).await?;
            }
            None => {}
        }

        if let Some(reason) = position.select_exit(price) {
            debug!(id = %position.id, token = %token, price, %reason, "exit selected");
            self.spawn_exit(position, reason);
        }
        Ok(())
    }

    /// Mark the position in flight and run the sell in its own task.
    fn spawn_exit(self: &Arc<Self>, position: Position, reason: ExitReason) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(position.id.clone()) {
                return;
            }
        }
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            watcher.execute_exit(position, reason).await;
            // Fall-through: execute_exit clears the in-flight entry.
        });
    }

    /// Sell and close, with the failure policy from the error design:
    /// transport failures retry next tick, a missing balance force-closes
    /// to break the loop.
    pub async fn execute_exit(self: &Arc<Self>, position: Position, reason: ExitReason) {
        let outcome = self.executor.sell(&position, reason.as_str()).await;

        let close_result = match outcome {
            Ok(fill) if fill.success => {
                info!(
                    id = %position.id,
                    token = %position.token_mint,
                    price = fill.execution_price,
                    %reason,
                    "position sold"
                );
                self.positions
                    .close(
                        &position.id,
                        fill.execution_price,
                        fill.amount,
                        fill.tx_id,
                        Some(reason.as_str().to_string()),
                    )
                    .await
                    .map(|_| ())
            }
            Ok(fill) if fill.is_missing_balance() => {
                warn!(
                    id = %position.id,
                    token = %position.token_mint,
                    message = ?fill.message,
                    "balance gone, force closing"
                );
                self.positions
                    .close(
                        &position.id,
                        0.0,
                        0.0,
                        None,
                        Some(reason.as_str().to_string()),
                    )
                    .await
                    .map(|_| ())
            }
            Ok(fill) => {
                warn!(
                    id = %position.id,
                    message = ?fill.message,
                    "sell rejected, retrying next tick"
                );
                Ok(())
            }
            Err(err) => {
                warn!(id = %position.id, error = %err, "sell failed, retrying next tick");
                Ok(())
            }
        };

        if let Err(err) = close_result {
            error!(id = %position.id, error = %err, "failed to persist close");
        }

        self.in_flight.lock().unwrap().remove(&position.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::paper::PaperLedger;
    use crate::domain::position::{PositionStatus, SellConditions};
    use crate::ports::mocks::{MockOracle, MockSwap};
    use crate::ports::swap::SwapResult;
    use crate::store::{EngineState, MemoryStore};

    use super::super::executor::ExecutorSettings;

    const QUOTE: &str = "QuoteMint";

    struct Fixture {
        watcher: Arc<PositionWatcher>,
        positions: Arc<PositionStore>,
        prices: Arc<PriceCache>,
        swap: Arc<MockSwap>,
    }

    fn fixture() -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let swap = Arc::new(MockSwap::new());
        let positions = Arc::new(PositionStore::new(store.clone()));
        let prices = Arc::new(PriceCache::new(store.clone()));
        let executor = Arc::new(TradeExecutor::new(
            ExecutorSettings {
                buy_amount: 0.5,
                slippage_bps: 100,
                agent_id: "agent".to_string(),
                simulation: false,
                allow_additional_entries: false,
                max_entries_per_token: None,
                quote_mint: QUOTE.to_string(),
            },
            swap.clone(),
            Arc::new(MockOracle::new()),
            positions.clone(),
            prices.clone(),
            Arc::new(EngineState::new(store.clone())),
            Arc::new(PaperLedger::new(QUOTE, 100.0)),
        ));
        let watcher = PositionWatcher::new(positions.clone(), prices.clone(), executor);
        Fixture {
            watcher,
            positions,
            prices,
            swap,
        }
    }

    async fn open_position(
        f: &Fixture,
        mint: &str,
        entry_price: f64,
        conditions: SellConditions,
    ) -> Position {
        f.positions
            .create_open(crate::domain::position::OpenPositionParams {
                agent_id: "agent".to_string(),
                token_mint: mint.to_string(),
                entry_price,
                entry_amount: 100.0,
                sell_conditions: conditions,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn settle(f: &Fixture) {
        // Let spawned sell tasks finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = f;
    }

    fn stepped() -> SellConditions {
        SellConditions {
            take_profit_pct: Some(50.0),
            trailing_stop_pct: Some(10.0),
            stop_loss_pct: Some(20.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tick_registers_interest_for_open_positions() {
        let f = fixture();
        open_position(&f, "MintA", 100.0, stepped()).await;

        f.watcher.tick().await.unwrap();
        assert!(f.prices.has_interest("MintA").await.unwrap());
    }

    #[tokio::test]
    async fn hard_stop_loss_closes_with_reason() {
        let f = fixture();
        let position = open_position(
            &f,
            "MintA",
            1.0,
            SellConditions {
                stop_loss_pct: Some(20.0),
                take_profit_pct: Some(50.0),
                ..Default::default()
            },
        )
        .await;

        f.swap.set_sell_result(SwapResult {
            success: true,
            execution_price: 0.80,
            amount: 100.0,
            tx_id: Some("tx-sell".to_string()),
            message: None,
        });
        f.prices.set_price("MintA", 0.80, None).await.unwrap();

        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let closed = f.positions.get(&position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.sell_reason.as_deref(), Some("stop loss"));
        // realizedPnL = (0.80 - 1.00) * 100.
        assert!((closed.realized_pnl.unwrap() + 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stepped_trailing_ladder_exits_on_stop() {
        let f = fixture();
        let position = open_position(&f, "MintA", 100.0, stepped()).await;

        // 140: inactive. 150: activates (stop 135, target 225).
        // 200: holds. 230: steps to stop 207. 200: stepped stop fires.
        for price in [140.0, 150.0, 200.0, 230.0] {
            f.prices.set_price("MintA", price, None).await.unwrap();
            f.watcher.tick().await.unwrap();
        }

        let live = f.positions.get(&position.id).await.unwrap().unwrap();
        assert!(live.is_open());
        assert_eq!(live.sell_conditions.step_level, 2);
        assert_eq!(live.sell_conditions.curr_stop_price, Some(207.0));
        assert_eq!(live.highest_price, 230.0);

        f.swap.set_sell_result(SwapResult {
            success: true,
            execution_price: 200.0,
            amount: 100.0,
            tx_id: None,
            message: None,
        });
        f.prices.set_price("MintA", 200.0, None).await.unwrap();
        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let closed = f.positions.get(&position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.sell_reason.as_deref(), Some("stepped stop"));
    }

    #[tokio::test]
    async fn max_hold_exits_without_price() {
        let f = fixture();
        let position = open_position(
            &f,
            "MintA",
            1.0,
            SellConditions {
                max_hold_minutes: Some(60),
                ..Default::default()
            },
        )
        .await;

        // Backdate the open far enough past the hold limit; no price is
        // ever cached.
        let mut aged = position.clone();
        aged.opened_at = Utc::now() - chrono::Duration::minutes(61);
        f.positions.replace(&aged).await.unwrap();

        f.swap.set_sell_result(SwapResult {
            success: true,
            execution_price: 0.0,
            amount: 100.0,
            tx_id: None,
            message: None,
        });

        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let closed = f.positions.get(&position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.sell_reason.as_deref(), Some("max hold time reached"));
        assert_eq!(f.swap.sell_calls().len(), 1);
    }

    #[tokio::test]
    async fn pricing_error_force_closes_without_swap() {
        let f = fixture();
        let position = open_position(&f, "MintA", 1.0, stepped()).await;
        f.prices.mark_error("MintA", None).await.unwrap();

        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let closed = f.positions.get(&position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.sell_reason.as_deref(), Some("token pricing error"));
        assert_eq!(closed.exit_price, Some(0.0));
        assert!(f.swap.sell_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_price_without_error_waits() {
        let f = fixture();
        let position = open_position(&f, "MintA", 1.0, stepped()).await;

        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let live = f.positions.get(&position.id).await.unwrap().unwrap();
        assert!(live.is_open());
    }

    #[tokio::test]
    async fn transport_failure_retries_next_tick() {
        let f = fixture();
        let position = open_position(
            &f,
            "MintA",
            1.0,
            SellConditions {
                stop_loss_pct: Some(20.0),
                ..Default::default()
            },
        )
        .await;

        // First attempt: backend rejects (not a balance problem).
        f.swap.set_sell_result(SwapResult {
            success: false,
            execution_price: 0.0,
            amount: 0.0,
            tx_id: None,
            message: Some("network congested".to_string()),
        });
        f.prices.set_price("MintA", 0.70, None).await.unwrap();
        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let live = f.positions.get(&position.id).await.unwrap().unwrap();
        assert!(live.is_open(), "rejected sell leaves the position open");

        // Next tick: backend recovers and the close lands.
        f.swap.set_sell_result(SwapResult {
            success: true,
            execution_price: 0.70,
            amount: 100.0,
            tx_id: None,
            message: None,
        });
        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let closed = f.positions.get(&position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(f.swap.sell_calls().len(), 2);
    }

    #[tokio::test]
    async fn missing_balance_force_closes() {
        let f = fixture();
        let position = open_position(
            &f,
            "MintA",
            1.0,
            SellConditions {
                stop_loss_pct: Some(20.0),
                ..Default::default()
            },
        )
        .await;

        f.swap.set_sell_result(SwapResult {
            success: false,
            execution_price: 0.0,
            amount: 0.0,
            tx_id: None,
            message: Some("insufficient funds in token account".to_string()),
        });
        f.prices.set_price("MintA", 0.70, None).await.unwrap();

        f.watcher.tick().await.unwrap();
        settle(&f).await;

        let closed = f.positions.get(&position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_value, Some(0.0));
    }

    #[tokio::test]
    async fn in_flight_guard_prevents_duplicate_sells() {
        let f = fixture();
        open_position(
            &f,
            "MintA",
            1.0,
            SellConditions {
                stop_loss_pct: Some(20.0),
                ..Default::default()
            },
        )
        .await;

        // Slow sell so the second tick overlaps the first sell.
        f.swap.set_delay(Duration::from_millis(80));
        f.swap.set_sell_result(SwapResult {
            success: true,
            execution_price: 0.70,
            amount: 100.0,
            tx_id: None,
            message: None,
        });
        f.prices.set_price("MintA", 0.70, None).await.unwrap();

        f.watcher.tick().await.unwrap();
        f.watcher.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(f.swap.sell_calls().len(), 1, "one sell despite two ticks");
    }
}
