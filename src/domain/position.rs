//! Position lifecycle types.
//!
//! A [`Position`] records one round trip on a token: the entry fill, the
//! running price extremes while the position is watched, the trailing-stop
//! ladder state, and the exit fill once a sell condition fires. All
//! mutation goes through the methods here so the arithmetic invariants
//! (entry/exit value products, monotone high/low extension) hold no matter
//! which worker touches the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActorId, TokenId};

/// Unique position identifier (`pos-{unix_millis}-{suffix}`).
pub type PositionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
    Failed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "open"),
            PositionStatus::Closed => write!(f, "closed"),
            PositionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Exit rules attached to a position at entry time.
///
/// `step_level`, `next_target_price` and `curr_stop_price` are the stepped
/// trailing-stop ladder state; they are only populated once
/// `trailing_stop_activated` flips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellConditions {
    pub take_profit_pct: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    #[serde(default)]
    pub trailing_stop_activated: bool,
    pub max_hold_minutes: Option<u64>,
    #[serde(default)]
    pub step_level: u32,
    pub next_target_price: Option<f64>,
    pub curr_stop_price: Option<f64>,
}

impl Default for SellConditions {
    fn default() -> Self {
        Self {
            take_profit_pct: None,
            stop_loss_pct: None,
            trailing_stop_pct: None,
            trailing_stop_activated: false,
            max_hold_minutes: None,
            step_level: 0,
            next_target_price: None,
            curr_stop_price: None,
        }
    }
}

/// Why a position was (or is about to be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    SteppedStop,
    TrailingStop,
    MaxHold,
    PricingError,
    Shutdown,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
            ExitReason::SteppedStop => "stepped stop",
            ExitReason::TrailingStop => "trailing stop",
            ExitReason::MaxHold => "max hold time reached",
            ExitReason::PricingError => "token pricing error",
            ExitReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trailing ladder transition produced by [`Position::advance_trailing`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailingTransition {
    Activated { stop: f64, target: f64 },
    SteppedUp { level: u32, stop: f64, target: f64 },
}

/// Parameters for opening a new position.
#[derive(Debug, Clone, Default)]
pub struct OpenPositionParams {
    pub agent_id: ActorId,
    pub token_mint: TokenId,
    pub is_simulation: bool,
    pub prediction: Option<f64>,
    pub entry_price: f64,
    pub entry_amount: f64,
    pub buy_tx_id: Option<String>,
    pub sell_conditions: SellConditions,
    pub ledger_id: Option<String>,
    pub original_trade_id: Option<String>,
    pub watch_job_id: Option<String>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
}

/// One open or completed round-trip trade on a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub agent_id: ActorId,
    pub token_mint: TokenId,
    pub is_simulation: bool,
    pub prediction: Option<f64>,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub entry_price: f64,
    pub entry_amount: f64,
    pub entry_value: f64,
    pub buy_tx_id: Option<String>,
    pub exit_price: Option<f64>,
    pub exit_amount: Option<f64>,
    pub exit_value: Option<f64>,
    pub sell_tx_id: Option<String>,
    pub sell_reason: Option<String>,
    pub realized_pnl: Option<f64>,
    pub realized_pnl_pct: Option<f64>,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub current_price: f64,
    pub last_price_update: DateTime<Utc>,
    pub sell_conditions: SellConditions,
    pub ledger_id: Option<String>,
    pub original_trade_id: Option<String>,
    pub watch_job_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Construct an open position at the entry fill. High/low/current all
    /// start at the entry price.
    pub fn open(id: PositionId, params: OpenPositionParams, now: DateTime<Utc>) -> Self {
        let entry_value = params.entry_price * params.entry_amount;
        Self {
            id,
            agent_id: params.agent_id,
            token_mint: params.token_mint,
            is_simulation: params.is_simulation,
            prediction: params.prediction,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            entry_price: params.entry_price,
            entry_amount: params.entry_amount,
            entry_value,
            buy_tx_id: params.buy_tx_id,
            exit_price: None,
            exit_amount: None,
            exit_value: None,
            sell_tx_id: None,
            sell_reason: None,
            realized_pnl: None,
            realized_pnl_pct: None,
            highest_price: params.entry_price,
            lowest_price: params.entry_price,
            current_price: params.entry_price,
            last_price_update: now,
            sell_conditions: params.sell_conditions,
            ledger_id: params.ledger_id,
            original_trade_id: params.original_trade_id,
            watch_job_id: params.watch_job_id,
            tags: params.tags,
            notes: params.notes,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// PnL percentage at `price` relative to entry. Defined as 0 when the
    /// entry price is 0 so a bad fill can never divide by zero.
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Minutes elapsed since the position was opened.
    pub fn held_minutes(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_milliseconds().max(0) as f64 / 60_000.0
    }

    /// Record a fresh price observation. High/low extension is monotone,
    /// so late or out-of-order observations can never regress the extremes.
    pub fn apply_price(&mut self, price: f64, now: DateTime<Utc>) {
        self.current_price = price;
        self.last_price_update = now;
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price {
            self.lowest_price = price;
        }
        self.updated_at = now;
    }

    /// Advance the stepped trailing ladder for a new price.
    ///
    /// Stepped mode requires both a take-profit and a trailing percentage;
    /// with either missing this is a no-op. A zero entry price also never
    /// activates.
    pub fn advance_trailing(&mut self, price: f64) -> Option<TrailingTransition> {
        let (take_profit, trailing) = match (
            self.sell_conditions.take_profit_pct,
            self.sell_conditions.trailing_stop_pct,
        ) {
            (Some(tp), Some(tr)) => (tp, tr),
            _ => return None,
        };
        if self.entry_price <= 0.0 {
            return None;
        }

        let stop = price * (1.0 - trailing / 100.0);
        let target = price * (1.0 + take_profit / 100.0);

        if !self.sell_conditions.trailing_stop_activated {
            if self.pnl_pct(price) >= take_profit {
                self.sell_conditions.trailing_stop_activated = true;
                self.sell_conditions.step_level = 1;
                self.sell_conditions.curr_stop_price = Some(stop);
                self.sell_conditions.next_target_price = Some(target);
                return Some(TrailingTransition::Activated { stop, target });
            }
            return None;
        }

        match self.sell_conditions.next_target_price {
            Some(next_target) if price >= next_target => {
                self.sell_conditions.step_level += 1;
                self.sell_conditions.curr_stop_price = Some(stop);
                self.sell_conditions.next_target_price = Some(target);
                Some(TrailingTransition::SteppedUp {
                    level: self.sell_conditions.step_level,
                    stop,
                    target,
                })
            }
            _ => None,
        }
    }

    /// Evaluate the exit conditions against `price`; first match wins.
    ///
    /// Order: stop loss, fixed take profit (only when no trailing stop is
    /// configured), stepped stop, legacy continuous trailing (trailing set
    /// with take-profit unset).
    pub fn select_exit(&self, price: f64) -> Option<ExitReason> {
        let pct = self.pnl_pct(price);
        let sc = &self.sell_conditions;

        if let Some(stop_loss) = sc.stop_loss_pct {
            if pct <= -stop_loss {
                return Some(ExitReason::StopLoss);
            }
        }

        if let Some(take_profit) = sc.take_profit_pct {
            if sc.trailing_stop_pct.is_none() && pct >= take_profit {
                return Some(ExitReason::TakeProfit);
            }
        }

        if sc.trailing_stop_activated {
            if let Some(stop) = sc.curr_stop_price {
                if price <= stop {
                    return Some(ExitReason::SteppedStop);
                }
            }
        }

        if let (Some(trailing), None) = (sc.trailing_stop_pct, sc.take_profit_pct) {
            if self.highest_price > 0.0 {
                let drawdown = (price - self.highest_price) / self.highest_price * 100.0;
                if drawdown <= -trailing {
                    return Some(ExitReason::TrailingStop);
                }
            }
        }

        None
    }

    /// True once the position has been open at least `max_hold_minutes`.
    pub fn max_hold_reached(&self, now: DateTime<Utc>) -> bool {
        match self.sell_conditions.max_hold_minutes {
            Some(max) => self.held_minutes(now) >= max as f64,
            None => false,
        }
    }

    /// Mark the position closed at the exit fill and derive the realized
    /// figures. The exit value is always the price/amount product and the
    /// PnL the exit/entry value difference.
    pub fn close_with(
        &mut self,
        exit_price: f64,
        exit_amount: f64,
        sell_tx_id: Option<String>,
        sell_reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        let exit_value = exit_price * exit_amount;
        let realized_pnl = exit_value - self.entry_value;
        let realized_pnl_pct = if self.entry_value > 0.0 {
            realized_pnl / self.entry_value * 100.0
        } else {
            0.0
        };

        self.status = PositionStatus::Closed;
        self.closed_at = Some(now);
        self.exit_price = Some(exit_price);
        self.exit_amount = Some(exit_amount);
        self.exit_value = Some(exit_value);
        self.sell_tx_id = sell_tx_id;
        self.sell_reason = sell_reason;
        self.realized_pnl = Some(realized_pnl);
        self.realized_pnl_pct = Some(realized_pnl_pct);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_position(entry_price: f64, conditions: SellConditions) -> Position {
        Position::open(
            "pos-1".to_string(),
            OpenPositionParams {
                agent_id: "agent".to_string(),
                token_mint: "MintAAA".to_string(),
                entry_price,
                entry_amount: 100.0,
                sell_conditions: conditions,
                ..Default::default()
            },
            Utc::now(),
        )
    }

    fn stepped_conditions() -> SellConditions {
        SellConditions {
            take_profit_pct: Some(50.0),
            trailing_stop_pct: Some(10.0),
            ..Default::default()
        }
    }

    #[test]
    fn open_initializes_extremes_at_entry() {
        let pos = open_position(100.0, SellConditions::default());
        assert_eq!(pos.highest_price, 100.0);
        assert_eq!(pos.lowest_price, 100.0);
        assert_eq!(pos.current_price, 100.0);
        assert_eq!(pos.entry_value, 10_000.0);
        assert!(pos.is_open());
        assert!(pos.closed_at.is_none());
    }

    #[test]
    fn apply_price_extends_monotonically() {
        let mut pos = open_position(100.0, SellConditions::default());
        pos.apply_price(140.0, Utc::now());
        pos.apply_price(90.0, Utc::now());
        pos.apply_price(120.0, Utc::now());
        assert_eq!(pos.highest_price, 140.0);
        assert_eq!(pos.lowest_price, 90.0);
        assert_eq!(pos.current_price, 120.0);
    }

    #[test]
    fn stepped_trailing_activation_sequence() {
        // Entry 100, take profit 50%, trailing 10%.
        let mut pos = open_position(100.0, stepped_conditions());

        // 140: below activation threshold, stays inactive.
        pos.apply_price(140.0, Utc::now());
        assert_eq!(pos.advance_trailing(140.0), None);
        assert!(!pos.sell_conditions.trailing_stop_activated);
        assert_eq!(pos.highest_price, 140.0);

        // 150: +50% activates step 1 at stop 135 / target 225.
        pos.apply_price(150.0, Utc::now());
        assert_eq!(
            pos.advance_trailing(150.0),
            Some(TrailingTransition::Activated {
                stop: 135.0,
                target: 225.0
            })
        );
        assert_eq!(pos.sell_conditions.step_level, 1);

        // 200: under the next target, ladder unchanged.
        pos.apply_price(200.0, Utc::now());
        assert_eq!(pos.advance_trailing(200.0), None);
        assert_eq!(pos.sell_conditions.step_level, 1);

        // 230: over 225, steps to level 2 at stop 207 / target 345.
        pos.apply_price(230.0, Utc::now());
        match pos.advance_trailing(230.0) {
            Some(TrailingTransition::SteppedUp { level, stop, target }) => {
                assert_eq!(level, 2);
                assert!((stop - 207.0).abs() < 1e-9);
                assert!((target - 345.0).abs() < 1e-9);
            }
            other => panic!("expected step up, got {:?}", other),
        }

        // 200 is at or under the 207 stop: stepped stop fires.
        assert_eq!(pos.select_exit(200.0), Some(ExitReason::SteppedStop));
    }

    #[test]
    fn stop_loss_takes_priority() {
        let mut conditions = stepped_conditions();
        conditions.stop_loss_pct = Some(20.0);
        let pos = open_position(1.0, conditions);
        assert_eq!(pos.select_exit(0.80), Some(ExitReason::StopLoss));
    }

    #[test]
    fn fixed_take_profit_only_without_trailing() {
        let conditions = SellConditions {
            take_profit_pct: Some(50.0),
            ..Default::default()
        };
        let pos = open_position(100.0, conditions);
        assert_eq!(pos.select_exit(150.0), Some(ExitReason::TakeProfit));

        // With trailing configured the fixed target must not fire.
        let pos = open_position(100.0, stepped_conditions());
        assert_eq!(pos.select_exit(150.0), None);
    }

    #[test]
    fn legacy_continuous_trailing_without_take_profit() {
        let conditions = SellConditions {
            trailing_stop_pct: Some(10.0),
            ..Default::default()
        };
        let mut pos = open_position(100.0, conditions);
        pos.apply_price(200.0, Utc::now());
        // 12.5% drawdown from the 200 high exceeds the 10% trail.
        assert_eq!(pos.select_exit(175.0), Some(ExitReason::TrailingStop));
        assert_eq!(pos.select_exit(195.0), None);
    }

    #[test]
    fn zero_entry_price_never_activates_trailing() {
        let mut pos = open_position(0.0, stepped_conditions());
        assert_eq!(pos.pnl_pct(10.0), 0.0);
        assert_eq!(pos.advance_trailing(10.0), None);
        assert!(!pos.sell_conditions.trailing_stop_activated);
        assert_eq!(pos.select_exit(10.0), None);
    }

    #[test]
    fn close_derives_realized_figures() {
        let mut pos = open_position(1.0, SellConditions::default());
        pos.close_with(
            0.80,
            100.0,
            Some("tx-sell".to_string()),
            Some(ExitReason::StopLoss.as_str().to_string()),
            Utc::now(),
        );

        assert_eq!(pos.status, PositionStatus::Closed);
        assert!(pos.closed_at.is_some());
        assert_eq!(pos.exit_value, Some(80.0));
        assert_eq!(pos.realized_pnl, Some(-20.0));
        assert_eq!(pos.realized_pnl_pct, Some(-20.0));
        assert_eq!(pos.sell_reason.as_deref(), Some("stop loss"));
    }

    #[test]
    fn max_hold_boundary_is_inclusive() {
        let conditions = SellConditions {
            max_hold_minutes: Some(60),
            ..Default::default()
        };
        let mut pos = open_position(100.0, conditions);
        let opened = Utc::now();
        pos.opened_at = opened;
        assert!(!pos.max_hold_reached(opened + chrono::Duration::minutes(59)));
        assert!(pos.max_hold_reached(opened + chrono::Duration::minutes(60)));
    }

    #[test]
    fn serde_round_trip() {
        let pos = open_position(100.0, stepped_conditions());
        let json = serde_json::to_string(&pos).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }
}
