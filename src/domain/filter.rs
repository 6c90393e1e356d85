//! Mindmap filter evaluation.
//!
//! Pure computation from a [`MindmapSnapshot`] to aggregate metrics, signal
//! detection, and the threshold gate. Strong signals bypass the
//! quantitative thresholds but never the influence floor. The on-chain
//! market-cap/liquidity verification lives in the admission pipeline; this
//! module has no I/O.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::mindmap::{MindmapSnapshot, TradeKind};
use super::TokenId;

/// Window for the viral-velocity count.
const VIRAL_WINDOW_SECS: i64 = 60;

/// Share of total volume that must be influence-weighted for smart money.
const SMART_MONEY_SHARE: f64 = 0.6;

/// Minimum connected actors for a consensus signal to be meaningful.
const CONSENSUS_MIN_ACTORS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterSignal {
    ViralSpike,
    SmartMoney,
    HighConsensus,
}

/// Aggregates computed over one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterMetrics {
    pub total_volume: f64,
    pub connected_actors: usize,
    pub avg_influence: f64,
    pub total_trades: u64,
    /// Actors that traded within the last 60 seconds.
    pub viral_velocity: u32,
    pub weighted_volume: f64,
    /// Share of actors with a buy, in [0, 100].
    pub consensus_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterResult {
    pub passed: bool,
    pub reason: Option<String>,
    pub metrics: FilterMetrics,
    pub signals: HashSet<FilterSignal>,
}

impl FilterResult {
    pub fn rejected(reason: impl Into<String>, metrics: FilterMetrics) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            metrics,
            signals: HashSet::new(),
        }
    }
}

/// Filter thresholds, converted from the `[filter]` config section.
#[derive(Debug, Clone)]
pub struct FilterThresholds {
    pub min_trade_volume: f64,
    pub min_connected_actors: usize,
    /// Quality floor in [0, 100]; enforced even under signal override.
    pub min_influence_score: f64,
    pub min_total_trades: u64,
    pub min_viral_velocity: Option<u32>,
    pub require_smart_money: bool,
    pub min_consensus_score: Option<f64>,
    pub min_market_cap_usd: Option<f64>,
    pub min_liquidity_usd: Option<f64>,
    /// The wrapped native quote asset; never tradeable.
    pub native_quote_mint: TokenId,
}

/// Compute the aggregate metrics for a snapshot.
pub fn compute_metrics(snapshot: &MindmapSnapshot, now: DateTime<Utc>) -> FilterMetrics {
    let connections = &snapshot.actor_connections;
    let connected_actors = connections.len();

    let total_volume: f64 = connections.values().map(|c| c.total_volume).sum();
    let weighted_volume: f64 = connections
        .values()
        .map(|c| c.total_volume * (c.influence_score / 100.0))
        .sum();

    let avg_influence = if connected_actors == 0 {
        0.0
    } else {
        connections.values().map(|c| c.influence_score).sum::<f64>() / connected_actors as f64
    };

    let viral_cutoff = now - Duration::seconds(VIRAL_WINDOW_SECS);
    let viral_velocity = connections
        .values()
        .filter(|c| c.last_trade_time > viral_cutoff)
        .count() as u32;

    let consensus_score = if connected_actors == 0 {
        0.0
    } else {
        let buyers = connections
            .values()
            .filter(|c| c.trade_kinds.contains(&TradeKind::Buy))
            .count();
        100.0 * buyers as f64 / connected_actors as f64
    };

    FilterMetrics {
        total_volume,
        connected_actors,
        avg_influence,
        total_trades: snapshot.network_metrics.total_trades,
        viral_velocity,
        weighted_volume,
        consensus_score,
    }
}

/// Detect override signals from the metrics.
pub fn detect_signals(
    metrics: &FilterMetrics,
    thresholds: &FilterThresholds,
) -> HashSet<FilterSignal> {
    let mut signals = HashSet::new();

    if let Some(min_velocity) = thresholds.min_viral_velocity {
        if metrics.viral_velocity >= min_velocity {
            signals.insert(FilterSignal::ViralSpike);
        }
    }

    if thresholds.require_smart_money
        && metrics.weighted_volume > SMART_MONEY_SHARE * metrics.total_volume
        && metrics.total_volume > 0.0
    {
        signals.insert(FilterSignal::SmartMoney);
    }

    if let Some(min_consensus) = thresholds.min_consensus_score {
        if metrics.consensus_score >= min_consensus
            && metrics.connected_actors >= CONSENSUS_MIN_ACTORS
        {
            signals.insert(FilterSignal::HighConsensus);
        }
    }

    signals
}

/// Run the threshold gate for one token.
///
/// Any detected signal skips the volume/actor/trade-count thresholds; the
/// influence floor applies in every case. The native quote asset is
/// rejected outright.
pub fn evaluate(
    token: &str,
    snapshot: &MindmapSnapshot,
    thresholds: &FilterThresholds,
    now: DateTime<Utc>,
) -> FilterResult {
    if token == thresholds.native_quote_mint {
        return FilterResult::rejected(
            "native quote asset is never tradeable",
            FilterMetrics::default(),
        );
    }

    let metrics = compute_metrics(snapshot, now);
    let signals = detect_signals(&metrics, thresholds);

    if signals.is_empty() {
        if metrics.total_volume < thresholds.min_trade_volume {
            return FilterResult::rejected(
                format!(
                    "total volume {:.2} below minimum {:.2}",
                    metrics.total_volume, thresholds.min_trade_volume
                ),
                metrics,
            );
        }
        if metrics.connected_actors < thresholds.min_connected_actors {
            return FilterResult::rejected(
                format!(
                    "connected actors {} below minimum {}",
                    metrics.connected_actors, thresholds.min_connected_actors
                ),
                metrics,
            );
        }
        if metrics.total_trades < thresholds.min_total_trades {
            return FilterResult::rejected(
                format!(
                    "total trades {} below minimum {}",
                    metrics.total_trades, thresholds.min_total_trades
                ),
                metrics,
            );
        }
    }

    if metrics.avg_influence < thresholds.min_influence_score {
        return FilterResult::rejected(
            format!(
                "average influence {:.1} below floor {:.1}",
                metrics.avg_influence, thresholds.min_influence_score
            ),
            metrics,
        );
    }

    FilterResult {
        passed: true,
        reason: None,
        metrics,
        signals,
    }
}
