//! Mindmap snapshots.
//!
//! A mindmap links the actors that recently traded a token to aggregate
//! network metrics. Snapshots arrive whole from the upstream producer and
//! are then mutated incrementally by per-actor trade events until the next
//! full snapshot overwrites them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::TradeData;
use super::ActorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Buy,
    Sell,
}

/// One actor's recent activity on a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorConnection {
    pub trade_count: u32,
    pub total_volume: f64,
    pub last_trade_time: DateTime<Utc>,
    /// Influence score in [0, 100].
    pub influence_score: f64,
    #[serde(default)]
    pub trade_kinds: HashSet<TradeKind>,
}

impl ActorConnection {
    /// A fresh connection for an actor seen for the first time.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            trade_count: 0,
            total_volume: 0.0,
            last_trade_time: now,
            influence_score: 0.0,
            trade_kinds: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    pub total_trades: u64,
}

/// Actor graph plus aggregate metrics for one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindmapSnapshot {
    #[serde(default)]
    pub actor_connections: HashMap<ActorId, ActorConnection>,
    #[serde(default)]
    pub network_metrics: NetworkMetrics,
    pub last_update: DateTime<Utc>,
}

impl MindmapSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            actor_connections: HashMap::new(),
            network_metrics: NetworkMetrics::default(),
            last_update: now,
        }
    }

    /// Fold one actor trade into the snapshot.
    ///
    /// Inserts a fresh connection for unseen actors, then accumulates the
    /// trade: buys contribute `amount_out`, sells `amount_in`. The
    /// influence score is recomputed as
    /// `min(100, 10 * trade_count + total_volume / 1000)`.
    /// Duplicate deliveries inflate the aggregates; deduplication is the
    /// producer's responsibility.
    pub fn apply_trade(&mut self, actor_id: &str, trade: &TradeData, now: DateTime<Utc>) {
        let connection = self
            .actor_connections
            .entry(actor_id.to_string())
            .or_insert_with(|| ActorConnection::empty(now));

        connection.trade_count += 1;
        connection.total_volume += match trade.trade_kind {
            TradeKind::Buy => trade.amount_out,
            TradeKind::Sell => trade.amount_in,
        };
        connection.last_trade_time = now;
        connection.trade_kinds.insert(trade.trade_kind);
        connection.influence_score =
            (10.0 * connection.trade_count as f64 + connection.total_volume / 1000.0).min(100.0);

        self.network_metrics.total_trades += 1;
        self.last_update = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buy_trade(mint: &str, amount_out: f64) -> TradeData {
        TradeData {
            token_in: Some("QuoteMint".to_string()),
            token_out: Some(mint.to_string()),
            mint: Some(mint.to_string()),
            amount_in: 1.0,
            amount_out,
            trade_kind: TradeKind::Buy,
        }
    }

    fn sell_trade(mint: &str, amount_in: f64) -> TradeData {
        TradeData {
            token_in: Some(mint.to_string()),
            token_out: Some("QuoteMint".to_string()),
            mint: Some(mint.to_string()),
            amount_in,
            amount_out: 1.0,
            trade_kind: TradeKind::Sell,
        }
    }

    #[test]
    fn apply_trade_inserts_fresh_connection() {
        let now = Utc::now();
        let mut snapshot = MindmapSnapshot::empty(now);

        snapshot.apply_trade("actor-1", &buy_trade("MintA", 500.0), now);

        let conn = &snapshot.actor_connections["actor-1"];
        assert_eq!(conn.trade_count, 1);
        assert_eq!(conn.total_volume, 500.0);
        assert!(conn.trade_kinds.contains(&TradeKind::Buy));
        assert_eq!(snapshot.network_metrics.total_trades, 1);
    }

    #[test]
    fn influence_score_formula_and_cap() {
        let now = Utc::now();
        let mut snapshot = MindmapSnapshot::empty(now);

        snapshot.apply_trade("actor-1", &buy_trade("MintA", 2000.0), now);
        // 10 * 1 + 2000/1000 = 12
        let conn = &snapshot.actor_connections["actor-1"];
        assert!((conn.influence_score - 12.0).abs() < 1e-9);

        // Pile on volume until the 100 cap engages.
        for _ in 0..20 {
            snapshot.apply_trade("actor-1", &buy_trade("MintA", 50_000.0), now);
        }
        assert_eq!(snapshot.actor_connections["actor-1"].influence_score, 100.0);
    }

    #[test]
    fn buys_and_sells_use_the_correct_leg() {
        let now = Utc::now();
        let mut snapshot = MindmapSnapshot::empty(now);

        snapshot.apply_trade("a", &buy_trade("MintA", 300.0), now);
        snapshot.apply_trade("a", &sell_trade("MintA", 200.0), now);

        let conn = &snapshot.actor_connections["a"];
        assert_eq!(conn.total_volume, 500.0);
        assert_eq!(conn.trade_kinds.len(), 2);
        assert_eq!(snapshot.network_metrics.total_trades, 2);
    }

    #[test]
    fn wire_format_accepts_camel_case() {
        let json = r#"{
            "actorConnections": {
                "actor-1": {
                    "tradeCount": 3,
                    "totalVolume": 1500.0,
                    "lastTradeTime": "2026-01-01T00:00:00Z",
                    "influenceScore": 31.5,
                    "tradeKinds": ["buy"]
                }
            },
            "networkMetrics": { "totalTrades": 3 },
            "lastUpdate": "2026-01-01T00:00:00Z"
        }"#;

        let snapshot: MindmapSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.actor_connections.len(), 1);
        assert_eq!(snapshot.network_metrics.total_trades, 3);
        let conn = &snapshot.actor_connections["actor-1"];
        assert_eq!(conn.trade_count, 3);
        assert!(conn.trade_kinds.contains(&TradeKind::Buy));
    }
}
