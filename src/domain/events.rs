//! Wire event types.
//!
//! Inbound: the upstream social-signal stream delivers full mindmap
//! snapshots and per-actor trade events as JSON. Outbound: the engine
//! publishes position and price updates on a broadcast bus that the
//! dashboard worker fans out to its subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mindmap::{MindmapSnapshot, TradeKind};
use super::position::Position;
use super::TokenId;

/// Trade legs for one actor swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeData {
    #[serde(default)]
    pub token_in: Option<String>,
    #[serde(default)]
    pub token_out: Option<String>,
    #[serde(default)]
    pub mint: Option<String>,
    #[serde(default)]
    pub amount_in: f64,
    #[serde(default)]
    pub amount_out: f64,
    pub trade_kind: TradeKind,
}

impl TradeData {
    /// Tokens this trade may affect, deduplicated and in a stable order:
    /// mint first, then the in/out legs.
    pub fn affected_tokens(&self) -> Vec<TokenId> {
        let mut tokens: Vec<TokenId> = Vec::with_capacity(3);
        for candidate in [&self.mint, &self.token_in, &self.token_out] {
            if let Some(token) = candidate {
                if !token.is_empty() && !tokens.contains(token) {
                    tokens.push(token.clone());
                }
            }
        }
        tokens
    }
}

/// Envelope metadata attached to every stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One actor trade as delivered by the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorTrade {
    #[serde(default)]
    pub id: Option<String>,
    pub actor_id: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub trade_data: TradeData,
}

/// `ActorTradeUpdate` stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorTradeEvent {
    pub trade: ActorTrade,
    #[serde(default)]
    pub event: Option<EventMeta>,
}

/// `MindmapUpdate` stream message. Producers disagree on the payload field
/// name, so both `data` and `mindmapData` are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindmapUpdateEvent {
    pub token_mint: TokenId,
    #[serde(alias = "mindmapData")]
    pub data: MindmapSnapshot,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Inbound stream message, dispatched by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Mindmap(MindmapUpdateEvent),
    ActorTrade(ActorTradeEvent),
}

/// Outbound engine event for the dashboard broadcast.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeUpdate { position: Box<Position> },
    PriceUpdate { mint: TokenId, price: f64 },
}
