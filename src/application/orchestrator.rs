//! Event orchestrator.
//!
//! Consumes the inbound social-signal stream: full mindmap updates
//! overwrite the cached snapshot and (for unprocessed tokens) run the
//! admission pipeline; per-actor trade events fold into whichever cached
//! snapshots they touch. Approval hands straight to the trade executor.
//! Errors never stop the loop; an event that fails is logged and
//! dropped.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::domain::events::{ActorTradeEvent, MindmapUpdateEvent, StreamEvent};
use crate::domain::position::SellConditions;
use crate::domain::TokenId;
use crate::store::EngineState;

use super::admission::AdmissionPipeline;
use super::executor::{TradeError, TradeExecutor};

pub struct Orchestrator {
    state: Arc<EngineState>,
    admission: Arc<AdmissionPipeline>,
    executor: Arc<TradeExecutor>,
    /// Exit-rule template stamped onto every new position.
    sell_conditions: SellConditions,
    native_quote: TokenId,
}

impl Orchestrator {
    pub fn new(
        state: Arc<EngineState>,
        admission: Arc<AdmissionPipeline>,
        executor: Arc<TradeExecutor>,
        sell_conditions: SellConditions,
        native_quote: TokenId,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            admission,
            executor,
            sell_conditions,
            native_quote,
        })
    }

    /// Drain the event stream until it closes or the stop signal flips.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<StreamEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("orchestrator started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(StreamEvent::Mindmap(update)) => self.handle_mindmap(update).await,
                    Some(StreamEvent::ActorTrade(update)) => self.handle_actor_trade(update).await,
                    None => {
                        warn!("event stream closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("orchestrator stopped");
    }

    /// Full snapshot delivery: overwrite, then evaluate once per token
    /// lifetime (the processed set survives restarts).
    pub async fn handle_mindmap(&self, event: MindmapUpdateEvent) {
        let token = event.token_mint;
        if token == self.native_quote {
            debug!(token = %token, "ignoring native quote update");
            return;
        }

        if let Err(err) = self.state.put_snapshot(&token, &event.data).await {
            error!(token = %token, error = %err, "failed to cache snapshot");
            return;
        }

        match self.state.is_processed(&token).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                error!(token = %token, error = %err, "processed lookup failed");
                return;
            }
        }

        let decision = self.admission.evaluate(&token, &event.data).await;
        if !decision.approved {
            debug!(token = %token, reason = ?decision.reason, "admission rejected");
            return;
        }

        info!(
            token = %token,
            signals = ?decision.filter.signals,
            confidence = decision.prediction.as_ref().map(|p| p.confidence),
            "admission approved, buying"
        );

        let prediction = decision.prediction.as_ref().and_then(|p| p.probability);
        match self
            .executor
            .buy(&token, prediction, self.sell_conditions.clone())
            .await
        {
            Ok(position) => {
                info!(token = %token, id = %position.id, "buy executed");
            }
            Err(TradeError::Duplicate(_)) => {
                debug!(token = %token, "buy already in progress");
            }
            // Never retried: a second attempt could double-buy.
            Err(err) => error!(token = %token, error = %err, "buy failed"),
        }
    }

    /// Incremental per-actor trade: fold into every touched snapshot.
    /// Copy-on-write keeps concurrent admission reads stable.
    pub async fn handle_actor_trade(&self, event: ActorTradeEvent) {
        let trade = event.trade;
        let now = trade.timestamp.unwrap_or_else(Utc::now);

        for token in trade.trade_data.affected_tokens() {
            let snapshot = match self.state.get_snapshot(&token).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    warn!(token = %token, error = %err, "snapshot read failed");
                    continue;
                }
            };

            let mut updated = snapshot;
            updated.apply_trade(&trade.actor_id, &trade.trade_data, now);

            if let Err(err) = self.state.put_snapshot(&token, &updated).await {
                warn!(token = %token, error = %err, "snapshot write failed");
            }
        }
    }
}
