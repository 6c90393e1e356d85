//! Admission pipeline.
//!
//! Decides whether a mindmap snapshot earns a buy: the filter engine's
//! threshold gate, the optional on-chain market-cap verification, then
//! the prediction-service gate with bounded retries and a permanent-fail
//! flag. Non-fatal errors never propagate; they turn into a rejection
//! with a reason.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::domain::filter::{self, FilterResult, FilterThresholds};
use crate::domain::mindmap::MindmapSnapshot;
use crate::ports::oracle::PriceOracle;
use crate::ports::prediction::{PredictionError, PredictionOutcome, PredictionService};
use crate::store::state::{EngineState, MAX_PREDICTION_RETRIES};
use crate::util::{retry, Backoff};

/// Prediction call retry schedule: 3 attempts, exponential, 10 s cap.
const PREDICTION_BACKOFF: Backoff =
    Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 3);

/// Liquidity proxy: market cap must be a healthy multiple of the
/// configured liquidity floor.
const LIQUIDITY_CAP_MULTIPLE: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub approved: bool,
    pub reason: Option<String>,
    pub filter: FilterResult,
    pub prediction: Option<PredictionOutcome>,
}

impl AdmissionDecision {
    fn rejected(filter: FilterResult, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            filter,
            prediction: None,
        }
    }
}

pub struct AdmissionPipeline {
    thresholds: FilterThresholds,
    oracle: Arc<dyn PriceOracle>,
    prediction: Arc<dyn PredictionService>,
    state: Arc<EngineState>,
}

impl AdmissionPipeline {
    pub fn new(
        thresholds: FilterThresholds,
        oracle: Arc<dyn PriceOracle>,
        prediction: Arc<dyn PredictionService>,
        state: Arc<EngineState>,
    ) -> Self {
        Self {
            thresholds,
            oracle,
            prediction,
            state,
        }
    }

    /// Evaluate one token's snapshot end to end.
    pub async fn evaluate(&self, token: &str, snapshot: &MindmapSnapshot) -> AdmissionDecision {
        let filter = filter::evaluate(token, snapshot, &self.thresholds, Utc::now());
        if !filter.passed {
            debug!(token, reason = ?filter.reason, "filter rejected");
            return AdmissionDecision {
                approved: false,
                reason: filter.reason.clone(),
                filter,
                prediction: None,
            };
        }
        if !filter.signals.is_empty() {
            info!(token, signals = ?filter.signals, "filter signals detected");
        }

        if let Err(reason) = self.verify_on_chain(token).await {
            info!(token, %reason, "on-chain verification rejected");
            return AdmissionDecision::rejected(filter, reason);
        }

        match self.prediction_gate(token).await {
            Ok(outcome) if outcome.approved => AdmissionDecision {
                approved: true,
                reason: None,
                filter,
                prediction: Some(outcome),
            },
            Ok(outcome) => {
                let reason = format!(
                    "prediction rejected (label {:?}, confidence {:.1})",
                    outcome.class_label, outcome.confidence
                );
                let mut decision = AdmissionDecision::rejected(filter, reason);
                decision.prediction = Some(outcome);
                decision
            }
            Err(reason) => AdmissionDecision::rejected(filter, reason),
        }
    }

    /// Market-cap/liquidity verification against live chain data. Any
    /// fetch failure rejects: the convention cannot be applied blind.
    async fn verify_on_chain(&self, token: &str) -> Result<(), String> {
        let min_cap = self.thresholds.min_market_cap_usd;
        let min_liquidity = self.thresholds.min_liquidity_usd;
        if min_cap.is_none() && min_liquidity.is_none() {
            return Ok(());
        }

        let market_cap_usd = async {
            let route = self
                .oracle
                .discover(token)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| "token not priceable".to_string())?;
            let supply = self
                .oracle
                .token_supply(token)
                .await
                .map_err(|e| e.to_string())?;
            let quote_usd = self
                .oracle
                .quote_usd_price()
                .await
                .map_err(|e| e.to_string())?;
            Ok::<f64, String>(route.price * supply * quote_usd)
        }
        .await
        .map_err(|err| {
            warn!(token, error = %err, "market data fetch failed");
            "on-chain verification failed".to_string()
        })?;

        if let Some(min_cap) = min_cap {
            if market_cap_usd < min_cap {
                return Err(format!(
                    "market cap ${market_cap_usd:.0} below minimum ${min_cap:.0}"
                ));
            }
        }
        if let Some(min_liquidity) = min_liquidity {
            let required = min_liquidity * LIQUIDITY_CAP_MULTIPLE;
            if market_cap_usd < required {
                return Err(format!(
                    "market cap ${market_cap_usd:.0} below ${required:.0} liquidity multiple"
                ));
            }
        }
        Ok(())
    }

    /// Prediction gate with persistent retry bookkeeping. Returns an
    /// error string when the gate cannot approve.
    async fn prediction_gate(&self, token: &str) -> Result<PredictionOutcome, String> {
        match self.state.is_prediction_failed(token).await {
            Ok(true) => {
                info!(token, "prediction permanently failed, skipping");
                return Err("prediction permanently failed".to_string());
            }
            Ok(false) => {}
            Err(err) => warn!(token, error = %err, "prediction-failed lookup errored"),
        }

        let prediction = retry(
            PREDICTION_BACKOFF,
            PredictionError::is_retryable,
            || self.prediction.predict(token),
        )
        .await;

        let outcome = match prediction {
            Ok(prediction) => PredictionOutcome::from_prediction(prediction),
            Err(err) => {
                warn!(token, error = %err, "prediction call failed");
                self.record_rejection(token).await;
                return Err(format!("prediction unavailable: {err}"));
            }
        };

        if !outcome.approved {
            self.record_rejection(token).await;
        }
        Ok(outcome)
    }

    async fn record_rejection(&self, token: &str) {
        match self.state.record_prediction_rejection(token).await {
            Ok(count) if count >= MAX_PREDICTION_RETRIES => {
                warn!(token, count, "prediction permanently failed");
            }
            Ok(count) => debug!(token, count, "prediction rejection recorded"),
            Err(err) => warn!(token, error = %err, "failed to record prediction rejection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::domain::mindmap::{ActorConnection, TradeKind};
    use crate::ports::mocks::{MockOracle, MockPrediction};
    use crate::ports::oracle::{DiscoveredRoute, RouteKind, RouteStage};
    use crate::ports::prediction::Prediction;
    use crate::store::MemoryStore;

    fn thresholds() -> FilterThresholds {
        FilterThresholds {
            min_trade_volume: 100.0,
            min_connected_actors: 1,
            min_influence_score: 10.0,
            min_total_trades: 1,
            min_viral_velocity: None,
            require_smart_money: false,
            min_consensus_score: None,
            min_market_cap_usd: None,
            min_liquidity_usd: None,
            native_quote_mint: "NativeQuote".to_string(),
        }
    }

    fn busy_snapshot() -> MindmapSnapshot {
        let now = Utc::now();
        let mut snapshot = MindmapSnapshot::empty(now);
        let mut kinds = HashSet::new();
        kinds.insert(TradeKind::Buy);
        snapshot.actor_connections.insert(
            "actor-1".to_string(),
            ActorConnection {
                trade_count: 5,
                total_volume: 5_000.0,
                last_trade_time: now,
                influence_score: 80.0,
                trade_kinds: kinds,
            },
        );
        snapshot.network_metrics.total_trades = 5;
        snapshot
    }

    fn good_prediction(probability: f64) -> Prediction {
        Prediction {
            task_type: "classification".to_string(),
            class_label: Some("good".to_string()),
            probability: Some(probability),
            value: None,
        }
    }

    fn bad_prediction() -> Prediction {
        Prediction {
            task_type: "classification".to_string(),
            class_label: Some("bad".to_string()),
            probability: Some(0.9),
            value: None,
        }
    }

    fn pipeline(
        thresholds: FilterThresholds,
        oracle: Arc<MockOracle>,
        prediction: Arc<MockPrediction>,
    ) -> AdmissionPipeline {
        AdmissionPipeline::new(
            thresholds,
            oracle,
            prediction,
            Arc::new(EngineState::new(Arc::new(MemoryStore::new()))),
        )
    }

    #[tokio::test]
    async fn approves_good_token() {
        let prediction = Arc::new(MockPrediction::new());
        prediction.set_default(good_prediction(0.9));
        let pipeline = pipeline(thresholds(), Arc::new(MockOracle::new()), prediction);

        let decision = pipeline.evaluate("MintA", &busy_snapshot()).await;
        assert!(decision.approved);
        assert!(decision.filter.passed);
        assert!((decision.prediction.unwrap().confidence - 90.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn filter_rejection_skips_prediction() {
        let prediction = Arc::new(MockPrediction::new());
        prediction.set_default(good_prediction(0.9));
        let mut gate = thresholds();
        gate.min_trade_volume = 1_000_000.0;
        let pipeline = pipeline(gate, Arc::new(MockOracle::new()), prediction.clone());

        let decision = pipeline.evaluate("MintA", &busy_snapshot()).await;
        assert!(!decision.approved);
        assert_eq!(prediction.calls_for("MintA"), 0);
    }

    #[tokio::test]
    async fn on_chain_failure_rejects_with_fixed_reason() {
        let oracle = Arc::new(MockOracle::new());
        oracle.fail_supply(true);
        oracle.set_discovery(
            "MintA",
            DiscoveredRoute {
                price: 1.0,
                kind: RouteKind::AmmA,
                stage: RouteStage::Post,
                route_blob: None,
            },
        );
        let prediction = Arc::new(MockPrediction::new());
        prediction.set_default(good_prediction(0.9));

        let mut gate = thresholds();
        gate.min_market_cap_usd = Some(50_000.0);
        let pipeline = pipeline(gate, oracle, prediction);

        let decision = pipeline.evaluate("MintA", &busy_snapshot()).await;
        assert!(!decision.approved);
        assert_eq!(
            decision.reason.as_deref(),
            Some("on-chain verification failed")
        );
    }

    #[tokio::test]
    async fn market_cap_threshold_applies() {
        let oracle = Arc::new(MockOracle::new());
        oracle.set_discovery(
            "MintA",
            DiscoveredRoute {
                price: 0.001,
                kind: RouteKind::AmmA,
                stage: RouteStage::Post,
                route_blob: None,
            },
        );
        oracle.set_supply("MintA", 1_000_000.0);
        oracle.set_quote_usd(200.0);
        let prediction = Arc::new(MockPrediction::new());
        prediction.set_default(good_prediction(0.9));

        // Cap = 0.001 * 1e6 * 200 = 200_000 USD.
        let mut gate = thresholds();
        gate.min_market_cap_usd = Some(500_000.0);
        let strict = pipeline(gate.clone(), oracle.clone(), prediction.clone());
        let decision = strict.evaluate("MintA", &busy_snapshot()).await;
        assert!(!decision.approved);
        assert!(decision.reason.unwrap().contains("market cap"));

        gate.min_market_cap_usd = Some(100_000.0);
        let lenient = pipeline(gate, oracle, prediction);
        let decision = lenient.evaluate("MintA", &busy_snapshot()).await;
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn prediction_exhaustion_short_circuits() {
        let prediction = Arc::new(MockPrediction::new());
        prediction.set_default(bad_prediction());
        let state = Arc::new(EngineState::new(Arc::new(MemoryStore::new())));
        let pipeline = AdmissionPipeline::new(
            thresholds(),
            Arc::new(MockOracle::new()),
            prediction.clone(),
            state,
        );

        // Three consecutive rejections mark the token failed.
        for _ in 0..3 {
            let decision = pipeline.evaluate("MintA", &busy_snapshot()).await;
            assert!(!decision.approved);
        }
        assert_eq!(prediction.calls_for("MintA"), 3);

        // The fourth evaluation must not touch the service.
        let decision = pipeline.evaluate("MintA", &busy_snapshot()).await;
        assert!(!decision.approved);
        assert_eq!(
            decision.reason.as_deref(),
            Some("prediction permanently failed")
        );
        assert_eq!(prediction.calls_for("MintA"), 3);
    }

    #[tokio::test]
    async fn confidence_boundary_is_inclusive() {
        let prediction = Arc::new(MockPrediction::new());
        prediction.push_response("MintA", good_prediction(0.64999));
        prediction.push_response("MintA", good_prediction(0.65));
        let pipeline = pipeline(thresholds(), Arc::new(MockOracle::new()), prediction);

        let decision = pipeline.evaluate("MintA", &busy_snapshot()).await;
        assert!(!decision.approved, "64.999 confidence must block");

        let decision = pipeline.evaluate("MintA", &busy_snapshot()).await;
        assert!(decision.approved, "exactly 65 must approve");
    }
}
