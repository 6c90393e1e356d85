//! Scripted port implementations for tests.
//!
//! Each mock records the calls it receives and replays configured
//! responses, so unit and integration tests can drive the engine without
//! any network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TokenId;

use super::oracle::{
    CurveBatch, DiscoveredRoute, OracleError, PriceOracle, VaultsRequest,
};
use super::prediction::{Prediction, PredictionError, PredictionService};
use super::swap::{SwapBackend, SwapError, SwapResult};

/// Price oracle with scripted curve/vault/discovery answers.
#[derive(Default)]
pub struct MockOracle {
    curve_prices: Mutex<HashMap<TokenId, f64>>,
    migrated: Mutex<HashSet<TokenId>>,
    vault_prices: Mutex<HashMap<TokenId, f64>>,
    discoveries: Mutex<HashMap<TokenId, DiscoveredRoute>>,
    fees: Mutex<Vec<f64>>,
    supplies: Mutex<HashMap<TokenId, f64>>,
    quote_usd: Mutex<Option<f64>>,
    fail_supply: Mutex<bool>,
    discover_calls: Mutex<Vec<TokenId>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_curve_price(&self, token: &str, price: f64) {
        self.curve_prices
            .lock()
            .unwrap()
            .insert(token.to_string(), price);
    }

    /// Mark a token as migrated off the curve (fast path misses it).
    pub fn set_migrated(&self, token: &str) {
        self.curve_prices.lock().unwrap().remove(token);
        self.migrated.lock().unwrap().insert(token.to_string());
    }

    pub fn set_vault_price(&self, token: &str, price: f64) {
        self.vault_prices
            .lock()
            .unwrap()
            .insert(token.to_string(), price);
    }

    pub fn set_discovery(&self, token: &str, route: DiscoveredRoute) {
        self.discoveries
            .lock()
            .unwrap()
            .insert(token.to_string(), route);
    }

    pub fn clear_discovery(&self, token: &str) {
        self.discoveries.lock().unwrap().remove(token);
    }

    pub fn set_fees(&self, fees: Vec<f64>) {
        *self.fees.lock().unwrap() = fees;
    }

    pub fn set_supply(&self, token: &str, supply: f64) {
        self.supplies
            .lock()
            .unwrap()
            .insert(token.to_string(), supply);
    }

    pub fn set_quote_usd(&self, price: f64) {
        *self.quote_usd.lock().unwrap() = Some(price);
    }

    /// Make supply lookups fail, simulating a dead data source.
    pub fn fail_supply(&self, fail: bool) {
        *self.fail_supply.lock().unwrap() = fail;
    }

    pub fn discover_calls(&self) -> Vec<TokenId> {
        self.discover_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn fast_batch_curve(&self, tokens: &[TokenId]) -> Result<CurveBatch, OracleError> {
        let prices = self.curve_prices.lock().unwrap();
        let mut batch = CurveBatch::default();
        for token in tokens {
            match prices.get(token) {
                Some(price) => {
                    batch.resolved.insert(token.clone(), *price);
                }
                None => batch.missing.push(token.clone()),
            }
        }
        Ok(batch)
    }

    async fn fast_batch_vaults(
        &self,
        requests: &[VaultsRequest],
    ) -> Result<HashMap<TokenId, f64>, OracleError> {
        let prices = self.vault_prices.lock().unwrap();
        Ok(requests
            .iter()
            .filter_map(|req| prices.get(&req.token).map(|p| (req.token.clone(), *p)))
            .collect())
    }

    async fn discover(&self, token: &str) -> Result<Option<DiscoveredRoute>, OracleError> {
        self.discover_calls.lock().unwrap().push(token.to_string());
        Ok(self.discoveries.lock().unwrap().get(token).cloned())
    }

    async fn recent_priority_fees(&self) -> Result<Vec<f64>, OracleError> {
        Ok(self.fees.lock().unwrap().clone())
    }

    async fn token_supply(&self, token: &str) -> Result<f64, OracleError> {
        if *self.fail_supply.lock().unwrap() {
            return Err(OracleError::Network("supply source unavailable".into()));
        }
        self.supplies
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .ok_or_else(|| OracleError::Network(format!("no supply for {token}")))
    }

    async fn quote_usd_price(&self) -> Result<f64, OracleError> {
        self.quote_usd
            .lock()
            .unwrap()
            .ok_or_else(|| OracleError::Network("quote price unavailable".into()))
    }
}

/// Prediction service replaying a scripted response sequence per token.
#[derive(Default)]
pub struct MockPrediction {
    responses: Mutex<HashMap<TokenId, VecDeque<Result<Prediction, String>>>>,
    default_response: Mutex<Option<Prediction>>,
    calls: Mutex<Vec<TokenId>>,
}

impl MockPrediction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a token; responses drain in order, the last
    /// one repeats.
    pub fn push_response(&self, token: &str, prediction: Prediction) {
        self.responses
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_default()
            .push_back(Ok(prediction));
    }

    pub fn push_failure(&self, token: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .entry(token.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn set_default(&self, prediction: Prediction) {
        *self.default_response.lock().unwrap() = Some(prediction);
    }

    pub fn calls_for(&self, token: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == token)
            .count()
    }
}

#[async_trait]
impl PredictionService for MockPrediction {
    async fn predict(&self, token: &str) -> Result<Prediction, PredictionError> {
        self.calls.lock().unwrap().push(token.to_string());

        let mut responses = self.responses.lock().unwrap();
        if let Some(queue) = responses.get_mut(token) {
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(response) = next {
                return response.map_err(PredictionError::Network);
            }
        }
        drop(responses);

        self.default_response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PredictionError::Network("no scripted response".into()))
    }
}

/// Swap backend with scripted fills and recorded calls.
pub struct MockSwap {
    buy_result: Mutex<SwapResult>,
    sell_result: Mutex<SwapResult>,
    balance: Mutex<f64>,
    delay: Mutex<Duration>,
    buys: Arc<Mutex<Vec<(TokenId, f64)>>>,
    sells: Arc<Mutex<Vec<(TokenId, f64)>>>,
}

impl Default for MockSwap {
    fn default() -> Self {
        Self {
            buy_result: Mutex::new(SwapResult {
                success: true,
                execution_price: 1.0,
                amount: 100.0,
                tx_id: Some("tx-buy".to_string()),
                message: None,
            }),
            sell_result: Mutex::new(SwapResult {
                success: true,
                execution_price: 1.0,
                amount: 100.0,
                tx_id: Some("tx-sell".to_string()),
                message: None,
            }),
            balance: Mutex::new(1_000.0),
            delay: Mutex::new(Duration::ZERO),
            buys: Arc::new(Mutex::new(Vec::new())),
            sells: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockSwap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_buy_result(&self, result: SwapResult) {
        *self.buy_result.lock().unwrap() = result;
    }

    pub fn set_sell_result(&self, result: SwapResult) {
        *self.sell_result.lock().unwrap() = result;
    }

    pub fn set_balance(&self, balance: f64) {
        *self.balance.lock().unwrap() = balance;
    }

    /// Artificial fill latency, for overlap tests.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn buy_calls(&self) -> Vec<(TokenId, f64)> {
        self.buys.lock().unwrap().clone()
    }

    pub fn sell_calls(&self) -> Vec<(TokenId, f64)> {
        self.sells.lock().unwrap().clone()
    }
}

#[async_trait]
impl SwapBackend for MockSwap {
    async fn buy(
        &self,
        mint: &str,
        amount: f64,
        _slippage_bps: u16,
        _priority_fee: f64,
    ) -> Result<SwapResult, SwapError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.buys.lock().unwrap().push((mint.to_string(), amount));
        Ok(self.buy_result.lock().unwrap().clone())
    }

    async fn sell(
        &self,
        mint: &str,
        amount: f64,
        _slippage_bps: u16,
        _priority_fee: f64,
    ) -> Result<SwapResult, SwapError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.sells.lock().unwrap().push((mint.to_string(), amount));
        Ok(self.sell_result.lock().unwrap().clone())
    }

    async fn balance(&self) -> Result<f64, SwapError> {
        Ok(*self.balance.lock().unwrap())
    }
}
