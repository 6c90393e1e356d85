//! Price monitor.
//!
//! Two cooperating loops over the interest set. The fast loop (100 ms)
//! serves tokens with a known cheap path: bonding-curve tokens through
//! the batched curve call, graduated tokens through their cached vault
//! blobs. Whatever the fast loop cannot resolve falls through to the
//! slow loop (1 s), which runs full discovery per token, caches the
//! route hint and blob, and negatively caches failures. Both loops write
//! fresh observations, so interleaved last-writer-wins commits are safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::TokenId;
use crate::ports::oracle::{PriceOracle, RouteStage, VaultsRequest};
use crate::store::{PriceCache, StoreError};

const FAST_PERIOD: Duration = Duration::from_millis(100);
const SLOW_PERIOD: Duration = Duration::from_secs(1);
/// Pause between slow-path discoveries, for oracle rate limits.
const DISCOVERY_PACING: Duration = Duration::from_millis(250);

pub struct PriceMonitor {
    oracle: Arc<dyn PriceOracle>,
    prices: Arc<PriceCache>,
}

impl PriceMonitor {
    pub fn new(oracle: Arc<dyn PriceOracle>, prices: Arc<PriceCache>) -> Arc<Self> {
        Arc::new(Self { oracle, prices })
    }

    /// Run both loops until the stop signal flips.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("price monitor started");
        let fast = tokio::spawn(Arc::clone(&self).fast_loop(shutdown.clone()));
        let slow = tokio::spawn(Arc::clone(&self).slow_loop(shutdown));
        let _ = tokio::join!(fast, slow);
        info!("price monitor stopped");
    }

    async fn fast_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(FAST_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.fast_tick().await {
                        debug!(error = %err, "fast tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn slow_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SLOW_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.slow_tick().await {
                        debug!(error = %err, "slow tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One fast pass: partition by route hint, batch both paths, commit
    /// the whole tick as one pipeline.
    pub async fn fast_tick(&self) -> Result<(), StoreError> {
        let interest = self.prices.list_interest().await?;
        if interest.is_empty() {
            return Ok(());
        }

        let mut curve_tokens: Vec<TokenId> = Vec::new();
        let mut vault_requests: Vec<VaultsRequest> = Vec::new();

        for token in &interest {
            match self.prices.get_route(token).await? {
                Some(hint) if hint.stage == RouteStage::Post => {
                    match self.prices.get_route_vaults(hint.kind, token).await? {
                        Some(blob) => vault_requests.push(VaultsRequest {
                            kind: hint.kind,
                            token: token.clone(),
                            blob,
                        }),
                        // No cached vaults yet; the slow loop will
                        // rediscover and fill them in.
                        None => {}
                    }
                }
                // No hint or still pre-graduation: the curve program can
                // answer cheaply.
                _ => curve_tokens.push(token.clone()),
            }
        }

        let mut ops = Vec::new();

        if !curve_tokens.is_empty() {
            match self.oracle.fast_batch_curve(&curve_tokens).await {
                Ok(batch) => {
                    for (token, price) in batch.resolved {
                        ops.extend(self.prices.price_write_ops(&token, price, None));
                    }
                    if !batch.missing.is_empty() {
                        debug!(count = batch.missing.len(), "curve batch misses");
                    }
                }
                Err(err) => warn!(error = %err, "curve batch failed"),
            }
        }

        if !vault_requests.is_empty() {
            match self.oracle.fast_batch_vaults(&vault_requests).await {
                Ok(resolved) => {
                    for (token, price) in resolved {
                        ops.extend(self.prices.price_write_ops(&token, price, None));
                    }
                }
                Err(err) => warn!(error = %err, "vault batch failed"),
            }
        }

        if !ops.is_empty() {
            self.prices.commit(ops).await?;
        }
        Ok(())
    }

    /// One slow pass: full discovery for every interest token that has
    /// neither a live price nor a live negative-cache entry.
    pub async fn slow_tick(&self) -> Result<(), StoreError> {
        let interest = self.prices.list_interest().await?;

        let mut first = true;
        for token in interest {
            if self.prices.get_price(&token).await?.is_some()
                || self.prices.has_error(&token).await?
            {
                continue;
            }
            if !first {
                tokio::time::sleep(DISCOVERY_PACING).await;
            }
            first = false;

            match self.oracle.discover(&token).await {
                Ok(Some(route)) => {
                    debug!(
                        token = %token,
                        price = route.price,
                        stage = ?route.stage,
                        "discovered price route"
                    );
                    self.prices.set_price(&token, route.price, None).await?;
                    self.prices.set_route(&token, &route.hint()).await?;
                    if let Some(blob) = &route.route_blob {
                        self.prices
                            .set_route_vaults(route.kind, &token, blob)
                            .await?;
                    }
                }
                Ok(None) => {
                    debug!(token = %token, "discovery found nothing, negative caching");
                    self.prices.mark_error(&token, None).await?;
                }
                Err(err) => {
                    warn!(token = %token, error = %err, "discovery failed");
                    self.prices.mark_error(&token, None).await?;
                }
            }
        }
        Ok(())
    }
}
