//! Shared price cache.
//!
//! Passive TTL'd state the price monitor writes and the watcher reads:
//! current price per token, a negative cache for failed discoveries, the
//! per-token route hint, the interest set driving what gets polled, and
//! cached vault blobs for the graduated fast path. Writers can batch a
//! whole monitor tick through [`PriceCache::commit`] so readers never see
//! a partial tick.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::domain::TokenId;
use crate::ports::oracle::{RouteHint, RouteKind, RouteStage};

use super::kv::{KeyValueStore, StoreError, StoreOp};

pub const PRICE_TTL: Duration = Duration::from_secs(60);
pub const ERROR_TTL: Duration = Duration::from_secs(30);
pub const INTEREST_TTL: Duration = Duration::from_secs(60);
pub const SOURCE_PRE_TTL: Duration = Duration::from_secs(5 * 60);
pub const SOURCE_POST_TTL: Duration = Duration::from_secs(24 * 3600);
pub const VAULTS_TTL: Duration = Duration::from_secs(24 * 3600);

pub struct PriceCache {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl PriceCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            prefix: "hivemind".to_string(),
        }
    }

    fn price_key(&self, token: &str) -> String {
        format!("{}:price:{}", self.prefix, token)
    }

    fn error_key(&self, token: &str) -> String {
        format!("{}:price:err:{}", self.prefix, token)
    }

    fn source_key(&self, token: &str) -> String {
        format!("{}:price:src:{}", self.prefix, token)
    }

    fn interest_set(&self) -> String {
        format!("{}:price:interest", self.prefix)
    }

    fn interest_key(&self, token: &str) -> String {
        format!("{}:price:interest:{}", self.prefix, token)
    }

    fn vaults_key(&self, kind: RouteKind, token: &str) -> String {
        format!("{}:vaults:{}:{}", self.prefix, kind.as_str(), token)
    }

    // ------------------------------------------------------------------
    // Interest set
    // ------------------------------------------------------------------

    /// Register interest in a token; the monitor polls interested tokens
    /// until the marker expires.
    pub async fn add_interest(&self, token: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let ttl = ttl.unwrap_or(INTEREST_TTL);
        self.store
            .apply(vec![
                StoreOp::SetAdd {
                    key: self.interest_set(),
                    member: token.to_string(),
                    ttl: None,
                },
                StoreOp::Set {
                    key: self.interest_key(token),
                    value: "1".to_string(),
                    ttl: Some(ttl),
                },
            ])
            .await
    }

    pub async fn has_interest(&self, token: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.interest_key(token)).await
    }

    /// Tokens with live interest. Expired members are pruned as a side
    /// effect.
    pub async fn list_interest(&self) -> Result<Vec<TokenId>, StoreError> {
        let members = self.store.set_members(&self.interest_set()).await?;
        let mut live = Vec::with_capacity(members.len());
        for token in members {
            if self.store.exists(&self.interest_key(&token)).await? {
                live.push(token);
            } else {
                debug!(token = %token, "pruning expired interest");
                self.store
                    .set_remove(&self.interest_set(), &token)
                    .await?;
            }
        }
        Ok(live)
    }

    // ------------------------------------------------------------------
    // Prices
    // ------------------------------------------------------------------

    pub async fn get_price(&self, token: &str) -> Result<Option<f64>, StoreError> {
        match self.store.get(&self.price_key(token)).await? {
            Some(raw) => raw
                .parse::<f64>()
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn set_price(
        &self,
        token: &str,
        price: f64,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.store
            .apply(self.price_write_ops(token, price, ttl))
            .await
    }

    /// The ops for one fresh price observation: write the price and drop
    /// any negative-cache entry. Used directly and by the monitor's
    /// per-tick batches.
    pub fn price_write_ops(
        &self,
        token: &str,
        price: f64,
        ttl: Option<Duration>,
    ) -> Vec<StoreOp> {
        vec![
            StoreOp::Set {
                key: self.price_key(token),
                value: price.to_string(),
                ttl: Some(ttl.unwrap_or(PRICE_TTL)),
            },
            StoreOp::Delete {
                key: self.error_key(token),
            },
        ]
    }

    // ------------------------------------------------------------------
    // Negative cache
    // ------------------------------------------------------------------

    pub async fn mark_error(&self, token: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.store
            .set(
                &self.error_key(token),
                "1",
                Some(ttl.unwrap_or(ERROR_TTL)),
            )
            .await
    }

    pub async fn has_error(&self, token: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.error_key(token)).await
    }

    // ------------------------------------------------------------------
    // Route hints and vault blobs
    // ------------------------------------------------------------------

    pub async fn get_route(&self, token: &str) -> Result<Option<RouteHint>, StoreError> {
        match self.store.get(&self.source_key(token)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Cache a route hint. Pre-graduation hints are short-lived since the
    /// token may migrate any moment; post-graduation routes are stable.
    pub async fn set_route(&self, token: &str, hint: &RouteHint) -> Result<(), StoreError> {
        let ttl = match hint.stage {
            RouteStage::Pre => SOURCE_PRE_TTL,
            RouteStage::Post => SOURCE_POST_TTL,
        };
        let value =
            serde_json::to_string(hint).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.set(&self.source_key(token), &value, Some(ttl)).await
    }

    pub async fn clear_route(&self, token: &str) -> Result<(), StoreError> {
        self.store.delete(&self.source_key(token)).await?;
        Ok(())
    }

    pub async fn get_route_vaults(
        &self,
        kind: RouteKind,
        token: &str,
    ) -> Result<Option<String>, StoreError> {
        self.store.get(&self.vaults_key(kind, token)).await
    }

    pub async fn set_route_vaults(
        &self,
        kind: RouteKind,
        token: &str,
        blob: &str,
    ) -> Result<(), StoreError> {
        self.store
            .set(&self.vaults_key(kind, token), blob, Some(VAULTS_TTL))
            .await
    }

    /// Commit a batch of ops collected over one monitor tick.
    pub async fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        self.store.apply(ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn cache() -> PriceCache {
        PriceCache::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn price_round_trip_and_error_clearing() {
        let cache = cache();
        cache.mark_error("MintA", None).await.unwrap();
        assert!(cache.has_error("MintA").await.unwrap());

        cache.set_price("MintA", 1.25, None).await.unwrap();
        assert_eq!(cache.get_price("MintA").await.unwrap(), Some(1.25));
        // A fresh price clears the negative cache.
        assert!(!cache.has_error("MintA").await.unwrap());
    }

    #[tokio::test]
    async fn price_expires() {
        let cache = cache();
        cache
            .set_price("MintA", 1.0, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(cache.get_price("MintA").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get_price("MintA").await.unwrap(), None);
    }

    #[tokio::test]
    async fn interest_expires_and_prunes() {
        let cache = cache();
        cache
            .add_interest("MintA", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        cache.add_interest("MintB", None).await.unwrap();

        assert!(cache.has_interest("MintA").await.unwrap());
        let mut interest = cache.list_interest().await.unwrap();
        interest.sort();
        assert_eq!(interest, vec!["MintA", "MintB"]);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.has_interest("MintA").await.unwrap());
        assert_eq!(cache.list_interest().await.unwrap(), vec!["MintB"]);
    }

    #[tokio::test]
    async fn route_hints_round_trip() {
        let cache = cache();
        let hint = RouteHint {
            kind: RouteKind::Cpmm,
            stage: RouteStage::Post,
        };
        cache.set_route("MintA", &hint).await.unwrap();
        assert_eq!(cache.get_route("MintA").await.unwrap(), Some(hint));

        cache.clear_route("MintA").await.unwrap();
        assert_eq!(cache.get_route("MintA").await.unwrap(), None);
    }

    #[tokio::test]
    async fn vault_blobs_round_trip() {
        let cache = cache();
        cache
            .set_route_vaults(RouteKind::AmmA, "MintA", "blob-data")
            .await
            .unwrap();
        assert_eq!(
            cache
                .get_route_vaults(RouteKind::AmmA, "MintA")
                .await
                .unwrap()
                .as_deref(),
            Some("blob-data")
        );
        // Different kind, different key.
        assert!(cache
            .get_route_vaults(RouteKind::Cpmm, "MintA")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn batched_commit_is_visible_atomically() {
        let cache = cache();
        let mut ops = cache.price_write_ops("MintA", 1.0, None);
        ops.extend(cache.price_write_ops("MintB", 2.0, None));
        cache.commit(ops).await.unwrap();

        assert_eq!(cache.get_price("MintA").await.unwrap(), Some(1.0));
        assert_eq!(cache.get_price("MintB").await.unwrap(), Some(2.0));
    }
}
