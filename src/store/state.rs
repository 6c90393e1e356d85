//! Engine coordination state.
//!
//! The mindmap snapshot cache, the processed-token set, the prediction
//! retry bookkeeping and the per-token buy lock. All of it lives in the
//! shared store so duplicate prevention and retry exhaustion survive
//! restarts.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::mindmap::MindmapSnapshot;

use super::kv::{KeyValueStore, StoreError};

const MINDMAP_TTL: Duration = Duration::from_secs(30 * 60);
const PROCESSED_TTL: Duration = Duration::from_secs(30 * 60);
const PREDICTION_TTL: Duration = Duration::from_secs(3600);
const BUY_LOCK_TTL: Duration = Duration::from_secs(60);

/// Retries after which a token is marked permanently failed.
pub const MAX_PREDICTION_RETRIES: i64 = 3;

pub struct EngineState {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl EngineState {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            prefix: "hivemind".to_string(),
        }
    }

    fn mindmap_key(&self, token: &str) -> String {
        format!("{}:mindmap:{}", self.prefix, token)
    }

    fn processed_set(&self) -> String {
        format!("{}:processed", self.prefix)
    }

    fn retries_key(&self, token: &str) -> String {
        format!("{}:prediction:retries:{}", self.prefix, token)
    }

    fn failed_key(&self, token: &str) -> String {
        format!("{}:prediction:failed:{}", self.prefix, token)
    }

    fn buy_lock_key(&self, token: &str) -> String {
        format!("{}:lock:buy:{}", self.prefix, token)
    }

    // ------------------------------------------------------------------
    // Mindmap snapshots
    // ------------------------------------------------------------------

    pub async fn get_snapshot(&self, token: &str) -> Result<Option<MindmapSnapshot>, StoreError> {
        match self.store.get(&self.mindmap_key(token)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn put_snapshot(
        &self,
        token: &str,
        snapshot: &MindmapSnapshot,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store
            .set(&self.mindmap_key(token), &raw, Some(MINDMAP_TTL))
            .await
    }

    pub async fn drop_snapshot(&self, token: &str) -> Result<(), StoreError> {
        self.store.delete(&self.mindmap_key(token)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processed tokens
    // ------------------------------------------------------------------

    pub async fn mark_processed(&self, token: &str) -> Result<(), StoreError> {
        self.store
            .set_add(&self.processed_set(), token, Some(PROCESSED_TTL))
            .await
    }

    pub async fn is_processed(&self, token: &str) -> Result<bool, StoreError> {
        self.store.set_contains(&self.processed_set(), token).await
    }

    // ------------------------------------------------------------------
    // Prediction bookkeeping
    // ------------------------------------------------------------------

    /// Bump the per-token rejection counter. At the retry ceiling the
    /// token is flagged permanently failed; both entries expire after an
    /// hour so a token gets another chance eventually.
    pub async fn record_prediction_rejection(&self, token: &str) -> Result<i64, StoreError> {
        let count = self
            .store
            .increment(&self.retries_key(token), Some(PREDICTION_TTL))
            .await?;
        if count >= MAX_PREDICTION_RETRIES {
            self.store
                .set(&self.failed_key(token), "1", Some(PREDICTION_TTL))
                .await?;
        }
        Ok(count)
    }

    pub async fn is_prediction_failed(&self, token: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.failed_key(token)).await
    }

    // ------------------------------------------------------------------
    // Buy lock
    // ------------------------------------------------------------------

    /// Cross-process per-token buy lock with a 60 s lease. Returns false
    /// when another holder is live.
    pub async fn acquire_buy_lock(&self, token: &str, owner: &str) -> Result<bool, StoreError> {
        self.store
            .set_nx(&self.buy_lock_key(token), owner, Some(BUY_LOCK_TTL))
            .await
    }

    pub async fn release_buy_lock(&self, token: &str) -> Result<(), StoreError> {
        self.store.delete(&self.buy_lock_key(token)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    fn state() -> EngineState {
        EngineState::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn snapshot_round_trip_and_drop() {
        let state = state();
        let snapshot = MindmapSnapshot::empty(Utc::now());

        state.put_snapshot("MintA", &snapshot).await.unwrap();
        assert_eq!(state.get_snapshot("MintA").await.unwrap(), Some(snapshot));

        state.drop_snapshot("MintA").await.unwrap();
        assert!(state.get_snapshot("MintA").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn processed_set_membership() {
        let state = state();
        assert!(!state.is_processed("MintA").await.unwrap());
        state.mark_processed("MintA").await.unwrap();
        assert!(state.is_processed("MintA").await.unwrap());
    }

    #[tokio::test]
    async fn prediction_failure_flags_at_ceiling() {
        let state = state();

        assert_eq!(state.record_prediction_rejection("MintA").await.unwrap(), 1);
        assert!(!state.is_prediction_failed("MintA").await.unwrap());
        assert_eq!(state.record_prediction_rejection("MintA").await.unwrap(), 2);
        assert!(!state.is_prediction_failed("MintA").await.unwrap());
        assert_eq!(state.record_prediction_rejection("MintA").await.unwrap(), 3);
        assert!(state.is_prediction_failed("MintA").await.unwrap());
    }

    #[tokio::test]
    async fn buy_lock_is_exclusive() {
        let state = state();
        assert!(state.acquire_buy_lock("MintA", "w1").await.unwrap());
        assert!(!state.acquire_buy_lock("MintA", "w2").await.unwrap());

        state.release_buy_lock("MintA").await.unwrap();
        assert!(state.acquire_buy_lock("MintA", "w2").await.unwrap());
    }
}
