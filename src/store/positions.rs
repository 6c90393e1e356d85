//! Durable position store.
//!
//! Positions are serialized JSON records plus four secondary indices
//! (by agent, by token, open set, closed set). Every write commits the
//! record and its index mutations as one pipeline group, then publishes a
//! change event on the broadcast bus. Records carry a 90-day TTL, index
//! sets a 30-minute TTL; both refresh on every write, so a live engine
//! keeps its indices alive through the watcher's tick writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::EngineEvent;
use crate::domain::position::{OpenPositionParams, Position, PositionId, PositionStatus};
use crate::util::{retry, Backoff};

use super::kv::{KeyValueStore, StoreError, StoreOp};

const POSITION_TTL: Duration = Duration::from_secs(90 * 24 * 3600);
const INDEX_TTL: Duration = Duration::from_secs(30 * 60);

const STORE_BACKOFF: Backoff =
    Backoff::new(Duration::from_millis(50), Duration::from_secs(2), 3);

/// Event bus capacity; slow dashboard subscribers lag rather than block.
const EVENT_CAPACITY: usize = 1024;

/// Composable position query.
#[derive(Debug, Clone, Default)]
pub struct PositionQuery {
    pub agent: Option<String>,
    pub token: Option<String>,
    pub status: Option<PositionStatus>,
    pub opened_after: Option<DateTime<Utc>>,
    pub opened_before: Option<DateTime<Utc>>,
    pub min_pnl: Option<f64>,
    pub max_pnl: Option<f64>,
    pub tags: Vec<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionStats {
    pub open: usize,
    pub closed: usize,
}

pub struct PositionStore {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    events: broadcast::Sender<EngineEvent>,
}

impl PositionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            prefix: "hivemind".to_string(),
            events,
        }
    }

    /// Subscribe to `position_update`/`price_update` events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn position_key(&self, id: &str) -> String {
        format!("{}:position:{}", self.prefix, id)
    }

    fn agent_index(&self, agent: &str) -> String {
        format!("{}:positions:agent:{}", self.prefix, agent)
    }

    fn token_index(&self, token: &str) -> String {
        format!("{}:positions:token:{}", self.prefix, token)
    }

    fn open_index(&self) -> String {
        format!("{}:positions:open", self.prefix)
    }

    fn closed_index(&self) -> String {
        format!("{}:positions:closed", self.prefix)
    }

    fn next_id() -> PositionId {
        let suffix: u16 = rand::thread_rng().gen();
        format!("pos-{}-{:04x}", Utc::now().timestamp_millis(), suffix)
    }

    fn encode(position: &Position) -> Result<String, StoreError> {
        serde_json::to_string(position).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(raw: &str) -> Result<Position, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn emit_position(&self, position: &Position) {
        let _ = self.events.send(EngineEvent::TradeUpdate {
            position: Box::new(position.clone()),
        });
    }

    fn emit_price(&self, position: &Position) {
        let _ = self.events.send(EngineEvent::PriceUpdate {
            mint: position.token_mint.clone(),
            price: position.current_price,
        });
    }

    /// Commit a pipeline group, repairing a container-type mismatch once:
    /// the offending key is dropped and the group replayed.
    async fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let result = retry(STORE_BACKOFF, StoreError::is_retryable, || {
            self.store.apply(ops.clone())
        })
        .await;

        match result {
            Err(StoreError::WrongType(key)) => {
                warn!(key = %key, "index key holds the wrong container type, repairing");
                self.store.delete(&key).await?;
                self.store.apply(ops).await
            }
            other => other,
        }
    }

    /// Index mutations for a position, refreshing index TTLs.
    fn index_ops(&self, position: &Position) -> Vec<StoreOp> {
        let (live, dead) = match position.status {
            PositionStatus::Open => (self.open_index(), self.closed_index()),
            _ => (self.closed_index(), self.open_index()),
        };
        vec![
            StoreOp::SetAdd {
                key: self.agent_index(&position.agent_id),
                member: position.id.clone(),
                ttl: Some(INDEX_TTL),
            },
            StoreOp::SetAdd {
                key: self.token_index(&position.token_mint),
                member: position.id.clone(),
                ttl: Some(INDEX_TTL),
            },
            StoreOp::SetAdd {
                key: live,
                member: position.id.clone(),
                ttl: Some(INDEX_TTL),
            },
            StoreOp::SetRemove {
                key: dead,
                member: position.id.clone(),
            },
        ]
    }

    fn write_ops(&self, position: &Position) -> Result<Vec<StoreOp>, StoreError> {
        let mut ops = vec![StoreOp::Set {
            key: self.position_key(&position.id),
            value: Self::encode(position)?,
            ttl: Some(POSITION_TTL),
        }];
        ops.extend(self.index_ops(position));
        Ok(ops)
    }

    /// Open a new position and write it with all indices in one group.
    pub async fn create_open(&self, params: OpenPositionParams) -> Result<Position, StoreError> {
        let position = Position::open(Self::next_id(), params, Utc::now());
        self.commit(self.write_ops(&position)?).await?;
        debug!(id = %position.id, mint = %position.token_mint, "position opened");
        self.emit_position(&position);
        Ok(position)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Position>, StoreError> {
        match self.store.get(&self.position_key(id)).await? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn fetch_many(&self, ids: Vec<String>) -> Result<Vec<Position>, StoreError> {
        let mut positions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(position) = self.get(&id).await? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    fn sort_newest_first(positions: &mut [Position]) {
        positions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
    }

    /// Positions for an actor, newest first, optionally filtered by status.
    pub async fn get_by_actor(
        &self,
        agent: &str,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, StoreError> {
        let ids = self.store.set_members(&self.agent_index(agent)).await?;
        let mut positions = self.fetch_many(ids).await?;
        if let Some(status) = status {
            positions.retain(|p| p.status == status);
        }
        Self::sort_newest_first(&mut positions);
        Ok(positions)
    }

    /// Positions for a token, newest first, optionally filtered by status.
    pub async fn get_by_token(
        &self,
        token: &str,
        status: Option<PositionStatus>,
    ) -> Result<Vec<Position>, StoreError> {
        let ids = self.store.set_members(&self.token_index(token)).await?;
        let mut positions = self.fetch_many(ids).await?;
        if let Some(status) = status {
            positions.retain(|p| p.status == status);
        }
        Self::sort_newest_first(&mut positions);
        Ok(positions)
    }

    /// All open positions, optionally restricted to one actor.
    pub async fn list_open(&self, agent: Option<&str>) -> Result<Vec<Position>, StoreError> {
        let ids = self.store.set_members(&self.open_index()).await?;
        let mut positions = self.fetch_many(ids).await?;
        positions.retain(|p| p.is_open());
        if let Some(agent) = agent {
            positions.retain(|p| p.agent_id == agent);
        }
        Self::sort_newest_first(&mut positions);
        Ok(positions)
    }

    /// Record a price observation. Non-open positions are left untouched.
    /// Emits `price_update` and `position_update` on success.
    pub async fn update_price(
        &self,
        id: &str,
        price: f64,
    ) -> Result<Option<Position>, StoreError> {
        let mut position = match self.get(id).await? {
            Some(position) => position,
            None => return Ok(None),
        };
        if !position.is_open() {
            return Ok(Some(position));
        }

        position.apply_price(price, Utc::now());
        self.commit(self.write_ops(&position)?).await?;
        self.emit_price(&position);
        self.emit_position(&position);
        Ok(Some(position))
    }

    /// Full write-through of an externally mutated position. Open/closed
    /// set membership is reconciled in the same pipeline group.
    pub async fn replace(&self, position: &Position) -> Result<(), StoreError> {
        self.commit(self.write_ops(position)?).await?;
        self.emit_position(position);
        Ok(())
    }

    /// Close a position at the exit fill. Unknown ids yield `None`; a
    /// position that is already closed is returned unchanged (a close can
    /// never re-open or re-close).
    pub async fn close(
        &self,
        id: &str,
        exit_price: f64,
        exit_amount: f64,
        sell_tx_id: Option<String>,
        sell_reason: Option<String>,
    ) -> Result<Option<Position>, StoreError> {
        let mut position = match self.get(id).await? {
            Some(position) => position,
            None => return Ok(None),
        };
        if !position.is_open() {
            return Ok(Some(position));
        }

        position.close_with(exit_price, exit_amount, sell_tx_id, sell_reason, Utc::now());
        self.commit(self.write_ops(&position)?).await?;
        debug!(
            id = %position.id,
            pnl = ?position.realized_pnl,
            reason = ?position.sell_reason,
            "position closed"
        );
        self.emit_position(&position);
        Ok(Some(position))
    }

    /// Remove a position and all its index entries.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let position = match self.get(id).await? {
            Some(position) => position,
            None => return Ok(false),
        };

        self.commit(vec![
            StoreOp::Delete {
                key: self.position_key(id),
            },
            StoreOp::SetRemove {
                key: self.agent_index(&position.agent_id),
                member: id.to_string(),
            },
            StoreOp::SetRemove {
                key: self.token_index(&position.token_mint),
                member: id.to_string(),
            },
            StoreOp::SetRemove {
                key: self.open_index(),
                member: id.to_string(),
            },
            StoreOp::SetRemove {
                key: self.closed_index(),
                member: id.to_string(),
            },
        ])
        .await?;
        Ok(true)
    }

    /// Drop every stored position. Test/reset surface.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let mut ids = self.store.set_members(&self.open_index()).await?;
        ids.extend(self.store.set_members(&self.closed_index()).await?);

        let mut ops = Vec::new();
        for id in &ids {
            if let Some(position) = self.get(id).await? {
                ops.push(StoreOp::Delete {
                    key: self.agent_index(&position.agent_id),
                });
                ops.push(StoreOp::Delete {
                    key: self.token_index(&position.token_mint),
                });
            }
            ops.push(StoreOp::Delete {
                key: self.position_key(id),
            });
        }
        ops.push(StoreOp::Delete {
            key: self.open_index(),
        });
        ops.push(StoreOp::Delete {
            key: self.closed_index(),
        });
        self.commit(ops).await
    }

    pub async fn stats(&self) -> Result<PositionStats, StoreError> {
        Ok(PositionStats {
            open: self.store.set_members(&self.open_index()).await?.len(),
            closed: self.store.set_members(&self.closed_index()).await?.len(),
        })
    }

    /// Composable filter query with pagination, newest first.
    pub async fn query(&self, query: &PositionQuery) -> Result<Vec<Position>, StoreError> {
        // Start from the narrowest index available.
        let ids = if let Some(agent) = &query.agent {
            self.store.set_members(&self.agent_index(agent)).await?
        } else if let Some(token) = &query.token {
            self.store.set_members(&self.token_index(token)).await?
        } else {
            match query.status {
                Some(PositionStatus::Open) => self.store.set_members(&self.open_index()).await?,
                Some(_) => self.store.set_members(&self.closed_index()).await?,
                None => {
                    let mut ids = self.store.set_members(&self.open_index()).await?;
                    ids.extend(self.store.set_members(&self.closed_index()).await?);
                    ids
                }
            }
        };

        let mut positions = self.fetch_many(ids).await?;
        positions.retain(|p| {
            query.agent.as_deref().map_or(true, |a| p.agent_id == a)
                && query.token.as_deref().map_or(true, |t| p.token_mint == t)
                && query.status.map_or(true, |s| p.status == s)
                && query.opened_after.map_or(true, |t| p.opened_at >= t)
                && query.opened_before.map_or(true, |t| p.opened_at <= t)
                && query
                    .min_pnl
                    .map_or(true, |min| p.realized_pnl.map_or(false, |pnl| pnl >= min))
                && query
                    .max_pnl
                    .map_or(true, |max| p.realized_pnl.map_or(false, |pnl| pnl <= max))
                && query.tags.iter().all(|tag| p.tags.contains(tag))
        });
        Self::sort_newest_first(&mut positions);

        let positions: Vec<Position> = positions
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::SellConditions;
    use crate::store::memory::MemoryStore;

    fn store() -> PositionStore {
        PositionStore::new(Arc::new(MemoryStore::new()))
    }

    fn params(agent: &str, mint: &str, entry_price: f64) -> OpenPositionParams {
        OpenPositionParams {
            agent_id: agent.to_string(),
            token_mint: mint.to_string(),
            entry_price,
            entry_amount: 100.0,
            sell_conditions: SellConditions::default(),
            tags: vec!["auto".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        let created = store.create_open(params("agent", "MintA", 1.0)).await.unwrap();
        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.status, PositionStatus::Open);
        assert_eq!(fetched.entry_value, 100.0);
    }

    #[tokio::test]
    async fn indices_track_creation() {
        let store = store();
        let p1 = store.create_open(params("agent", "MintA", 1.0)).await.unwrap();
        let p2 = store.create_open(params("agent", "MintB", 2.0)).await.unwrap();

        let by_actor = store.get_by_actor("agent", None).await.unwrap();
        assert_eq!(by_actor.len(), 2);
        // Newest first.
        assert_eq!(by_actor[0].id, p2.id);

        let by_token = store.get_by_token("MintA", None).await.unwrap();
        assert_eq!(by_token.len(), 1);
        assert_eq!(by_token[0].id, p1.id);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats, PositionStats { open: 2, closed: 0 });
    }

    #[tokio::test]
    async fn update_price_is_monotone_on_extremes() {
        let store = store();
        let created = store.create_open(params("agent", "MintA", 100.0)).await.unwrap();

        store.update_price(&created.id, 140.0).await.unwrap();
        store.update_price(&created.id, 90.0).await.unwrap();
        let position = store.update_price(&created.id, 120.0).await.unwrap().unwrap();

        assert_eq!(position.highest_price, 140.0);
        assert_eq!(position.lowest_price, 90.0);
        assert_eq!(position.current_price, 120.0);
    }

    #[tokio::test]
    async fn update_price_skips_closed_positions() {
        let store = store();
        let created = store.create_open(params("agent", "MintA", 100.0)).await.unwrap();
        store
            .close(&created.id, 120.0, 100.0, None, Some("take profit".into()))
            .await
            .unwrap();

        let position = store.update_price(&created.id, 50.0).await.unwrap().unwrap();
        assert_eq!(position.current_price, 100.0, "closed position untouched");
    }

    #[tokio::test]
    async fn close_moves_between_index_sets() {
        let store = store();
        let created = store.create_open(params("agent", "MintA", 1.0)).await.unwrap();

        let closed = store
            .close(&created.id, 0.8, 100.0, Some("tx".into()), Some("stop loss".into()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.realized_pnl, Some(-20.0));
        let stats = store.stats().await.unwrap();
        assert_eq!(stats, PositionStats { open: 0, closed: 1 });
        assert!(store.list_open(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_unknown_returns_none_and_never_reopens() {
        let store = store();
        assert!(store
            .close("pos-missing", 1.0, 1.0, None, None)
            .await
            .unwrap()
            .is_none());

        let created = store.create_open(params("agent", "MintA", 1.0)).await.unwrap();
        let first = store
            .close(&created.id, 2.0, 100.0, None, Some("take profit".into()))
            .await
            .unwrap()
            .unwrap();
        // A second close must not rewrite the exit.
        let second = store
            .close(&created.id, 9.0, 100.0, None, Some("stop loss".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.exit_price, first.exit_price);
        assert_eq!(second.sell_reason, first.sell_reason);
    }

    #[tokio::test]
    async fn replace_is_idempotent() {
        let store = store();
        let created = store.create_open(params("agent", "MintA", 1.0)).await.unwrap();

        store.replace(&created).await.unwrap();
        store.replace(&created).await.unwrap();
        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(store.stats().await.unwrap().open, 1);
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let store = store();
        let created = store.create_open(params("agent", "MintA", 1.0)).await.unwrap();

        assert!(store.delete(&created.id).await.unwrap());
        assert!(store.get(&created.id).await.unwrap().is_none());
        assert!(store.get_by_actor("agent", None).await.unwrap().is_empty());
        assert!(!store.delete(&created.id).await.unwrap());
    }

    #[tokio::test]
    async fn clear_all_resets_the_store() {
        let store = store();
        store.create_open(params("agent", "MintA", 1.0)).await.unwrap();
        store.create_open(params("agent", "MintB", 1.0)).await.unwrap();

        store.clear_all().await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats, PositionStats::default());
    }

    #[tokio::test]
    async fn query_filters_compose() {
        let store = store();
        let p1 = store.create_open(params("agent-1", "MintA", 1.0)).await.unwrap();
        let _p2 = store.create_open(params("agent-2", "MintB", 1.0)).await.unwrap();
        store
            .close(&p1.id, 2.0, 100.0, None, Some("take profit".into()))
            .await
            .unwrap();

        let closed_winners = store
            .query(&PositionQuery {
                status: Some(PositionStatus::Closed),
                min_pnl: Some(0.0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(closed_winners.len(), 1);
        assert_eq!(closed_winners[0].id, p1.id);

        let tagged = store
            .query(&PositionQuery {
                tags: vec!["auto".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tagged.len(), 2);

        let paged = store
            .query(&PositionQuery {
                offset: 1,
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn wrong_container_type_is_repaired() {
        let memory = Arc::new(MemoryStore::new());
        let store = PositionStore::new(memory.clone());

        // Corrupt the open index into a plain string entry.
        memory.poison_as_text("hivemind:positions:open", "garbage");

        let created = store.create_open(params("agent", "MintA", 1.0)).await.unwrap();
        // Repair must have replaced the poisoned key with a real set.
        assert_eq!(store.list_open(None).await.unwrap()[0].id, created.id);
    }

    #[tokio::test]
    async fn events_are_emitted_on_writes() {
        let store = store();
        let mut rx = store.subscribe();

        let created = store.create_open(params("agent", "MintA", 100.0)).await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::TradeUpdate { position } => assert_eq!(position.id, created.id),
            other => panic!("expected trade update, got {:?}", other),
        }

        store.update_price(&created.id, 110.0).await.unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::PriceUpdate { mint, price } => {
                assert_eq!(mint, "MintA");
                assert_eq!(price, 110.0);
            }
            other => panic!("expected price update, got {:?}", other),
        }
    }
}
