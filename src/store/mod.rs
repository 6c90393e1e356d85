//! Store layer - shared mutable state behind a key/value abstraction.
//!
//! `MemoryStore` backs paper trading and tests; `RedisStore` is the
//! production backend (`store.url` in the config). `PositionStore`,
//! `PriceCache` and `EngineState` are the typed surfaces the engine
//! workers use.

pub mod kv;
pub mod memory;
pub mod positions;
pub mod prices;
pub mod redis;
pub mod state;

pub use kv::{KeyValueStore, StoreError, StoreOp};
pub use memory::MemoryStore;
pub use positions::{PositionQuery, PositionStats, PositionStore};
pub use prices::PriceCache;
pub use redis::RedisStore;
pub use state::{EngineState, MAX_PREDICTION_RETRIES};
