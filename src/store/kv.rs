//! Key/value store abstraction.
//!
//! Everything the engine shares across workers (positions, price cache,
//! coordination state) lives behind this trait: TTL'd string entries,
//! TTL'd sets, an atomic set-if-absent for locks, and a grouped pipeline
//! so multi-key writes commit without partial visibility.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store operation failed: {0}")]
    Operation(String),
    #[error("wrong container type at key {0}")]
    WrongType(String),
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Connection and transient operation failures are retryable; a type
    /// mismatch or a bad payload will not fix itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Operation(_))
    }
}

/// One write in a grouped pipeline.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    SetAdd {
        key: String,
        member: String,
        ttl: Option<Duration>,
    },
    SetRemove {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Shared key/value store with TTLs, sets and a pipeline primitive.
///
/// Every method is individually atomic. `apply` commits all operations as
/// one group: concurrent readers see either none or all of them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set only when the key does not exist. Returns true when the write
    /// won; this is the distributed-lock primitive.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Increment a counter, refreshing its TTL on every write.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError>;

    /// Commit a group of writes without partial visibility.
    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;
}
