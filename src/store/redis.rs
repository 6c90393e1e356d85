//! Redis store backend.
//!
//! Production [`KeyValueStore`] over a multiplexed async connection. TTLs
//! map to PX/PEXPIRE, the set-if-absent lock to `SET NX`, and the grouped
//! pipeline to a MULTI/EXEC block.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::kv::{KeyValueStore, StoreError, StoreOp};

pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to `url` (`redis://...`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    fn map_err(key: &str, err: redis::RedisError) -> StoreError {
        let text = err.to_string();
        if text.contains("WRONGTYPE") {
            StoreError::WrongType(key.to_string())
        } else if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            StoreError::Connection(text)
        } else {
            StoreError::Operation(text)
        }
    }

    fn add_to_pipe(pipe: &mut redis::Pipeline, op: &StoreOp) {
        match op {
            StoreOp::Set { key, value, ttl } => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key).arg(value);
                if let Some(ttl) = ttl {
                    cmd.arg("PX").arg(ttl.as_millis() as u64);
                }
                pipe.add_command(cmd).ignore();
            }
            StoreOp::Delete { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
            StoreOp::SetAdd { key, member, ttl } => {
                pipe.cmd("SADD").arg(key).arg(member).ignore();
                if let Some(ttl) = ttl {
                    pipe.cmd("PEXPIRE")
                        .arg(key)
                        .arg(ttl.as_millis() as u64)
                        .ignore();
                }
            }
            StoreOp::SetRemove { key, member } => {
                pipe.cmd("SREM").arg(key).arg(member).ignore();
            }
            StoreOp::Expire { key, ttl } => {
                pipe.cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl.as_millis() as u64)
                    .ignore();
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = cmd
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let found: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(found > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        if let Some(ttl) = ttl {
            self.expire(key, ttl).await?;
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let found: i64 = redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(found > 0)
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let value: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        if let Some(ttl) = ttl {
            self.expire(key, ttl).await?;
        }
        Ok(value)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            Self::add_to_pipe(&mut pipe, op);
        }
        pipe.query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(|e| Self::map_err("pipeline", e))
    }
}
