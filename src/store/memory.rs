//! In-memory store backend.
//!
//! The default backend for paper trading and tests. Entries expire lazily
//! on read; `cleanup` sweeps the whole map for long-running processes.
//! Faithful to the shared contract including the container-type mismatch:
//! string operations against a set (or the reverse) fail with
//! [`StoreError::WrongType`] exactly like the production backend does.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::kv::{KeyValueStore, StoreError, StoreOp};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process [`KeyValueStore`].
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries to bound memory growth.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| !entry.is_expired(now));
    }

    /// Live entry count, for stats surfaces.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_op(
        entries: &mut HashMap<String, Entry>,
        op: StoreOp,
        now: Instant,
    ) -> Result<(), StoreError> {
        match op {
            StoreOp::Set { key, value, ttl } => {
                entries.insert(
                    key,
                    Entry {
                        value: Value::Text(value),
                        expires_at: ttl.map(|t| now + t),
                    },
                );
            }
            StoreOp::Delete { key } => {
                entries.remove(&key);
            }
            StoreOp::SetAdd { key, member, ttl } => {
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                });
                if entry.is_expired(now) {
                    entry.value = Value::Set(HashSet::new());
                    entry.expires_at = None;
                }
                match &mut entry.value {
                    Value::Set(set) => {
                        set.insert(member);
                    }
                    Value::Text(_) => return Err(StoreError::WrongType(key)),
                }
                if let Some(ttl) = ttl {
                    entry.expires_at = Some(now + ttl);
                }
            }
            StoreOp::SetRemove { key, member } => {
                if let Some(entry) = entries.get_mut(&key) {
                    match &mut entry.value {
                        Value::Set(set) => {
                            set.remove(&member);
                        }
                        Value::Text(_) => return Err(StoreError::WrongType(key)),
                    }
                }
            }
            StoreOp::Expire { key, ttl } => {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.expires_at = Some(now + ttl);
                }
            }
        }
        Ok(())
    }

    /// Corrupt a key into the wrong container type. Test hook for the
    /// index-repair path.
    #[doc(hidden)]
    pub fn poison_as_text(&self, key: &str, value: &str) {
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: None,
            },
        );
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => Ok(None),
            Some(entry) => match &entry.value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Set(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        Self::write_op(
            &mut entries,
            StoreOp::Set {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
            now,
        )
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let live = entries
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false);
        if live {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        Self::write_op(
            &mut entries,
            StoreOp::Expire {
                key: key.to_string(),
                ttl,
            },
            now,
        )
    }

    async fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        Self::write_op(
            &mut entries,
            StoreOp::SetAdd {
                key: key.to_string(),
                member: member.to_string(),
                ttl,
            },
            now,
        )
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        Self::write_op(
            &mut entries,
            StoreOp::SetRemove {
                key: key.to_string(),
                member: member.to_string(),
            },
            now,
        )
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                Value::Text(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(Vec::new()),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => Ok(false),
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.contains(member)),
                Value::Text(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(false),
        }
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        let current = match entries.get(key) {
            Some(entry) if entry.is_expired(now) => 0,
            Some(entry) => match &entry.value {
                Value::Text(text) => text
                    .parse::<i64>()
                    .map_err(|_| StoreError::WrongType(key.to_string()))?,
                Value::Set(_) => return Err(StoreError::WrongType(key.to_string())),
            },
            None => 0,
        };

        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(next.to_string()),
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(next)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        // Validate container types first so the group commits whole or
        // not at all.
        for op in &ops {
            let key = match op {
                StoreOp::SetAdd { key, .. } | StoreOp::SetRemove { key, .. } => key,
                _ => continue,
            };
            if let Some(entry) = entries.get(key) {
                if !entry.is_expired(now) && matches!(entry.value, Value::Text(_)) {
                    return Err(StoreError::WrongType(key.clone()));
                }
            }
        }

        for op in ops {
            Self::write_op(&mut entries, op, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store
            .set("short", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.exists("short").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(!store.exists("short").await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_wins_only_once() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock", "a", None).await.unwrap());
        assert!(!store.set_nx("lock", "b", None).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn set_nx_succeeds_after_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("lock", "a", Some(Duration::from_millis(20)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_nx("lock", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn set_operations() {
        let store = MemoryStore::new();
        store.set_add("s", "a", None).await.unwrap();
        store.set_add("s", "b", None).await.unwrap();
        assert!(store.set_contains("s", "a").await.unwrap());

        let mut members = store.set_members("s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);

        store.set_remove("s", "a").await.unwrap();
        assert!(!store.set_contains("s", "a").await.unwrap());
    }

    #[tokio::test]
    async fn wrong_container_type_is_reported() {
        let store = MemoryStore::new();
        store.set("k", "text", None).await.unwrap();

        let err = store.set_add("k", "member", None).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(key) if key == "k"));

        store.set_add("s", "member", None).await.unwrap();
        let err = store.get("s").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
    }

    #[tokio::test]
    async fn increment_refreshes_ttl() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("c", None).await.unwrap(), 1);
        assert_eq!(store.increment("c", None).await.unwrap(), 2);
        assert_eq!(store.increment("c", None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn apply_commits_as_a_group() {
        let store = MemoryStore::new();
        store
            .apply(vec![
                StoreOp::Set {
                    key: "a".to_string(),
                    value: "1".to_string(),
                    ttl: None,
                },
                StoreOp::SetAdd {
                    key: "s".to_string(),
                    member: "m".to_string(),
                    ttl: None,
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.set_contains("s", "m").await.unwrap());
    }

    #[tokio::test]
    async fn apply_rejects_group_on_type_mismatch() {
        let store = MemoryStore::new();
        store.set("s", "text", None).await.unwrap();

        let err = store
            .apply(vec![
                StoreOp::Set {
                    key: "a".to_string(),
                    value: "1".to_string(),
                    ttl: None,
                },
                StoreOp::SetAdd {
                    key: "s".to_string(),
                    member: "m".to_string(),
                    ttl: None,
                },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::WrongType(_)));
        // First op must not have been applied.
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cleanup_drops_expired_entries() {
        let store = MemoryStore::new();
        store
            .set("a", "1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.set("b", "2", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        store.cleanup();
        assert_eq!(store.len(), 1);
    }
}
