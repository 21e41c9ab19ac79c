//! Read-model cache trait and implementations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::StudentId;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};

/// Read-model views cached per student.
pub const STUDENT_VIEWS: [&str; 4] = ["purchases", "allocations", "sessions", "dashboard"];

/// Cache keys of every read-model view of a student.
pub fn student_keys(student_id: StudentId) -> Vec<String> {
    STUDENT_VIEWS
        .iter()
        .map(|view| format!("student:{student_id}:{view}"))
        .collect()
}

/// A cache that read models are served from. Never authoritative.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Removes a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryCacheState {
    entries: HashMap<String, String>,
    deleted: HashSet<String>,
    failing_deletes: usize,
}

/// In-memory cache for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCacheStore {
    state: Arc<RwLock<InMemoryCacheState>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.write().await.entries.insert(key.into(), value.into());
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.read().await.entries.contains_key(key)
    }

    /// Returns true if `delete` was ever called for the key.
    pub async fn was_deleted(&self, key: &str) -> bool {
        self.state.read().await.deleted.contains(key)
    }

    /// Makes the next `count` deletes fail.
    pub async fn fail_deletes(&self, count: usize) {
        self.state.write().await.failing_deletes = count;
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(PipelineError::Cache("cache unavailable".to_string()));
        }
        state.entries.remove(key);
        state.deleted.insert(key.to_string());
        Ok(())
    }
}

/// Redis-backed cache.
///
/// `ConnectionManager` reconnects on its own, so one instance is shared by
/// all invalidations.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn_manager: ConnectionManager,
}

impl RedisCacheStore {
    /// Connects to Redis at `redis_url` (e.g. "redis://127.0.0.1:6379").
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| PipelineError::Cache(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            PipelineError::Cache(format!("Failed to create Redis connection manager: {e}"))
        })?;

        Ok(Self { conn_manager })
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| PipelineError::Cache(format!("Failed to delete {key}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cover_every_view() {
        let student_id = StudentId::new();
        let keys = student_keys(student_id);
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], format!("student:{student_id}:purchases"));
        assert!(keys.iter().any(|k| k.ends_with(":dashboard")));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = InMemoryCacheStore::new();
        cache.set("student:1:sessions", "[]").await;

        cache.delete("student:1:sessions").await.unwrap();
        assert!(!cache.contains("student:1:sessions").await);
        assert!(cache.was_deleted("student:1:sessions").await);

        // Missing keys are fine.
        cache.delete("student:1:purchases").await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures() {
        let cache = InMemoryCacheStore::new();
        cache.fail_deletes(1).await;
        assert!(cache.delete("k").await.is_err());
        assert!(cache.delete("k").await.is_ok());
    }
}
