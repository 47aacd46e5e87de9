//! In-memory store for development and tests
//!
//! Expiry is lazy: stale items are dropped when touched, and every
//! `sweep_every` writes a full sweep drops whatever was never read again.

use super::{glob_match, KeyValueStore, VectorMatch};
use crate::embedding::cosine_similarity;
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredItem {
    value: Value,
    embedding: Option<Vec<f32>>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredItem {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

const DEFAULT_SWEEP_EVERY: u64 = 64;

pub struct InMemoryStore {
    items: Arc<RwLock<HashMap<String, StoredItem>>>,
    writes: AtomicU64,
    sweep_every: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
            writes: AtomicU64::new(0),
            sweep_every: DEFAULT_SWEEP_EVERY,
        }
    }

    /// Sweep expired items every `writes` writes (minimum 1)
    pub fn with_sweep_interval(mut self, writes: u64) -> Self {
        self.sweep_every = writes.max(1);
        self
    }

    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.items
            .read()
            .await
            .values()
            .filter(|item| item.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired item
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| item.is_live(now));
        before - items.len()
    }

    /// Insert under the write lock, sweeping expired items when due
    async fn insert(&self, key: &str, item: StoredItem) {
        let mut items = self.items.write().await;
        items.insert(key.to_string(), item);

        let written = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if written % self.sweep_every == 0 {
            let now = Utc::now();
            let before = items.len();
            items.retain(|_, item| item.is_live(now));
            let swept = before - items.len();
            if swept > 0 {
                debug!(swept, remaining = items.len(), "Swept expired items");
            }
        }
    }

    #[cfg(test)]
    async fn raw_len(&self) -> usize {
        self.items.read().await.len()
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Utc::now();

        {
            let items = self.items.read().await;
            match items.get(key) {
                Some(item) if item.is_live(now) => return Ok(Some(item.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: evict
        let mut items = self.items.write().await;
        if items.get(key).is_some_and(|item| !item.is_live(now)) {
            items.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.insert(
            key,
            StoredItem {
                value,
                embedding: None,
                expires_at: Self::expiry(ttl),
            },
        )
        .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut items = self.items.write().await;
        Ok(items.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let items = self.items.read().await;

        let mut keys: Vec<String> = items
            .iter()
            .filter(|(key, item)| item.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();

        Ok(keys)
    }

    async fn upsert_vector(
        &self,
        key: &str,
        embedding: Vec<f32>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.insert(
            key,
            StoredItem {
                value,
                embedding: Some(embedding),
                expires_at: Self::expiry(ttl),
            },
        )
        .await;
        Ok(())
    }

    async fn nearest(
        &self,
        prefix: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let now = Utc::now();
        let items = self.items.read().await;

        let mut matches: Vec<VectorMatch> = items
            .iter()
            .filter(|(key, item)| key.starts_with(prefix) && item.is_live(now))
            .filter_map(|(key, item)| {
                let stored = item.embedding.as_ref()?;
                Some(VectorMatch {
                    key: key.clone(),
                    distance: 1.0 - cosine_similarity(embedding, stored),
                    value: item.value.clone(),
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryStore::new();
        store.set("tool:a", json!({"v": 1}), None).await.unwrap();
        assert_eq!(store.get("tool:a").await.unwrap(), Some(json!({"v": 1})));
        assert!(store.delete("tool:a").await.unwrap());
        assert!(store.get("tool:a").await.unwrap().is_none());
        assert!(!store.delete("tool:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("tool:a", json!(1), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(store.get("tool:a").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("tool:a").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_writes_sweep_unread_expired_items() {
        let store = InMemoryStore::new().with_sweep_interval(10);
        for i in 0..100 {
            store
                .set(&format!("tool:{}", i), json!(i), Some(Duration::from_millis(10)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.keys("tool:*").await.unwrap().is_empty());

        for i in 0..10 {
            store
                .upsert_vector(&format!("semantic:{}", i), vec![1.0, 0.0], json!(i), None)
                .await
                .unwrap();
        }
        assert_eq!(store.raw_len().await, 10);
        assert_eq!(store.len().await, 10);
    }

    #[tokio::test]
    async fn test_nearest_orders_by_distance_within_prefix() {
        let store = InMemoryStore::new();
        store
            .upsert_vector("semantic:a", vec![1.0, 0.0], json!("a"), None)
            .await
            .unwrap();
        store
            .upsert_vector("semantic:b", vec![0.7, 0.7], json!("b"), None)
            .await
            .unwrap();
        store
            .upsert_vector("route:c", vec![1.0, 0.0], json!("c"), None)
            .await
            .unwrap();

        let matches = store.nearest("semantic:", &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].key, "semantic:a");
        assert!((matches[0].similarity() - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let store = InMemoryStore::new();
        store.set("workflow:outcome:quote:1", json!(1), None).await.unwrap();
        store.set("workflow:outcome:research:2", json!(2), None).await.unwrap();

        let keys = store.keys("workflow:outcome:quote:*").await.unwrap();
        assert_eq!(keys, vec!["workflow:outcome:quote:1".to_string()]);
    }
}
