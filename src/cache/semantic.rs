//! Embedding-similarity cache for whole-request responses
//!
//! Top-1 nearest neighbour over stored request embeddings; a hit needs
//! `similarity >= threshold`. Store failures degrade to a miss.

use super::keys::content_hash;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ttl_secs_ceil, CacheEntry};
use crate::store::{KeyValueStore, Namespace};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a semantic lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticLookup {
    pub hit: bool,
    pub response: Option<Value>,
    /// Best similarity observed, also reported on a miss
    pub similarity: f32,
    pub matched_text: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl SemanticLookup {
    fn miss(similarity: f32, matched_text: Option<String>) -> Self {
        Self {
            hit: false,
            response: None,
            similarity,
            matched_text,
            metadata: Value::Null,
        }
    }
}

pub struct SemanticCache {
    store: Arc<dyn KeyValueStore>,
    threshold: f32,
    dimension: usize,
    ttl: Duration,
}

impl SemanticCache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            threshold: config.similarity_threshold,
            dimension: config.embedding_dimension,
            ttl: config.semantic_ttl,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(EngineError::Configuration(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        Ok(())
    }

    pub async fn get(&self, request_text: &str, embedding: &[f32]) -> Result<SemanticLookup> {
        self.check_dimension(embedding)?;

        let prefix = Namespace::Semantic.prefix();
        let best = match self.store.nearest(prefix, embedding, 1).await {
            Ok(mut matches) => matches.pop(),
            Err(e) => {
                warn!(error = %e, "Semantic cache unavailable, treating as miss");
                return Ok(SemanticLookup::miss(0.0, None));
            }
        };

        let Some(best) = best else {
            return Ok(SemanticLookup::miss(0.0, None));
        };

        let similarity = best.similarity();
        let mut entry: CacheEntry = match serde_json::from_value(best.value) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %best.key, error = %e, "Corrupt semantic entry, treating as miss");
                return Ok(SemanticLookup::miss(0.0, None));
            }
        };

        if entry.is_expired() {
            return Ok(SemanticLookup::miss(0.0, None));
        }

        if similarity < self.threshold {
            debug!(
                similarity,
                threshold = self.threshold,
                matched = %entry.original_request_text,
                "Semantic near miss"
            );
            return Ok(SemanticLookup::miss(
                similarity,
                Some(entry.original_request_text),
            ));
        }

        entry.usage_count += 1;
        debug!(
            request = request_text,
            matched = %entry.original_request_text,
            similarity,
            usage_count = entry.usage_count,
            "Semantic cache hit"
        );

        // Preserve the original expiry on write-back
        if let Some(remaining) = entry.remaining_ttl() {
            match serde_json::to_value(&entry) {
                Ok(value) => {
                    if let Err(e) = self
                        .store
                        .upsert_vector(&entry.key, entry.embedding_vector.clone(), value, Some(remaining))
                        .await
                    {
                        warn!(error = %e, "Failed to persist semantic usage count");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize semantic entry"),
            }
        }

        Ok(SemanticLookup {
            hit: true,
            response: Some(entry.payload),
            similarity,
            matched_text: Some(entry.original_request_text),
            metadata: entry.metadata,
        })
    }

    /// Idempotent per request text: a repeat overwrites the prior entry
    pub async fn set(
        &self,
        request_text: &str,
        embedding: Vec<f32>,
        response: Value,
        metadata: Value,
    ) -> Result<()> {
        self.check_dimension(&embedding)?;

        let key = Namespace::Semantic.key(&content_hash(request_text));
        let entry = CacheEntry {
            key: key.clone(),
            embedding_vector: embedding.clone(),
            original_request_text: request_text.trim().to_string(),
            payload: response,
            metadata,
            created_at: Utc::now(),
            ttl_secs: ttl_secs_ceil(self.ttl),
            usage_count: 0,
        };

        let value = serde_json::to_value(&entry)?;
        if let Err(e) = self
            .store
            .upsert_vector(&key, embedding, value, Some(self.ttl))
            .await
        {
            warn!(error = %e, "Semantic cache write failed");
        }

        Ok(())
    }

    pub async fn invalidate(&self, request_text: &str) -> bool {
        let key = Namespace::Semantic.key(&content_hash(request_text));
        match self.store.delete(&key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Semantic invalidation failed");
                false
            }
        }
    }

    pub async fn clear(&self) -> usize {
        match self.store.delete_pattern(&Namespace::Semantic.pattern()).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Semantic clear failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::UnavailableStore;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn cache_with(store: Arc<dyn KeyValueStore>) -> SemanticCache {
        let config = EngineConfig::default().with_embedding_dimension(3);
        SemanticCache::new(store, &config)
    }

    #[tokio::test]
    async fn test_empty_store_is_a_miss() {
        let cache = cache_with(Arc::new(InMemoryStore::new()));
        let lookup = cache.get("price of AAPL", &[1.0, 0.0, 0.0]).await.unwrap();
        assert!(!lookup.hit);
        assert_eq!(lookup.similarity, 0.0);
    }

    #[tokio::test]
    async fn test_similar_request_generalizes() {
        let cache = cache_with(Arc::new(InMemoryStore::new()));
        cache
            .set("price of AAPL", vec![1.0, 0.0, 0.0], json!({"price": 190.1}), json!({}))
            .await
            .unwrap();

        // cos ≈ 0.995
        let lookup = cache
            .get("what's AAPL trading at", &[0.995, 0.0999, 0.0])
            .await
            .unwrap();
        assert!(lookup.hit);
        assert_eq!(lookup.response, Some(json!({"price": 190.1})));
        assert_eq!(lookup.matched_text.as_deref(), Some("price of AAPL"));
    }

    #[tokio::test]
    async fn test_below_threshold_reports_similarity() {
        let cache = cache_with(Arc::new(InMemoryStore::new()));
        cache
            .set("price of AAPL", vec![1.0, 0.0, 0.0], json!("cached"), json!({}))
            .await
            .unwrap();

        let lookup = cache.get("other", &[0.8, 0.6, 0.0]).await.unwrap();
        assert!(!lookup.hit);
        assert!(lookup.response.is_none());
        assert!((lookup.similarity - 0.8).abs() < 1e-4);
        assert_eq!(lookup.matched_text.as_deref(), Some("price of AAPL"));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_configuration_error() {
        let cache = cache_with(Arc::new(InMemoryStore::new()));
        let err = cache.get("q", &[1.0, 0.0]).await.unwrap_err();
        assert!(err.is_fatal());

        let err = cache
            .set("q", vec![1.0; 4], json!(1), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_duplicate_set_overwrites() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_with(store.clone());
        cache.set("price of AAPL", vec![1.0, 0.0, 0.0], json!(1), json!({})).await.unwrap();
        cache.set("price of AAPL", vec![1.0, 0.0, 0.0], json!(2), json!({})).await.unwrap();

        assert_eq!(store.len().await, 1);
        let lookup = cache.get("price of AAPL", &[1.0, 0.0, 0.0]).await.unwrap();
        assert_eq!(lookup.response, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_usage_count_increments_on_hit() {
        let store = Arc::new(InMemoryStore::new());
        let cache = cache_with(store.clone());
        cache.set("price of AAPL", vec![0.0, 1.0, 0.0], json!(1), json!({})).await.unwrap();

        cache.get("price of AAPL", &[0.0, 1.0, 0.0]).await.unwrap();
        cache.get("price of AAPL", &[0.0, 1.0, 0.0]).await.unwrap();

        let key = Namespace::Semantic.key(&content_hash("price of AAPL"));
        let raw = store.get(&key).await.unwrap().unwrap();
        let entry: CacheEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(entry.usage_count, 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades_to_miss() {
        let cache = cache_with(Arc::new(UnavailableStore));
        let lookup = cache.get("q", &[1.0, 0.0, 0.0]).await.unwrap();
        assert!(!lookup.hit);

        // Writes are swallowed
        assert!(cache.set("q", vec![1.0, 0.0, 0.0], json!(1), json!({})).await.is_ok());
    }
}
