//! Deterministic parameter-keyed cache for individual tool calls
//!
//! Keys are `tool:{tool_name}:{hash(tool_name, canonical(params))}`, so
//! logically equal parameter sets collide regardless of insertion order.

use super::keys::tool_key_hash;
use crate::config::EngineConfig;
use crate::models::{ttl_secs_ceil, TokenUsage, ToolCacheEntry};
use crate::store::{KeyValueStore, Namespace};
use chrono::Utc;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Tool categories with their own default TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFamily {
    Quote,
    Indicator,
    News,
    Filing,
}

lazy_static! {
    static ref FAMILY_TTLS: HashMap<ToolFamily, Duration> = {
        let mut m = HashMap::new();
        m.insert(ToolFamily::Quote, Duration::from_secs(60));
        m.insert(ToolFamily::Indicator, Duration::from_secs(300));
        m.insert(ToolFamily::News, Duration::from_secs(1800));
        m.insert(ToolFamily::Filing, Duration::from_secs(86_400));
        m
    };
}

// Checked in order; first keyword hit wins
const FAMILY_KEYWORDS: &[(ToolFamily, &[&str])] = &[
    (ToolFamily::Filing, &["filing", "fundamental", "10k", "10q", "earnings"]),
    (ToolFamily::News, &["sentiment", "news", "research"]),
    (ToolFamily::Quote, &["quote", "price_snapshot", "snapshot", "ticker"]),
    (ToolFamily::Indicator, &["indicator", "technical", "risk", "history", "volatility"]),
];

impl ToolFamily {
    pub fn classify(tool_name: &str) -> Option<Self> {
        let name = tool_name.to_lowercase();
        FAMILY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| name.contains(k)))
            .map(|(family, _)| *family)
    }

    pub fn default_ttl(&self) -> Duration {
        FAMILY_TTLS
            .get(self)
            .copied()
            .unwrap_or(Duration::from_secs(300))
    }
}

/// Per-tool observability counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
}

impl ToolCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct ToolCache {
    store: Arc<dyn KeyValueStore>,
    default_ttl: Duration,
    stats: RwLock<HashMap<String, ToolCacheStats>>,
}

impl ToolCache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            default_ttl: config.tool_default_ttl,
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn composite_key(tool_name: &str, parameters: &Value) -> String {
        Namespace::Tool.key(&format!(
            "{}:{}",
            tool_name.trim(),
            tool_key_hash(tool_name, parameters)
        ))
    }

    /// Explicit > tool family > global default
    pub fn resolve_ttl(&self, tool_name: &str, explicit: Option<Duration>) -> Duration {
        explicit
            .or_else(|| ToolFamily::classify(tool_name).map(|f| f.default_ttl()))
            .unwrap_or(self.default_ttl)
    }

    pub async fn get(&self, tool_name: &str, parameters: &Value) -> Option<Value> {
        self.get_entry(tool_name, parameters)
            .await
            .map(|entry| entry.value)
    }

    /// Full entry lookup; a hit bumps `hit_count` on the stored entry
    pub async fn get_entry(&self, tool_name: &str, parameters: &Value) -> Option<ToolCacheEntry> {
        let key = Self::composite_key(tool_name, parameters);

        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(tool = tool_name, error = %e, "Tool cache unavailable, treating as miss");
                self.bump(tool_name, |s| {
                    s.errors += 1;
                    s.misses += 1;
                })
                .await;
                return None;
            }
        };

        let entry = raw.and_then(|value| match serde_json::from_value::<ToolCacheEntry>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(tool = tool_name, error = %e, "Corrupt tool cache entry");
                None
            }
        });

        let Some(mut entry) = entry.filter(|e| !e.is_expired()) else {
            self.bump(tool_name, |s| s.misses += 1).await;
            debug!(tool = tool_name, "Tool cache miss");
            return None;
        };

        entry.hit_count += 1;
        self.bump(tool_name, |s| s.hits += 1).await;
        debug!(tool = tool_name, hit_count = entry.hit_count, "Tool cache hit");

        if let Some(remaining) = entry.remaining_ttl() {
            if let Ok(value) = serde_json::to_value(&entry) {
                if let Err(e) = self.store.set(&key, value, Some(remaining)).await {
                    warn!(tool = tool_name, error = %e, "Failed to persist tool hit count");
                }
            }
        }

        Some(entry)
    }

    pub async fn set(
        &self,
        tool_name: &str,
        parameters: &Value,
        value: Value,
        ttl: Option<Duration>,
    ) {
        self.set_with_cost(tool_name, parameters, value, TokenUsage::default(), 0.0, ttl)
            .await
    }

    /// Store a computed value together with what it cost to produce
    pub async fn set_with_cost(
        &self,
        tool_name: &str,
        parameters: &Value,
        value: Value,
        usage: TokenUsage,
        cost: f64,
        ttl: Option<Duration>,
    ) {
        let key = Self::composite_key(tool_name, parameters);
        let ttl = self.resolve_ttl(tool_name, ttl);

        let entry = ToolCacheEntry {
            composite_key: key.clone(),
            tool_name: tool_name.to_string(),
            value,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost,
            created_at: Utc::now(),
            ttl_secs: ttl_secs_ceil(ttl),
            hit_count: 0,
        };

        let value = match serde_json::to_value(&entry) {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = tool_name, error = %e, "Failed to serialize tool cache entry");
                return;
            }
        };

        match self.store.set(&key, value, Some(ttl)).await {
            Ok(()) => {
                self.bump(tool_name, |s| s.writes += 1).await;
                debug!(tool = tool_name, ttl_secs = ttl.as_secs(), "Tool result cached");
            }
            Err(e) => {
                self.bump(tool_name, |s| s.errors += 1).await;
                warn!(tool = tool_name, error = %e, "Tool cache write failed");
            }
        }
    }

    pub async fn invalidate(&self, tool_name: &str, parameters: &Value) -> bool {
        let key = Self::composite_key(tool_name, parameters);
        match self.store.delete(&key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(tool = tool_name, error = %e, "Tool cache invalidation failed");
                false
            }
        }
    }

    /// Glob within the tool namespace, e.g. `price_snapshot:*`
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let pattern = if pattern.starts_with(Namespace::Tool.prefix()) {
            pattern.to_string()
        } else {
            Namespace::Tool.key(pattern)
        };

        match self.store.delete_pattern(&pattern).await {
            Ok(removed) => {
                debug!(pattern = %pattern, removed, "Tool cache pattern invalidation");
                removed
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Tool cache pattern invalidation failed");
                0
            }
        }
    }

    pub async fn invalidate_tool(&self, tool_name: &str) -> usize {
        self.invalidate_pattern(&format!("{}:*", tool_name.trim()))
            .await
    }

    pub async fn stats(&self) -> HashMap<String, ToolCacheStats> {
        self.stats.read().await.clone()
    }

    pub async fn stats_for(&self, tool_name: &str) -> ToolCacheStats {
        self.stats
            .read()
            .await
            .get(tool_name)
            .cloned()
            .unwrap_or_default()
    }

    async fn bump(&self, tool_name: &str, update: impl FnOnce(&mut ToolCacheStats)) {
        let mut stats = self.stats.write().await;
        update(stats.entry(tool_name.to_string()).or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::UnavailableStore;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn cache() -> ToolCache {
        ToolCache::new(Arc::new(InMemoryStore::new()), &EngineConfig::default())
    }

    #[tokio::test]
    async fn test_get_after_set_ignores_parameter_order() {
        let cache = cache();
        let a: Value = serde_json::from_str(r#"{"symbol":"AAPL","period":"1y"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"period":"1y","symbol":"AAPL"}"#).unwrap();

        cache.set("price_history", &a, json!([1, 2, 3]), None).await;
        assert_eq!(cache.get("price_history", &b).await, Some(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let cache = cache();
        let params = json!({"symbol": "AAPL"});
        cache
            .set("price_snapshot", &params, json!({"price": 190.0}), Some(Duration::from_secs(1)))
            .await;
        assert!(cache.get("price_snapshot", &params).await.is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.get("price_snapshot", &params).await.is_none());
    }

    #[tokio::test]
    async fn test_sub_second_ttl_is_still_a_hit() {
        let cache = cache();
        let params = json!({"symbol": "AAPL"});
        cache
            .set("price_snapshot", &params, json!(1), Some(Duration::from_millis(300)))
            .await;

        let entry = cache.get_entry("price_snapshot", &params).await.unwrap();
        assert_eq!(entry.ttl_secs, 1);
        assert!(cache.get("price_snapshot", &params).await.is_some());
    }

    #[tokio::test]
    async fn test_ttl_resolution_order() {
        let cache = cache();
        assert_eq!(
            cache.resolve_ttl("price_snapshot", Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(cache.resolve_ttl("price_snapshot", None), Duration::from_secs(60));
        assert_eq!(cache.resolve_ttl("sentiment", None), Duration::from_secs(1800));
        assert_eq!(cache.resolve_ttl("fundamentals", None), Duration::from_secs(86_400));
        assert_eq!(cache.resolve_ttl("risk_metrics", None), Duration::from_secs(300));
        assert_eq!(cache.resolve_ttl("triage", None), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_hit_and_miss_counters() {
        let cache = cache();
        let params = json!({"symbol": "MSFT"});

        assert!(cache.get("sentiment", &params).await.is_none());
        cache.set("sentiment", &params, json!("bullish"), None).await;
        cache.get("sentiment", &params).await;
        let entry = cache.get_entry("sentiment", &params).await.unwrap();

        assert_eq!(entry.hit_count, 2);
        let stats = cache.stats_for("sentiment").await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalidate_and_pattern() {
        let cache = cache();
        cache.set("price_snapshot", &json!({"symbol": "AAPL"}), json!(1), None).await;
        cache.set("price_snapshot", &json!({"symbol": "MSFT"}), json!(2), None).await;
        cache.set("sentiment", &json!({"symbol": "AAPL"}), json!(3), None).await;

        assert!(cache.invalidate("price_snapshot", &json!({"symbol": "AAPL"})).await);
        assert!(cache.get("price_snapshot", &json!({"symbol": "AAPL"})).await.is_none());

        assert_eq!(cache.invalidate_pattern("price_snapshot:*").await, 1);
        assert!(cache.get("sentiment", &json!({"symbol": "AAPL"})).await.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_store_never_fails_caller() {
        let cache = ToolCache::new(Arc::new(UnavailableStore), &EngineConfig::default());
        let params = json!({"symbol": "AAPL"});

        cache.set("price_snapshot", &params, json!(1), None).await;
        assert!(cache.get("price_snapshot", &params).await.is_none());
        assert_eq!(cache.invalidate_pattern("*").await, 0);

        let stats = cache.stats_for("price_snapshot").await;
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_family_classification() {
        assert_eq!(ToolFamily::classify("price_snapshot"), Some(ToolFamily::Quote));
        assert_eq!(ToolFamily::classify("news_research"), Some(ToolFamily::News));
        assert_eq!(ToolFamily::classify("price_history"), Some(ToolFamily::Indicator));
        assert_eq!(ToolFamily::classify("synthesis"), None);
    }
}
