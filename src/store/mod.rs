//! External key-value / vector store
//!
//! The engine issues single-key or single-query operations only.
//! Entries are namespaced by cache layer; each namespace can be cleared
//! by pattern independently.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Result of a nearest-neighbour query
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub key: String,
    /// Cosine distance (`1 - cosine similarity`); smaller is closer
    pub distance: f32,
    pub value: Value,
}

impl VectorMatch {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// `ttl = None` stores without expiry
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Glob-style enumeration (`*` and `?`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys(pattern).await? {
            if self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn upsert_vector(
        &self,
        key: &str,
        embedding: Vec<f32>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Top-k nearest stored vectors among keys starting with `prefix`
    async fn nearest(
        &self,
        prefix: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>>;
}

//
// ================= Namespaces =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Semantic,
    Tool,
    WorkflowOutcome,
    Route,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [
        Namespace::Semantic,
        Namespace::Tool,
        Namespace::WorkflowOutcome,
        Namespace::Route,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Semantic => "semantic:",
            Namespace::Tool => "tool:",
            Namespace::WorkflowOutcome => "workflow:outcome:",
            Namespace::Route => "route:",
        }
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix(), suffix)
    }

    pub fn pattern(&self) -> String {
        format!("{}*", self.prefix())
    }

    pub fn default_ttl(&self, config: &EngineConfig) -> Option<Duration> {
        match self {
            Namespace::Semantic => Some(config.semantic_ttl),
            Namespace::Tool => Some(config.tool_default_ttl),
            Namespace::WorkflowOutcome => Some(config.workflow_outcome_ttl),
            Namespace::Route => config.route_ttl,
        }
    }
}

impl FromStr for Namespace {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "semantic" => Ok(Namespace::Semantic),
            "tool" => Ok(Namespace::Tool),
            "workflow" | "workflow_outcome" | "workflow-outcome" => {
                Ok(Namespace::WorkflowOutcome)
            }
            "route" | "routes" => Ok(Namespace::Route),
            other => Err(EngineError::Configuration(format!(
                "unknown cache namespace '{}'",
                other
            ))),
        }
    }
}

/// Operator-facing bulk invalidation of one namespace
pub async fn clear_namespace(store: &dyn KeyValueStore, namespace: Namespace) -> Result<usize> {
    store.delete_pattern(&namespace.pattern()).await
}

/// Wildcard match supporting `*` (any run) and `?` (one char)
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(star_pos) = star {
            pi = star_pos + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }

    pi == p.len()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Store whose every operation fails, for degrade-to-miss tests
    pub struct UnavailableStore;

    fn down<T>() -> Result<T> {
        Err(EngineError::Store("connection refused".to_string()))
    }

    #[async_trait]
    impl KeyValueStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<Value>> {
            down()
        }

        async fn set(&self, _key: &str, _value: Value, _ttl: Option<Duration>) -> Result<()> {
            down()
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            down()
        }

        async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
            down()
        }

        async fn upsert_vector(
            &self,
            _key: &str,
            _embedding: Vec<f32>,
            _value: Value,
            _ttl: Option<Duration>,
        ) -> Result<()> {
            down()
        }

        async fn nearest(
            &self,
            _prefix: &str,
            _embedding: &[f32],
            _top_k: usize,
        ) -> Result<Vec<VectorMatch>> {
            down()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("tool:*", "tool:price_snapshot:abc"));
        assert!(glob_match("tool:price_*:*", "tool:price_snapshot:abc"));
        assert!(!glob_match("tool:sentiment:*", "tool:price_snapshot:abc"));
        assert!(glob_match("route:?", "route:a"));
        assert!(!glob_match("route:?", "route:ab"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn test_namespace_parsing_and_prefixes() {
        assert_eq!("workflow".parse::<Namespace>().unwrap(), Namespace::WorkflowOutcome);
        assert_eq!(Namespace::WorkflowOutcome.pattern(), "workflow:outcome:*");
        assert!("bogus".parse::<Namespace>().is_err());
    }

    #[tokio::test]
    async fn test_clear_namespace_leaves_others() {
        let store = InMemoryStore::new();
        store.set("tool:a:1", Value::from(1), None).await.unwrap();
        store.set("tool:b:2", Value::from(2), None).await.unwrap();
        store.set("route:x", Value::from(3), None).await.unwrap();

        let removed = clear_namespace(&store, Namespace::Tool).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("route:x").await.unwrap().is_some());
    }
}
