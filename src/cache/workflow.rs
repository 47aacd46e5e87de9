//! Memoized outcomes of whole workflow runs
//!
//! Keyed by `workflow:outcome:{workflow_id}:{hash(normalized key payload)}`.

use super::keys::{hash_value, normalize_key_payload};
use crate::config::EngineConfig;
use crate::models::{ttl_secs_ceil, WorkflowOutcome};
use crate::store::{KeyValueStore, Namespace};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Optional parts of a stored outcome
#[derive(Debug, Clone, Default)]
pub struct OutcomeExtras {
    pub synthesis: Option<String>,
    pub final_answer: Option<String>,
    pub metadata: Option<Value>,
    pub ttl: Option<Duration>,
}

pub struct WorkflowOutcomeStore {
    store: Arc<dyn KeyValueStore>,
    default_ttl: Duration,
}

impl WorkflowOutcomeStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            default_ttl: config.workflow_outcome_ttl,
        }
    }

    pub fn key_hash(key_payload: &Value) -> String {
        hash_value(&normalize_key_payload(key_payload))
    }

    fn key(workflow_id: &str, key_hash: &str) -> String {
        Namespace::WorkflowOutcome.key(&format!("{}:{}", workflow_id, key_hash))
    }

    pub async fn fetch(&self, workflow_id: &str, key_payload: &Value) -> Option<WorkflowOutcome> {
        let key = Self::key(workflow_id, &Self::key_hash(key_payload));

        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(workflow_id, error = %e, "Outcome store unavailable, treating as miss");
                return None;
            }
        };

        match serde_json::from_value::<WorkflowOutcome>(raw) {
            Ok(outcome) if !outcome.is_expired() => {
                debug!(workflow_id, "Workflow outcome hit");
                Some(outcome)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(workflow_id, error = %e, "Corrupt workflow outcome");
                None
            }
        }
    }

    /// Last write wins; failures are logged and swallowed
    pub async fn store(
        &self,
        workflow_id: &str,
        key_payload: &Value,
        result: Value,
        extras: OutcomeExtras,
    ) -> Option<WorkflowOutcome> {
        let key_hash = Self::key_hash(key_payload);
        let ttl = extras.ttl.unwrap_or(self.default_ttl);

        let outcome = WorkflowOutcome {
            workflow_id: workflow_id.to_string(),
            key_hash: key_hash.clone(),
            result,
            synthesis: extras.synthesis,
            final_answer: extras.final_answer,
            metadata: extras.metadata.unwrap_or(Value::Null),
            created_at: Utc::now(),
            ttl_secs: ttl_secs_ceil(ttl),
        };

        let value = match serde_json::to_value(&outcome) {
            Ok(value) => value,
            Err(e) => {
                warn!(workflow_id, error = %e, "Failed to serialize workflow outcome");
                return None;
            }
        };

        match self
            .store
            .set(&Self::key(workflow_id, &key_hash), value, Some(ttl))
            .await
        {
            Ok(()) => {
                info!(workflow_id, ttl_secs = ttl.as_secs(), "Workflow outcome stored");
                Some(outcome)
            }
            Err(e) => {
                warn!(workflow_id, error = %e, "Workflow outcome write failed");
                None
            }
        }
    }

    pub async fn invalidate(&self, workflow_id: &str, key_payload: &Value) -> bool {
        let key = Self::key(workflow_id, &Self::key_hash(key_payload));
        self.store.delete(&key).await.unwrap_or_else(|e| {
            warn!(workflow_id, error = %e, "Workflow outcome invalidation failed");
            false
        })
    }

    /// Clear one workflow's outcomes, or all of them
    pub async fn clear(&self, workflow_id: Option<&str>) -> usize {
        let pattern = match workflow_id {
            Some(id) => Namespace::WorkflowOutcome.key(&format!("{}:*", id)),
            None => Namespace::WorkflowOutcome.pattern(),
        };

        self.store.delete_pattern(&pattern).await.unwrap_or_else(|e| {
            warn!(pattern = %pattern, error = %e, "Workflow outcome clear failed");
            0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::UnavailableStore;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn outcomes() -> WorkflowOutcomeStore {
        WorkflowOutcomeStore::new(Arc::new(InMemoryStore::new()), &EngineConfig::default())
    }

    #[tokio::test]
    async fn test_normalized_payloads_share_an_entry() {
        let store = outcomes();
        store
            .store(
                "research",
                &json!({"query": "Compare AAPL and MSFT", "tickers": ["msft", "aapl"]}),
                json!({"summary": "both fine"}),
                OutcomeExtras {
                    final_answer: Some("Both look fine.".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = store
            .fetch(
                "research",
                &json!({"tickers": ["AAPL", "MSFT"], "query": "  compare aapl   and msft "}),
            )
            .await
            .unwrap();
        assert_eq!(outcome.final_answer.as_deref(), Some("Both look fine."));
        assert_eq!(outcome.ttl_secs, 900);
    }

    #[tokio::test]
    async fn test_workflow_id_scopes_entries() {
        let store = outcomes();
        let payload = json!({"ticker": "AAPL"});
        store.store("quote", &payload, json!(1), OutcomeExtras::default()).await;
        assert!(store.fetch("equity_analysis", &payload).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let store = outcomes();
        store.store("quote", &json!({"ticker": "AAPL"}), json!(1), OutcomeExtras::default()).await;
        store.store("quote", &json!({"ticker": "MSFT"}), json!(2), OutcomeExtras::default()).await;
        store
            .store("research", &json!({"query": "x", "tickers": []}), json!(3), OutcomeExtras::default())
            .await;

        assert!(store.invalidate("quote", &json!({"ticker": "aapl"})).await);
        assert_eq!(store.clear(Some("quote")).await, 1);
        assert!(store.fetch("research", &json!({"query": "x", "tickers": []})).await.is_some());
        assert_eq!(store.clear(None).await, 1);
    }

    #[tokio::test]
    async fn test_explicit_ttl_expires() {
        let store = outcomes();
        let payload = json!({"ticker": "AAPL"});
        store
            .store(
                "quote",
                &payload,
                json!(1),
                OutcomeExtras {
                    ttl: Some(Duration::from_secs(1)),
                    ..Default::default()
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.fetch("quote", &payload).await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_is_a_miss() {
        let store = WorkflowOutcomeStore::new(Arc::new(UnavailableStore), &EngineConfig::default());
        let payload = json!({"ticker": "AAPL"});
        assert!(store.store("quote", &payload, json!(1), OutcomeExtras::default()).await.is_none());
        assert!(store.fetch("quote", &payload).await.is_none());
        assert_eq!(store.clear(None).await, 0);
    }
}
