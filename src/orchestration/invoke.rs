//! Single executor invocation: tool cache, timeout, token/cost accounting
//!
//! Invocations may run inside spawned tasks, so they never touch the
//! request's `MetricsCollector`. The owner records the returned outcome.

use crate::cache::ToolCache;
use crate::error::{EngineError, ErrorKind};
use crate::executors::TaskExecutor;
use crate::metrics::{estimate_tokens, CostModel, MetricsCollector};
use crate::models::{
    CacheLayer, EventStatus, EventType, ExecutionStatus, ResponseError, TaskResponse, TokenUsage,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub executor_name: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: ExecutionStatus,
    /// Present when the executor answered, including "no data" answers
    pub response: Option<TaskResponse>,
    pub error: Option<(ErrorKind, String)>,
    pub usage: TokenUsage,
    pub cost: f64,
    /// `Some(hit)` when the tool cache was consulted
    pub tool_cache_hit: Option<bool>,
    pub cache_lookup: Duration,
    pub cost_saved: f64,
    /// Never called because the request deadline had already passed
    pub deadline_skipped: bool,
}

impl InvocationOutcome {
    fn new(executor_name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            executor_name: executor_name.to_string(),
            started_at,
            duration: Duration::ZERO,
            status: ExecutionStatus::Success,
            response: None,
            error: None,
            usage: TokenUsage::default(),
            cost: 0.0,
            tool_cache_hit: None,
            cache_lookup: Duration::ZERO,
            cost_saved: 0.0,
            deadline_skipped: false,
        }
    }

    /// Outcome for a call that never started (unregistered, deadline passed)
    pub fn not_invoked(executor_name: &str, status: ExecutionStatus, kind: ErrorKind, message: String) -> Self {
        let mut outcome = Self::new(executor_name, Utc::now());
        outcome.status = status;
        outcome.error = Some((kind, message));
        outcome
    }

    pub fn deadline_exceeded(executor_name: &str) -> Self {
        let mut outcome = Self::not_invoked(
            executor_name,
            ExecutionStatus::Timeout,
            ErrorKind::Timeout,
            "request deadline exceeded before invocation".to_string(),
        );
        outcome.deadline_skipped = true;
        outcome
    }

    pub fn unregistered(executor_name: &str) -> Self {
        Self::not_invoked(
            executor_name,
            ExecutionStatus::Error,
            ErrorKind::ExecutorFailure,
            format!("executor '{}' is not registered", executor_name),
        )
    }

    /// Executor answered with a usable result
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
            && self.response.as_ref().is_some_and(|r| r.success)
    }

    pub fn cached(&self) -> bool {
        self.tool_cache_hit == Some(true)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|(_, message)| message.as_str())
    }

    /// Successful payload, or a structured fallback scoped to this executor
    pub fn payload(&self) -> Value {
        match &self.response {
            Some(response) if self.succeeded() => response.payload.clone(),
            _ => json!({
                "success": false,
                "executor": self.executor_name,
                "error": self.error_message().unwrap_or("unknown error"),
            }),
        }
    }

    /// Text handed to downstream executors; a placeholder on failure
    pub fn narrative(&self) -> String {
        match &self.response {
            Some(response) if self.succeeded() => response.narrative(),
            _ => format!(
                "{} unavailable ({})",
                self.executor_name,
                self.error_message().unwrap_or("unknown error")
            ),
        }
    }

    pub fn response_error(&self) -> Option<ResponseError> {
        self.error.as_ref().map(|(kind, message)| ResponseError {
            executor: Some(self.executor_name.clone()),
            kind: *kind,
            message: message.clone(),
        })
    }

    /// Fan-in: the owning request records timing, cost and cache use
    pub fn record(&self, metrics: &mut MetricsCollector) {
        if let Some(hit) = self.tool_cache_hit {
            metrics.record_cache_check(CacheLayer::Tool, hit, None, self.cache_lookup, self.cost_saved);
        }

        let event_status = match self.status {
            ExecutionStatus::Success => EventStatus::Success,
            ExecutionStatus::Error => EventStatus::Error,
            ExecutionStatus::Timeout => EventStatus::Timeout,
        };
        metrics.record_closed_event(
            EventType::TaskExecution,
            &self.executor_name,
            self.started_at,
            self.duration,
            event_status,
            json!({
                "cached": self.cached(),
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
            }),
        );

        metrics.record_task_execution(
            &self.executor_name,
            self.duration,
            self.usage.input_tokens,
            self.usage.output_tokens,
            self.cost,
            self.status,
            self.cached(),
            self.error_message().map(str::to_string),
        );
    }
}

/// Cloneable invocation wrapper shared by all topologies
#[derive(Clone)]
pub struct Invoker {
    tool_cache: Option<Arc<ToolCache>>,
    cost_model: Arc<CostModel>,
}

impl Invoker {
    pub fn new(tool_cache: Option<Arc<ToolCache>>, cost_model: Arc<CostModel>) -> Self {
        Self {
            tool_cache,
            cost_model,
        }
    }

    pub async fn invoke(
        &self,
        executor: Arc<dyn TaskExecutor>,
        task: String,
        context: Map<String, Value>,
        timeout: Duration,
    ) -> InvocationOutcome {
        let name = executor.name().to_string();
        let started = Instant::now();
        let mut outcome = InvocationOutcome::new(&name, Utc::now());
        let cache_params = json!({"task": task, "context": context});

        // -------------------------------------------------
        // 1️⃣ TOOL CACHE
        // -------------------------------------------------
        if let Some(cache) = &self.tool_cache {
            let entry = cache.get_entry(&name, &cache_params).await;
            outcome.cache_lookup = started.elapsed();

            let cached = entry.and_then(|entry| {
                serde_json::from_value::<TaskResponse>(entry.value)
                    .ok()
                    .map(|response| (response, entry.cost))
            });

            if let Some((response, cost)) = cached {
                debug!(executor = %name, "Served from tool cache");
                outcome.tool_cache_hit = Some(true);
                outcome.cost_saved = cost;
                outcome.response = Some(response);
                outcome.duration = started.elapsed();
                return outcome;
            }
            outcome.tool_cache_hit = Some(false);
        }

        // -------------------------------------------------
        // 2️⃣ LIVE CALL UNDER TIMEOUT
        // -------------------------------------------------
        let result = tokio::time::timeout(timeout, executor.invoke(&task, &context)).await;
        outcome.duration = started.elapsed();

        match result {
            Ok(Ok(response)) => {
                let usage = response.usage.unwrap_or_else(|| TokenUsage {
                    input_tokens: estimate_tokens(&task),
                    output_tokens: estimate_tokens(&response.narrative()),
                });
                outcome.usage = usage;
                outcome.cost =
                    self.cost_model
                        .executor_cost(&name, usage.input_tokens, usage.output_tokens);

                if response.success {
                    if let (Some(cache), Ok(value)) = (&self.tool_cache, serde_json::to_value(&response)) {
                        cache
                            .set_with_cost(&name, &cache_params, value, usage, outcome.cost, None)
                            .await;
                    }
                } else {
                    let message = response
                        .message
                        .clone()
                        .unwrap_or_else(|| "no data".to_string());
                    debug!(executor = %name, %message, "Executor returned no data");
                    outcome.status = ExecutionStatus::Error;
                    outcome.error = Some((ErrorKind::ExecutorFailure, message));
                }
                outcome.response = Some(response);
            }
            Ok(Err(e)) => {
                warn!(executor = %name, error = %e, "Executor failed");
                outcome.status = ExecutionStatus::Error;
                outcome.error = Some((failure_kind(&e), e.to_string()));
            }
            Err(_) => {
                let err = EngineError::Timeout {
                    operation: name.clone(),
                    elapsed_ms: outcome.duration.as_millis() as u64,
                };
                warn!(executor = %name, timeout_ms = timeout.as_millis() as u64, "Executor timed out");
                outcome.status = ExecutionStatus::Timeout;
                outcome.error = Some((ErrorKind::Timeout, err.to_string()));
            }
        }

        outcome
    }
}

/// Executor errors stay recoverable at this level
fn failure_kind(error: &EngineError) -> ErrorKind {
    match error.kind() {
        ErrorKind::Timeout => ErrorKind::Timeout,
        _ => ErrorKind::ExecutorFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::executors::{FailingTaskExecutor, StaticTaskExecutor};
    use crate::store::InMemoryStore;

    fn invoker(with_cache: bool) -> Invoker {
        let cache = with_cache.then(|| {
            Arc::new(ToolCache::new(
                Arc::new(InMemoryStore::new()),
                &EngineConfig::default(),
            ))
        });
        Invoker::new(cache, Arc::new(CostModel::new()))
    }

    #[tokio::test]
    async fn test_success_is_costed_and_cached() {
        let invoker = invoker(true);
        let executor: Arc<dyn TaskExecutor> =
            Arc::new(StaticTaskExecutor::new("sentiment", json!({"score": 1})).with_usage(1000, 1000));

        let first = invoker
            .invoke(executor.clone(), "q".into(), Map::new(), Duration::from_secs(1))
            .await;
        assert!(first.succeeded());
        assert_eq!(first.tool_cache_hit, Some(false));
        assert!((first.cost - 0.0005).abs() < 1e-12);

        let second = invoker
            .invoke(executor, "q".into(), Map::new(), Duration::from_secs(1))
            .await;
        assert!(second.cached());
        assert_eq!(second.cost, 0.0);
        assert!((second.cost_saved - first.cost).abs() < 1e-12);
        assert_eq!(second.payload()["score"], json!(1));
    }

    #[tokio::test]
    async fn test_timeout_produces_fallback() {
        let invoker = invoker(false);
        let executor: Arc<dyn TaskExecutor> = Arc::new(
            StaticTaskExecutor::new("risk_metrics", json!({})).with_delay(Duration::from_millis(200)),
        );

        let outcome = invoker
            .invoke(executor, "q".into(), Map::new(), Duration::from_millis(20))
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert_eq!(outcome.payload()["success"], json!(false));
        assert_eq!(outcome.response_error().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_failure_and_no_data_are_not_cached() {
        let invoker = invoker(true);
        let failing: Arc<dyn TaskExecutor> = Arc::new(FailingTaskExecutor::new("sentiment", "boom"));
        let outcome = invoker
            .invoke(failing, "q".into(), Map::new(), Duration::from_secs(1))
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(outcome.narrative().contains("boom"));

        let empty: Arc<dyn TaskExecutor> =
            Arc::new(StaticTaskExecutor::new("fundamentals", json!({})).without_data("no filings"));
        invoker
            .invoke(empty.clone(), "q".into(), Map::new(), Duration::from_secs(1))
            .await;
        let again = invoker
            .invoke(empty, "q".into(), Map::new(), Duration::from_secs(1))
            .await;
        assert_eq!(again.tool_cache_hit, Some(false));
        assert_eq!(again.error_message(), Some("no filings"));
    }

    #[tokio::test]
    async fn test_record_into_metrics() {
        let invoker = invoker(true);
        let executor: Arc<dyn TaskExecutor> = Arc::new(StaticTaskExecutor::new("price_snapshot", json!({})));
        let outcome = invoker
            .invoke(executor, "q".into(), Map::new(), Duration::from_secs(1))
            .await;

        let mut metrics = MetricsCollector::new(Arc::new(CostModel::new()));
        outcome.record(&mut metrics);
        assert_eq!(metrics.records().len(), 1);
        assert_eq!(metrics.cache_checks().len(), 1);
        assert_eq!(metrics.get_timeline().events[0].event_type, EventType::TaskExecution);
    }
}
