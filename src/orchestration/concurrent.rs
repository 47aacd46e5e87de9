//! Concurrent topology: fan-out on identical input, fan-in on completion
//!
//! Every executor runs in its own tokio task. Fan-in waits for all of
//! them, so a failure or timeout in one never cancels the others.

use super::{InvocationOutcome, OrchestrationExecutor, TaskRequest, TopologyOutput};
use crate::error::ErrorKind;
use crate::metrics::MetricsCollector;
use crate::models::ExecutionStatus;
use crate::workflows::WorkflowDefinition;
use serde_json::{Map, Value};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) async fn run(
    orchestrator: &OrchestrationExecutor,
    workflow: &WorkflowDefinition,
    request: &TaskRequest,
    metrics: &mut MetricsCollector,
    deadline: Instant,
) -> TopologyOutput {
    let context = request.base_context();

    // -------------------------------------------------
    // 1️⃣ FAN-OUT
    // -------------------------------------------------
    let handles: Vec<(String, JoinHandle<InvocationOutcome>)> = workflow
        .executors
        .iter()
        .map(|name| {
            let name = name.clone();
            let executor = orchestrator.registry.get(&name);
            let timeout = orchestrator.call_timeout(deadline);
            let invoker = orchestrator.invoker.clone();
            let task = request.query.clone();
            let context = context.clone();

            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                match (executor, timeout) {
                    (_, None) => InvocationOutcome::deadline_exceeded(&task_name),
                    (None, _) => InvocationOutcome::unregistered(&task_name),
                    (Some(executor), Some(timeout)) => {
                        invoker.invoke(executor, task, context, timeout).await
                    }
                }
            });
            (name, handle)
        })
        .collect();

    debug!(workflow_id = %workflow.workflow_id, tasks = handles.len(), "Fan-out complete");

    // -------------------------------------------------
    // 2️⃣ FAN-IN
    // -------------------------------------------------
    let mut results = Map::new();
    let mut narrative = Vec::new();
    let mut errors = Vec::new();
    let mut deadline_exceeded = false;

    for (name, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(executor = %name, error = %e, "Executor task aborted");
                InvocationOutcome::not_invoked(
                    &name,
                    ExecutionStatus::Error,
                    ErrorKind::ExecutorFailure,
                    format!("executor task aborted: {}", e),
                )
            }
        };
        outcome.record(metrics);

        if outcome.succeeded() {
            narrative.push(format!("[{}] {}", name, outcome.narrative()));
        } else {
            warn!(executor = %name, error = ?outcome.error_message(), "Concurrent branch degraded");
            deadline_exceeded |= outcome.deadline_skipped;
            errors.extend(outcome.response_error());
        }
        results.insert(name, outcome.payload());
    }

    let final_answer = (!narrative.is_empty()).then(|| narrative.join("\n"));

    TopologyOutput {
        result: Value::Object(results),
        final_answer,
        errors,
        deadline_exceeded,
    }
}

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::error::ErrorKind;
    use crate::executors::{ExecutorRegistry, FailingTaskExecutor, StaticTaskExecutor};
    use crate::models::{ExecutionStatus, Topology};

    fn workflow(executors: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition::new("equity_analysis", Topology::Concurrent, executors)
    }

    #[tokio::test]
    async fn test_one_failure_keeps_other_results() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(StaticTaskExecutor::new("sentiment", json!({"score": 0.4}))));
        registry.register(Arc::new(FailingTaskExecutor::new("fundamentals", "filings api down")));
        registry.register(Arc::new(StaticTaskExecutor::new("risk_metrics", json!({"beta": 1.2}))));

        let orchestrator = OrchestrationExecutor::new(
            Arc::new(registry),
            Arc::new(CostModel::new()),
            None,
            &EngineConfig::default(),
        );
        let mut metrics = MetricsCollector::new(Arc::new(CostModel::new()));
        let result = orchestrator
            .execute(
                &workflow(&["sentiment", "fundamentals", "risk_metrics"]),
                &TaskRequest::new("analyze AAPL").with_tickers(vec!["AAPL".into()]),
                &mut metrics,
            )
            .await;

        assert_eq!(result.records.len(), 3);
        assert_eq!(result.result["sentiment"]["score"], json!(0.4));
        assert_eq!(result.result["risk_metrics"]["beta"], json!(1.2));
        assert_eq!(result.result["fundamentals"]["success"], json!(false));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].executor.as_deref(), Some("fundamentals"));
        assert_eq!(result.errors[0].kind, ErrorKind::ExecutorFailure);

        let answer = result.final_answer.unwrap();
        assert!(answer.contains("[sentiment]"));
        assert!(!answer.contains("[fundamentals]"));
    }

    #[tokio::test]
    async fn test_slow_executor_times_out_others_complete() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(StaticTaskExecutor::new("sentiment", json!({}))));
        registry.register(Arc::new(StaticTaskExecutor::new("fundamentals", json!({}))));
        registry.register(Arc::new(
            StaticTaskExecutor::new("risk_metrics", json!({})).with_delay(Duration::from_secs(5)),
        ));
        registry.register(Arc::new(StaticTaskExecutor::new("news_research", json!({}))));

        let config = EngineConfig::default().with_executor_timeout(Duration::from_millis(100));
        let orchestrator =
            OrchestrationExecutor::new(Arc::new(registry), Arc::new(CostModel::new()), None, &config);
        let mut metrics = MetricsCollector::new(Arc::new(CostModel::new()));

        let started = Instant::now();
        let result = orchestrator
            .execute(
                &workflow(&["sentiment", "fundamentals", "risk_metrics", "news_research"]),
                &TaskRequest::new("analyze MSFT"),
                &mut metrics,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.records.len(), 4);
        let statuses: Vec<ExecutionStatus> = result.records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Success,
                ExecutionStatus::Success,
                ExecutionStatus::Timeout,
                ExecutionStatus::Success,
            ]
        );
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
        assert!(!result.deadline_exceeded);
    }

    #[tokio::test]
    async fn test_unregistered_executor_is_an_error_record() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(StaticTaskExecutor::new("sentiment", json!({}))));

        let orchestrator = OrchestrationExecutor::new(
            Arc::new(registry),
            Arc::new(CostModel::new()),
            None,
            &EngineConfig::default(),
        );
        let mut metrics = MetricsCollector::new(Arc::new(CostModel::new()));
        let result = orchestrator
            .execute(&workflow(&["sentiment", "ghost"]), &TaskRequest::new("q"), &mut metrics)
            .await;

        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[1].status, ExecutionStatus::Error);
        assert!(result.errors[0].message.contains("not registered"));
    }
}
