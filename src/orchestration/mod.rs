//! Orchestration executor
//!
//! Runs a workflow's task executors in one of three topologies:
//! - sequential: each executor sees the query plus all prior outputs
//! - concurrent: fan-out on the same input, fan-in waits for every call
//! - handoff: one executor at a time, following explicit next-hop signals
//!
//! Executor failures and timeouts never abort a run. They become error
//! records with a fallback payload, and the run carries on.

pub mod concurrent;
pub mod handoff;
pub mod invoke;
pub mod sequential;

pub use invoke::{InvocationOutcome, Invoker};

use crate::cache::ToolCache;
use crate::config::EngineConfig;
use crate::executors::{context_keys, ExecutorRegistry};
use crate::metrics::{CostModel, MetricsCollector};
use crate::models::{ResponseError, TaskExecutionRecord, Topology};
use crate::workflows::WorkflowDefinition;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What the topologies receive
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub query: String,
    pub tickers: Vec<String>,
    pub context: Map<String, Value>,
    /// Handoff entry override
    pub start_executor: Option<String>,
}

impl TaskRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_tickers(mut self, tickers: Vec<String>) -> Self {
        self.tickers = tickers;
        self
    }

    /// Caller context plus the query and tickers under well-known keys
    pub fn base_context(&self) -> Map<String, Value> {
        let mut context = self.context.clone();
        context.insert(context_keys::QUERY.to_string(), json!(self.query));
        context.insert(context_keys::TICKERS.to_string(), json!(self.tickers));
        context
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub pattern: Topology,
    /// Combined (concurrent, sequential) or final (handoff) result
    pub result: Value,
    pub final_answer: Option<String>,
    pub records: Vec<TaskExecutionRecord>,
    pub errors: Vec<ResponseError>,
    pub total_duration: Duration,
    pub deadline_exceeded: bool,
}

impl ExecutionResult {
    /// No executor failed or timed out
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Shared output of a topology run, before records are attached
pub(crate) struct TopologyOutput {
    pub result: Value,
    pub final_answer: Option<String>,
    pub errors: Vec<ResponseError>,
    pub deadline_exceeded: bool,
}

pub struct OrchestrationExecutor {
    registry: Arc<ExecutorRegistry>,
    invoker: Invoker,
    executor_timeout: Duration,
    request_deadline: Duration,
    max_handoffs: usize,
}

impl OrchestrationExecutor {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        cost_model: Arc<CostModel>,
        tool_cache: Option<Arc<ToolCache>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            invoker: Invoker::new(tool_cache, cost_model),
            executor_timeout: config.executor_timeout,
            request_deadline: config.request_deadline,
            max_handoffs: config.max_handoffs,
        }
    }

    pub fn max_handoffs(&self) -> usize {
        self.max_handoffs
    }

    /// Run with a fresh deadline starting now
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        request: &TaskRequest,
        metrics: &mut MetricsCollector,
    ) -> ExecutionResult {
        let deadline = Instant::now() + self.request_deadline;
        self.execute_until(workflow, request, metrics, deadline).await
    }

    /// Run against an externally owned request deadline
    pub async fn execute_until(
        &self,
        workflow: &WorkflowDefinition,
        request: &TaskRequest,
        metrics: &mut MetricsCollector,
        deadline: Instant,
    ) -> ExecutionResult {
        let started = Instant::now();
        let first_record = metrics.records().len();

        info!(
            workflow_id = %workflow.workflow_id,
            pattern = %workflow.topology,
            executors = workflow.executors.len(),
            "Executing workflow"
        );

        let output = match workflow.topology {
            Topology::Sequential => sequential::run(self, workflow, request, metrics, deadline).await,
            Topology::Concurrent => concurrent::run(self, workflow, request, metrics, deadline).await,
            Topology::Handoff => handoff::run(self, workflow, request, metrics, deadline).await,
        };

        let records = metrics.records()[first_record..].to_vec();
        debug!(
            workflow_id = %workflow.workflow_id,
            records = records.len(),
            errors = output.errors.len(),
            "Workflow finished"
        );

        ExecutionResult {
            pattern: workflow.topology,
            result: output.result,
            final_answer: output.final_answer,
            records,
            errors: output.errors,
            total_duration: started.elapsed(),
            deadline_exceeded: output.deadline_exceeded || Instant::now() >= deadline,
        }
    }

    /// Per-call timeout bounded by what is left of the request deadline;
    /// `None` once the deadline has passed
    pub(crate) fn call_timeout(&self, deadline: Instant) -> Option<Duration> {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        Some(self.executor_timeout.min(remaining))
    }

    /// Invoke one executor in the current task (sequential, handoff)
    pub(crate) async fn invoke_inline(
        &self,
        executor_name: &str,
        task: &str,
        context: Map<String, Value>,
        deadline: Instant,
    ) -> InvocationOutcome {
        let Some(timeout) = self.call_timeout(deadline) else {
            return InvocationOutcome::deadline_exceeded(executor_name);
        };
        let Some(executor) = self.registry.get(executor_name) else {
            return InvocationOutcome::unregistered(executor_name);
        };

        self.invoker
            .invoke(executor, task.to_string(), context, timeout)
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::executors::TaskExecutor;
    use crate::models::TaskResponse;
    use crate::Result;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Captures the task and context of every call
    pub struct RecordingExecutor {
        name: String,
        output: String,
        handoff_to: Option<String>,
        pub calls: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
    }

    impl RecordingExecutor {
        pub fn new(name: &str, output: &str) -> Self {
            Self {
                name: name.to_string(),
                output: output.to_string(),
                handoff_to: None,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn handing_off_to(mut self, next: &str) -> Self {
            self.handoff_to = Some(next.to_string());
            self
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for RecordingExecutor {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "Records its inputs"
        }

        async fn invoke(&self, task: &str, context: &Map<String, Value>) -> Result<TaskResponse> {
            self.calls
                .lock()
                .await
                .push((task.to_string(), context.clone()));

            let mut payload = json!({"output": self.output});
            if let Some(next) = &self.handoff_to {
                payload["handoff_to"] = json!(next);
            }
            Ok(TaskResponse::ok(payload)
                .with_message(self.output.clone())
                .with_usage(100, 50))
        }
    }
}
