//! Sequential topology with context chaining
//!
//! Executor `i` receives the original query as its task and, under
//! `prior_outputs`, the outputs of every executor `j < i` in order.
//! A failed executor contributes a placeholder line instead.

use super::{OrchestrationExecutor, TaskRequest, TopologyOutput};
use crate::executors::context_keys;
use crate::metrics::MetricsCollector;
use crate::workflows::WorkflowDefinition;
use serde_json::{Map, Value};
use std::time::Instant;
use tracing::{debug, warn};

pub(crate) async fn run(
    orchestrator: &OrchestrationExecutor,
    workflow: &WorkflowDefinition,
    request: &TaskRequest,
    metrics: &mut MetricsCollector,
    deadline: Instant,
) -> TopologyOutput {
    let base = request.base_context();
    let mut narrative: Vec<String> = Vec::with_capacity(workflow.executors.len());
    let mut results = Map::new();
    let mut errors = Vec::new();
    let mut final_answer = None;
    let mut deadline_exceeded = false;

    for name in &workflow.executors {
        let mut context = base.clone();
        context.insert(
            context_keys::PRIOR_OUTPUTS.to_string(),
            Value::String(narrative.join("\n")),
        );

        debug!(executor = %name, prior = narrative.len(), "Sequential step");
        let outcome = orchestrator
            .invoke_inline(name, &request.query, context, deadline)
            .await;
        outcome.record(metrics);

        if outcome.succeeded() {
            let text = outcome.narrative();
            final_answer = Some(text.clone());
            narrative.push(format!("[{}] {}", name, text));
        } else {
            warn!(executor = %name, error = ?outcome.error_message(), "Sequential step degraded");
            narrative.push(format!("[{}] {}", name, outcome.narrative()));
            deadline_exceeded |= outcome.deadline_skipped;
            errors.extend(outcome.response_error());
        }

        results.insert(name.clone(), outcome.payload());
    }

    TopologyOutput {
        result: Value::Object(results),
        final_answer,
        errors,
        deadline_exceeded,
    }
}
