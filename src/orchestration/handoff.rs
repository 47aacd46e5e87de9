//! Handoff topology
//!
//! One executor handles the request at a time. A successful response
//! carrying `handoff_to` transfers control to that executor, which sees
//! the accumulated history. The chain stops on failure, on a response
//! without a signal, or once `max_handoffs` transfers have happened.

use super::{OrchestrationExecutor, TaskRequest, TopologyOutput};
use crate::error::ErrorKind;
use crate::executors::context_keys;
use crate::metrics::MetricsCollector;
use crate::models::ResponseError;
use crate::workflows::WorkflowDefinition;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, info, warn};

pub(crate) async fn run(
    orchestrator: &OrchestrationExecutor,
    workflow: &WorkflowDefinition,
    request: &TaskRequest,
    metrics: &mut MetricsCollector,
    deadline: Instant,
) -> TopologyOutput {
    let entry = request
        .start_executor
        .as_deref()
        .or_else(|| workflow.entry());

    let Some(entry) = entry else {
        return TopologyOutput {
            result: json!({"chain": [], "responses": [], "handoff_limit_reached": false}),
            final_answer: None,
            errors: vec![ResponseError {
                executor: None,
                kind: ErrorKind::Configuration,
                message: format!("workflow '{}' has no entry executor", workflow.workflow_id),
            }],
            deadline_exceeded: false,
        };
    };

    let base = request.base_context();
    let mut current = entry.to_string();
    let mut chain: Vec<String> = Vec::new();
    let mut responses: Vec<Value> = Vec::new();
    let mut history: Vec<Value> = Vec::new();
    let mut errors = Vec::new();
    let mut final_answer = None;
    let mut deadline_exceeded = false;
    let mut limit_reached = false;
    let mut handoffs = 0usize;

    loop {
        let mut context = base.clone();
        context.insert(context_keys::HISTORY.to_string(), Value::Array(history.clone()));

        debug!(executor = %current, hop = handoffs, "Handoff step");
        let outcome = orchestrator
            .invoke_inline(&current, &request.query, context, deadline)
            .await;
        outcome.record(metrics);

        chain.push(current.clone());
        responses.push(json!({"executor": current, "payload": outcome.payload()}));

        if !outcome.succeeded() {
            warn!(executor = %current, error = ?outcome.error_message(), "Handoff chain stopped on failure");
            deadline_exceeded |= outcome.deadline_skipped;
            errors.extend(outcome.response_error());
            break;
        }

        let text = outcome.narrative();
        history.push(json!({"executor": current, "message": text}));
        final_answer = Some(text);

        let next = outcome
            .response
            .as_ref()
            .and_then(|r| r.handoff_target())
            .map(str::to_string);

        let Some(next) = next else {
            break;
        };

        if handoffs >= orchestrator.max_handoffs() {
            info!(
                executor = %current,
                requested = %next,
                max_handoffs = orchestrator.max_handoffs(),
                "Handoff limit reached"
            );
            limit_reached = true;
            break;
        }

        debug!(from = %current, to = %next, "Handing off");
        handoffs += 1;
        current = next;
    }

    TopologyOutput {
        result: json!({
            "chain": chain,
            "responses": responses,
            "handoff_limit_reached": limit_reached,
        }),
        final_answer,
        errors,
        deadline_exceeded,
    }
}
