//! Canned executors for demos and tests

use super::{context_keys, TaskExecutor};
use crate::error::EngineError;
use crate::metrics::cost::{estimate_tokens, DEFAULT_MODEL};
use crate::models::{TaskResponse, TokenUsage};
use crate::Result;
use serde_json::{Map, Value};
use std::time::Duration;

/// Returns a fixed payload, echoing the request's tickers
pub struct StaticTaskExecutor {
    name: String,
    description: String,
    model: String,
    payload: Value,
    message: Option<String>,
    handoff_to: Option<String>,
    delay: Option<Duration>,
    usage: Option<TokenUsage>,
    success: bool,
}

impl StaticTaskExecutor {
    pub fn new(name: &str, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            model: DEFAULT_MODEL.to_string(),
            payload,
            message: None,
            handoff_to: None,
            delay: None,
            usage: None,
            success: true,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn with_handoff(mut self, executor: &str) -> Self {
        self.handoff_to = Some(executor.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            input_tokens,
            output_tokens,
        });
        self
    }

    /// Report "no data" (`success: false`) instead of a result
    pub fn without_data(mut self, message: &str) -> Self {
        self.success = false;
        self.message = Some(message.to_string());
        self
    }
}

#[async_trait::async_trait]
impl TaskExecutor for StaticTaskExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, task: &str, context: &Map<String, Value>) -> Result<TaskResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if !self.success {
            let message = self.message.clone().unwrap_or_default();
            return Ok(TaskResponse::no_data(message));
        }

        let mut payload = self.payload.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("executor".to_string(), Value::String(self.name.clone()));
            if let Some(tickers) = context.get(context_keys::TICKERS) {
                map.insert(context_keys::TICKERS.to_string(), tickers.clone());
            }
            if let Some(next) = &self.handoff_to {
                map.insert("handoff_to".to_string(), Value::String(next.clone()));
            }
        }

        let message = self
            .message
            .clone()
            .unwrap_or_else(|| format!("{}: {}", self.name, self.payload));

        let usage = self.usage.unwrap_or_else(|| TokenUsage {
            input_tokens: estimate_tokens(task) + estimate_tokens(&Value::Object(context.clone()).to_string()),
            output_tokens: estimate_tokens(&message),
        });

        Ok(TaskResponse::ok(payload)
            .with_message(message)
            .with_usage(usage.input_tokens, usage.output_tokens))
    }
}

/// Always fails; exercises per-executor failure isolation
pub struct FailingTaskExecutor {
    name: String,
    message: String,
    delay: Option<Duration>,
}

impl FailingTaskExecutor {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait::async_trait]
impl TaskExecutor for FailingTaskExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn invoke(&self, _task: &str, _context: &Map<String, Value>) -> Result<TaskResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Err(EngineError::executor(&self.name, &self.message))
    }
}
