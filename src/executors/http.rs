//! Executors backed by the financial API service

use super::{context_keys, TaskExecutor};
use crate::error::EngineError;
use crate::models::TaskResponse;
use crate::Result;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct FinancialApiClient {
    client: Client,
    base_url: String,
}

impl FinancialApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `Ok(None)` when the API has no data for the request (404)
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Option<Value>> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                EngineError::executor(path, format!("Financial API request failed: {}", e))
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response.json::<Value>().await.map_err(|e| {
            EngineError::executor(path, format!("Invalid JSON response: {}", e))
        })?;

        if !status.is_success() {
            return Err(EngineError::executor(
                path,
                format!("Financial API returned {}: {}", status, body),
            ));
        }

        Ok(Some(body))
    }
}

pub struct HttpTaskExecutor {
    name: String,
    description: String,
    path: String,
    api: FinancialApiClient,
}

impl HttpTaskExecutor {
    pub fn new(name: &str, description: &str, path: &str, api: FinancialApiClient) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            path: path.to_string(),
            api,
        }
    }

    fn request_body(task: &str, context: &Map<String, Value>) -> Value {
        let tickers = context
            .get(context_keys::TICKERS)
            .cloned()
            .unwrap_or_else(|| json!([]));
        let symbol = tickers
            .as_array()
            .and_then(|t| t.first())
            .cloned()
            .unwrap_or(Value::Null);

        json!({
            "task": task,
            "query": context.get(context_keys::QUERY).cloned().unwrap_or(Value::Null),
            "symbol": symbol,
            "symbols": tickers,
        })
    }
}

#[async_trait::async_trait]
impl TaskExecutor for HttpTaskExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn model(&self) -> &str {
        "http"
    }

    async fn invoke(&self, task: &str, context: &Map<String, Value>) -> Result<TaskResponse> {
        let body = Self::request_body(task, context);
        debug!(executor = %self.name, path = %self.path, "Calling financial API");

        match self.api.post_json(&self.path, &body).await {
            Ok(Some(data)) => Ok(TaskResponse::ok(data)),
            Ok(None) => Ok(TaskResponse::no_data(format!(
                "{} has no data for this request",
                self.name
            ))),
            Err(EngineError::ExecutorFailure { message, .. }) => {
                Err(EngineError::executor(&self.name, message))
            }
            Err(e) => Err(e),
        }
    }
}
