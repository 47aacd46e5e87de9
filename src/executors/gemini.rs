//! Gemini-backed task executors
//!
//! Uses a long-lived reqwest::Client for connection pooling. Token usage
//! comes from the response metadata, or is estimated when absent.

use super::{context_keys, TaskExecutor};
use crate::error::EngineError;
use crate::metrics::cost::{estimate_tokens, DEFAULT_MODEL};
use crate::models::TaskResponse;
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Text plus accounting for one generation
#[derive(Debug, Clone)]
pub struct GeminiReply {
    pub text: String,
    pub confidence: f32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_string(),
        })
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<GeminiReply> {
        if self.api_key.is_empty() {
            return Err(EngineError::Configuration(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_BASE_URL, self.model, self.api_key
        );

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                EngineError::executor(&self.model, format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(EngineError::executor(
                &self.model,
                format!("Gemini API error: {}", error_text),
            ));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            EngineError::executor(&self.model, format!("Gemini parse error: {}", e))
        })?;

        let text = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| EngineError::executor(&self.model, "Empty response from Gemini"))?;

        let confidence = calculate_confidence(&gemini_response);
        let (input_tokens, output_tokens) = match &gemini_response.usage_metadata {
            Some(usage) => (
                usage.prompt_token_count.max(0) as u64,
                usage.candidates_token_count.max(0) as u64,
            ),
            None => (
                estimate_tokens(system_prompt) + estimate_tokens(prompt),
                estimate_tokens(&text),
            ),
        };

        info!(
            model = %self.model,
            confidence,
            input_tokens,
            output_tokens,
            "Gemini response received"
        );

        Ok(GeminiReply {
            text,
            confidence,
            input_tokens,
            output_tokens,
        })
    }
}

/// LLM-backed domain executor
pub struct GeminiTaskExecutor {
    name: String,
    description: String,
    system_prompt: String,
    client: Arc<GeminiClient>,
}

impl GeminiTaskExecutor {
    pub fn new(name: &str, description: &str, system_prompt: &str, client: Arc<GeminiClient>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            system_prompt: format!(
                "You are a professional financial analyst.\n\n{}\n\nBe structured and concise.",
                system_prompt
            ),
            client,
        }
    }
}

#[async_trait::async_trait]
impl TaskExecutor for GeminiTaskExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn model(&self) -> &str {
        self.client.model()
    }

    async fn invoke(&self, task: &str, context: &Map<String, Value>) -> Result<TaskResponse> {
        let prompt = build_prompt(task, context);
        let reply = self
            .client
            .generate(&self.system_prompt, &prompt)
            .await
            .map_err(|e| match e {
                EngineError::ExecutorFailure { message, .. } => {
                    EngineError::executor(&self.name, message)
                }
                other => other,
            })?;

        let (answer, handoff_to) = split_handoff(&reply.text);
        let mut payload = json!({
            "answer": answer,
            "confidence": reply.confidence,
            "executor": self.name,
        });
        if let Some(next) = handoff_to {
            payload["handoff_to"] = Value::String(next);
        }

        Ok(TaskResponse::ok(payload)
            .with_message(answer)
            .with_usage(reply.input_tokens, reply.output_tokens))
    }
}

fn build_prompt(task: &str, context: &Map<String, Value>) -> String {
    let mut prompt = format!("Request: {}", task);

    if let Some(tickers) = context.get(context_keys::TICKERS).and_then(Value::as_array) {
        let list: Vec<&str> = tickers.iter().filter_map(Value::as_str).collect();
        if !list.is_empty() {
            prompt.push_str(&format!("\nSymbols: {}", list.join(", ")));
        }
    }

    if let Some(prior) = context.get(context_keys::PRIOR_OUTPUTS).and_then(Value::as_str) {
        if !prior.is_empty() {
            prompt.push_str(&format!("\n\nPrior findings:\n{}", prior));
        }
    }

    if let Some(history) = context.get(context_keys::HISTORY).and_then(Value::as_array) {
        for step in history {
            let executor = step.get("executor").and_then(Value::as_str).unwrap_or("?");
            let message = step.get("message").and_then(Value::as_str).unwrap_or("");
            prompt.push_str(&format!("\n[{}] {}", executor, message));
        }
    }

    prompt
}

/// Strip a `HANDOFF: <executor>` line from the answer
fn split_handoff(text: &str) -> (String, Option<String>) {
    let mut target = None;
    let mut kept = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        let upper = trimmed.to_ascii_uppercase();
        if target.is_none() && upper.starts_with("HANDOFF:") {
            let name = trimmed["HANDOFF:".len()..]
                .trim()
                .trim_matches(|c: char| c == '`' || c == '*' || c == '.')
                .to_lowercase();
            if !name.is_empty() {
                target = Some(name);
            }
            continue;
        }
        kept.push(line);
    }

    (kept.join("\n").trim().to_string(), target)
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
}

/// Calculate response confidence
fn calculate_confidence(response: &GeminiResponse) -> f32 {
    let Some(candidate) = response.candidates.first() else {
        return 0.5;
    };

    let base_confidence: f32 = 0.85;

    let finish_confidence = match candidate.finish_reason.as_deref() {
        Some("STOP") => 1.0,
        Some("MAX_TOKENS") => 0.8,
        Some("SAFETY") => 0.6,
        _ => 0.7,
    };

    let response_length = candidate
        .content
        .parts
        .first()
        .map(|p| p.text.len())
        .unwrap_or(0);

    let length_confidence = if response_length < 50 {
        0.6
    } else if response_length > 2000 {
        0.8
    } else {
        1.0
    };

    (base_confidence * finish_confidence * length_confidence).clamp(0.5, 0.98)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_handoff() {
        let (answer, target) = split_handoff("User asks about sizing.\nHANDOFF: risk_metrics");
        assert_eq!(answer, "User asks about sizing.");
        assert_eq!(target.as_deref(), Some("risk_metrics"));

        let (answer, target) = split_handoff("handoff: `Sentiment`.\nrest");
        assert_eq!(answer, "rest");
        assert_eq!(target.as_deref(), Some("sentiment"));

        let (_, target) = split_handoff("No routing needed.");
        assert!(target.is_none());
    }

    #[test]
    fn test_prompt_includes_prior_findings_and_history() {
        let mut context = Map::new();
        context.insert("tickers".into(), json!(["AAPL"]));
        context.insert("prior_outputs".into(), json!("news: buyback announced"));
        context.insert(
            "history".into(),
            json!([{"executor": "triage", "message": "sizing question"}]),
        );

        let prompt = build_prompt("should I add AAPL", &context);
        assert!(prompt.contains("Symbols: AAPL"));
        assert!(prompt.contains("buyback announced"));
        assert!(prompt.contains("[triage] sizing question"));
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [{"text": "Hold."}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 120, "candidatesTokenCount": 8}
        }"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.usage_metadata.as_ref().unwrap().prompt_token_count, 120);
        assert!(calculate_confidence(&response) >= 0.5);
    }

    #[test]
    fn test_request_serialization() {
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "What is RSI?".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 1024,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: "You are a financial analyst".to_string(),
                }],
            },
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("What is RSI?"));
    }
}
