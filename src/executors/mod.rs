//! Task executor trait and registry
//!
//! Executors are the expensive domain agents the engine coordinates.
//! They are registered explicitly at startup; lookup is by name.
//! Expected "no data" outcomes come back as `success: false`, not `Err`.

pub mod gemini;
pub mod http;
pub mod mock;

pub use gemini::{GeminiClient, GeminiTaskExecutor};
pub use http::{FinancialApiClient, HttpTaskExecutor};
pub use mock::{FailingTaskExecutor, StaticTaskExecutor};

use crate::config::EngineConfig;
use crate::metrics::cost::{CostModel, DEFAULT_MODEL};
use crate::models::TaskResponse;
use crate::Result;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Context keys shared by executors and topologies
pub mod context_keys {
    pub const QUERY: &str = "query";
    pub const TICKERS: &str = "tickers";
    /// Sequential: narrative of prior outputs
    pub const PRIOR_OUTPUTS: &str = "prior_outputs";
    /// Handoff: accumulated `[{executor, message}]`
    pub const HISTORY: &str = "history";
}

/// Trait for a single task executor
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Pricing key for the cost model
    fn model(&self) -> &str {
        DEFAULT_MODEL
    }

    async fn invoke(&self, task: &str, context: &Map<String, Value>) -> Result<TaskResponse>;
}

/// Registry for looking up task executors by name
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors
            .insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Cost model priced by each registered executor's model
    pub fn cost_model(&self) -> CostModel {
        self.executors
            .values()
            .fold(CostModel::new(), |model, executor| {
                model.with_executor_model(executor.name(), executor.model())
            })
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Prompts for the LLM-backed executors
const GEMINI_EXECUTORS: &[(&str, &str, &str)] = &[
    (
        "sentiment",
        "Market and news sentiment for the given symbols",
        "Assess current market sentiment for the symbols in the request. Answer with a \
         bullish/neutral/bearish call per symbol and the two strongest drivers.",
    ),
    (
        "fundamentals",
        "Fundamental snapshot: valuation, growth, margins",
        "Summarize valuation multiples, revenue growth and margins for the symbols in the \
         request. Flag anything unusual against sector peers.",
    ),
    (
        "risk_metrics",
        "Quantitative risk profile: volatility, beta, drawdown",
        "Describe the risk profile (volatility, beta, max drawdown, concentration) for the \
         symbols in the request. Be numeric where possible.",
    ),
    (
        "news_research",
        "Recent news and events relevant to the query",
        "List the most relevant recent news and corporate events for the request, newest \
         first, one line each.",
    ),
    (
        "synthesis",
        "Combine prior findings into a final answer",
        "Using the prior findings in the context, write a concise final answer to the \
         request. State risks explicitly.",
    ),
    (
        "triage",
        "Decide which specialist should handle an advisory request",
        "You route advisory questions. Reply with a one-line summary of the request, then \
         on its own line `HANDOFF: <specialist>` where specialist is one of risk_metrics, \
         sentiment or synthesis. Omit the HANDOFF line if you can answer directly.",
    ),
];

/// Deterministic data endpoints on the financial API
const HTTP_EXECUTORS: &[(&str, &str, &str)] = &[
    (
        "price_snapshot",
        "Latest quote for a symbol",
        "/api/v1/market/quote",
    ),
    (
        "price_history",
        "Historical prices and returns",
        "/api/v1/market/history",
    ),
];

/// Registry backed by Gemini and the financial API where configured.
///
/// Any executor whose backend is not configured is filled with its demo
/// counterpart so every built-in workflow stays runnable.
pub fn create_default_registry(config: &EngineConfig) -> Result<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();

    if let Some(api_key) = config.gemini_api_key.clone() {
        let client = Arc::new(GeminiClient::new(api_key)?);
        for (name, description, prompt) in GEMINI_EXECUTORS {
            registry.register(Arc::new(GeminiTaskExecutor::new(
                name,
                description,
                prompt,
                client.clone(),
            )));
        }
    }

    if let Some(base_url) = config.financial_api_base_url.as_deref() {
        let api = FinancialApiClient::new(base_url)?;
        for (name, description, path) in HTTP_EXECUTORS {
            registry.register(Arc::new(HttpTaskExecutor::new(
                name,
                description,
                path,
                api.clone(),
            )));
        }
    }

    let demo = create_demo_registry();
    let mut filled = Vec::new();
    for name in demo.list() {
        if !registry.contains(name) {
            if let Some(executor) = demo.get(name) {
                registry.register(executor);
                filled.push(name.to_string());
            }
        }
    }

    if !filled.is_empty() {
        warn!(executors = ?filled, "Backends not configured, using demo executors");
    }
    info!(count = registry.len(), "Executor registry ready");

    Ok(registry)
}

/// Canned executors covering every built-in workflow
pub fn create_demo_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();

    registry.register(Arc::new(
        StaticTaskExecutor::new(
            "price_snapshot",
            json!({"price": 189.84, "change_pct": 0.42, "currency": "USD"}),
        )
        .with_description("Latest quote for a symbol"),
    ));
    registry.register(Arc::new(
        StaticTaskExecutor::new(
            "price_history",
            json!({"return_1y_pct": 18.3, "return_ytd_pct": 7.9, "high_52w": 199.6, "low_52w": 164.1}),
        )
        .with_description("Historical prices and returns"),
    ));
    registry.register(Arc::new(
        StaticTaskExecutor::new("sentiment", json!({"sentiment": "bullish", "score": 0.64}))
            .with_description("Market and news sentiment")
            .with_message("Sentiment is moderately bullish on strong services growth."),
    ));
    registry.register(Arc::new(
        StaticTaskExecutor::new(
            "fundamentals",
            json!({"pe_ratio": 29.4, "revenue_growth_pct": 6.1, "gross_margin_pct": 45.9}),
        )
        .with_description("Fundamental snapshot")
        .with_message("Valuation is above sector median; margins remain best in class."),
    ));
    registry.register(Arc::new(
        StaticTaskExecutor::new(
            "risk_metrics",
            json!({"volatility_30d": 0.21, "beta": 1.12, "max_drawdown_pct": -14.8}),
        )
        .with_description("Quantitative risk profile")
        .with_message("Volatility is moderate with beta slightly above the market."),
    ));
    registry.register(Arc::new(
        StaticTaskExecutor::new("news_research", json!({"headlines": 3}))
            .with_description("Recent news and events")
            .with_message("Three relevant headlines: product launch, buyback, analyst upgrade."),
    ));
    registry.register(Arc::new(
        StaticTaskExecutor::new("synthesis", json!({"recommendation": "hold"}))
            .with_description("Combine prior findings into a final answer")
            .with_message("Overall: a quality name at a full price. Hold; add on pullbacks."),
    ));
    registry.register(Arc::new(
        StaticTaskExecutor::new("triage", json!({}))
            .with_description("Route advisory requests to a specialist")
            .with_message("Advisory request about position sizing.")
            .with_handoff("risk_metrics"),
    ));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_registry_covers_builtin_workflows() {
        let registry = create_demo_registry();
        let catalog = crate::workflows::WorkflowCatalog::builtin();
        assert!(catalog.validate(&registry).is_ok());
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn test_default_registry_without_backends_is_demo() {
        let registry = create_default_registry(&EngineConfig::default()).unwrap();
        assert_eq!(registry.list(), create_demo_registry().list());
    }

    #[test]
    fn test_cost_model_from_registry() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(
            StaticTaskExecutor::new("synthesis", json!({})).with_model("gemini-1.5-pro"),
        ));
        let model = registry.cost_model();
        assert_eq!(model.model_for("synthesis"), "gemini-1.5-pro");
        assert_eq!(model.model_for("other"), DEFAULT_MODEL);
    }
}
