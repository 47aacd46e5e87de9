//! Pricing table and zero-cache baseline estimates

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Rates in USD per 1,000 tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// One executor call in a workflow's typical token profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineStep {
    pub executor: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl BaselineStep {
    pub fn new(executor: &str, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            executor: executor.to_string(),
            input_tokens,
            output_tokens,
        }
    }
}

lazy_static! {
    static ref PRICING: HashMap<&'static str, ModelPricing> = {
        let mut m = HashMap::new();
        m.insert("gemini-2.0-flash", ModelPricing::new(0.0001, 0.0004));
        m.insert("gemini-1.5-flash", ModelPricing::new(0.000075, 0.0003));
        m.insert("gemini-1.5-pro", ModelPricing::new(0.00125, 0.005));
        m.insert("gpt-4o", ModelPricing::new(0.0025, 0.01));
        m.insert("gpt-4o-mini", ModelPricing::new(0.00015, 0.0006));
        // Deterministic HTTP data tools
        m.insert("http", ModelPricing::new(0.0, 0.0));
        m
    };

    static ref DEFAULT_PRICING: ModelPricing = ModelPricing::new(0.0005, 0.0015);

    static ref BASELINE_PROFILES: HashMap<&'static str, Vec<BaselineStep>> = {
        let mut m = HashMap::new();
        m.insert("quote", vec![BaselineStep::new("price_snapshot", 400, 150)]);
        m.insert(
            "equity_analysis",
            vec![
                BaselineStep::new("price_history", 1200, 400),
                BaselineStep::new("sentiment", 1500, 500),
                BaselineStep::new("fundamentals", 1800, 600),
                BaselineStep::new("risk_metrics", 1000, 350),
            ],
        );
        m.insert(
            "research",
            vec![
                BaselineStep::new("news_research", 2000, 700),
                BaselineStep::new("fundamentals", 1800, 600),
                BaselineStep::new("synthesis", 2500, 900),
            ],
        );
        m.insert(
            "advisor",
            vec![
                BaselineStep::new("triage", 600, 150),
                BaselineStep::new("risk_metrics", 1000, 350),
                BaselineStep::new("synthesis", 2500, 900),
            ],
        );
        m
    };
}

/// Rough token count: ~4 characters per token
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() + 3) / 4) as u64
}

/// Maps executors to models and models to rates
#[derive(Debug, Clone, Default)]
pub struct CostModel {
    executor_models: HashMap<String, String>,
    profiles: HashMap<String, Vec<BaselineStep>>,
}

impl CostModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor_model(mut self, executor: &str, model: &str) -> Self {
        self.executor_models
            .insert(executor.to_string(), model.to_string());
        self
    }

    /// Override or add a workflow's baseline profile
    pub fn with_profile(mut self, workflow_id: &str, steps: Vec<BaselineStep>) -> Self {
        self.profiles.insert(workflow_id.to_string(), steps);
        self
    }

    pub fn pricing(model: &str) -> ModelPricing {
        PRICING.get(model).copied().unwrap_or(*DEFAULT_PRICING)
    }

    pub fn model_for(&self, executor: &str) -> &str {
        self.executor_models
            .get(executor)
            .map(String::as_str)
            .unwrap_or(DEFAULT_MODEL)
    }

    pub fn executor_cost(&self, executor: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        Self::pricing(self.model_for(executor)).cost(input_tokens, output_tokens)
    }

    pub fn profile(&self, workflow_id: &str) -> Option<&[BaselineStep]> {
        self.profiles
            .get(workflow_id)
            .or_else(|| BASELINE_PROFILES.get(workflow_id))
            .map(Vec::as_slice)
    }

    /// What the workflow would cost with every cache cold; 0 when unknown
    pub fn baseline_cost(&self, workflow_id: &str) -> f64 {
        self.profile(workflow_id)
            .map(|steps| {
                steps
                    .iter()
                    .map(|s| self.executor_cost(&s.executor, s.input_tokens, s.output_tokens))
                    .sum()
            })
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_per_thousand_tokens() {
        let pricing = CostModel::pricing("gpt-4o");
        assert!((pricing.cost(1000, 1000) - 0.0125).abs() < 1e-12);
        assert_eq!(CostModel::pricing("unknown-model"), *DEFAULT_PRICING);
    }

    #[test]
    fn test_executor_model_mapping() {
        let model = CostModel::new().with_executor_model("synthesis", "gemini-1.5-pro");
        assert_eq!(model.model_for("synthesis"), "gemini-1.5-pro");
        assert_eq!(model.model_for("sentiment"), DEFAULT_MODEL);
        assert!(model.executor_cost("synthesis", 1000, 0) > model.executor_cost("sentiment", 1000, 0));
    }

    #[test]
    fn test_baseline_cost() {
        let model = CostModel::new();
        // 400/1000 * 0.0001 + 150/1000 * 0.0004
        assert!((model.baseline_cost("quote") - 0.0001).abs() < 1e-12);
        assert!(model.baseline_cost("equity_analysis") > model.baseline_cost("quote"));
        assert_eq!(model.baseline_cost("no_such_workflow"), 0.0);

        let model = model.with_profile("quote", vec![]);
        assert_eq!(model.baseline_cost("quote"), 0.0);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
