//! Workflow catalog
//!
//! A workflow is a fixed set of task executors plus the topology used to
//! run them. Each workflow declares which request fields form its outcome
//! key; normalisation of those fields lives in `cache::keys`:
//!
//! | workflow          | topology   | key payload          |
//! |-------------------|------------|----------------------|
//! | `quote`           | sequential | `{ticker}`           |
//! | `equity_analysis` | concurrent | `{tickers[]}`        |
//! | `research`        | sequential | `{query, tickers[]}` |
//! | `advisor`         | handoff    | `{query, tickers[]}` |

use crate::cache::keys::normalize_symbol;
use crate::error::EngineError;
use crate::executors::ExecutorRegistry;
use crate::models::Topology;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub const QUOTE: &str = "quote";
pub const EQUITY_ANALYSIS: &str = "equity_analysis";
pub const RESEARCH: &str = "research";
pub const ADVISOR: &str = "advisor";

/// Tokens that look like symbols but are not
const TICKER_STOP_WORDS: &[&str] = &[
    "A", "I", "AI", "AM", "AN", "AND", "ARE", "AS", "AT", "BE", "BUY", "BY", "CEO", "CFO",
    "DO", "EPS", "ETF", "FOR", "GDP", "HOW", "IF", "IN", "IPO", "IS", "IT", "MACD", "ME",
    "MY", "NO", "OF", "OK", "ON", "OR", "PE", "RSI", "SELL", "SO", "THE", "TO", "UP", "US",
    "USD", "VS", "WE", "WHAT", "WHY",
];

/// Candidate ticker symbols in order of appearance.
///
/// `$`-prefixed tokens are accepted in any case; bare tokens must already
/// be upper-case. Both are limited to 1-5 ASCII letters.
pub fn extract_tickers(text: &str) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();

    for raw in text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '$')) {
        let (prefixed, token) = match raw.strip_prefix('$') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        if token.is_empty() || token.len() > 5 || !token.chars().all(|c| c.is_ascii_alphabetic()) {
            continue;
        }
        if !prefixed && !token.chars().all(|c| c.is_ascii_uppercase()) {
            continue;
        }

        let symbol = normalize_symbol(token);
        if !prefixed && TICKER_STOP_WORDS.contains(&symbol.as_str()) {
            continue;
        }
        if !tickers.contains(&symbol) {
            tickers.push(symbol);
        }
    }

    tickers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyField {
    Ticker,
    Tickers,
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    pub description: String,
    pub topology: Topology,
    pub executors: Vec<String>,
    /// Handoff entry point; defaults to the first executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_executor: Option<String>,
    pub key_fields: Vec<KeyField>,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: &str, topology: Topology, executors: &[&str]) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            description: String::new(),
            topology,
            executors: executors.iter().map(|e| e.to_string()).collect(),
            entry_executor: None,
            key_fields: vec![KeyField::Query],
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_entry(mut self, executor: &str) -> Self {
        self.entry_executor = Some(executor.to_string());
        self
    }

    pub fn with_key_fields(mut self, fields: &[KeyField]) -> Self {
        self.key_fields = fields.to_vec();
        self
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry_executor
            .as_deref()
            .or_else(|| self.executors.first().map(String::as_str))
    }

    /// Raw key payload; normalised by the outcome store before hashing.
    ///
    /// Explicit `ticker`/`tickers` in the request context take precedence
    /// over symbols found in the query text. When a symbol field is wanted
    /// but none can be found, the query itself joins the key so unrelated
    /// symbol-less requests never share an entry.
    pub fn key_payload(&self, query: &str, context: &Map<String, Value>) -> Value {
        let tickers = request_tickers(query, context);

        let mut payload = Map::new();
        for field in &self.key_fields {
            match field {
                KeyField::Ticker => {
                    let ticker = tickers.first().cloned().unwrap_or_default();
                    payload.insert("ticker".to_string(), Value::String(ticker));
                }
                KeyField::Tickers => {
                    payload.insert("tickers".to_string(), json!(tickers));
                }
                KeyField::Query => {
                    payload.insert("query".to_string(), Value::String(query.to_string()));
                }
            }
        }

        let wants_symbols = self
            .key_fields
            .iter()
            .any(|f| matches!(f, KeyField::Ticker | KeyField::Tickers));
        if wants_symbols && tickers.is_empty() {
            payload
                .entry("query".to_string())
                .or_insert_with(|| Value::String(query.to_string()));
        }

        Value::Object(payload)
    }
}

/// Symbols for a request: explicit context wins over the query text
pub fn request_tickers(query: &str, context: &Map<String, Value>) -> Vec<String> {
    context_tickers(context).unwrap_or_else(|| extract_tickers(query))
}

fn context_tickers(context: &Map<String, Value>) -> Option<Vec<String>> {
    if let Some(list) = context
        .get("tickers")
        .or_else(|| context.get("symbols"))
        .and_then(Value::as_array)
    {
        let tickers: Vec<String> = list
            .iter()
            .filter_map(Value::as_str)
            .map(normalize_symbol)
            .filter(|s| !s.is_empty())
            .collect();
        if !tickers.is_empty() {
            return Some(tickers);
        }
    }

    context
        .get("ticker")
        .or_else(|| context.get("symbol"))
        .and_then(Value::as_str)
        .map(normalize_symbol)
        .filter(|s| !s.is_empty())
        .map(|s| vec![s])
}

pub struct WorkflowCatalog {
    workflows: HashMap<String, WorkflowDefinition>,
    order: Vec<String>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::new();

        catalog.register(
            WorkflowDefinition::new(QUOTE, Topology::Sequential, &["price_snapshot"])
                .with_description("Latest price snapshot for one symbol")
                .with_key_fields(&[KeyField::Ticker]),
        );
        catalog.register(
            WorkflowDefinition::new(
                EQUITY_ANALYSIS,
                Topology::Concurrent,
                &["price_history", "sentiment", "fundamentals", "risk_metrics"],
            )
            .with_description("Independent analyses of the same symbols, run in parallel")
            .with_key_fields(&[KeyField::Tickers]),
        );
        catalog.register(
            WorkflowDefinition::new(
                RESEARCH,
                Topology::Sequential,
                &["news_research", "fundamentals", "synthesis"],
            )
            .with_description("Research chain where each step reads the previous findings")
            .with_key_fields(&[KeyField::Query, KeyField::Tickers]),
        );
        catalog.register(
            WorkflowDefinition::new(
                ADVISOR,
                Topology::Handoff,
                &["triage", "risk_metrics", "sentiment", "synthesis"],
            )
            .with_description("Triage agent that hands off to specialists")
            .with_entry("triage")
            .with_key_fields(&[KeyField::Query, KeyField::Tickers]),
        );

        catalog
    }

    /// Replaces an existing definition with the same id
    pub fn register(&mut self, definition: WorkflowDefinition) {
        if !self.workflows.contains_key(&definition.workflow_id) {
            self.order.push(definition.workflow_id.clone());
        }
        self.workflows
            .insert(definition.workflow_id.clone(), definition);
    }

    pub fn get(&self, workflow_id: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(workflow_id)
    }

    pub fn require(&self, workflow_id: &str) -> Result<&WorkflowDefinition> {
        self.get(workflow_id).ok_or_else(|| {
            EngineError::Configuration(format!("unknown workflow '{}'", workflow_id))
        })
    }

    pub fn list(&self) -> Vec<&WorkflowDefinition> {
        self.order
            .iter()
            .filter_map(|id| self.workflows.get(id))
            .collect()
    }

    /// Every executor a workflow names must be registered
    pub fn validate(&self, registry: &ExecutorRegistry) -> Result<()> {
        for definition in self.list() {
            for executor in &definition.executors {
                if !registry.contains(executor) {
                    return Err(EngineError::Configuration(format!(
                        "workflow '{}' requires unregistered executor '{}'",
                        definition.workflow_id, executor
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for WorkflowCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
