//! Core data models for the caching and orchestration engine

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
    Timeout,
    Hit,
    Miss,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Request,
    Embedding,
    CacheCheck,
    Routing,
    Workflow,
    TaskExecution,
    Persist,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    #[default]
    Sequential,
    Concurrent,
    Handoff,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CacheLayer {
    Semantic,
    Tool,
    WorkflowOutcome,
}

impl CacheLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLayer::Semantic => "semantic",
            CacheLayer::Tool => "tool",
            CacheLayer::WorkflowOutcome => "workflow_outcome",
        }
    }
}

//
// ================= Cache Entries =================
//

/// Semantic cache entry for a whole-request response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub embedding_vector: Vec<f32>,
    pub original_request_text: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub usage_count: u64,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        is_expired(self.created_at, self.ttl_secs)
    }

    pub fn remaining_ttl(&self) -> Option<Duration> {
        remaining_ttl(self.created_at, self.ttl_secs)
    }
}

/// Deterministic per-tool result cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCacheEntry {
    pub composite_key: String,
    pub tool_name: String,
    pub value: Value,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Cost paid when the value was computed
    #[serde(default)]
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    #[serde(default)]
    pub hit_count: u64,
}

impl ToolCacheEntry {
    pub fn is_expired(&self) -> bool {
        is_expired(self.created_at, self.ttl_secs)
    }

    pub fn remaining_ttl(&self) -> Option<Duration> {
        remaining_ttl(self.created_at, self.ttl_secs)
    }
}

/// Memoized output of a complete workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub key_hash: String,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl WorkflowOutcome {
    pub fn is_expired(&self) -> bool {
        is_expired(self.created_at, self.ttl_secs)
    }
}

/// Whole seconds for an entry's recorded TTL, rounded up so a sub-second
/// TTL never records as already expired
pub fn ttl_secs_ceil(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

fn is_expired(created_at: DateTime<Utc>, ttl_secs: u64) -> bool {
    let age = Utc::now().signed_duration_since(created_at).num_milliseconds();
    age >= (ttl_secs as i64).saturating_mul(1000)
}

fn remaining_ttl(created_at: DateTime<Utc>, ttl_secs: u64) -> Option<Duration> {
    let age_ms = Utc::now()
        .signed_duration_since(created_at)
        .num_milliseconds()
        .max(0) as u64;
    let ttl_ms = ttl_secs.saturating_mul(1000);
    if age_ms >= ttl_ms {
        None
    } else {
        Some(Duration::from_millis(ttl_ms - age_ms))
    }
}

//
// ================= Routing =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub trigger_patterns: Vec<String>,
    pub workflow_id: String,
    pub required_task_executors: Vec<String>,
    #[serde(default)]
    pub usage_count: u64,
    /// "seed" for the static table, otherwise whoever recorded it
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Route {
    pub fn is_seed(&self) -> bool {
        self.source == "seed"
    }
}

//
// ================= Metrics =================
//

/// Closed timeline event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: EventStatus,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub executor_name: String,
    pub index: usize,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub status: ExecutionStatus,
    /// Served from the ToolCache
    #[serde(default)]
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCheck {
    pub layer: String,
    pub hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub duration_ms: u64,
    pub cost_saved: f64,
}

//
// ================= Executor I/O =================
//

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What a task executor hands back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub success: bool,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl TaskResponse {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            message: None,
            usage: None,
        }
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: Value::Object(Default::default()),
            message: Some(message.into()),
            usage: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            input_tokens,
            output_tokens,
        });
        self
    }

    /// Text handed to downstream executors
    pub fn narrative(&self) -> String {
        match &self.message {
            Some(message) if !message.is_empty() => message.clone(),
            _ => self.payload.to_string(),
        }
    }

    /// Explicit next-hop signal for handoff chains
    pub fn handoff_target(&self) -> Option<&str> {
        self.payload
            .get("handoff_to")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

//
// ================= Request / Response =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineRequest {
    pub query: String,
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
    /// Entry executor override for handoff workflows
    #[serde(default)]
    pub start_executor: Option<String>,
}

impl EngineRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub actual_cost: f64,
    pub baseline_cost: f64,
    pub savings: f64,
    /// Percentage in 0..=100 (`100 * savings / baseline_cost`), not a ratio
    pub savings_pct: f64,
    pub cost_per_executor: std::collections::BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub total_duration_ms: u64,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub request_id: Uuid,
    pub query: String,
    pub workflow_id: Option<String>,
    pub route_id: Option<String>,
    pub route_source: Option<String>,
    pub cached: bool,
    pub cache_layer: Option<CacheLayer>,
    pub result: Value,
    pub final_answer: Option<String>,
    pub records: Vec<TaskExecutionRecord>,
    pub errors: Vec<ResponseError>,
    pub pattern: Option<Topology>,
    pub costs: CostBreakdown,
    pub timeline: Timeline,
    pub total_duration_ms: u64,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Topology::Sequential => "sequential",
            Topology::Concurrent => "concurrent",
            Topology::Handoff => "handoff",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}
