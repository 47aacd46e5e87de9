//! Per-request telemetry records
//!
//! Every handled request emits one structured record with its timeline,
//! cache-layer breakdown and cost breakdown, for an external dashboard.

use crate::metrics::LayerSummary;
use crate::models::{CostBreakdown, ResponseError, Timeline};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: Uuid,
    pub query: String,
    pub workflow_id: Option<String>,
    pub route_source: Option<String>,
    pub cached: bool,
    pub cache_breakdown: BTreeMap<String, LayerSummary>,
    pub costs: CostBreakdown,
    pub timeline: Timeline,
    pub errors: Vec<ResponseError>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, record: RequestRecord) -> Result<()>;
}

/// Keeps records in memory, queryable by request id
pub struct InMemoryTelemetrySink {
    records: Arc<RwLock<HashMap<Uuid, RequestRecord>>>,
}

impl InMemoryTelemetrySink {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, request_id: Uuid) -> Option<RequestRecord> {
        self.records.read().await.get(&request_id).cloned()
    }

    /// Records ordered by creation time
    pub async fn list(&self) -> Vec<RequestRecord> {
        let records = self.records.read().await;
        let mut items: Vec<RequestRecord> = records.values().cloned().collect();
        items.sort_by_key(|r| r.created_at);
        items
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryTelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySink for InMemoryTelemetrySink {
    async fn record(&self, record: RequestRecord) -> Result<()> {
        self.records.write().await.insert(record.request_id, record);
        Ok(())
    }
}

/// Emits each record as one structured `tracing` event
pub struct LogTelemetrySink;

#[async_trait]
impl TelemetrySink for LogTelemetrySink {
    async fn record(&self, record: RequestRecord) -> Result<()> {
        let breakdown = serde_json::to_string(&record.cache_breakdown)?;
        info!(
            target: "engine::telemetry",
            request_id = %record.request_id,
            workflow_id = record.workflow_id.as_deref().unwrap_or("-"),
            route_source = record.route_source.as_deref().unwrap_or("-"),
            cached = record.cached,
            actual_cost = record.costs.actual_cost,
            baseline_cost = record.costs.baseline_cost,
            savings_pct = record.costs.savings_pct,
            events = record.timeline.events.len(),
            duration_ms = record.timeline.total_duration_ms,
            errors = record.errors.len(),
            cache = %breakdown,
            "Request completed"
        );
        Ok(())
    }
}
