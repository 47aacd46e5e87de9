//! Per-request metrics: timeline events, executor records, cache checks
//!
//! A collector is owned by exactly one in-flight request. Concurrent
//! fan-out hands results back to the owner, which records them.

pub mod cost;

pub use cost::{estimate_tokens, BaselineStep, CostModel, ModelPricing};

use crate::models::{
    CacheCheck, CacheLayer, CostBreakdown, Event, EventStatus, EventType, ExecutionStatus,
    TaskExecutionRecord, Timeline,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

struct OpenEvent {
    event_type: EventType,
    name: String,
    start_time: DateTime<Utc>,
    started: Instant,
    metadata: Value,
}

/// Hit/miss totals for one cache layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerSummary {
    pub checks: u64,
    pub hits: u64,
    pub cost_saved: f64,
}

pub struct MetricsCollector {
    request_id: Uuid,
    started: Instant,
    cost_model: Arc<CostModel>,
    open: HashMap<Uuid, OpenEvent>,
    events: Vec<Event>,
    tasks: Vec<TaskExecutionRecord>,
    cache_checks: Vec<CacheCheck>,
}

impl MetricsCollector {
    pub fn new(cost_model: Arc<CostModel>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started: Instant::now(),
            cost_model,
            open: HashMap::new(),
            events: Vec::new(),
            tasks: Vec::new(),
            cache_checks: Vec::new(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    //
    // ================= Events =================
    //

    pub fn start_event(&mut self, event_type: EventType, name: &str) -> Uuid {
        self.start_event_with(event_type, name, Value::Null)
    }

    pub fn start_event_with(&mut self, event_type: EventType, name: &str, metadata: Value) -> Uuid {
        let id = Uuid::new_v4();
        self.open.insert(
            id,
            OpenEvent {
                event_type,
                name: name.to_string(),
                start_time: Utc::now(),
                started: Instant::now(),
                metadata,
            },
        );
        id
    }

    /// Close an event. Unknown or already-closed ids return `None`.
    pub fn end_event(
        &mut self,
        event_id: Uuid,
        status: EventStatus,
        metadata: Option<Value>,
    ) -> Option<Duration> {
        let Some(open) = self.open.remove(&event_id) else {
            warn!(%event_id, "end_event for unknown event");
            return None;
        };

        let duration = open.started.elapsed();
        self.events.push(Event {
            id: event_id,
            event_type: open.event_type,
            name: open.name,
            start_time: open.start_time,
            end_time: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            status,
            metadata: merge_metadata(open.metadata, metadata),
        });

        Some(duration)
    }

    /// Record an event that was timed elsewhere (e.g. inside a spawned task)
    pub fn record_closed_event(
        &mut self,
        event_type: EventType,
        name: &str,
        start_time: DateTime<Utc>,
        duration: Duration,
        status: EventStatus,
        metadata: Value,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let end_time = chrono::Duration::from_std(duration)
            .map(|d| start_time + d)
            .unwrap_or(start_time);

        self.events.push(Event {
            id,
            event_type,
            name: name.to_string(),
            start_time,
            end_time,
            duration_ms: duration.as_millis() as u64,
            status,
            metadata,
        });
        id
    }

    /// Close anything still open, e.g. after the request deadline
    pub fn close_open_events(&mut self, status: EventStatus) -> usize {
        let ids: Vec<Uuid> = self.open.keys().copied().collect();
        for id in &ids {
            self.end_event(*id, status, None);
        }
        ids.len()
    }

    //
    // ================= Executors & Caches =================
    //

    /// Append a record; `index` is assigned in recording order
    #[allow(clippy::too_many_arguments)]
    pub fn record_task_execution(
        &mut self,
        executor_name: &str,
        duration: Duration,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        status: ExecutionStatus,
        cached: bool,
        error: Option<String>,
    ) -> &TaskExecutionRecord {
        let index = self.tasks.len();
        self.tasks.push(TaskExecutionRecord {
            executor_name: executor_name.to_string(),
            index,
            duration_ms: duration.as_millis() as u64,
            input_tokens,
            output_tokens,
            cost,
            status,
            cached,
            error,
        });
        &self.tasks[index]
    }

    pub fn record_cache_check(
        &mut self,
        layer: CacheLayer,
        hit: bool,
        similarity: Option<f32>,
        duration: Duration,
        cost_saved: f64,
    ) {
        self.cache_checks.push(CacheCheck {
            layer: layer.as_str().to_string(),
            hit,
            similarity,
            duration_ms: duration.as_millis() as u64,
            cost_saved: if hit { cost_saved.max(0.0) } else { 0.0 },
        });
    }

    pub fn records(&self) -> &[TaskExecutionRecord] {
        &self.tasks
    }

    pub fn cache_checks(&self) -> &[CacheCheck] {
        &self.cache_checks
    }

    pub fn any_cache_hit(&self) -> bool {
        self.cache_checks.iter().any(|c| c.hit)
    }

    pub fn cache_breakdown(&self) -> BTreeMap<String, LayerSummary> {
        let mut breakdown: BTreeMap<String, LayerSummary> = BTreeMap::new();
        for check in &self.cache_checks {
            let layer = breakdown.entry(check.layer.clone()).or_default();
            layer.checks += 1;
            if check.hit {
                layer.hits += 1;
                layer.cost_saved += check.cost_saved;
            }
        }
        breakdown
    }

    //
    // ================= Summaries =================
    //

    /// Realized cost against the zero-cache baseline.
    ///
    /// The baseline is the workflow profile, raised to at least
    /// `actual + saved` so savings are never negative. `savings_pct` is a
    /// percentage in [0, 100].
    pub fn calculate_costs(&self, workflow_id: Option<&str>) -> CostBreakdown {
        let mut cost_per_executor: BTreeMap<String, f64> = BTreeMap::new();
        let mut actual_cost = 0.0;
        for record in &self.tasks {
            actual_cost += record.cost;
            *cost_per_executor
                .entry(record.executor_name.clone())
                .or_insert(0.0) += record.cost;
        }

        let saved: f64 = self.cache_checks.iter().map(|c| c.cost_saved).sum();
        let profile = workflow_id
            .map(|id| self.cost_model.baseline_cost(id))
            .unwrap_or(0.0);
        let baseline_cost = profile.max(actual_cost + saved);

        let savings = (baseline_cost - actual_cost).max(0.0);
        let savings_pct = if baseline_cost > 0.0 {
            savings / baseline_cost * 100.0
        } else {
            0.0
        };

        CostBreakdown {
            actual_cost,
            baseline_cost,
            savings,
            savings_pct,
            cost_per_executor,
        }
    }

    pub fn get_timeline(&self) -> Timeline {
        let mut events = self.events.clone();
        events.sort_by_key(|e| e.start_time);

        Timeline {
            total_duration_ms: self.started.elapsed().as_millis() as u64,
            events,
        }
    }
}

fn merge_metadata(base: Value, extra: Option<Value>) -> Value {
    match (base, extra) {
        (base, None) => base,
        (Value::Object(mut base), Some(Value::Object(extra))) => {
            base.extend(extra);
            Value::Object(base)
        }
        (_, Some(extra)) => extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(Arc::new(CostModel::new()))
    }

    #[test]
    fn test_event_lifecycle() {
        let mut metrics = collector();
        let id = metrics.start_event_with(EventType::CacheCheck, "semantic", json!({"a": 1}));
        let duration = metrics.end_event(id, EventStatus::Miss, Some(json!({"b": 2})));
        assert!(duration.is_some());

        // Closed events are immutable
        assert!(metrics.end_event(id, EventStatus::Hit, None).is_none());

        let timeline = metrics.get_timeline();
        assert_eq!(timeline.events.len(), 1);
        assert_eq!(timeline.events[0].status, EventStatus::Miss);
        assert_eq!(timeline.events[0].metadata, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_record_indexes_follow_recording_order() {
        let mut metrics = collector();
        metrics.record_task_execution(
            "sentiment",
            Duration::from_millis(10),
            100,
            50,
            0.01,
            ExecutionStatus::Success,
            false,
            None,
        );
        let record = metrics.record_task_execution(
            "risk_metrics",
            Duration::from_millis(5),
            0,
            0,
            0.0,
            ExecutionStatus::Timeout,
            false,
            Some("timed out".into()),
        );
        assert_eq!(record.index, 1);
        assert_eq!(metrics.records().len(), 2);
    }

    #[test]
    fn test_savings_never_negative_with_cache_hit() {
        let mut metrics = collector();
        metrics.record_cache_check(CacheLayer::Tool, true, None, Duration::from_millis(1), 0.5);
        metrics.record_task_execution(
            "synthesis",
            Duration::from_millis(10),
            1000,
            1000,
            0.2,
            ExecutionStatus::Success,
            false,
            None,
        );

        // Baseline profile for quote is tiny; the floor keeps actual <= baseline
        let costs = metrics.calculate_costs(Some("quote"));
        assert!(costs.actual_cost <= costs.baseline_cost);
        assert!((costs.baseline_cost - 0.7).abs() < 1e-9);
        assert!((costs.savings - 0.5).abs() < 1e-9);
        assert!((costs.savings_pct - 0.5 / 0.7 * 100.0).abs() < 1e-9);
        assert!(costs.savings_pct > 1.0);
        assert_eq!(costs.cost_per_executor.get("synthesis"), Some(&0.2));
    }

    #[test]
    fn test_zero_baseline_has_zero_pct() {
        let metrics = collector();
        let costs = metrics.calculate_costs(None);
        assert_eq!(costs.baseline_cost, 0.0);
        assert_eq!(costs.savings_pct, 0.0);
    }

    #[test]
    fn test_full_cache_hit_saves_whole_baseline() {
        let mut metrics = collector();
        metrics.record_cache_check(CacheLayer::WorkflowOutcome, true, None, Duration::ZERO, 0.0);
        let costs = metrics.calculate_costs(Some("equity_analysis"));
        assert_eq!(costs.actual_cost, 0.0);
        assert!(costs.baseline_cost > 0.0);
        assert!((costs.savings_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_breakdown() {
        let mut metrics = collector();
        metrics.record_cache_check(CacheLayer::Semantic, false, Some(0.4), Duration::ZERO, 0.0);
        metrics.record_cache_check(CacheLayer::Tool, true, None, Duration::ZERO, 0.01);
        metrics.record_cache_check(CacheLayer::Tool, false, None, Duration::ZERO, 0.0);

        let breakdown = metrics.cache_breakdown();
        assert_eq!(breakdown["semantic"].hits, 0);
        assert_eq!(breakdown["tool"].checks, 2);
        assert_eq!(breakdown["tool"].hits, 1);
        assert!(metrics.any_cache_hit());
    }
}
