//! Top-level request handler
//!
//! REQUEST → EMBED → SEMANTIC? → ROUTE (or FALLBACK + LEARN) → OUTCOME? →
//! EXECUTE → PERSIST → COSTS → TELEMETRY
//!
//! Every component is built from one `EngineContext` created at startup.
//! Only configuration errors surface as `Err`; everything else is absorbed
//! into the response's `errors`.

use crate::cache::{OutcomeExtras, SemanticCache, ToolCache, ToolCacheStats, WorkflowOutcomeStore};
use crate::config::EngineConfig;
use crate::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
use crate::error::EngineError;
use crate::executors::{create_demo_registry, ExecutorRegistry};
use crate::metrics::{CostModel, MetricsCollector};
use crate::models::{
    CacheLayer, EngineRequest, EngineResponse, EventStatus, EventType, ResponseError, Route,
    TaskExecutionRecord, Topology,
};
use crate::orchestration::{OrchestrationExecutor, TaskRequest};
use crate::router::{FallbackSelector, PatternRouter, FALLBACK_SOURCE};
use crate::store::{self, InMemoryStore, KeyValueStore, Namespace};
use crate::telemetry::{LogTelemetrySink, RequestRecord, TelemetrySink};
use crate::workflows::{request_tickers, WorkflowCatalog};
use crate::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything the engine depends on, constructed once at process start
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    pub executors: Arc<ExecutorRegistry>,
    pub cost_model: Arc<CostModel>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl EngineContext {
    /// Cost model derived from the registry's executor models; telemetry
    /// goes to the log
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        executors: ExecutorRegistry,
    ) -> Self {
        let cost_model = Arc::new(executors.cost_model());
        Self {
            config,
            store,
            embeddings,
            executors: Arc::new(executors),
            cost_model,
            telemetry: Arc::new(LogTelemetrySink),
        }
    }

    /// In-memory store, hashing embeddings, demo executors
    pub fn in_memory(config: EngineConfig) -> Self {
        let embeddings = Arc::new(HashingEmbeddingProvider::new(config.embedding_dimension));
        Self::new(
            config,
            Arc::new(InMemoryStore::new()),
            embeddings,
            create_demo_registry(),
        )
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = Arc::new(cost_model);
        self
    }
}

/// Parts of a response decided before costs and timeline are attached
struct Resolution {
    workflow_id: Option<String>,
    route_id: Option<String>,
    route_source: Option<String>,
    cache_layer: Option<CacheLayer>,
    result: Value,
    final_answer: Option<String>,
    records: Vec<TaskExecutionRecord>,
    errors: Vec<ResponseError>,
    pattern: Option<Topology>,
}

impl Resolution {
    fn cached(layer: CacheLayer, workflow_id: Option<String>, result: Value) -> Self {
        Self {
            workflow_id,
            route_id: None,
            route_source: None,
            cache_layer: Some(layer),
            result,
            final_answer: None,
            records: Vec::new(),
            errors: Vec::new(),
            pattern: None,
        }
    }
}

pub struct Engine {
    context: EngineContext,
    semantic: SemanticCache,
    tool_cache: Arc<ToolCache>,
    outcomes: WorkflowOutcomeStore,
    router: PatternRouter,
    catalog: WorkflowCatalog,
    orchestrator: OrchestrationExecutor,
}

impl Engine {
    pub fn new(context: EngineContext) -> Result<Self> {
        Self::with_catalog(context, WorkflowCatalog::builtin())
    }

    /// Fails fast on invalid configuration, a provider/config dimension
    /// mismatch, or workflows naming unregistered executors
    pub fn with_catalog(context: EngineContext, catalog: WorkflowCatalog) -> Result<Self> {
        context.config.validate()?;

        let provider_dimension = context.embeddings.dimension();
        if provider_dimension != context.config.embedding_dimension {
            return Err(EngineError::Configuration(format!(
                "embedding provider produces {} dimensions, configured for {}",
                provider_dimension, context.config.embedding_dimension
            )));
        }

        catalog.validate(&context.executors)?;

        let config = &context.config;
        let tool_cache = Arc::new(ToolCache::new(context.store.clone(), config));
        let orchestrator = OrchestrationExecutor::new(
            context.executors.clone(),
            context.cost_model.clone(),
            Some(tool_cache.clone()),
            config,
        );

        info!(
            executors = context.executors.len(),
            workflows = catalog.list().len(),
            similarity_threshold = config.similarity_threshold,
            "Engine ready"
        );

        Ok(Self {
            semantic: SemanticCache::new(context.store.clone(), config),
            outcomes: WorkflowOutcomeStore::new(context.store.clone(), config),
            router: PatternRouter::new(context.store.clone(), config),
            tool_cache,
            catalog,
            orchestrator,
            context,
        })
    }

    /// Persist the seed routes so operators can list them with usage counts
    pub async fn initialize(&self) -> usize {
        self.router.seed_routes().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.context.config
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub async fn handle(&self, request: EngineRequest) -> Result<EngineResponse> {
        let started = Instant::now();
        let deadline = started + self.context.config.request_deadline;
        let query = request.query.trim().to_string();

        let mut metrics = MetricsCollector::new(self.context.cost_model.clone());
        let request_event = metrics.start_event_with(
            EventType::Request,
            "request",
            json!({"query": query}),
        );

        info!(request_id = %metrics.request_id(), query = %query, "Handling request");

        let resolution = self.resolve(&query, &request, &mut metrics, deadline).await;
        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(e) => {
                metrics.end_event(request_event, EventStatus::Error, None);
                warn!(request_id = %metrics.request_id(), error = %e, "Request failed");
                return Err(e);
            }
        };

        let status = if resolution.errors.is_empty() {
            EventStatus::Success
        } else {
            EventStatus::Error
        };
        metrics.end_event(request_event, status, None);
        metrics.close_open_events(EventStatus::Error);

        Ok(self.finish(query, metrics, resolution).await)
    }

    async fn resolve(
        &self,
        query: &str,
        request: &EngineRequest,
        metrics: &mut MetricsCollector,
        deadline: Instant,
    ) -> Result<Resolution> {
        // === EMBED ===
        let embed_event = metrics.start_event(EventType::Embedding, "embed");
        let embedding = match self.context.embeddings.embed(query).await {
            Ok(vector) if vector.len() == self.context.config.embedding_dimension => {
                metrics.end_event(embed_event, EventStatus::Success, None);
                Some(vector)
            }
            Ok(vector) => {
                metrics.end_event(embed_event, EventStatus::Error, None);
                return Err(EngineError::Configuration(format!(
                    "embedding has {} dimensions, expected {}",
                    vector.len(),
                    self.context.config.embedding_dimension
                )));
            }
            Err(e) => {
                warn!(error = %e, "Embedding failed, continuing without semantic layers");
                metrics.end_event(embed_event, EventStatus::Error, Some(json!({"error": e.to_string()})));
                None
            }
        };

        // === SEMANTIC CACHE ===
        if let Some(vector) = embedding.as_deref() {
            let lookup_started = Instant::now();
            let event = metrics.start_event(EventType::CacheCheck, CacheLayer::Semantic.as_str());
            let lookup = self.semantic.get(query, vector).await?;

            let workflow_id = lookup
                .metadata
                .get("workflow_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let cost_saved = if lookup.hit {
                self.saved_cost(workflow_id.as_deref(), &lookup.metadata)
            } else {
                0.0
            };

            metrics.end_event(
                event,
                if lookup.hit { EventStatus::Hit } else { EventStatus::Miss },
                Some(json!({"similarity": lookup.similarity})),
            );
            metrics.record_cache_check(
                CacheLayer::Semantic,
                lookup.hit,
                Some(lookup.similarity),
                lookup_started.elapsed(),
                cost_saved,
            );

            if lookup.hit {
                debug!(similarity = lookup.similarity, matched = ?lookup.matched_text, "Semantic hit");
                let metadata = lookup.metadata;
                let mut resolution = Resolution::cached(
                    CacheLayer::Semantic,
                    workflow_id,
                    lookup.response.unwrap_or(Value::Null),
                );
                resolution.route_id = metadata
                    .get("route_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                resolution.final_answer = metadata
                    .get("final_answer")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                resolution.pattern = metadata
                    .get("pattern")
                    .cloned()
                    .and_then(|p| serde_json::from_value(p).ok());
                return Ok(resolution);
            }
        }

        // === ROUTE ===
        let route_event = metrics.start_event(EventType::Routing, "route");
        let route = match self.router.find_route(query, embedding.as_deref()).await {
            Some(found) => {
                metrics.end_event(
                    route_event,
                    EventStatus::Hit,
                    Some(json!({
                        "route_id": found.route.route_id,
                        "matched_by": found.matched_by,
                        "similarity": found.similarity,
                    })),
                );
                found.route
            }
            None => {
                let route = self.learn_fallback_route(query, embedding.as_deref()).await?;
                metrics.end_event(
                    route_event,
                    EventStatus::Miss,
                    Some(json!({"route_id": route.route_id, "fallback": true})),
                );
                route
            }
        };

        let workflow = self.catalog.require(&route.workflow_id)?;
        let key_payload = workflow.key_payload(query, &request.context);

        // === WORKFLOW OUTCOME ===
        let lookup_started = Instant::now();
        let event = metrics.start_event(EventType::CacheCheck, CacheLayer::WorkflowOutcome.as_str());
        let memoized = self.outcomes.fetch(&workflow.workflow_id, &key_payload).await;
        let hit = memoized.is_some();
        let cost_saved = match &memoized {
            Some(outcome) => self.saved_cost(Some(&workflow.workflow_id), &outcome.metadata),
            None => 0.0,
        };
        metrics.end_event(event, if hit { EventStatus::Hit } else { EventStatus::Miss }, None);
        metrics.record_cache_check(
            CacheLayer::WorkflowOutcome,
            hit,
            None,
            lookup_started.elapsed(),
            cost_saved,
        );

        if let Some(outcome) = memoized {
            debug!(workflow_id = %workflow.workflow_id, "Workflow outcome hit");
            let mut resolution = Resolution::cached(
                CacheLayer::WorkflowOutcome,
                Some(workflow.workflow_id.clone()),
                outcome.result,
            );
            resolution.route_id = Some(route.route_id);
            resolution.route_source = Some(route.source);
            resolution.final_answer = outcome.final_answer;
            resolution.pattern = Some(workflow.topology);
            return Ok(resolution);
        }

        // === EXECUTE ===
        let task_request = TaskRequest {
            query: query.to_string(),
            tickers: request_tickers(query, &request.context),
            context: request.context.clone(),
            start_executor: request.start_executor.clone(),
        };

        let workflow_event = metrics.start_event_with(
            EventType::Workflow,
            &workflow.workflow_id,
            json!({"pattern": workflow.topology}),
        );
        let execution = self
            .orchestrator
            .execute_until(workflow, &task_request, metrics, deadline)
            .await;
        metrics.end_event(
            workflow_event,
            if execution.is_clean() { EventStatus::Success } else { EventStatus::Error },
            Some(json!({
                "records": execution.records.len(),
                "errors": execution.errors.len(),
                "deadline_exceeded": execution.deadline_exceeded,
            })),
        );

        // === PERSIST ===
        if execution.is_clean() {
            let persist_event = metrics.start_event(EventType::Persist, &workflow.workflow_id);
            let actual_cost: f64 = execution.records.iter().map(|r| r.cost).sum();
            let metadata = json!({
                "workflow_id": workflow.workflow_id,
                "route_id": route.route_id,
                "pattern": workflow.topology,
                "final_answer": execution.final_answer,
                "cost": actual_cost,
            });

            self.outcomes
                .store(
                    &workflow.workflow_id,
                    &key_payload,
                    execution.result.clone(),
                    OutcomeExtras {
                        final_answer: execution.final_answer.clone(),
                        metadata: Some(metadata.clone()),
                        ..Default::default()
                    },
                )
                .await;

            if let Some(vector) = embedding {
                self.semantic
                    .set(query, vector, execution.result.clone(), metadata)
                    .await?;
            }
            metrics.end_event(persist_event, EventStatus::Success, None);
        } else {
            debug!(
                workflow_id = %workflow.workflow_id,
                errors = execution.errors.len(),
                "Degraded result not persisted"
            );
        }

        Ok(Resolution {
            workflow_id: Some(workflow.workflow_id.clone()),
            route_id: Some(route.route_id),
            route_source: Some(route.source),
            cache_layer: None,
            result: execution.result,
            final_answer: execution.final_answer,
            records: execution.records,
            errors: execution.errors,
            pattern: Some(execution.pattern),
        })
    }

    /// No route matched: pick a workflow from coarse signals and record the
    /// decision so the next identical query routes directly
    async fn learn_fallback_route(&self, query: &str, embedding: Option<&[f32]>) -> Result<Route> {
        let decision = FallbackSelector::select(query);
        let workflow = self.catalog.require(decision.workflow_id)?;

        info!(
            workflow_id = %workflow.workflow_id,
            reason = decision.reason,
            "No route matched, using fallback workflow"
        );

        Ok(self
            .router
            .record_route(
                query,
                embedding,
                &decision.route_id(query),
                &workflow.workflow_id,
                &workflow.executors,
                FALLBACK_SOURCE,
            )
            .await)
    }

    /// What a cache hit avoided: the workflow's baseline, or the recorded
    /// cost of the run that produced the entry
    fn saved_cost(&self, workflow_id: Option<&str>, metadata: &Value) -> f64 {
        let recorded = metadata.get("cost").and_then(Value::as_f64).unwrap_or(0.0);
        let baseline = workflow_id
            .map(|id| self.context.cost_model.baseline_cost(id))
            .unwrap_or(0.0);
        baseline.max(recorded)
    }

    async fn finish(
        &self,
        query: String,
        metrics: MetricsCollector,
        resolution: Resolution,
    ) -> EngineResponse {
        let costs = metrics.calculate_costs(resolution.workflow_id.as_deref());
        let timeline = metrics.get_timeline();
        let cached = resolution.cache_layer.is_some();

        let record = RequestRecord {
            request_id: metrics.request_id(),
            query: query.clone(),
            workflow_id: resolution.workflow_id.clone(),
            route_source: resolution.route_source.clone(),
            cached,
            cache_breakdown: metrics.cache_breakdown(),
            costs: costs.clone(),
            timeline: timeline.clone(),
            errors: resolution.errors.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.context.telemetry.record(record).await {
            warn!(error = %e, "Telemetry sink rejected request record");
        }

        EngineResponse {
            request_id: metrics.request_id(),
            query,
            workflow_id: resolution.workflow_id,
            route_id: resolution.route_id,
            route_source: resolution.route_source,
            cached,
            cache_layer: resolution.cache_layer,
            result: resolution.result,
            final_answer: resolution.final_answer,
            records: resolution.records,
            errors: resolution.errors,
            pattern: resolution.pattern,
            costs,
            total_duration_ms: timeline.total_duration_ms,
            timeline,
        }
    }

    //
    // ===== Operator surface =====
    //

    pub async fn list_routes(&self) -> Vec<Route> {
        self.router.list_routes().await
    }

    pub async fn tool_cache_stats(&self) -> HashMap<String, ToolCacheStats> {
        self.tool_cache.stats().await
    }

    pub async fn clear_namespace(&self, namespace: Namespace) -> Result<usize> {
        let removed = store::clear_namespace(self.context.store.as_ref(), namespace).await?;
        info!(namespace = namespace.prefix(), removed, "Cache namespace cleared");
        Ok(removed)
    }
}
