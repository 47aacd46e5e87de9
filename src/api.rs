//! Operator HTTP surface
//!
//! Thin axum layer over the engine: submit queries, list routes, inspect
//! tool cache counters and clear cache namespaces.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::models::EngineRequest;
use crate::store::Namespace;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiReply = (StatusCode, Json<ApiResponse>);

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Query Endpoint
/// =============================

async fn run_query(State(state): State<ApiState>, Json(req): Json<EngineRequest>) -> ApiReply {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("query must not be empty".to_string())),
        );
    }

    info!(query = %req.query, "Received query");

    match state.engine.handle(req).await {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => {
            warn!(error = %e, "Query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Query failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Cache & Route Endpoints
/// =============================

async fn list_routes(State(state): State<ApiState>) -> ApiReply {
    let routes = state.engine.list_routes().await;
    (StatusCode::OK, Json(ApiResponse::success(routes)))
}

async fn cache_stats(State(state): State<ApiState>) -> ApiReply {
    let stats = state.engine.tool_cache_stats().await;
    let tools: serde_json::Map<String, serde_json::Value> = stats
        .into_iter()
        .map(|(tool, s)| {
            let hit_rate = s.hit_rate();
            (
                tool,
                serde_json::json!({
                    "hits": s.hits,
                    "misses": s.misses,
                    "writes": s.writes,
                    "errors": s.errors,
                    "hit_rate": hit_rate,
                }),
            )
        })
        .collect();

    (StatusCode::OK, Json(ApiResponse::success(tools)))
}

async fn clear_cache(State(state): State<ApiState>, Path(namespace): Path<String>) -> ApiReply {
    let namespace = match Namespace::from_str(&namespace) {
        Ok(namespace) => namespace,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string()))),
    };

    match state.engine.clear_namespace(namespace).await {
        Ok(removed) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "namespace": namespace.prefix(),
                "removed": removed,
            }))),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error(format!("Clear failed: {}", e))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<Engine>) -> Router {
    let state = ApiState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(run_query))
        .route("/api/routes", get(list_routes))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/:namespace", delete(clear_cache))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<Engine>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineContext;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let engine = Engine::new(EngineContext::in_memory(EngineConfig::default())).unwrap();
        create_router(Arc::new(engine))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_query_returns_envelope() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "price of AAPL"}"#))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], serde_json::json!(true));
        assert_eq!(body["data"]["workflow_id"], serde_json::json!("quote"));
        assert_eq!(body["data"]["cached"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/query")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "  "}"#))
            .unwrap();

        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_clear_unknown_namespace() {
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/cache/bogus")
            .body(Body::empty())
            .unwrap();

        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/cache/tool")
            .body(Body::empty())
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["namespace"], serde_json::json!("tool:"));
    }

    #[tokio::test]
    async fn test_routes_list_seeds() {
        let response = router()
            .oneshot(Request::builder().uri("/api/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 4);
    }
}
