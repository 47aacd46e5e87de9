use financial_agent_engine::{
    api::start_server,
    config::EngineConfig,
    embedding::{EmbeddingProvider, GeminiEmbeddingProvider, HashingEmbeddingProvider},
    engine::{Engine, EngineContext},
    executors::create_default_registry,
    store::{InMemoryStore, KeyValueStore, PostgresStore},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env()?;

    info!("🚀 Financial Agent Engine - API Server");
    info!("📍 Port: {}", config.api_port);

    let store: Arc<dyn KeyValueStore> = match config.database_url.as_deref() {
        Some(url) => {
            info!("🗄️  Using Postgres store");
            Arc::new(PostgresStore::connect_lazy(url)?)
        }
        None => {
            warn!("⚠️  POSTGRES_URL not set, caches are in-memory and per-process");
            Arc::new(InMemoryStore::new())
        }
    };

    let embeddings: Arc<dyn EmbeddingProvider> = match config.gemini_api_key.clone() {
        Some(key) => Arc::new(GeminiEmbeddingProvider::new(key, config.embedding_dimension)?),
        None => {
            warn!("⚠️  GEMINI_API_KEY not set, using hashing embeddings");
            Arc::new(HashingEmbeddingProvider::new(config.embedding_dimension))
        }
    };

    let executors = create_default_registry(&config)?;
    let port = config.api_port;

    let engine = Engine::new(EngineContext::new(config, store, embeddings, executors))?;
    let seeded = engine.initialize().await;
    info!(seeded, "✅ Engine initialized");

    info!("📡 Starting API server...");
    start_server(Arc::new(engine), port).await?;

    Ok(())
}
