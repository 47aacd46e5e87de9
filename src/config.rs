//! Engine configuration
//!
//! Loaded once at process start and handed to every component constructor.

use crate::error::EngineError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum cosine similarity for a semantic cache hit
    pub similarity_threshold: f32,
    /// Fixed embedding dimensionality for this deployment
    pub embedding_dimension: usize,
    pub semantic_ttl: Duration,
    /// Global ToolCache default when no tool family matches
    pub tool_default_ttl: Duration,
    pub workflow_outcome_ttl: Duration,
    /// `None` keeps learned routes until cleared
    pub route_ttl: Option<Duration>,
    pub route_similarity_threshold: f32,
    pub executor_timeout: Duration,
    pub request_deadline: Duration,
    pub max_handoffs: usize,
    pub database_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub financial_api_base_url: Option<String>,
    pub api_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            embedding_dimension: 768,
            semantic_ttl: Duration::from_secs(7 * 24 * 3600),
            tool_default_ttl: Duration::from_secs(300),
            workflow_outcome_ttl: Duration::from_secs(900),
            route_ttl: None,
            route_similarity_threshold: 0.90,
            executor_timeout: Duration::from_secs(300),
            request_deadline: Duration::from_secs(300),
            max_handoffs: 5,
            database_url: None,
            gemini_api_key: None,
            financial_api_base_url: None,
            api_port: 8080,
        }
    }
}

impl EngineConfig {
    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            similarity_threshold: parse_var(
                "ENGINE_SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            ),
            embedding_dimension: parse_var(
                "ENGINE_EMBEDDING_DIMENSION",
                defaults.embedding_dimension,
            ),
            semantic_ttl: secs_var("ENGINE_SEMANTIC_TTL_SECS", defaults.semantic_ttl),
            tool_default_ttl: secs_var("ENGINE_TOOL_TTL_SECS", defaults.tool_default_ttl),
            workflow_outcome_ttl: secs_var(
                "ENGINE_WORKFLOW_TTL_SECS",
                defaults.workflow_outcome_ttl,
            ),
            route_ttl: env::var("ENGINE_ROUTE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs),
            route_similarity_threshold: parse_var(
                "ENGINE_ROUTE_SIMILARITY_THRESHOLD",
                defaults.route_similarity_threshold,
            ),
            executor_timeout: secs_var(
                "ENGINE_EXECUTOR_TIMEOUT_SECS",
                defaults.executor_timeout,
            ),
            request_deadline: secs_var(
                "ENGINE_REQUEST_DEADLINE_SECS",
                defaults.request_deadline,
            ),
            max_handoffs: parse_var("ENGINE_MAX_HANDOFFS", defaults.max_handoffs),
            database_url: env::var("POSTGRES_URL")
                .or_else(|_| env::var("DATABASE_URL"))
                .ok()
                .filter(|v| !v.trim().is_empty()),
            gemini_api_key: env::var("GEMINI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            financial_api_base_url: env::var("FINANCIAL_API_BASE_URL")
                .or_else(|_| env::var("TOOLS_API_BASE_URL"))
                .ok()
                .map(|v| v.trim_end_matches('/').to_string()),
            api_port: env::var("PORT")
                .or_else(|_| env::var("API_PORT"))
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.api_port),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(EngineError::Configuration(format!(
                "similarity threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }

        if !(0.0..=1.0).contains(&self.route_similarity_threshold) {
            return Err(EngineError::Configuration(format!(
                "route similarity threshold must be within [0, 1], got {}",
                self.route_similarity_threshold
            )));
        }

        if self.embedding_dimension == 0 {
            return Err(EngineError::Configuration(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_embedding_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }

    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = deadline;
        self
    }

    pub fn with_max_handoffs(mut self, max_handoffs: usize) -> Self {
        self.max_handoffs = max_handoffs;
        self
    }
}

fn parse_var<T: FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, ?default, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn secs_var(name: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_var(name, default.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!((config.similarity_threshold - 0.92).abs() < f32::EPSILON);
        assert_eq!(config.semantic_ttl, Duration::from_secs(604_800));
        assert_eq!(config.workflow_outcome_ttl, Duration::from_secs(900));
        assert_eq!(config.max_handoffs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_threshold_is_configuration_error() {
        let config = EngineConfig::default().with_similarity_threshold(1.5);
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let config = EngineConfig::default().with_embedding_dimension(0);
        assert!(config.validate().is_err());
    }
}
