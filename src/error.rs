//! Error types for the caching and orchestration engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Engine Taxonomy
    // =============================

    /// Fatal: surfaced immediately, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Executor failure ({executor}): {message}")]
    ExecutorFailure { executor: String, message: String },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("No route for query: {0}")]
    RoutingAmbiguous(String),

    #[error("Timed out after {elapsed_ms} ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    // =============================
    // Collaborator Errors
    // =============================

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn executor(executor: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ExecutorFailure {
            executor: executor.into(),
            message: message.into(),
        }
    }

    /// Only configuration problems abort a request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration(_) => ErrorKind::Configuration,
            EngineError::ExecutorFailure { .. } => ErrorKind::ExecutorFailure,
            EngineError::RoutingAmbiguous(_) => ErrorKind::RoutingAmbiguous,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Http(_) => ErrorKind::ExecutorFailure,
            EngineError::CacheUnavailable(_)
            | EngineError::Store(_)
            | EngineError::Database(_)
            | EngineError::Sql(_) => ErrorKind::CacheUnavailable,
            EngineError::Embedding(_)
            | EngineError::Serialization(_)
            | EngineError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Classification carried in a response's `errors[]` list
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    ExecutorFailure,
    CacheUnavailable,
    RoutingAmbiguous,
    Timeout,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(EngineError::Configuration("dim".into()).is_fatal());
        assert!(!EngineError::executor("sentiment", "boom").is_fatal());
        assert!(!EngineError::CacheUnavailable("down".into()).is_fatal());
        assert!(!EngineError::Timeout {
            operation: "risk_metrics".into(),
            elapsed_ms: 10
        }
        .is_fatal());
    }

    #[test]
    fn test_store_errors_classify_as_cache_unavailable() {
        assert_eq!(
            EngineError::Store("connection refused".into()).kind(),
            ErrorKind::CacheUnavailable
        );
        assert_eq!(
            EngineError::Timeout {
                operation: "x".into(),
                elapsed_ms: 1
            }
            .kind(),
            ErrorKind::Timeout
        );
    }
}
