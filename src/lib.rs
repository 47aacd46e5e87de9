//! Financial Agent Engine
//!
//! A caching and orchestration engine for financial agent workflows:
//! - Semantic cache over request embeddings
//! - Tool cache keyed by canonicalized executor parameters
//! - Memoized workflow outcomes
//! - Pattern routing with learned fallback routes
//! - Sequential, concurrent and handoff execution topologies
//! - Per-request timeline and cost accounting against a zero-cache baseline
//!
//! REQUEST FLOW:
//! EMBED → SEMANTIC? → ROUTE → OUTCOME? → EXECUTE → PERSIST → REPORT

pub mod api;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod executors;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod workflows;

pub use error::{EngineError, Result};

// Re-export common types
pub use engine::{Engine, EngineContext};
pub use models::*;
