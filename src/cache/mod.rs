//! Cache layers: semantic responses, tool results, workflow outcomes

pub mod keys;
pub mod semantic;
pub mod tool;
pub mod workflow;

pub use semantic::{SemanticCache, SemanticLookup};
pub use tool::{ToolCache, ToolCacheStats, ToolFamily};
pub use workflow::{OutcomeExtras, WorkflowOutcomeStore};
