//! Search tool adapters: the uniform capability wrapping one retrieval
//! backend, and the registry that dispatches tool calls by name.
//!
//! Adapter failures are data. `dispatch` always produces a
//! `tool_result` content block; nothing an adapter does can abort the
//! conversation turn.

mod registry;
mod vector;

pub use registry::ToolRegistry;
pub use vector::VectorSearchTool;

use rawi_domain::content::{Passage, ToolDefinition};

/// Why a search call produced no passages.
///
/// Transient failures (network, timeout) may succeed on a future round;
/// invalid queries will not.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// A uniform capability translating a free-text query into ranked
/// passages from one retrieval backend.
///
/// "No results" is an empty list, not an error.
#[async_trait::async_trait]
pub trait SearchTool: Send + Sync {
    /// Tool name exposed to the model (e.g. "search_quran").
    fn name(&self) -> &str;

    /// One-line corpus description handed to the model.
    fn description(&self) -> &str;

    /// Run one search. Exactly one outbound call per invocation.
    async fn search(
        &self,
        query: &str,
        language_hint: Option<&str>,
    ) -> Result<Vec<Passage>, SearchError>;

    /// The JSON Schema for the tool's input. All search tools share the
    /// same query shape.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Free-text search query"
                },
                "language_hint": {
                    "type": "string",
                    "description": "ISO 639-1 code of the query language, when known"
                }
            },
            "required": ["query"]
        })
    }

    /// The definition sent to the LLM provider.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}
