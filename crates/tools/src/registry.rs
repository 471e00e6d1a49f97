//! Name → adapter registry.
//!
//! `dispatch` is the engine's only entry into tool execution and never
//! raises past this boundary: unknown names, bad inputs, and backend
//! failures all come back as `tool_result` content blocks the model can
//! see and react to on its next round.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use rawi_domain::content::{ContentBlock, FailureKind, ToolDefinition, ToolResultContent};
use rawi_domain::error::{Error, Result};

use crate::{SearchError, SearchTool};

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn SearchTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Called once per tool at engine construction;
    /// a duplicate name is a configuration error.
    pub fn register(&mut self, tool: Arc<dyn SearchTool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(Error::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Definitions for the tools named in `enabled`, in registry order.
    /// A name that matches nothing is skipped with a warning; a typo in
    /// the enabled list would otherwise hide a tool silently.
    pub fn definitions_for(&self, enabled: &[String]) -> Vec<ToolDefinition> {
        for name in enabled {
            if !self.tools.contains_key(name) {
                tracing::warn!(tool = %name, "enabled tool is not registered");
            }
        }
        self.tools
            .values()
            .filter(|t| enabled.iter().any(|n| n == t.name()))
            .map(|t| t.definition())
            .collect()
    }

    /// Execute one tool call and wrap the outcome as a `tool_result`
    /// block. Failures are data, not errors.
    pub async fn dispatch(&self, tool_use_id: &str, name: &str, input: &Value) -> ContentBlock {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = %name, "dispatch to unregistered tool");
            return ContentBlock::tool_failure(
                tool_use_id,
                FailureKind::NotFound,
                format!("no tool named '{name}' is registered"),
            );
        };

        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            return ContentBlock::tool_failure(
                tool_use_id,
                FailureKind::InvalidQuery,
                "input is missing the required 'query' string",
            );
        };
        let language_hint = input.get("language_hint").and_then(|v| v.as_str());

        match tool.search(query, language_hint).await {
            Ok(passages) => {
                tracing::debug!(tool = %name, hits = passages.len(), "search completed");
                ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.to_string(),
                    content: ToolResultContent::Passages { passages },
                    is_error: false,
                }
            }
            Err(SearchError::Transient(msg)) => {
                tracing::warn!(tool = %name, error = %msg, "transient search failure");
                ContentBlock::tool_failure(tool_use_id, FailureKind::Transient, msg)
            }
            Err(SearchError::InvalidQuery(msg)) => {
                tracing::warn!(tool = %name, error = %msg, "query rejected");
                ContentBlock::tool_failure(tool_use_id, FailureKind::InvalidQuery, msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawi_domain::content::Passage;

    struct StubTool {
        name: &'static str,
        outcome: std::result::Result<Vec<Passage>, SearchError>,
    }

    #[async_trait::async_trait]
    impl SearchTool for StubTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "stub corpus"
        }
        async fn search(
            &self,
            _query: &str,
            _language_hint: Option<&str>,
        ) -> std::result::Result<Vec<Passage>, SearchError> {
            self.outcome.clone()
        }
    }

    fn passage() -> Passage {
        Passage {
            text: "text".into(),
            title: "title".into(),
            language: "ar".into(),
            source_id: "1".into(),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "search_quran",
                outcome: Ok(vec![]),
            }))
            .unwrap();
        let err = registry
            .register(Arc::new(StubTool {
                name: "search_quran",
                outcome: Ok(vec![]),
            }))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTool(_)));
    }

    #[test]
    fn definitions_respect_enabled_set() {
        let mut registry = ToolRegistry::new();
        for name in ["search_quran", "search_hadith", "search_encyclopedia"] {
            registry
                .register(Arc::new(StubTool {
                    name: Box::leak(name.to_string().into_boxed_str()),
                    outcome: Ok(vec![]),
                }))
                .unwrap();
        }
        let defs = registry.definitions_for(&["search_hadith".to_string()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "search_hadith");
    }

    #[test]
    fn unregistered_enabled_name_does_not_affect_the_rest() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "search_quran",
                outcome: Ok(vec![]),
            }))
            .unwrap();
        let defs = registry.definitions_for(&[
            "search_quran".to_string(),
            "search_qurna".to_string(), // typo: warned, not fatal
        ]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "search_quran");
    }

    #[tokio::test]
    async fn dispatch_success_wraps_passages() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "search_quran",
                outcome: Ok(vec![passage()]),
            }))
            .unwrap();

        let block = registry
            .dispatch("tu_1", "search_quran", &serde_json::json!({"query": "patience"}))
            .await;
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content: ToolResultContent::Passages { passages },
                is_error,
            } => {
                assert_eq!(tool_use_id, "tu_1");
                assert_eq!(passages.len(), 1);
                assert!(!is_error);
            }
            other => panic!("expected passages, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_not_found_data() {
        let registry = ToolRegistry::new();
        let block = registry
            .dispatch("tu_1", "search_nothing", &serde_json::json!({"query": "x"}))
            .await;
        match block {
            ContentBlock::ToolResult {
                content: ToolResultContent::Failure { kind, .. },
                is_error,
                ..
            } => {
                assert_eq!(kind, FailureKind::NotFound);
                assert!(is_error);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_missing_query_is_invalid_query() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "search_quran",
                outcome: Ok(vec![]),
            }))
            .unwrap();
        let block = registry
            .dispatch("tu_1", "search_quran", &serde_json::json!({"q": "typo"}))
            .await;
        assert!(matches!(
            block,
            ContentBlock::ToolResult {
                content: ToolResultContent::Failure {
                    kind: FailureKind::InvalidQuery,
                    ..
                },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dispatch_transient_failure_is_retryable_data() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "search_hadith",
                outcome: Err(SearchError::Transient("connection reset".into())),
            }))
            .unwrap();
        let block = registry
            .dispatch("tu_9", "search_hadith", &serde_json::json!({"query": "mercy"}))
            .await;
        assert!(matches!(
            block,
            ContentBlock::ToolResult {
                content: ToolResultContent::Failure {
                    kind: FailureKind::Transient,
                    ..
                },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_result_list_is_success_not_error() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(StubTool {
                name: "search_quran",
                outcome: Ok(vec![]),
            }))
            .unwrap();
        let block = registry
            .dispatch("tu_2", "search_quran", &serde_json::json!({"query": "obscure"}))
            .await;
        assert!(matches!(
            block,
            ContentBlock::ToolResult {
                content: ToolResultContent::Passages { passages },
                is_error: false,
                ..
            } if passages.is_empty()
        ));
    }
}
