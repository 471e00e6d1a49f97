//! Conversation data model: messages, the closed content-block union,
//! retrieved passages, and tool definitions.
//!
//! Messages are append-only. The engine only ever pushes new messages
//! onto a turn; prior history is never mutated.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Passage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single retrieved text unit from a search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub title: String,
    /// ISO 639-1 language code of the passage text (e.g. "ar", "en").
    pub language: String,
    /// Backend-specific identifier (ayah key, hadith number, article id).
    pub source_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a tool call produced no passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No tool with the requested name is registered.
    NotFound,
    /// The streamed tool input never parsed as JSON.
    MalformedInput,
    /// Network/timeout failure; a future round may retry.
    Transient,
    /// The query shape was rejected by the backend.
    InvalidQuery,
    /// The call was rejected by the per-turn call budget.
    QuotaExceeded,
}

/// Payload of a tool result: ranked passages on success, a typed
/// failure otherwise. Failures are data the model can react to, never
/// errors that escape the engine.
///
/// Tagged `outcome` rather than `kind`: the failure variant carries its
/// own `kind` field and the two must not collide on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolResultContent {
    Passages { passages: Vec<Passage> },
    Failure { kind: FailureKind, message: String },
}

/// One element of a message, a closed tagged union. Every consumer
/// matches exhaustively; there is deliberately no open-ended variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Internal reasoning. Never forwarded to search backends;
    /// optionally surfaced to the caller as events.
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    /// A resolved, deduplicated reference to a retrieved passage.
    Citation {
        cited_text: String,
        document_title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        translation: Option<String>,
    },
    /// A retrieved passage offered back to the model for
    /// citation-aware generation.
    Document {
        title: String,
        text: String,
        language: String,
        source_id: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_failure(
        tool_use_id: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: ToolResultContent::Failure {
                kind,
                message: message.into(),
            },
            is_error: true,
        }
    }

    pub fn from_passage(p: &Passage) -> Self {
        ContentBlock::Document {
            title: p.title.clone(),
            text: p.text.clone(),
            language: p.language.clone(),
            source_id: p.source_id.clone(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One turn element in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    /// True only for the single well-defined cancellation case where a
    /// partial assistant message is handed back explicitly flagged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![ContentBlock::text(text)],
            partial: false,
        }
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            blocks,
            partial: false,
        }
    }

    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Tool,
            blocks,
            partial: false,
        }
    }

    /// Concatenated plain text of all `Text` blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for b in &self.blocks {
            if let ContentBlock::Text { text } = b {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.as_str(), name.as_str(), input))
            }
            _ => None,
        })
    }
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pairing invariant
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Check the tool-use / tool-result pairing invariant over an ordered
/// message slice: every `ToolResult` must reference exactly one prior
/// `ToolUse` id, and by the end of the slice no `ToolUse` may be left
/// unresolved. A violation indicates a provider protocol error and the
/// engine fails fast on it.
pub fn validate_tool_pairing(messages: &[Message]) -> Result<()> {
    let mut open: HashSet<&str> = HashSet::new();
    let mut resolved: HashSet<&str> = HashSet::new();

    for msg in messages {
        for block in &msg.blocks {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    if !open.insert(id.as_str()) || resolved.contains(id.as_str()) {
                        return Err(Error::Protocol(format!(
                            "duplicate tool_use id {id}"
                        )));
                    }
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    if !open.remove(tool_use_id.as_str()) {
                        return Err(Error::Protocol(format!(
                            "tool_result {tool_use_id} pairs with no prior tool_use"
                        )));
                    }
                    resolved.insert(tool_use_id.as_str());
                }
                _ => {}
            }
        }
    }

    if let Some(id) = open.iter().next() {
        return Err(Error::Protocol(format!("tool_use {id} left unresolved")));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
