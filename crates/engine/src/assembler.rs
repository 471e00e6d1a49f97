//! Streaming response assembler.
//!
//! Folds a provider event stream into an ordered assistant message:
//! text and thinking deltas accumulate into blocks, tool-input deltas
//! buffer per call id as raw JSON fragments, and citation markers are
//! surfaced as they arrive. Tool inputs are parsed only when the
//! provider closes the block; a buffer that never parses fails that one
//! call, not the turn.
//!
//! The async driver ([`drain`]) yields to the scheduler after every
//! event even when the next one is already buffered, so other tasks on
//! the runtime are never starved by a fast stream. It also checks the
//! cancel token between events.

use std::collections::HashMap;

use futures_util::StreamExt;

use rawi_domain::error::{Error, Result};
use rawi_domain::content::ContentBlock;
use rawi_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::cancel::CancelToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incremental output produced while assembling, forwarded to the
/// caller's event stream as it happens.
#[derive(Debug, Clone)]
pub enum AsmOutput {
    Token(String),
    Thinking(String),
    ToolCallBegin { id: String, name: String },
    Citation {
        cited_text: String,
        document_title: String,
    },
}

/// A fully assembled tool call ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// A tool call whose streamed input never parsed as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCall {
    pub id: String,
    pub name: String,
    pub raw: String,
}

/// Everything one model response contained, in arrival order.
#[derive(Debug, Default)]
pub struct Assembled {
    /// Ordered blocks of the assistant message (text, thinking,
    /// tool_use). Malformed calls appear here too, with a null input,
    /// so the pairing invariant still holds once their failure results
    /// are appended.
    pub blocks: Vec<ContentBlock>,
    /// Concatenated visible text.
    pub text: String,
    /// Parsed tool calls in arrival order.
    pub tool_calls: Vec<ToolCall>,
    /// Calls whose input never parsed; each costs one ledger slot.
    pub malformed: Vec<MalformedCall>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assembler state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ToolBuffer {
    name: String,
    json: String,
}

/// Pure event-folding state machine; the async concerns (yielding,
/// cancellation) live in [`drain`].
#[derive(Default)]
pub struct Assembler {
    out: Assembled,
    open_tools: HashMap<String, ToolBuffer>,
    done: bool,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fold one event, returning whatever should be surfaced to the
    /// caller immediately.
    pub fn ingest(&mut self, event: StreamEvent) -> Result<Vec<AsmOutput>> {
        match event {
            StreamEvent::Token { text } => {
                self.out.text.push_str(&text);
                match self.out.blocks.last_mut() {
                    Some(ContentBlock::Text { text: t }) => t.push_str(&text),
                    _ => self.out.blocks.push(ContentBlock::text(text.clone())),
                }
                Ok(vec![AsmOutput::Token(text)])
            }
            StreamEvent::Thinking { text } => {
                match self.out.blocks.last_mut() {
                    Some(ContentBlock::Thinking { text: t }) => t.push_str(&text),
                    _ => self
                        .out
                        .blocks
                        .push(ContentBlock::Thinking { text: text.clone() }),
                }
                Ok(vec![AsmOutput::Thinking(text)])
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                if self.open_tools.contains_key(&call_id) {
                    return Err(Error::Protocol(format!(
                        "tool call {call_id} started twice"
                    )));
                }
                self.open_tools.insert(
                    call_id.clone(),
                    ToolBuffer {
                        name: tool_name.clone(),
                        json: String::new(),
                    },
                );
                Ok(vec![AsmOutput::ToolCallBegin {
                    id: call_id,
                    name: tool_name,
                }])
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                let buf = self.open_tools.get_mut(&call_id).ok_or_else(|| {
                    Error::Protocol(format!("input delta for unknown tool call {call_id}"))
                })?;
                buf.json.push_str(&delta);
                Ok(vec![])
            }
            StreamEvent::ToolCallEnded { call_id } => {
                let buf = self.open_tools.remove(&call_id).ok_or_else(|| {
                    Error::Protocol(format!("tool call {call_id} ended but never started"))
                })?;
                self.close_tool(call_id, buf);
                Ok(vec![])
            }
            StreamEvent::CitationMarker {
                cited_text,
                document_title,
            } => Ok(vec![AsmOutput::Citation {
                cited_text,
                document_title,
            }]),
            StreamEvent::Done {
                usage,
                finish_reason,
            } => {
                self.out.usage = usage;
                self.out.finish_reason = finish_reason;
                self.done = true;
                Ok(vec![])
            }
            StreamEvent::Error { message } => Err(Error::Provider {
                provider: "stream".into(),
                message,
            }),
        }
    }

    /// Close the stream: unended tool buffers are closed as if the
    /// provider had ended them, then the accumulated message is handed
    /// back.
    pub fn finish(mut self) -> Assembled {
        // Stable order for buffers the provider never closed.
        let mut leftover: Vec<(String, ToolBuffer)> = self.open_tools.drain().collect();
        leftover.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, buf) in leftover {
            self.close_tool(id, buf);
        }
        self.out
    }

    fn close_tool(&mut self, id: String, buf: ToolBuffer) {
        // No-argument tools stream no input deltas at all.
        let raw = if buf.json.trim().is_empty() {
            "{}".to_string()
        } else {
            buf.json
        };
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(input) => {
                self.out.blocks.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: buf.name.clone(),
                    input: input.clone(),
                });
                self.out.tool_calls.push(ToolCall {
                    id,
                    name: buf.name,
                    input,
                });
            }
            Err(e) => {
                tracing::warn!(call_id = %id, tool = %buf.name, error = %e,
                    "tool input never parsed as JSON, failing this call only");
                self.out.blocks.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: buf.name.clone(),
                    input: serde_json::Value::Null,
                });
                self.out.malformed.push(MalformedCall {
                    id,
                    name: buf.name,
                    raw,
                });
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Async driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a drain ended.
pub enum DrainOutcome {
    Completed(Assembled),
    /// Cancellation was observed between events; whatever was
    /// assembled so far is handed back for explicit partial handling.
    Cancelled(Assembled),
}

/// Drive a provider stream through an [`Assembler`], invoking
/// `on_output` for every incremental output. Yields after every event
/// and checks `cancel` between events.
pub async fn drain<F>(
    mut stream: BoxStream<'static, Result<StreamEvent>>,
    cancel: &CancelToken,
    mut on_output: F,
) -> Result<DrainOutcome>
where
    F: FnMut(AsmOutput),
{
    let mut asm = Assembler::new();
    loop {
        if cancel.is_cancelled() {
            return Ok(DrainOutcome::Cancelled(asm.finish()));
        }
        let Some(event) = stream.next().await else {
            break;
        };
        for out in asm.ingest(event?)? {
            on_output(out);
        }
        let done = asm.is_done();
        tokio::task::yield_now().await;
        if done {
            break;
        }
    }
    Ok(DrainOutcome::Completed(asm.finish()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest_all(events: Vec<StreamEvent>) -> Assembled {
        let mut asm = Assembler::new();
        for ev in events {
            asm.ingest(ev).unwrap();
        }
        asm.finish()
    }

    #[test]
    fn text_tokens_coalesce_into_one_block() {
        let out = ingest_all(vec![
            StreamEvent::Token { text: "As".into() },
            StreamEvent::Token {
                text: " for patience".into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            },
        ]);
        assert_eq!(out.text, "As for patience");
        assert_eq!(out.blocks, vec![ContentBlock::text("As for patience")]);
        assert_eq!(out.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn blocks_keep_arrival_order_across_kinds() {
        let out = ingest_all(vec![
            StreamEvent::Thinking { text: "hm".into() },
            StreamEvent::Token { text: "Let me check.".into() },
            StreamEvent::ToolCallStarted {
                call_id: "tu_1".into(),
                tool_name: "search_quran".into(),
            },
            StreamEvent::ToolCallDelta {
                call_id: "tu_1".into(),
                delta: r#"{"query":"#.into(),
            },
            StreamEvent::ToolCallDelta {
                call_id: "tu_1".into(),
                delta: r#""patience"}"#.into(),
            },
            StreamEvent::ToolCallEnded {
                call_id: "tu_1".into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: Some("tool_calls".into()),
            },
        ]);
        assert_eq!(out.blocks.len(), 3);
        assert!(matches!(out.blocks[0], ContentBlock::Thinking { .. }));
        assert!(matches!(out.blocks[1], ContentBlock::Text { .. }));
        assert_eq!(
            out.tool_calls,
            vec![ToolCall {
                id: "tu_1".into(),
                name: "search_quran".into(),
                input: serde_json::json!({"query": "patience"}),
            }]
        );
        assert!(out.malformed.is_empty());
    }

    #[test]
    fn malformed_input_fails_that_call_only() {
        let out = ingest_all(vec![
            StreamEvent::ToolCallStarted {
                call_id: "tu_1".into(),
                tool_name: "search_quran".into(),
            },
            StreamEvent::ToolCallDelta {
                call_id: "tu_1".into(),
                delta: r#"{"query": "unterminated"#.into(),
            },
            StreamEvent::ToolCallEnded {
                call_id: "tu_1".into(),
            },
            StreamEvent::ToolCallStarted {
                call_id: "tu_2".into(),
                tool_name: "search_hadith".into(),
            },
            StreamEvent::ToolCallDelta {
                call_id: "tu_2".into(),
                delta: r#"{"query":"mercy"}"#.into(),
            },
            StreamEvent::ToolCallEnded {
                call_id: "tu_2".into(),
            },
            StreamEvent::Done {
                usage: None,
                finish_reason: Some("tool_calls".into()),
            },
        ]);
        assert_eq!(out.malformed.len(), 1);
        assert_eq!(out.malformed[0].id, "tu_1");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "tu_2");
        // Both calls still have tool_use blocks so pairing can close.
        let use_ids: Vec<_> = out
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(use_ids, vec!["tu_1", "tu_2"]);
    }

    #[test]
    fn empty_tool_input_defaults_to_empty_object() {
        let out = ingest_all(vec![
            StreamEvent::ToolCallStarted {
                call_id: "tu_1".into(),
                tool_name: "search_quran".into(),
            },
            StreamEvent::ToolCallEnded {
                call_id: "tu_1".into(),
            },
        ]);
        assert_eq!(out.tool_calls[0].input, serde_json::json!({}));
    }

    #[test]
    fn unended_tool_buffer_closes_at_finish() {
        let out = ingest_all(vec![
            StreamEvent::ToolCallStarted {
                call_id: "tu_1".into(),
                tool_name: "search_quran".into(),
            },
            StreamEvent::ToolCallDelta {
                call_id: "tu_1".into(),
                delta: r#"{"query":"patience"}"#.into(),
            },
            // Provider dropped the connection before content_block_stop.
        ]);
        assert_eq!(out.tool_calls.len(), 1);
    }

    #[test]
    fn delta_for_unknown_call_is_a_protocol_error() {
        let mut asm = Assembler::new();
        let err = asm
            .ingest(StreamEvent::ToolCallDelta {
                call_id: "tu_ghost".into(),
                delta: "{}".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn stream_error_event_becomes_provider_error() {
        let mut asm = Assembler::new();
        let err = asm
            .ingest(StreamEvent::Error {
                message: "overloaded".into(),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[tokio::test]
    async fn drain_surfaces_outputs_and_completes() {
        let stream: BoxStream<'static, Result<StreamEvent>> =
            Box::pin(async_stream::stream! {
                yield Ok(StreamEvent::Token { text: "hi".into() });
                yield Ok(StreamEvent::CitationMarker {
                    cited_text: "c".into(),
                    document_title: "T".into(),
                });
                yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
            });
        let mut seen = Vec::new();
        let outcome = drain(stream, &CancelToken::new(), |o| seen.push(o))
            .await
            .unwrap();
        let DrainOutcome::Completed(out) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(out.text, "hi");
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[1], AsmOutput::Citation { .. }));
    }

    #[tokio::test]
    async fn drain_stops_between_events_when_cancelled() {
        let cancel = CancelToken::new();
        let c2 = cancel.clone();
        let stream: BoxStream<'static, Result<StreamEvent>> =
            Box::pin(async_stream::stream! {
                c2.cancel();
                yield Ok(StreamEvent::Token { text: "partial".into() });
                yield Ok(StreamEvent::Token { text: " never seen".into() });
                yield Ok(StreamEvent::Done { usage: None, finish_reason: None });
            });
        let outcome = drain(stream, &cancel, |_| {}).await.unwrap();
        let DrainOutcome::Cancelled(out) = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(out.text, "partial");
    }
}
