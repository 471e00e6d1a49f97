//! The conversation turn loop.
//!
//! One turn is a finite state machine: await the model, stream its
//! response, then either finalize or dispatch the buffered tool calls
//! and loop. Tool execution is deferred until the model's end of turn
//! so visible text always precedes side effects; within a round the
//! adapter calls run concurrently but their results are appended in
//! request order. The per-turn [`CallLedger`] bounds the loop; a quota
//! breach ends the turn with a synthesized, never-empty final answer
//! built from whatever was already retrieved.
//!
//! `run_turn` hands back a [`TurnHandle`]: an unbounded event channel
//! that ends with exactly one terminal event (`Final`, `Stopped`, or
//! `Failed`) plus a cancel token checked at every suspension point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use rawi_domain::config::{Config, QuotaConfig};
use rawi_domain::content::{
    validate_tool_pairing, ContentBlock, FailureKind, Message, Passage, Role,
    ToolResultContent,
};
use rawi_domain::error::Result;
use rawi_domain::stream::Usage;
use rawi_providers::{is_transient, ChatRequest, LlmProvider};
use rawi_tools::ToolRegistry;

use crate::assembler::{self, AsmOutput, Assembled, DrainOutcome};
use crate::cancel::CancelToken;
use crate::citations::CitationExtractor;
use crate::ledger::{CallLedger, QuotaBreach};
use crate::translate::{SchedulerContext, Translator};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted over a turn's channel. Exactly one of `Final`,
/// `Stopped`, or `Failed` ends the sequence; `Usage` immediately
/// precedes `Final` when the turn completes.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Token { text: String },
    Thinking { text: String },
    ToolCallBegin { id: String, name: String },
    /// One resolved tool result, passages or typed failure.
    ToolResult { block: ContentBlock },
    Citation {
        cited_text: String,
        document_title: String,
    },
    Usage { usage: Usage },
    /// The turn finished; `messages` is everything appended this turn.
    Final { messages: Vec<Message> },
    /// Cancelled. `partial` is either absent or a single assistant
    /// message explicitly flagged `partial: true`.
    Stopped { partial: Option<Message> },
    Failed { reason: String },
}

/// Everything the caller supplies for one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    /// Prior conversation, untouched by the engine.
    pub history: Vec<Message>,
    pub user_message: String,
    pub system_instruction: Option<String>,
    /// Tool names the model may call this turn.
    pub enabled_tools: Vec<String>,
    /// Language citations should be readable in (e.g. "en").
    pub target_language: String,
}

/// Handle to a running turn.
pub struct TurnHandle {
    pub turn_id: Uuid,
    pub cancel: CancelToken,
    pub events: mpsc::UnboundedReceiver<TurnEvent>,
}

type EventTx = mpsc::UnboundedSender<TurnEvent>;

/// The conversation engine. Cheap to clone; every turn runs on its own
/// spawned task.
#[derive(Clone)]
pub struct Engine {
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    translator: Translator,
    quota: QuotaConfig,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        config: &Config,
    ) -> Self {
        let translator = Translator::new(
            provider.clone(),
            config.translation.model.clone(),
            config.translation.max_parallel,
        );
        Self {
            provider,
            registry,
            translator,
            quota: config.quota,
        }
    }

    /// Start one turn. The returned channel is finite and not
    /// restartable; drain it or stream it, then drop the handle.
    pub fn run_turn(&self, input: TurnInput) -> TurnHandle {
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let turn_id = Uuid::new_v4();

        let engine = self.clone();
        let token = cancel.clone();
        let span = tracing::info_span!("turn", %turn_id);
        tokio::spawn(
            async move {
                if let Err(e) = engine.run_turn_inner(input, &tx, &token).await {
                    tracing::warn!(error = %e, "turn failed");
                    let _ = tx.send(TurnEvent::Failed {
                        reason: e.to_string(),
                    });
                }
            }
            .instrument(span),
        );

        TurnHandle {
            turn_id,
            cancel,
            events,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Turn state machine
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn run_turn_inner(
        &self,
        input: TurnInput,
        tx: &EventTx,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut transcript = input.history.clone();
        transcript.push(Message::user(&input.user_message));

        let mut new_messages: Vec<Message> = Vec::new();
        let mut ledger = CallLedger::new(self.quota);
        let mut extractor = CitationExtractor::new(&input.target_language);
        let mut usage_total = Usage::default();
        let mut gathered: Vec<Passage> = Vec::new();

        // Documents already in history carry declared languages.
        for msg in &transcript {
            register_documents(&mut extractor, &msg.blocks);
        }

        let tools = self.registry.definitions_for(&input.enabled_tools);
        let mut quota_breach: Option<QuotaBreach> = None;

        loop {
            if cancel.is_cancelled() {
                let _ = tx.send(TurnEvent::Stopped { partial: None });
                return Ok(());
            }

            let req = ChatRequest {
                system: input.system_instruction.clone(),
                messages: transcript.clone(),
                tools: tools.clone(),
                temperature: None,
                max_tokens: None,
                model: None,
            };

            let asm = match self.stream_round(req, cancel, tx, &mut extractor).await? {
                DrainOutcome::Cancelled(partial) => {
                    let _ = tx.send(TurnEvent::Stopped {
                        partial: partial_message(&partial),
                    });
                    return Ok(());
                }
                DrainOutcome::Completed(asm) => asm,
            };

            if let Some(u) = &asm.usage {
                usage_total.add(u);
            }

            let had_tool_activity = !asm.tool_calls.is_empty() || !asm.malformed.is_empty();
            if !asm.blocks.is_empty() {
                let assistant = Message::assistant(asm.blocks.clone());
                transcript.push(assistant.clone());
                new_messages.push(assistant);
            }

            if !had_tool_activity {
                break;
            }

            if cancel.is_cancelled() {
                // Tool uses are unresolved; hand back visible content
                // only, flagged partial.
                let _ = tx.send(TurnEvent::Stopped {
                    partial: partial_message(&asm),
                });
                return Ok(());
            }

            let (result_blocks, breach) = self
                .resolve_calls(&asm, &mut ledger, &mut extractor, &mut gathered)
                .await;
            for block in &result_blocks {
                let _ = tx.send(TurnEvent::ToolResult {
                    block: block.clone(),
                });
            }
            let results = Message::tool_results(result_blocks);
            transcript.push(results.clone());
            new_messages.push(results);

            tracing::debug!(
                dispatched = ledger.total(),
                breach = breach.is_some(),
                "tool round resolved"
            );

            if let Some(b) = breach {
                quota_breach = Some(b);
                break;
            }
        }

        // Quota breach still produces a final answer; the model gets
        // one tool-free synthesis attempt, then a deterministic digest
        // of the gathered passages.
        if let Some(breach) = quota_breach {
            tracing::info!(%breach, calls = ledger.total(), "quota reached, synthesizing final answer");
            let text = self
                .synthesize_final(&transcript, &input.system_instruction, &gathered)
                .await;
            let _ = tx.send(TurnEvent::Token { text: text.clone() });
            let msg = Message::assistant(vec![ContentBlock::text(text)]);
            new_messages.push(msg);
        }

        // The engine shares the host runtime, so the translator is told
        // so and takes its sequential path.
        let citation_blocks = extractor
            .finalize(&self.translator, SchedulerContext::Shared)
            .await;
        if !citation_blocks.is_empty() {
            match new_messages
                .iter_mut()
                .rev()
                .find(|m| m.role == Role::Assistant)
            {
                Some(last) => last.blocks.extend(citation_blocks),
                None => new_messages.push(Message::assistant(citation_blocks)),
            }
        }

        validate_tool_pairing(&new_messages)?;

        let _ = tx.send(TurnEvent::Usage { usage: usage_total });
        let _ = tx.send(TurnEvent::Final {
            messages: new_messages,
        });
        Ok(())
    }

    /// One model round: open the stream and drain it, forwarding
    /// incremental output. A transient failure before anything was
    /// emitted is retried once after a short backoff.
    async fn stream_round(
        &self,
        req: ChatRequest,
        cancel: &CancelToken,
        tx: &EventTx,
        extractor: &mut CitationExtractor,
    ) -> Result<DrainOutcome> {
        let mut emitted = false;
        match self.try_stream(req.clone(), cancel, tx, extractor, &mut emitted).await {
            Err(e) if is_transient(&e) && !emitted => {
                tracing::warn!(error = %e, "transient provider failure, retrying once");
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.try_stream(req, cancel, tx, extractor, &mut emitted).await
            }
            other => other,
        }
    }

    async fn try_stream(
        &self,
        req: ChatRequest,
        cancel: &CancelToken,
        tx: &EventTx,
        extractor: &mut CitationExtractor,
        emitted: &mut bool,
    ) -> Result<DrainOutcome> {
        let stream = self.provider.chat_stream(req).await?;
        assembler::drain(stream, cancel, |out| {
            *emitted = true;
            match out {
                AsmOutput::Token(text) => {
                    let _ = tx.send(TurnEvent::Token { text });
                }
                AsmOutput::Thinking(text) => {
                    let _ = tx.send(TurnEvent::Thinking { text });
                }
                AsmOutput::ToolCallBegin { id, name } => {
                    let _ = tx.send(TurnEvent::ToolCallBegin { id, name });
                }
                AsmOutput::Citation {
                    cited_text,
                    document_title,
                } => {
                    // First occurrence wins; repeats are not re-emitted.
                    if extractor.observe(&cited_text, &document_title) {
                        let _ = tx.send(TurnEvent::Citation {
                            cited_text,
                            document_title,
                        });
                    }
                }
            }
        })
        .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tool resolution
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Resolve every tool_use of one round to a result block, in
    /// arrival order. Malformed inputs become `malformed_input`
    /// failures but pass through the same ledger check as parsed
    /// calls, so a model stuck emitting broken JSON still hits the
    /// ceiling. The first ledger breach rejects that call and every
    /// later one with `quota_exceeded`, so the pairing invariant
    /// survives the breach.
    async fn resolve_calls(
        &self,
        asm: &Assembled,
        ledger: &mut CallLedger,
        extractor: &mut CitationExtractor,
        gathered: &mut Vec<Passage>,
    ) -> (Vec<ContentBlock>, Option<QuotaBreach>) {
        let parsed: HashMap<&str, usize> = asm
            .tool_calls
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();
        let malformed: HashMap<&str, usize> = asm
            .malformed
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.as_str(), i))
            .collect();

        // Arrival order comes from the assembled block sequence.
        let order: Vec<&str> = asm
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect();

        let mut slots: Vec<Option<ContentBlock>> = vec![None; order.len()];
        let mut dispatches: Vec<(usize, usize)> = Vec::new();
        let mut breach: Option<QuotaBreach> = None;

        for (slot, id) in order.iter().enumerate() {
            if let Some(&mi) = malformed.get(id) {
                let call = &asm.malformed[mi];
                if let Some(b) = &breach {
                    slots[slot] = Some(ContentBlock::tool_failure(
                        &call.id,
                        FailureKind::QuotaExceeded,
                        b.to_string(),
                    ));
                    continue;
                }
                match ledger.check(&call.name) {
                    Ok(()) => {
                        ledger.record(&call.name);
                        slots[slot] = Some(ContentBlock::tool_failure(
                            &call.id,
                            FailureKind::MalformedInput,
                            format!(
                                "tool input was not valid JSON: {}",
                                snippet(&call.raw, 120)
                            ),
                        ));
                    }
                    Err(b) => {
                        slots[slot] = Some(ContentBlock::tool_failure(
                            &call.id,
                            FailureKind::QuotaExceeded,
                            b.to_string(),
                        ));
                        breach = Some(b);
                    }
                }
                continue;
            }
            let ci = parsed[id];
            let call = &asm.tool_calls[ci];
            if let Some(b) = &breach {
                slots[slot] = Some(ContentBlock::tool_failure(
                    &call.id,
                    FailureKind::QuotaExceeded,
                    b.to_string(),
                ));
                continue;
            }
            match ledger.check(&call.name) {
                Ok(()) => {
                    ledger.record(&call.name);
                    dispatches.push((slot, ci));
                }
                Err(b) => {
                    slots[slot] = Some(ContentBlock::tool_failure(
                        &call.id,
                        FailureKind::QuotaExceeded,
                        b.to_string(),
                    ));
                    breach = Some(b);
                }
            }
        }

        // Concurrent execution, request-order results. A failed call
        // never aborts its siblings: failures come back as blocks.
        let futures = dispatches.iter().map(|&(_, ci)| {
            let call = &asm.tool_calls[ci];
            self.registry.dispatch(&call.id, &call.name, &call.input)
        });
        let outcomes = join_all(futures).await;
        for (&(slot, _), block) in dispatches.iter().zip(outcomes) {
            if let ContentBlock::ToolResult {
                content: ToolResultContent::Passages { passages },
                ..
            } = &block
            {
                for p in passages {
                    extractor.register_document(&p.title, &p.language);
                }
                gathered.extend(passages.iter().cloned());
            }
            slots[slot] = Some(block);
        }

        let blocks = slots.into_iter().flatten().collect();
        (blocks, breach)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Quota-breach synthesis
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Best-effort final answer after a quota breach: one tool-free
    /// model call, falling back to a deterministic digest of the
    /// gathered passages. Never returns an empty string.
    async fn synthesize_final(
        &self,
        transcript: &[Message],
        system: &Option<String>,
        gathered: &[Passage],
    ) -> String {
        let mut messages = transcript.to_vec();
        messages.push(Message::user(
            "Answer now using only the material already retrieved above. \
             Do not request any further lookups.",
        ));
        let req = ChatRequest {
            system: system.clone(),
            messages,
            tools: vec![],
            temperature: None,
            max_tokens: None,
            model: None,
        };
        match self.provider.chat(req).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content,
            Ok(_) => passage_digest(gathered),
            Err(e) => {
                tracing::warn!(error = %e, "synthesis call failed, using passage digest");
                passage_digest(gathered)
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn register_documents(extractor: &mut CitationExtractor, blocks: &[ContentBlock]) {
    for b in blocks {
        match b {
            ContentBlock::Document { title, language, .. } => {
                extractor.register_document(title, language);
            }
            ContentBlock::ToolResult {
                content: ToolResultContent::Passages { passages },
                ..
            } => {
                for p in passages {
                    extractor.register_document(&p.title, &p.language);
                }
            }
            _ => {}
        }
    }
}

/// Visible content of a half-streamed response, explicitly flagged.
/// Unresolved tool uses are dropped, never silently kept.
fn partial_message(asm: &Assembled) -> Option<Message> {
    let blocks: Vec<ContentBlock> = asm
        .blocks
        .iter()
        .filter(|b| matches!(b, ContentBlock::Text { .. } | ContentBlock::Thinking { .. }))
        .cloned()
        .collect();
    if blocks.is_empty() {
        return None;
    }
    Some(Message {
        role: Role::Assistant,
        blocks,
        partial: true,
    })
}

/// Deterministic fallback answer from whatever was retrieved.
fn passage_digest(gathered: &[Passage]) -> String {
    if gathered.is_empty() {
        return "I reached the lookup limit for this question before finding \
                relevant sources. Please narrow the question and ask again."
            .to_string();
    }
    let mut seen = std::collections::HashSet::new();
    let mut out = String::from(
        "I reached the lookup limit for this question. \
         Here is what the retrieved sources say:\n",
    );
    for p in gathered {
        if !seen.insert(p.source_id.clone()) {
            continue;
        }
        if seen.len() > 8 {
            break;
        }
        out.push_str(&format!(
            "\n- {} ({}): {}",
            p.title,
            p.source_id,
            snippet(&p.text, 240)
        ));
    }
    out
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut s: String = text.chars().take(max_chars).collect();
    s.push('…');
    s
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
