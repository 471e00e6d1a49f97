//! Citation translation with dual-context safety.
//!
//! The batched path fans all requests out concurrently and assumes it
//! may saturate the scheduler; it is only legal when the caller is not
//! already sharing a cooperative scheduler with other work. Whether
//! that is the case is an explicit capability the caller passes in
//! ([`SchedulerContext`]) — the service never introspects ambient
//! runtime state.
//!
//! The engine always calls through [`Translator::translate`], the
//! safety wrapper: it attempts the batched path and falls back to the
//! sequential path on exactly [`Error::SchedulerActive`]; any other
//! failure propagates unchanged.

use std::sync::Arc;

use rawi_domain::error::{Error, Result};
use rawi_providers::{ChatRequest, LlmProvider};

/// What the caller knows about the scheduler driving its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerContext {
    /// No other work shares the scheduler; the batched path may own it.
    Exclusive,
    /// A cooperative scheduler is already driving the calling context
    /// (the usual case mid-stream inside the engine).
    Shared,
}

#[derive(Clone)]
pub struct Translator {
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
    max_parallel: usize,
}

impl Translator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: Option<String>,
        max_parallel: usize,
    ) -> Self {
        Self {
            provider,
            model,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Safety wrapper: batched first, sequential only when the batched
    /// path reports the scheduler is taken. Every other error kind
    /// propagates without attempting the fallback.
    pub async fn translate(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
        ctx: SchedulerContext,
    ) -> Result<Vec<String>> {
        match self
            .translate_parallel(texts, source_lang, target_lang, ctx)
            .await
        {
            Ok(out) => Ok(out),
            Err(Error::SchedulerActive(reason)) => {
                tracing::debug!(%reason, "batched translation unavailable, going sequential");
                self.translate_sequential(texts, source_lang, target_lang)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Batched path: a bounded concurrent fan-out. At most
    /// `max_parallel` requests are in flight at once and outputs come
    /// back in input order.
    ///
    /// Precondition: `ctx` must be [`SchedulerContext::Exclusive`].
    /// When the caller reports a shared scheduler this fails with
    /// [`Error::SchedulerActive`] before issuing any request.
    pub async fn translate_parallel(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
        ctx: SchedulerContext,
    ) -> Result<Vec<String>> {
        if ctx == SchedulerContext::Shared {
            return Err(Error::SchedulerActive(
                "caller reports a shared cooperative scheduler".into(),
            ));
        }

        use futures_util::{StreamExt, TryStreamExt};
        let requests: Vec<_> = texts
            .iter()
            .map(|t| self.translate_one(t, source_lang, target_lang))
            .collect();
        futures_util::stream::iter(requests)
            .buffered(self.max_parallel)
            .try_collect()
            .await
    }

    /// Fallback path: one request at a time on the current scheduler.
    /// O(n) round-trips, but safe anywhere.
    pub async fn translate_sequential(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.translate_one(text, source_lang, target_lang).await?);
        }
        Ok(out)
    }

    async fn translate_one(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String> {
        let req = ChatRequest {
            system: Some(format!(
                "Translate the user's text from {source_lang} to {target_lang}. \
                 Reply with the translation only, no commentary."
            )),
            messages: vec![rawi_domain::content::Message::user(text)],
            model: self.model.clone(),
            max_tokens: Some(1024),
            temperature: Some(0.0),
            ..Default::default()
        };
        let resp = self.provider.chat(req).await?;
        Ok(resp.content.trim().to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
