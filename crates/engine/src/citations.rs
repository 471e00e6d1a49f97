//! Per-turn citation extraction and deduplication.
//!
//! Citation markers arrive mid-stream as `(cited_text, document_title)`
//! pairs resolved by the provider against the documents the model was
//! given. The extractor deduplicates them (first occurrence wins),
//! routes each one through translation when its source language differs
//! from the turn's target language, and emits the final ordered
//! [`ContentBlock::Citation`] list. A translation failure degrades that
//! citation to `translation: None`; it never drops the citation.

use std::collections::{HashMap, HashSet};

use rawi_domain::content::ContentBlock;

use crate::translate::{SchedulerContext, Translator};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Language routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dominant-script language guess, used only when the source document
/// did not declare a language. Counts Arabic-block codepoints against
/// ASCII letters; ties go to "en".
pub fn dominant_language(text: &str) -> &'static str {
    let mut arabic = 0usize;
    let mut latin = 0usize;
    for c in text.chars() {
        match c {
            '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}' | '\u{08A0}'..='\u{08FF}' => {
                arabic += 1
            }
            'a'..='z' | 'A'..='Z' => latin += 1,
            _ => {}
        }
    }
    if arabic > latin {
        "ar"
    } else {
        "en"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Citation set
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingCitation {
    cited_text: String,
    document_title: String,
}

/// Ordered, deduplicated set of citations observed during one turn,
/// keyed by `(document_title, cited_text)`. Lives for the turn only.
#[derive(Default)]
pub struct CitationSet {
    seen: HashSet<(String, String)>,
    ordered: Vec<PendingCitation>,
}

impl CitationSet {
    /// Insert a marker; returns `true` if it was new. Re-observations
    /// of the same passage are dropped, first occurrence wins.
    pub fn insert(&mut self, cited_text: &str, document_title: &str) -> bool {
        let key = (document_title.to_string(), cited_text.to_string());
        if !self.seen.insert(key) {
            return false;
        }
        self.ordered.push(PendingCitation {
            cited_text: cited_text.to_string(),
            document_title: document_title.to_string(),
        });
        true
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extractor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates citation markers for one turn and resolves translations
/// at the end of the turn.
pub struct CitationExtractor {
    set: CitationSet,
    /// Declared language per document title, learned from the passages
    /// handed to the model. Falls back to script detection when a
    /// marker references a title we never saw declared.
    doc_languages: HashMap<String, String>,
    target_language: String,
}

impl CitationExtractor {
    pub fn new(target_language: impl Into<String>) -> Self {
        Self {
            set: CitationSet::default(),
            doc_languages: HashMap::new(),
            target_language: target_language.into(),
        }
    }

    /// Record the declared language of a document offered to the model.
    pub fn register_document(&mut self, title: &str, language: &str) {
        self.doc_languages
            .entry(title.to_string())
            .or_insert_with(|| language.to_string());
    }

    /// Observe a mid-stream citation marker; returns `true` if new.
    pub fn observe(&mut self, cited_text: &str, document_title: &str) -> bool {
        self.set.insert(cited_text, document_title)
    }

    pub fn count(&self) -> usize {
        self.set.len()
    }

    fn source_language(&self, citation: &PendingCitation) -> String {
        self.doc_languages
            .get(&citation.document_title)
            .cloned()
            .unwrap_or_else(|| dominant_language(&citation.cited_text).to_string())
    }

    /// Resolve translations and emit the ordered citation blocks.
    ///
    /// Citations whose source language matches the target pass through
    /// untranslated. The rest are translated in per-language batches;
    /// if a batch fails, its citations keep `translation: None`.
    pub async fn finalize(
        self,
        translator: &Translator,
        ctx: SchedulerContext,
    ) -> Vec<ContentBlock> {
        let mut translations: Vec<Option<String>> = vec![None; self.set.ordered.len()];

        // Group indices by source language so each batch shares one
        // translation direction.
        let mut batches: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, citation) in self.set.ordered.iter().enumerate() {
            let src = self.source_language(citation);
            if src != self.target_language {
                batches.entry(src).or_default().push(i);
            }
        }

        for (src, indices) in batches {
            let texts: Vec<String> = indices
                .iter()
                .map(|&i| self.set.ordered[i].cited_text.clone())
                .collect();
            match translator
                .translate(&texts, &src, &self.target_language, ctx)
                .await
            {
                Ok(translated) => {
                    for (&i, t) in indices.iter().zip(translated) {
                        translations[i] = Some(t);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        source = %src,
                        target = %self.target_language,
                        error = %e,
                        "citation translation failed, keeping citations untranslated"
                    );
                }
            }
        }

        self.set
            .ordered
            .into_iter()
            .zip(translations)
            .map(|(c, translation)| ContentBlock::Citation {
                cited_text: c.cited_text,
                document_title: c.document_title,
                translation,
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
