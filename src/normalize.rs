//! Transcript normalizer: raw speech-to-text output in, cleaned transcript out.
//!
//! Cleaning is a hybrid of deterministic passes and one LLM call:
//!
//! 1. strip disfluencies (deterministic, conservative);
//! 2. LLM pass for dialect normalization and noise removal, instructed to
//!    preserve factual tokens and emit the canonical CIS/VAT sentences;
//! 3. deterministic canonicalization of any CIS/VAT statements the model left
//!    in free form;
//! 4. length bound.
//!
//! The deterministic passes are the safety net: tri-state detection downstream
//! matches the canonical sentences exactly, so they must appear even when the
//! model paraphrases. Factual tokens (names, postcodes, amounts, hour counts)
//! are never touched by the deterministic passes.

use crate::llm::prompts::{
    CANONICAL_CIS_NO, CANONICAL_CIS_YES, CANONICAL_VAT_NO, CANONICAL_VAT_YES, CLEANING_PROMPT,
};
use crate::llm::{LlmError, LlmProvider};
use once_cell::sync::Lazy;
use regex::Regex;

/// Ceiling on transcript length fed to extraction. Bounds extraction cost and
/// shrinks the adversarial-input surface.
pub const MAX_TRANSCRIPT_CHARS: usize = 4000;

/// Errors from the cleaning stage.
///
/// A cleaning failure never falls back to the raw transcript: an unnormalized
/// transcript is unsafe input for extraction.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Transcript cleaning failed: {0}")]
    Llm(#[from] LlmError),
}

static FILLER_RE: Lazy<Regex> = Lazy::new(|| {
    // Standalone hesitation tokens only. Anything that could carry meaning
    // (including dialect words) is left for the LLM pass.
    Regex::new(r"(?i)\b(um+|uh+|erm+|er+|hmm+|ah+)\b[,.]?").expect("invalid filler regex")
});

static FILLER_PHRASE_RE: Lazy<Regex> = Lazy::new(|| {
    // Filler phrases are only removed when set off by commas (or at the start
    // of the text), where they cannot be part of a factual clause.
    Regex::new(r"(?i)(^|(?P<p>[,.]))\s*(you know|i mean)\s*,").expect("invalid filler phrase regex")
});

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("invalid regex"));

static SPACE_BEFORE_PUNCT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([,.!?])").expect("invalid regex"));

static CIS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(c\.?\s?i\.?\s?s\.?|construction industry scheme)\b")
        .expect("invalid CIS regex")
});

static VAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(v\.?\s?a\.?\s?t\.?)\b").expect("invalid VAT regex"));

static NEGATION_RE: Lazy<Regex> = Lazy::new(|| {
    // "n't" requires the apostrophe so words ending in "nt" never match.
    Regex::new(r"(?i)\b(not|no|never|without|exempt|outside)\b|n['’]t\b")
        .expect("invalid negation regex")
});

static CLAUSE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| {
    // Boundaries that separate independently-negatable clauses. "or" is kept
    // inside a clause so "no CIS or VAT" negates both topics.
    Regex::new(r"(?i)[,;]|\b(but|and|though|although|while|whereas|however)\b")
        .expect("invalid clause split regex")
});

/// Remove hesitation tokens and tidy the whitespace they leave behind.
///
/// Deliberately conservative: only pure disfluencies are removed, so factual
/// tokens (names, postcodes, amounts) pass through verbatim.
pub fn strip_disfluencies(text: &str) -> String {
    let dephrased = FILLER_PHRASE_RE.replace_all(text, "${p} ");
    let stripped = FILLER_RE.replace_all(&dephrased, " ");
    let collapsed = WHITESPACE_RE.replace_all(&stripped, " ");
    SPACE_BEFORE_PUNCT_RE
        .replace_all(&collapsed, "$1")
        .trim()
        .to_string()
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate_transcript(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Split text into sentences, keeping terminal punctuation.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            sentences.push(current.trim().to_string());
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Rewrite CIS/VAT statements into the four canonical sentence forms.
///
/// A sentence mentioning both topics is split into two sentences, one per
/// topic. Sentences mentioning neither are left untouched. This is what makes
/// downstream tri-state detection tractable: extraction matches these exact
/// sentences and treats their absence as "unknown".
pub fn canonicalize_tax_statements(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();

    for sentence in split_sentences(text) {
        let mentions_cis = CIS_RE.is_match(&sentence);
        let mentions_vat = VAT_RE.is_match(&sentence);

        if !mentions_cis && !mentions_vat {
            out.push(sentence);
            continue;
        }

        // Negation is scoped to the clause mentioning the topic, so mixed
        // polarity ("a CIS job but no VAT") and incidental negation ("no
        // problem, it's a CIS job") never flip the other flag.
        let mut cis_negated = None;
        let mut vat_negated = None;
        for clause in CLAUSE_SPLIT_RE.split(&sentence) {
            let negated = NEGATION_RE.is_match(clause);
            if CIS_RE.is_match(clause) {
                cis_negated = Some(negated);
            }
            if VAT_RE.is_match(clause) {
                vat_negated = Some(negated);
            }
        }

        if mentions_cis {
            let negated = cis_negated.unwrap_or_else(|| NEGATION_RE.is_match(&sentence));
            out.push(if negated { CANONICAL_CIS_NO } else { CANONICAL_CIS_YES }.to_string());
        }
        if mentions_vat {
            let negated = vat_negated.unwrap_or_else(|| NEGATION_RE.is_match(&sentence));
            out.push(if negated { CANONICAL_VAT_NO } else { CANONICAL_VAT_YES }.to_string());
        }
    }

    out.join(" ")
}

/// Clean a raw transcript into the form extraction expects.
///
/// Empty input short-circuits without an LLM call. Any LLM failure is
/// returned as [`NormalizeError::Llm`]; callers must not substitute the raw
/// transcript.
pub async fn clean_transcript(
    provider: &dyn LlmProvider,
    raw_transcript: &str,
) -> Result<String, NormalizeError> {
    let raw = raw_transcript.trim();
    if raw.is_empty() {
        return Ok(String::new());
    }

    let pre_cleaned = strip_disfluencies(raw);
    let bounded = truncate_transcript(&pre_cleaned, MAX_TRANSCRIPT_CHARS);

    log::info!(
        "Normalizer: cleaning transcript ({} chars after pre-clean)",
        bounded.len()
    );

    let cleaned = provider.complete(CLEANING_PROMPT, &bounded).await?;

    let canonical = canonicalize_tax_statements(cleaned.trim());
    let result = truncate_transcript(&canonical, MAX_TRANSCRIPT_CHARS);

    log::info!("Normalizer: cleaned {} -> {} chars", raw.len(), result.len());
    Ok(result)
}
