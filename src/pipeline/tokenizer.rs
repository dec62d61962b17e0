//! The fixed tokenizer the chunking and context-budget logic measure in.
//!
//! Tokens are lossless covers of the input: concatenating a text's tokens
//! reproduces the text byte-for-byte. This is what makes chunk overlap a
//! literal substring equality and keeps re-chunking deterministic.

use std::path::Path;

use crate::core::errors::PipelineError;

pub trait Tokenizer: Send + Sync {
    /// Split `text` into covering tokens. Empty input yields no tokens.
    fn tokenize(&self, text: &str) -> Vec<String>;

    fn count(&self, text: &str) -> usize {
        self.tokenize(text).len()
    }
}

/// Whitespace-run tokenizer: each token is a run of non-whitespace together
/// with the whitespace that follows it. Dependency-free default.
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut start = 0;
        let mut prev_ws = false;

        for (idx, ch) in text.char_indices() {
            if prev_ws && !ch.is_whitespace() && idx > start {
                tokens.push(text[start..idx].to_string());
                start = idx;
            }
            prev_ws = ch.is_whitespace();
        }
        if start < text.len() {
            tokens.push(text[start..].to_string());
        }
        tokens
    }
}

/// Tokenizer backed by a HuggingFace `tokenizer.json` vocabulary.
///
/// The model's own offsets decide token boundaries; each boundary is then
/// widened to a covering slice so the lossless-cover property holds even
/// for vocabularies that drop whitespace.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            PipelineError::Config(format!("cannot load tokenizer {}: {}", path.display(), e))
        })?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let encoding = match self.inner.encode(text, false) {
            Ok(encoding) => encoding,
            Err(err) => {
                // Unencodable input falls back to the word tokenizer so the
                // pipeline still sees a valid cover.
                tracing::warn!("tokenizer encode failed, falling back to words: {}", err);
                return WordTokenizer.tokenize(text);
            }
        };

        let mut starts: Vec<usize> = encoding
            .get_offsets()
            .iter()
            .map(|(start, _)| floor_char_boundary(text, (*start).min(text.len())))
            .collect();
        starts.dedup();
        if starts.is_empty() {
            return vec![text.to_string()];
        }
        starts[0] = 0;

        let mut tokens = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(text.len());
            if start < end {
                tokens.push(text[start..end].to_string());
            }
        }
        tokens
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
