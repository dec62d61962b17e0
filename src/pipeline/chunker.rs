//! Token-bounded overlapping chunking.
//!
//! Windows of `chunk_tokens` are taken with step `chunk_tokens -
//! overlap_tokens`; a tail shorter than `min_chunk_tokens` is merged into
//! the previous chunk instead of emitted standalone. Identical input and
//! parameters always produce identical chunks, which keeps re-indexing
//! idempotent.

use sha2::{Digest, Sha256};

use crate::core::config::ChunkingSettings;
use crate::core::errors::PipelineError;
use crate::pipeline::tokenizer::Tokenizer;

/// An immutable chunk derived from one document. Re-chunking a document
/// supersedes all of its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    /// Stable id derived from (document, sequence, text).
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub token_count: usize,
    pub sequence_index: usize,
}

pub fn chunk_document(
    tokenizer: &dyn Tokenizer,
    document_id: &str,
    text: &str,
    cfg: &ChunkingSettings,
) -> Result<Vec<DocumentChunk>, PipelineError> {
    if cfg.overlap_tokens >= cfg.chunk_tokens {
        return Err(PipelineError::Config(format!(
            "overlap_tokens ({}) must be smaller than chunk_tokens ({})",
            cfg.overlap_tokens, cfg.chunk_tokens
        )));
    }
    if cfg.min_chunk_tokens > cfg.chunk_tokens {
        return Err(PipelineError::Config(format!(
            "min_chunk_tokens ({}) cannot exceed chunk_tokens ({})",
            cfg.min_chunk_tokens, cfg.chunk_tokens
        )));
    }

    let tokens = tokenizer.tokenize(text);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let step = cfg.chunk_tokens - cfg.overlap_tokens;
    let mut windows: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + cfg.chunk_tokens).min(tokens.len());
        windows.push((start, end));
        if end == tokens.len() {
            break;
        }
        start += step;
    }

    // A short tail extends the previous window rather than standing alone.
    // A lone chunk from a short document is kept as-is.
    if windows.len() >= 2 {
        let (last_start, last_end) = windows[windows.len() - 1];
        if last_end - last_start < cfg.min_chunk_tokens {
            windows.pop();
            if let Some(prev) = windows.last_mut() {
                prev.1 = last_end;
            }
        }
    }

    let chunks = windows
        .into_iter()
        .enumerate()
        .map(|(sequence_index, (s, e))| {
            let chunk_text = tokens[s..e].concat();
            DocumentChunk {
                id: chunk_id(document_id, sequence_index, &chunk_text),
                document_id: document_id.to_string(),
                text: chunk_text,
                token_count: e - s,
                sequence_index,
            }
        })
        .collect();

    Ok(chunks)
}

fn chunk_id(document_id: &str, sequence_index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(sequence_index.to_le_bytes());
    hasher.update(text.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tokenizer::WordTokenizer;

    fn cfg(chunk: usize, overlap: usize, min: usize) -> ChunkingSettings {
        ChunkingSettings {
            chunk_tokens: chunk,
            overlap_tokens: overlap,
            min_chunk_tokens: min,
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn thousand_tokens_split_into_three_overlapping_windows() {
        let text = words(1000);
        let chunks =
            chunk_document(&WordTokenizer, "doc", &text, &cfg(400, 50, 30)).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].token_count, 400); // [0, 400)
        assert_eq!(chunks[1].token_count, 400); // [350, 750)
        assert_eq!(chunks[2].token_count, 300); // [700, 1000)
        assert!(chunks[0].text.starts_with("w0 "));
        assert!(chunks[1].text.starts_with("w350 "));
        assert!(chunks[2].text.starts_with("w700 "));
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = words(937);
        let first = chunk_document(&WordTokenizer, "doc", &text, &cfg(100, 20, 10)).unwrap();
        let second = chunk_document(&WordTokenizer, "doc", &text, &cfg(100, 20, 10)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn adjacent_chunks_share_exactly_the_overlap() {
        let text = words(1000);
        let overlap = 50;
        let chunks =
            chunk_document(&WordTokenizer, "doc", &text, &cfg(400, overlap, 30)).unwrap();
        let tok = WordTokenizer;

        for pair in chunks.windows(2) {
            let prev = tok.tokenize(&pair[0].text);
            let next = tok.tokenize(&pair[1].text);
            assert_eq!(prev[prev.len() - overlap..], next[..overlap]);
        }
    }

    #[test]
    fn short_tail_merges_into_previous_chunk() {
        // 110 tokens, windows of 100 step 80: [0,100) and a 30-token tail
        // [80,110) that falls below min 40, so it merges.
        let text = words(110);
        let chunks =
            chunk_document(&WordTokenizer, "doc", &text, &cfg(100, 20, 40)).unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_count, 110);
        assert!(chunks[0].text.ends_with("w109"));
    }

    #[test]
    fn tail_at_or_above_min_is_kept() {
        let text = words(120);
        let chunks =
            chunk_document(&WordTokenizer, "doc", &text, &cfg(100, 20, 40)).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].token_count, 40); // [80, 120)
    }

    #[test]
    fn lone_short_document_is_emitted() {
        let text = words(5);
        let chunks =
            chunk_document(&WordTokenizer, "doc", &text, &cfg(400, 50, 30)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_count, 5);
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        let chunks = chunk_document(&WordTokenizer, "doc", "", &cfg(400, 50, 30)).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let err = chunk_document(&WordTokenizer, "doc", "a b c", &cfg(50, 50, 10)).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn min_chunk_cannot_exceed_window() {
        let err = chunk_document(&WordTokenizer, "doc", "a b c", &cfg(50, 10, 51)).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn chunk_ids_are_stable_across_runs() {
        let text = words(500);
        let a = chunk_document(&WordTokenizer, "doc", &text, &cfg(100, 10, 10)).unwrap();
        let b = chunk_document(&WordTokenizer, "doc", &text, &cfg(100, 10, 10)).unwrap();
        let ids_a: Vec<_> = a.iter().map(|c| c.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }
}
