//! Greedy token-budget context assembly.
//!
//! Candidates arrive best-first; each is rendered as a numbered source
//! block and appended while the running token total stays within budget.
//! The first block that would overflow stops assembly, so a high-ranked
//! large chunk can shut out smaller ones behind it. Ranking order wins
//! over packing density.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use crate::core::config::{ChunkingSettings, RetrievalSettings};
use crate::index::StoredChunk;
use crate::pipeline::tokenizer::Tokenizer;

/// Citation emitted alongside the context, one per included chunk.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Citation {
    pub chunk_id: String,
    /// Bracketed marker as it appears in the context text, e.g. `[1]`.
    pub label: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub enum AssembledContext {
    Context {
        text: String,
        citations: Vec<Citation>,
    },
    /// Nothing survived retrieval; the answer path must say so rather than
    /// let the model guess.
    NoContext,
}

pub struct ContextAssembler {
    retrieval: RetrievalSettings,
    chunking: ChunkingSettings,
}

impl ContextAssembler {
    pub fn new(retrieval: RetrievalSettings, chunking: ChunkingSettings) -> Self {
        Self {
            retrieval,
            chunking,
        }
    }

    /// Assemble ranked chunks into prompt context. `chunks` must already be
    /// in final rank order.
    pub fn assemble(&self, tokenizer: &dyn Tokenizer, chunks: &[StoredChunk]) -> AssembledContext {
        if chunks.is_empty() {
            return AssembledContext::NoContext;
        }

        let mut included: HashSet<(String, usize)> = HashSet::new();
        let mut blocks: Vec<String> = Vec::new();
        let mut citations: Vec<Citation> = Vec::new();
        let mut used_tokens = 0;

        for chunk in chunks {
            let body = self.dedup_overlap(tokenizer, chunk, &included);
            if body.trim().is_empty() {
                continue;
            }

            let label = format!("[{}]", citations.len() + 1);
            let block = format!("{} ({})\n{}", label, chunk.source, body.trim_end());
            let block_tokens = tokenizer.count(&block);
            if used_tokens + block_tokens > self.retrieval.max_context_tokens {
                debug!(
                    chunk_id = %chunk.chunk_id,
                    block_tokens,
                    used_tokens,
                    budget = self.retrieval.max_context_tokens,
                    "context budget reached"
                );
                break;
            }

            used_tokens += block_tokens;
            included.insert((chunk.document_id.clone(), chunk.sequence_index));
            citations.push(Citation {
                chunk_id: chunk.chunk_id.clone(),
                label,
                source: chunk.source.clone(),
            });
            blocks.push(block);
        }

        if blocks.is_empty() {
            return AssembledContext::NoContext;
        }

        AssembledContext::Context {
            text: blocks.join("\n\n"),
            citations,
        }
    }

    /// When a sequence-adjacent chunk of the same document is already in
    /// the context, the shared overlap repeats text the model has seen;
    /// strip it before the budget is charged. Rank order decides which side
    /// gets trimmed: a predecessor already present trims this chunk's
    /// leading overlap, a successor already present trims its trailing one.
    fn dedup_overlap(
        &self,
        tokenizer: &dyn Tokenizer,
        chunk: &StoredChunk,
        included: &HashSet<(String, usize)>,
    ) -> String {
        let after_predecessor = chunk.sequence_index > 0
            && included.contains(&(chunk.document_id.clone(), chunk.sequence_index - 1));
        let before_successor =
            included.contains(&(chunk.document_id.clone(), chunk.sequence_index + 1));
        if !after_predecessor && !before_successor {
            return chunk.text.clone();
        }

        let tokens = tokenizer.tokenize(&chunk.text);
        let overlap = self.chunking.overlap_tokens;
        let start = if after_predecessor {
            overlap.min(tokens.len())
        } else {
            0
        };
        let end = if before_successor {
            tokens.len().saturating_sub(overlap).max(start)
        } else {
            tokens.len()
        };
        if start >= end {
            return String::new();
        }
        tokens[start..end].concat()
    }
}
