//! Vector index capability boundary.
//!
//! The pipeline treats the index as a black box honoring an approximate
//! nearest-neighbor contract: given a query vector, return up to `top_k`
//! candidates ordered by similarity, with `ef_search` as the search-effort
//! knob. The bundled implementation is SQLite-backed; a remote ANN service
//! would implement the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::errors::PipelineError;
use crate::pipeline::chunker::DocumentChunk;

mod sqlite;

pub use sqlite::SqliteVectorIndex;

/// A document as handed to ingestion. Immutable once chunked; re-ingesting
/// under the same id supersedes all previous chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub raw_text: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// A chunk as stored in (and returned by) the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    /// Source label used for citations (typically the document URI).
    pub source: String,
    pub text: String,
    pub token_count: usize,
    pub sequence_index: usize,
}

/// Per-query retrieval result, consumed by the reranking step.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalCandidate {
    pub chunk: StoredChunk,
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace all chunks of `document` with `items` in one transaction.
    async fn upsert_document(
        &self,
        document: &Document,
        items: Vec<(DocumentChunk, Vec<f32>)>,
    ) -> Result<(), PipelineError>;

    /// Approximate top-`top_k` neighbors of `query`, highest similarity
    /// first. `ef_search` bounds the candidate pool that gets scored.
    /// Equal scores keep the index's native order.
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        ef_search: usize,
    ) -> Result<Vec<RetrievalCandidate>, PipelineError>;

    /// Remove a document and all of its chunks. Returns the chunk count
    /// removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, PipelineError>;

    async fn chunk_count(&self) -> Result<usize, PipelineError>;

    async fn document_count(&self) -> Result<usize, PipelineError>;
}
