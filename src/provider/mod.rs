//! External model capabilities.
//!
//! The pipeline is written against these traits; concrete bindings (which
//! model, which endpoint) are configuration. Implementations must be safe
//! for concurrent read-only inference calls: one instance is constructed at
//! startup and shared across all request tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::errors::PipelineError;

mod openai;
mod rerank;

pub use openai::OpenAiProvider;
pub use rerank::HttpReranker;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Output of the reranking pass, ordering used by the context assembler.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub chunk_id: String,
    pub rerank_score: f32,
}

/// Maps text to a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// Re-scores a candidate set with a more precise relevance model. Pure over
/// (query, candidates); must tolerate an empty candidate slice.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates are `(chunk_id, chunk_text)` pairs. Returns all of them,
    /// re-ordered best first.
    async fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<RankedCandidate>, PipelineError>;
}

/// Token-streaming completion model.
#[async_trait]
pub trait AnswerModel: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap liveness probe for the status endpoint and startup warmup.
    async fn health_check(&self) -> bool;

    /// Starts a streaming completion. Fragments arrive on the receiver in
    /// generation order; the sender side stops as soon as the receiver is
    /// dropped, which is how client-disconnect cancellation propagates.
    async fn stream_answer(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::Receiver<Result<String, PipelineError>>, PipelineError>;
}
