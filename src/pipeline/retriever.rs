//! Query-time retrieval: embed the query, search the index, drop weak hits.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::core::config::{RetrievalSettings, TimeoutSettings};
use crate::core::errors::{PipelineError, Stage};
use crate::index::{RetrievalCandidate, VectorIndex};
use crate::provider::Embedder;

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    retrieval: RetrievalSettings,
    timeouts: TimeoutSettings,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        retrieval: RetrievalSettings,
        timeouts: TimeoutSettings,
    ) -> Self {
        Self {
            embedder,
            index,
            retrieval,
            timeouts,
        }
    }

    /// Top candidates for `query`, similarity order, already thresholded.
    /// An empty result is a valid outcome, not an error.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalCandidate>, PipelineError> {
        let embed_budget = Duration::from_secs(self.timeouts.embed_secs);
        let query_vector = timeout(embed_budget, self.embedder.embed(query))
            .await
            .map_err(|_| PipelineError::Timeout(Stage::Embedding, embed_budget))??;

        let search_budget = Duration::from_secs(self.timeouts.search_secs);
        let candidates = timeout(
            search_budget,
            self.index
                .search(&query_vector, self.retrieval.top_k, self.retrieval.ef_search),
        )
        .await
        .map_err(|_| PipelineError::Timeout(Stage::Retrieval, search_budget))??;

        let before = candidates.len();
        let threshold = self.retrieval.similarity_threshold;
        // retain() keeps similarity order for the survivors.
        let mut candidates = candidates;
        candidates.retain(|c| c.similarity >= threshold);

        debug!(
            requested = self.retrieval.top_k,
            scored = before,
            kept = candidates.len(),
            threshold,
            "retrieval complete"
        );

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::index::{Document, StoredChunk};
    use crate::pipeline::chunker::DocumentChunk;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
            Ok(self.0.clone())
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn name(&self) -> &str {
            "failing"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
            Err(PipelineError::Embedding("model offline".to_string()))
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Err(PipelineError::Embedding("model offline".to_string()))
        }
    }

    struct CannedIndex(Vec<RetrievalCandidate>);

    #[async_trait]
    impl VectorIndex for CannedIndex {
        async fn upsert_document(
            &self,
            _document: &Document,
            _items: Vec<(DocumentChunk, Vec<f32>)>,
        ) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn search(
            &self,
            _query: &[f32],
            top_k: usize,
            _ef_search: usize,
        ) -> Result<Vec<RetrievalCandidate>, PipelineError> {
            let mut out = self.0.clone();
            out.truncate(top_k);
            Ok(out)
        }

        async fn delete_document(&self, _document_id: &str) -> Result<usize, PipelineError> {
            Ok(0)
        }

        async fn chunk_count(&self) -> Result<usize, PipelineError> {
            Ok(self.0.len())
        }

        async fn document_count(&self) -> Result<usize, PipelineError> {
            Ok(1)
        }
    }

    fn candidate(id: &str, similarity: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk: StoredChunk {
                chunk_id: id.to_string(),
                document_id: "doc".to_string(),
                source: "wiki://doc".to_string(),
                text: format!("text of {}", id),
                token_count: 3,
                sequence_index: 0,
            },
            similarity,
        }
    }

    fn retriever(index: CannedIndex, threshold: f32) -> Retriever {
        let retrieval = RetrievalSettings {
            similarity_threshold: threshold,
            ..Default::default()
        };
        Retriever::new(
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            Arc::new(index),
            retrieval,
            TimeoutSettings::default(),
        )
    }

    #[tokio::test]
    async fn weak_candidates_are_dropped() {
        let index = CannedIndex(vec![
            candidate("strong", 0.9),
            candidate("borderline", 0.3),
            candidate("weak", 0.1),
        ]);
        let kept = retriever(index, 0.3).retrieve("query").await.unwrap();

        let ids: Vec<_> = kept.iter().map(|c| c.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["strong", "borderline"]);
    }

    #[tokio::test]
    async fn all_below_threshold_yields_empty_ok() {
        let index = CannedIndex(vec![candidate("a", 0.1), candidate("b", 0.05)]);
        let kept = retriever(index, 0.3).retrieve("query").await.unwrap();
        assert!(kept.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_propagates() {
        let retriever = Retriever::new(
            Arc::new(FailingEmbedder),
            Arc::new(CannedIndex(vec![candidate("a", 0.9)])),
            RetrievalSettings::default(),
            TimeoutSettings::default(),
        );
        let err = retriever.retrieve("query").await.unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
    }
}
