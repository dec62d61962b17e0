//! The retrieval-augmented answer pipeline.
//!
//! One request flows retrieve -> rerank -> assemble -> generate -> format.
//! Failures before the first token are returned to the caller as plain
//! errors; failures after it close the stream with an error event so the
//! client keeps the partial answer it already received.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::core::config::Settings;
use crate::core::errors::{PipelineError, Stage};
use crate::history::ConversationStore;
use crate::index::{Document, RetrievalCandidate, StoredChunk, VectorIndex};
use crate::provider::{AnswerModel, ChatMessage, Embedder, Reranker};

pub mod chunker;
pub mod context;
pub mod retriever;
pub mod stream;
pub mod tokenizer;

use chunker::chunk_document;
use context::{AssembledContext, Citation, ContextAssembler};
use retriever::Retriever;
use stream::{StreamEvent, StreamFormatter};
use tokenizer::Tokenizer;

/// Answer given when nothing relevant was retrieved. Streamed verbatim,
/// without a model call, so the behavior is deterministic.
const NO_CONTEXT_ANSWER: &str =
    "I could not find anything relevant to that in the indexed documents, \
     so I cannot give a grounded answer.";

const SYSTEM_PROMPT: &str = "You are a careful assistant answering strictly from the \
    provided context. Cite sources with their bracketed markers, e.g. [1]. \
    If the context does not contain the answer, say so instead of guessing.";

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexSummary {
    pub document_id: String,
    pub chunk_count: usize,
}

struct PreparedRequest {
    context: AssembledContext,
    messages: Vec<ChatMessage>,
}

pub struct RagPipeline {
    tokenizer: Arc<dyn Tokenizer>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    reranker: Option<Arc<dyn Reranker>>,
    model: Arc<dyn AnswerModel>,
    history: Arc<ConversationStore>,
    retriever: Retriever,
    assembler: ContextAssembler,
    settings: Settings,
}

impl RagPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        reranker: Option<Arc<dyn Reranker>>,
        model: Arc<dyn AnswerModel>,
        history: Arc<ConversationStore>,
        settings: Settings,
    ) -> Self {
        let retriever = Retriever::new(
            embedder.clone(),
            index.clone(),
            settings.retrieval,
            settings.timeouts,
        );
        let assembler = ContextAssembler::new(settings.retrieval, settings.chunking);
        Self {
            tokenizer,
            embedder,
            index,
            reranker,
            model,
            history,
            retriever,
            assembler,
            settings,
        }
    }

    /// Chunk, embed and store a document, superseding any previous version.
    pub async fn index_document(&self, document: &Document) -> Result<IndexSummary, PipelineError> {
        let chunks = chunk_document(
            self.tokenizer.as_ref(),
            &document.id,
            &document.raw_text,
            &self.settings.chunking,
        )?;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(PipelineError::Embedding(format!(
                "expected {} embeddings for document {}, got {}",
                chunks.len(),
                document.id,
                embeddings.len()
            )));
        }

        let chunk_count = chunks.len();
        let items = chunks.into_iter().zip(embeddings).collect();
        self.index.upsert_document(document, items).await?;

        info!(document_id = %document.id, chunk_count, "document indexed");
        Ok(IndexSummary {
            document_id: document.id.clone(),
            chunk_count,
        })
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<usize, PipelineError> {
        let removed = self.index.delete_document(document_id).await?;
        info!(document_id, removed, "document deleted");
        Ok(removed)
    }

    /// Raw retrieval results, exposed for debugging the index.
    pub async fn search(&self, query: &str) -> Result<Vec<RetrievalCandidate>, PipelineError> {
        self.retriever.retrieve(query).await
    }

    pub async fn chunk_count(&self) -> Result<usize, PipelineError> {
        self.index.chunk_count().await
    }

    pub async fn document_count(&self) -> Result<usize, PipelineError> {
        self.index.document_count().await
    }

    pub async fn turn_count(&self) -> Result<usize, PipelineError> {
        self.history.turn_count().await
    }

    /// Probe the model, embedder and reranker once so the first request
    /// does not pay cold-start latency.
    pub async fn warm_up(&self) {
        let healthy = self.model.health_check().await;
        if !healthy {
            warn!(model = self.model.name(), "answer model health check failed");
        }
        if let Err(e) = self.embedder.embed("warmup").await {
            warn!("embedder warmup failed: {}", e);
        }
        if let Some(reranker) = &self.reranker {
            let canary = [
                ("w0".to_string(), "warmup passage one".to_string()),
                ("w1".to_string(), "warmup passage two".to_string()),
            ];
            if let Err(e) = reranker.rerank("warmup", &canary).await {
                warn!(reranker = reranker.name(), "reranker warmup failed: {}", e);
            }
        }
        info!("pipeline warmup complete");
    }

    /// Stream an answer. Errors before the first event are returned here;
    /// everything after arrives on the channel, which always ends with
    /// exactly one terminal event. Dropping the receiver cancels the work.
    pub async fn answer_stream(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, PipelineError> {
        let prepared = self.prepare(conversation_id, query).await?;
        self.history
            .record_turn(conversation_id, "user", query)
            .await?;

        let (tx, rx) = mpsc::channel::<StreamEvent>(64);

        match prepared.context {
            AssembledContext::NoContext => {
                let history = self.history.clone();
                let conversation_id = conversation_id.to_string();
                tokio::spawn(async move {
                    let mut formatter = StreamFormatter::new(Vec::new());
                    let mut events = formatter.push(NO_CONTEXT_ANSWER);
                    events.extend(formatter.finish());
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    if let Err(e) = history
                        .record_turn(&conversation_id, "assistant", formatter.formatted())
                        .await
                    {
                        warn!("failed to persist assistant turn: {}", e);
                    }
                });
            }
            AssembledContext::Context { citations, .. } => {
                let model_rx = self.model.stream_answer(prepared.messages).await?;
                let budget = Duration::from_secs(self.settings.timeouts.generation_secs);
                let history = self.history.clone();
                let conversation_id = conversation_id.to_string();
                tokio::spawn(drive_generation(
                    model_rx,
                    StreamFormatter::new(citations),
                    tx,
                    budget,
                    history,
                    conversation_id,
                ));
            }
        }

        Ok(rx)
    }

    /// Non-streaming answer: drives the same generation path and collects
    /// the result. A failure after partial output is an error here, since
    /// there is no way to hand back a marked-partial body.
    pub async fn answer(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> Result<ChatAnswer, PipelineError> {
        let prepared = self.prepare(conversation_id, query).await?;
        self.history
            .record_turn(conversation_id, "user", query)
            .await?;

        match prepared.context {
            AssembledContext::NoContext => {
                self.history
                    .record_turn(conversation_id, "assistant", NO_CONTEXT_ANSWER)
                    .await?;
                Ok(ChatAnswer {
                    answer: NO_CONTEXT_ANSWER.to_string(),
                    citations: Vec::new(),
                })
            }
            AssembledContext::Context { citations, .. } => {
                let mut model_rx = self.model.stream_answer(prepared.messages).await?;
                let mut formatter = StreamFormatter::new(citations.clone());
                let deadline =
                    Instant::now() + Duration::from_secs(self.settings.timeouts.generation_secs);

                loop {
                    match timeout_at(deadline, model_rx.recv()).await {
                        Ok(Some(Ok(fragment))) => {
                            formatter.push(&fragment);
                        }
                        Ok(Some(Err(e))) => return Err(e),
                        Ok(None) => break,
                        Err(_) => {
                            return Err(PipelineError::Timeout(
                                Stage::Generation,
                                Duration::from_secs(self.settings.timeouts.generation_secs),
                            ))
                        }
                    }
                }

                formatter.finish();
                let answer = formatter.formatted().to_string();
                self.history
                    .record_turn(conversation_id, "assistant", &answer)
                    .await?;
                Ok(ChatAnswer { answer, citations })
            }
        }
    }

    async fn prepare(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> Result<PreparedRequest, PipelineError> {
        let candidates = self.retriever.retrieve(query).await?;
        let ranked = self.rerank_or_fallback(query, candidates).await;
        let context = self.assembler.assemble(self.tokenizer.as_ref(), &ranked);

        let messages = match &context {
            AssembledContext::NoContext => Vec::new(),
            AssembledContext::Context { text, .. } => {
                self.build_messages(conversation_id, query, text).await?
            }
        };

        Ok(PreparedRequest { context, messages })
    }

    /// Rerank when a reranker is configured; any rerank failure degrades to
    /// similarity order rather than failing the request.
    async fn rerank_or_fallback(
        &self,
        query: &str,
        candidates: Vec<RetrievalCandidate>,
    ) -> Vec<StoredChunk> {
        let Some(reranker) = &self.reranker else {
            return candidates.into_iter().map(|c| c.chunk).collect();
        };
        if candidates.len() < 2 {
            return candidates.into_iter().map(|c| c.chunk).collect();
        }

        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (c.chunk.chunk_id.clone(), c.chunk.text.clone()))
            .collect();

        let budget = Duration::from_secs(self.settings.rerank.timeout_secs);
        let outcome = match timeout(budget, reranker.rerank(query, &pairs)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::Timeout(Stage::Rerank, budget)),
        };

        match outcome {
            Ok(ranked) => {
                debug!(candidates = ranked.len(), "rerank applied");
                let mut by_id: std::collections::HashMap<String, StoredChunk> = candidates
                    .into_iter()
                    .map(|c| (c.chunk.chunk_id.clone(), c.chunk))
                    .collect();
                ranked
                    .into_iter()
                    .filter_map(|r| by_id.remove(&r.chunk_id))
                    .collect()
            }
            Err(e) => {
                warn!(
                    reranker = reranker.name(),
                    "rerank failed, falling back to similarity order: {}", e
                );
                candidates.into_iter().map(|c| c.chunk).collect()
            }
        }
    }

    async fn build_messages(
        &self,
        conversation_id: &str,
        query: &str,
        context_text: &str,
    ) -> Result<Vec<ChatMessage>, PipelineError> {
        let mut messages = vec![ChatMessage::system(format!(
            "{}\n\nContext:\n{}",
            SYSTEM_PROMPT, context_text
        ))];

        let turns = self
            .history
            .recent_turns(conversation_id, self.settings.history.prompt_turns)
            .await?;
        for turn in turns {
            let message = match turn.role.as_str() {
                "assistant" => ChatMessage::assistant(turn.content),
                _ => ChatMessage::user(turn.content),
            };
            messages.push(message);
        }

        messages.push(ChatMessage::user(query));
        Ok(messages)
    }
}

/// Pump model fragments through the formatter into the client channel.
/// Returns when the stream ends, errors, times out, or the client goes away.
async fn drive_generation(
    mut model_rx: mpsc::Receiver<Result<String, PipelineError>>,
    mut formatter: StreamFormatter,
    tx: mpsc::Sender<StreamEvent>,
    budget: Duration,
    history: Arc<ConversationStore>,
    conversation_id: String,
) {
    let deadline = Instant::now() + budget;

    loop {
        match timeout_at(deadline, model_rx.recv()).await {
            Ok(Some(Ok(fragment))) => {
                for event in formatter.push(&fragment) {
                    if tx.send(event).await.is_err() {
                        // Dropping model_rx propagates the cancellation
                        // upstream to the provider task.
                        info!("{}", PipelineError::Cancelled);
                        return;
                    }
                }
            }
            Ok(Some(Err(e))) => {
                warn!("generation failed mid-stream: {}", e);
                for event in formatter.fail(e.client_message()) {
                    let _ = tx.send(event).await;
                }
                persist_partial(&history, &conversation_id, &formatter).await;
                return;
            }
            Ok(None) => {
                for event in formatter.finish() {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                persist_partial(&history, &conversation_id, &formatter).await;
                return;
            }
            Err(_) => {
                let e = PipelineError::Timeout(Stage::Generation, budget);
                warn!("{}", e);
                for event in formatter.fail(e.client_message()) {
                    let _ = tx.send(event).await;
                }
                persist_partial(&history, &conversation_id, &formatter).await;
                return;
            }
        }
    }
}

async fn persist_partial(
    history: &ConversationStore,
    conversation_id: &str,
    formatter: &StreamFormatter,
) {
    if !formatter.emitted_any() {
        return;
    }
    if let Err(e) = history
        .record_turn(conversation_id, "assistant", formatter.formatted())
        .await
    {
        warn!("failed to persist assistant turn: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::core::config::Settings;
    use crate::pipeline::chunker::DocumentChunk;
    use crate::pipeline::tokenizer::WordTokenizer;
    use crate::provider::RankedCandidate;

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, PipelineError> {
            Ok(vec![1.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
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

    /// Emits scripted fragments, then either ends cleanly or errors.
    struct ScriptedModel {
        fragments: Vec<&'static str>,
        fail_after: bool,
        called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AnswerModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn stream_answer(
            &self,
            _messages: Vec<ChatMessage>,
        ) -> Result<mpsc::Receiver<Result<String, PipelineError>>, PipelineError> {
            self.called.store(true, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(8);
            let fragments: Vec<String> = self.fragments.iter().map(|s| s.to_string()).collect();
            let fail_after = self.fail_after;
            tokio::spawn(async move {
                for fragment in fragments {
                    if tx.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                }
                if fail_after {
                    let _ = tx
                        .send(Err(PipelineError::Generation("upstream reset".to_string())))
                        .await;
                }
            });
            Ok(rx)
        }
    }

    /// Streams fragments forever; flags when its channel closes.
    struct EndlessModel {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AnswerModel for EndlessModel {
        fn name(&self) -> &str {
            "endless"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn stream_answer(
            &self,
            _messages: Vec<ChatMessage>,
        ) -> Result<mpsc::Receiver<Result<String, PipelineError>>, PipelineError> {
            let (tx, rx) = mpsc::channel(1);
            let closed = self.closed.clone();
            tokio::spawn(async move {
                loop {
                    if tx.send(Ok("tick\n".to_string())).await.is_err() {
                        closed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    /// Records the messages it was asked to answer, then ends immediately.
    struct CapturingModel {
        seen: Arc<std::sync::Mutex<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl AnswerModel for CapturingModel {
        fn name(&self) -> &str {
            "capturing"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn stream_answer(
            &self,
            messages: Vec<ChatMessage>,
        ) -> Result<mpsc::Receiver<Result<String, PipelineError>>, PipelineError> {
            if let Ok(mut seen) = self.seen.lock() {
                *seen = messages;
            }
            let (tx, rx) = mpsc::channel(1);
            drop(tx);
            Ok(rx)
        }
    }

    struct SlowReranker;

    #[async_trait]
    impl Reranker for SlowReranker {
        fn name(&self) -> &str {
            "slow"
        }

        async fn rerank(
            &self,
            _query: &str,
            candidates: &[(String, String)],
        ) -> Result<Vec<RankedCandidate>, PipelineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(candidates
                .iter()
                .map(|(id, _)| RankedCandidate {
                    chunk_id: id.clone(),
                    rerank_score: 1.0,
                })
                .collect())
        }
    }

    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        fn name(&self) -> &str {
            "reversing"
        }

        async fn rerank(
            &self,
            _query: &str,
            candidates: &[(String, String)],
        ) -> Result<Vec<RankedCandidate>, PipelineError> {
            Ok(candidates
                .iter()
                .rev()
                .map(|(id, _)| RankedCandidate {
                    chunk_id: id.clone(),
                    rerank_score: 1.0,
                })
                .collect())
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        fn name(&self) -> &str {
            "broken"
        }

        async fn rerank(
            &self,
            _query: &str,
            _candidates: &[(String, String)],
        ) -> Result<Vec<RankedCandidate>, PipelineError> {
            Err(PipelineError::Generation("rerank service down".to_string()))
        }
    }

    fn candidate(id: &str, similarity: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            chunk: StoredChunk {
                chunk_id: id.to_string(),
                document_id: "doc".to_string(),
                source: "wiki://doc".to_string(),
                text: format!("content of {}", id),
                token_count: 3,
                sequence_index: 0,
            },
            similarity,
        }
    }

    async fn test_history() -> Arc<ConversationStore> {
        let tmp =
            std::env::temp_dir().join(format!("deskmate-pipeline-{}.db", uuid::Uuid::new_v4()));
        Arc::new(ConversationStore::open(tmp).await.unwrap())
    }

    async fn pipeline(
        index: CannedIndex,
        reranker: Option<Arc<dyn Reranker>>,
        model: ScriptedModel,
    ) -> (RagPipeline, Arc<AtomicBool>) {
        let called = model.called.clone();
        let pipeline = RagPipeline::new(
            Arc::new(WordTokenizer),
            Arc::new(FixedEmbedder),
            Arc::new(index),
            reranker,
            Arc::new(model),
            test_history().await,
            Settings::default(),
        );
        (pipeline, called)
    }

    fn model(fragments: Vec<&'static str>, fail_after: bool) -> ScriptedModel {
        ScriptedModel {
            fragments,
            fail_after,
            called: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn tokens_of(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { token } => Some(token.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_streams_tokens_then_done() {
        let index = CannedIndex(vec![candidate("c1", 0.9)]);
        let (pipeline, _) = pipeline(index, None, model(vec!["The answer.\n"], false)).await;

        let rx = pipeline.answer_stream("conv", "what is it?").await.unwrap();
        let events = collect(rx).await;

        assert!(tokens_of(&events).contains("The answer."));
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        let terminals = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Done | StreamEvent::Error { .. }))
            .count();
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn no_context_streams_refusal_without_model_call() {
        let index = CannedIndex(Vec::new());
        let (pipeline, called) = pipeline(index, None, model(vec!["unused"], false)).await;

        let rx = pipeline.answer_stream("conv", "anything?").await.unwrap();
        let events = collect(rx).await;

        assert!(!called.load(Ordering::SeqCst));
        assert!(tokens_of(&events).contains("cannot give a grounded answer"));
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn below_threshold_candidates_mean_no_context() {
        let index = CannedIndex(vec![candidate("weak", 0.1)]);
        let (pipeline, called) = pipeline(index, None, model(vec!["unused"], false)).await;

        let rx = pipeline.answer_stream("conv", "anything?").await.unwrap();
        let events = collect(rx).await;

        assert!(!called.load(Ordering::SeqCst));
        assert!(tokens_of(&events).contains("cannot give a grounded answer"));
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_and_ends_with_error() {
        let index = CannedIndex(vec![candidate("c1", 0.9)]);
        let (pipeline, _) =
            pipeline(index, None, model(vec!["partial answer\n"], true)).await;

        let rx = pipeline.answer_stream("conv", "what is it?").await.unwrap();
        let events = collect(rx).await;

        assert!(tokens_of(&events).contains("partial answer"));
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert!(!events.contains(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn error_event_carries_no_internal_detail() {
        let index = CannedIndex(vec![candidate("c1", 0.9)]);
        let (pipeline, _) = pipeline(index, None, model(Vec::new(), true)).await;

        let rx = pipeline.answer_stream("conv", "what is it?").await.unwrap();
        let events = collect(rx).await;

        let Some(StreamEvent::Error { error }) = events.last() else {
            panic!("expected error terminal");
        };
        assert!(!error.contains("upstream reset"));
    }

    #[tokio::test]
    async fn reranker_order_drives_context_order() {
        let index = CannedIndex(vec![candidate("first", 0.9), candidate("second", 0.8)]);
        let (pipeline, _) = pipeline(
            index,
            Some(Arc::new(ReversingReranker)),
            model(vec!["ok\n"], false),
        )
        .await;

        let answer = pipeline.answer("conv", "what is it?").await.unwrap();
        assert_eq!(answer.citations[0].chunk_id, "second");
        assert_eq!(answer.citations[1].chunk_id, "first");
    }

    #[tokio::test]
    async fn rerank_failure_degrades_to_similarity_order() {
        let index = CannedIndex(vec![candidate("first", 0.9), candidate("second", 0.8)]);
        let (pipeline, _) = pipeline(
            index,
            Some(Arc::new(BrokenReranker)),
            model(vec!["ok\n"], false),
        )
        .await;

        let answer = pipeline.answer("conv", "what is it?").await.unwrap();
        assert_eq!(answer.citations[0].chunk_id, "first");
        assert_eq!(answer.citations[1].chunk_id, "second");
    }

    #[tokio::test]
    async fn non_streaming_answer_includes_sources() {
        let index = CannedIndex(vec![candidate("c1", 0.9)]);
        let (pipeline, _) = pipeline(index, None, model(vec!["The answer.\n"], false)).await;

        let answer = pipeline.answer("conv", "what is it?").await.unwrap();
        assert!(answer.answer.contains("Sources:"));
        assert_eq!(answer.citations.len(), 1);
    }

    #[tokio::test]
    async fn dropping_the_receiver_cancels_generation() {
        let closed = Arc::new(AtomicBool::new(false));
        let pipeline = RagPipeline::new(
            Arc::new(WordTokenizer),
            Arc::new(FixedEmbedder),
            Arc::new(CannedIndex(vec![candidate("c1", 0.9)])),
            None,
            Arc::new(EndlessModel {
                closed: closed.clone(),
            }),
            test_history().await,
            Settings::default(),
        );

        let mut rx = pipeline.answer_stream("conv", "what is it?").await.unwrap();
        assert!(rx.recv().await.is_some());
        drop(rx);

        // The model's sender sees the closed channel once the driver stops
        // pulling.
        for _ in 0..100 {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn history_roles_survive_into_prompt_messages() {
        let history = test_history().await;
        history
            .record_turn("conv", "user", "earlier question")
            .await
            .unwrap();
        history
            .record_turn("conv", "assistant", "earlier answer")
            .await
            .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = RagPipeline::new(
            Arc::new(WordTokenizer),
            Arc::new(FixedEmbedder),
            Arc::new(CannedIndex(vec![candidate("c1", 0.9)])),
            None,
            Arc::new(CapturingModel { seen: seen.clone() }),
            history,
            Settings::default(),
        );

        let rx = pipeline.answer_stream("conv", "follow-up?").await.unwrap();
        collect(rx).await;

        let messages = seen.lock().unwrap().clone();
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[1].content, "earlier question");
        assert_eq!(messages[2].role, "assistant");
        assert_eq!(messages[2].content, "earlier answer");
        assert_eq!(messages.last().unwrap().role, "user");
        assert_eq!(messages.last().unwrap().content, "follow-up?");
    }

    #[tokio::test]
    async fn rerank_timeout_degrades_to_similarity_order() {
        let mut settings = Settings::default();
        settings.rerank.timeout_secs = 1;
        let pipeline = RagPipeline::new(
            Arc::new(WordTokenizer),
            Arc::new(FixedEmbedder),
            Arc::new(CannedIndex(vec![
                candidate("first", 0.9),
                candidate("second", 0.8),
            ])),
            Some(Arc::new(SlowReranker)),
            Arc::new(model(vec!["ok\n"], false)),
            test_history().await,
            settings,
        );

        let answer = pipeline.answer("conv", "what is it?").await.unwrap();
        assert_eq!(answer.citations[0].chunk_id, "first");
        assert_eq!(answer.citations[1].chunk_id, "second");
    }

    #[tokio::test]
    async fn turns_are_persisted_after_completion() {
        let history = test_history().await;
        let pipeline = RagPipeline::new(
            Arc::new(WordTokenizer),
            Arc::new(FixedEmbedder),
            Arc::new(CannedIndex(vec![candidate("c1", 0.9)])),
            None,
            Arc::new(model(vec!["The answer.\n"], false)),
            history.clone(),
            Settings::default(),
        );

        let rx = pipeline.answer_stream("conv", "what is it?").await.unwrap();
        collect(rx).await;

        let turns = history.recent_turns("conv", 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[1].role, "assistant");
        assert!(turns[1].content.contains("The answer."));
    }
}
