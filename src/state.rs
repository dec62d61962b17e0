//! Shared application state, built once at startup.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::core::config::{AppPaths, Settings};
use crate::history::ConversationStore;
use crate::index::SqliteVectorIndex;
use crate::pipeline::tokenizer::{HfTokenizer, Tokenizer, WordTokenizer};
use crate::pipeline::RagPipeline;
use crate::provider::{HttpReranker, OpenAiProvider, Reranker};

pub struct AppState {
    pub paths: AppPaths,
    pub settings: Settings,
    pub pipeline: Arc<RagPipeline>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the shared state from already-discovered paths. Logging is
    /// expected to be initialized first so construction events are not
    /// lost.
    pub async fn initialize(paths: AppPaths) -> anyhow::Result<Arc<Self>> {
        let settings = Settings::load(&paths).context("failed to load settings")?;

        let tokenizer: Arc<dyn Tokenizer> = match &settings.provider.tokenizer_path {
            Some(path) => Arc::new(
                HfTokenizer::from_file(path)
                    .with_context(|| format!("failed to load tokenizer {}", path.display()))?,
            ),
            None => Arc::new(WordTokenizer),
        };

        let index = SqliteVectorIndex::open(paths.index_db_path.clone())
            .await
            .context("failed to open vector index")?;
        let history = ConversationStore::open(paths.history_db_path.clone())
            .await
            .context("failed to open history store")?;

        let provider = Arc::new(OpenAiProvider::new(&settings.provider));

        let reranker: Option<Arc<dyn Reranker>> = match &settings.rerank.endpoint {
            Some(endpoint) if settings.rerank.enabled => Some(Arc::new(
                HttpReranker::new(endpoint.clone(), settings.rerank.timeout_secs)
                    .context("failed to build reranker")?,
            )),
            _ => None,
        };
        if reranker.is_none() {
            info!("reranking disabled, using similarity order");
        }

        let pipeline = Arc::new(RagPipeline::new(
            tokenizer,
            provider.clone(),
            Arc::new(index),
            reranker,
            provider,
            Arc::new(history),
            settings.clone(),
        ));

        Ok(Arc::new(Self {
            paths,
            settings,
            pipeline,
            started_at: Utc::now(),
        }))
    }
}
