use std::env;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::paths::AppPaths;
use crate::core::errors::PipelineError;

/// Typed server configuration, loaded once at startup and validated before
/// any traffic is accepted. Invalid chunking or retrieval parameters fail
/// fast here and never reach request handling.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub rerank: RerankSettings,
    pub provider: ProviderSettings,
    pub timeouts: TimeoutSettings,
    pub history: HistorySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
    /// Run the capability warmup before binding the listener.
    pub warm_up_on_start: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
            warm_up_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Window size in tokenizer tokens.
    pub chunk_tokens: usize,
    /// Overlap between consecutive windows, in tokens.
    pub overlap_tokens: usize,
    /// Tails shorter than this merge into the previous chunk.
    pub min_chunk_tokens: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_tokens: 400,
            overlap_tokens: 50,
            min_chunk_tokens: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Number of candidates requested from the index. Default 5, matching
    /// the reranker's final cut.
    pub top_k: usize,
    /// ANN search-effort knob: size of the candidate pool scored per query.
    pub ef_search: usize,
    /// Candidates scoring below this are dropped before reranking.
    pub similarity_threshold: f32,
    /// Token budget for the assembled prompt context.
    pub max_context_tokens: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            ef_search: 50,
            similarity_threshold: 0.3,
            max_context_tokens: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub enabled: bool,
    /// Base URL of a TEI-style `/rerank` endpoint. When unset, reranking is
    /// disabled regardless of `enabled`.
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// OpenAI-compatible base URL for chat + embeddings.
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    /// Optional `tokenizer.json` for token-exact chunk measurement; the
    /// word tokenizer is used when unset.
    pub tokenizer_path: Option<PathBuf>,
    pub temperature: f32,
    pub max_answer_tokens: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "bge-m3".to_string(),
            tokenizer_path: None,
            temperature: 0.3,
            max_answer_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub embed_secs: u64,
    pub search_secs: u64,
    pub generation_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            embed_secs: 10,
            search_secs: 10,
            generation_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// Recent turns folded into the prompt as conversation history.
    pub prompt_turns: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { prompt_turns: 6 }
    }
}

impl Settings {
    /// Load from the config file (missing file means defaults), apply
    /// environment overrides, then validate.
    pub fn load(paths: &AppPaths) -> Result<Self, PipelineError> {
        let path = paths.config_path();
        let mut settings = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
            serde_yaml::from_str::<Settings>(&contents)
                .map_err(|e| PipelineError::Config(format!("cannot parse {}: {}", path.display(), e)))?
        } else {
            Settings::default()
        };

        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = env::var("DESKMATE_API_KEY").or_else(|_| env::var("OPENAI_API_KEY")) {
            if !key.trim().is_empty() {
                self.provider.api_key = Some(key);
            }
        }
        if let Ok(url) = env::var("DESKMATE_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Some(value) = env_usize("DESKMATE_EF_SEARCH") {
            self.retrieval.ef_search = value;
        }
        if let Some(value) = env_usize("DESKMATE_CHUNK_TOKENS") {
            self.chunking.chunk_tokens = value;
        }
        if let Some(value) = env_usize("DESKMATE_OVERLAP_TOKENS") {
            self.chunking.overlap_tokens = value;
        }
        if let Some(value) = env_usize("DESKMATE_MIN_CHUNK_TOKENS") {
            self.chunking.min_chunk_tokens = value;
        }
        if let Ok(value) = env::var("DESKMATE_SIMILARITY_THRESHOLD") {
            if let Ok(parsed) = value.parse::<f32>() {
                self.retrieval.similarity_threshold = parsed;
            }
        }
        if env::var("DESKMATE_ENV").as_deref() == Ok("production") {
            self.server.warm_up_on_start = true;
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let c = &self.chunking;
        if c.chunk_tokens == 0 {
            return Err(PipelineError::Config(
                "chunking.chunk_tokens must be at least 1".to_string(),
            ));
        }
        if c.overlap_tokens >= c.chunk_tokens {
            return Err(PipelineError::Config(format!(
                "chunking.overlap_tokens ({}) must be smaller than chunk_tokens ({}): the window would never advance",
                c.overlap_tokens, c.chunk_tokens
            )));
        }
        if c.min_chunk_tokens > c.chunk_tokens {
            return Err(PipelineError::Config(format!(
                "chunking.min_chunk_tokens ({}) cannot exceed chunk_tokens ({})",
                c.min_chunk_tokens, c.chunk_tokens
            )));
        }

        let r = &self.retrieval;
        if r.top_k == 0 {
            return Err(PipelineError::Config(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if r.ef_search == 0 {
            return Err(PipelineError::Config(
                "retrieval.ef_search must be at least 1".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&r.similarity_threshold) {
            return Err(PipelineError::Config(format!(
                "retrieval.similarity_threshold ({}) must be within [-1, 1]",
                r.similarity_threshold
            )));
        }
        if r.max_context_tokens == 0 {
            return Err(PipelineError::Config(
                "retrieval.max_context_tokens must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("timeouts.embed_secs", self.timeouts.embed_secs),
            ("timeouts.search_secs", self.timeouts.search_secs),
            ("timeouts.generation_secs", self.timeouts.generation_secs),
        ] {
            if value == 0 {
                return Err(PipelineError::Config(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }

        if self.provider.base_url.trim().is_empty() {
            return Err(PipelineError::Config(
                "provider.base_url cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse::<usize>().ok())
}
