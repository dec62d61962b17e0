//! Cross-encoder reranking over a text-embeddings-inference style endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{RankedCandidate, Reranker};
use crate::core::errors::PipelineError;

pub struct HttpReranker {
    endpoint: String,
    client: Client,
}

#[derive(Deserialize)]
struct RerankRow {
    index: usize,
    score: f32,
}

impl HttpReranker {
    pub fn new(endpoint: String, timeout_secs: u64) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build rerank client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        "http-rerank"
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<RankedCandidate>, PipelineError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/rerank", self.endpoint);
        let texts: Vec<&str> = candidates.iter().map(|(_, text)| text.as_str()).collect();
        let body = json!({
            "query": query,
            "texts": texts,
        });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Generation(format!("rerank request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(PipelineError::Generation(format!(
                "rerank endpoint returned {}: {}",
                status, text
            )));
        }

        let rows: Vec<RerankRow> = res
            .json()
            .await
            .map_err(|e| PipelineError::Generation(format!("rerank response invalid: {}", e)))?;

        // The endpoint returns (index, score) pairs already sorted best
        // first; translate indexes back to chunk ids, dropping anything out
        // of range rather than trusting the remote blindly.
        let mut ranked: Vec<RankedCandidate> = rows
            .into_iter()
            .filter_map(|row| {
                candidates.get(row.index).map(|(chunk_id, _)| RankedCandidate {
                    chunk_id: chunk_id.clone(),
                    rerank_score: row.score,
                })
            })
            .collect();

        if ranked.len() != candidates.len() {
            return Err(PipelineError::Generation(format!(
                "rerank covered {} of {} candidates",
                ranked.len(),
                candidates.len()
            )));
        }

        ranked.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(ranked)
    }
}
