//! Document ingestion, deletion, and the retrieval debug endpoint.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::core::errors::ApiError;
use crate::index::Document;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpsertDocumentRequest {
    pub id: String,
    #[serde(default)]
    pub source_uri: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

pub async fn upsert_document(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpsertDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.id.trim().is_empty() {
        return Err(ApiError::BadRequest("document id cannot be empty".to_string()));
    }
    if request.text.trim().is_empty() {
        return Err(ApiError::BadRequest("document text cannot be empty".to_string()));
    }

    let document = Document {
        source_uri: request.source_uri.unwrap_or_else(|| request.id.clone()),
        id: request.id,
        raw_text: request.text,
        metadata: request.metadata,
    };

    let summary = state.pipeline.index_document(&document).await?;
    Ok(Json(json!({
        "document_id": summary.document_id,
        "chunk_count": summary.chunk_count,
    })))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.pipeline.delete_document(&document_id).await?;
    if removed == 0 {
        return Err(ApiError::NotFound(format!(
            "document {} not found",
            document_id
        )));
    }

    info!(document_id = %document_id, removed, "document removed");
    Ok(Json(json!({
        "document_id": document_id,
        "chunks_removed": removed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
}

/// Raw retrieval results, for inspecting what the pipeline would see.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.q.trim().is_empty() {
        return Err(ApiError::BadRequest("q cannot be empty".to_string()));
    }

    let candidates = state.pipeline.search(&params.q).await?;
    let results: Vec<_> = candidates
        .iter()
        .map(|c| {
            json!({
                "chunk_id": c.chunk.chunk_id,
                "document_id": c.chunk.document_id,
                "source": c.chunk.source,
                "similarity": c.similarity,
                "sequence_index": c.chunk.sequence_index,
                "text": c.chunk.text,
            })
        })
        .collect();

    Ok(Json(json!({ "results": results })))
}
