use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

pub async fn health(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let documents = state.pipeline.document_count().await.unwrap_or(0);
    let chunks = state.pipeline.chunk_count().await.unwrap_or(0);
    let turns = state.pipeline.turn_count().await.unwrap_or(0);
    let uptime_secs = (Utc::now() - state.started_at).num_seconds().max(0);

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "documents": documents,
        "chunks": chunks,
        "conversation_turns": turns,
        "rerank_enabled": state.settings.rerank.enabled && state.settings.rerank.endpoint.is_some(),
        "chat_model": state.settings.provider.chat_model,
        "embedding_model": state.settings.provider.embedding_model,
    })))
}
