//! Chat endpoints: the SSE streaming channel and its non-streaming twin.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::core::errors::ApiError;
use crate::pipeline::stream::StreamEvent;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn validate(request: &ChatRequest) -> Result<String, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query cannot be empty".to_string()));
    }
    Ok(request
        .conversation_id
        .clone()
        .unwrap_or_else(|| "default".to_string()))
}

/// Streaming answer over SSE. Pipeline failures before the first token are
/// plain HTTP errors; after that, the stream itself carries the terminal
/// error event. Client disconnects drop the stream, which cancels the
/// generation upstream.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let conversation_id = validate(&request)?;
    info!(conversation_id = %conversation_id, "chat stream request");

    let rx = state
        .pipeline
        .answer_stream(&conversation_id, &request.query)
        .await?;

    let stream = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((sse_frame(&event), rx))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_frame(event: &StreamEvent) -> Result<Event, Infallible> {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"type":"error","error":"serialization failed"}"#.to_string());
    Ok(Event::default().data(payload))
}

/// Non-streaming answer, for clients that cannot consume SSE.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation_id = validate(&request)?;
    info!(conversation_id = %conversation_id, "chat request");

    let answer = state
        .pipeline
        .answer(&conversation_id, &request.query)
        .await?;

    Ok(Json(json!({
        "conversation_id": conversation_id,
        "answer": answer.answer,
        "citations": answer.citations,
    })))
}
