use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Stage at which an external-capability call timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Embedding,
    Retrieval,
    Rerank,
    Generation,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Embedding => "embedding",
            Stage::Retrieval => "retrieval",
            Stage::Rerank => "rerank",
            Stage::Generation => "generation",
        };
        f.write_str(name)
    }
}

/// Errors produced by the retrieval/generation pipeline.
///
/// `Config` is only ever raised at startup; the remaining variants are
/// per-request. Rerank failure is deliberately not represented here: the
/// pipeline degrades to similarity order instead of failing.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("query embedding failed: {0}")]
    Embedding(String),
    #[error("vector search failed: {0}")]
    Retrieval(String),
    #[error("answer generation failed: {0}")]
    Generation(String),
    #[error("{0} timed out after {1:?}")]
    Timeout(Stage, std::time::Duration),
    #[error("cancelled by client")]
    Cancelled,
}

impl PipelineError {
    /// Sanitized message for the client. The full error goes to the logs;
    /// clients never see internal detail.
    pub fn client_message(&self) -> String {
        match self {
            PipelineError::Config(_) => "The service is misconfigured.".to_string(),
            PipelineError::Embedding(_) => {
                "Document search is temporarily unavailable. Please try again shortly.".to_string()
            }
            PipelineError::Retrieval(_) => {
                "Document search failed. Please try again shortly.".to_string()
            }
            PipelineError::Generation(_) => {
                "Answer generation was interrupted. Please try again shortly.".to_string()
            }
            PipelineError::Timeout(_, _) => {
                "The request took too long to process. Please try again shortly.".to_string()
            }
            PipelineError::Cancelled => "Request cancelled.".to_string(),
        }
    }
}

/// HTTP boundary error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.client_message();
        match &err {
            PipelineError::Config(detail) => {
                tracing::error!("config error surfaced at request time: {}", detail);
                ApiError::Internal(message)
            }
            PipelineError::Embedding(detail) | PipelineError::Retrieval(detail) => {
                tracing::error!("retrieval pipeline failure: {}", detail);
                ApiError::ServiceUnavailable
            }
            PipelineError::Generation(detail) => {
                tracing::error!("generation failure: {}", detail);
                ApiError::Internal(message)
            }
            PipelineError::Timeout(stage, elapsed) => {
                tracing::error!("{} timed out after {:?}", stage, elapsed);
                ApiError::Internal(message)
            }
            PipelineError::Cancelled => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}
