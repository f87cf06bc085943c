//! Unified API error type with Axum `IntoResponse` support.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use intent_pipeline::PipelineError;

/// API error type that converts to proper HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::SessionNotFound(_) => Self::NotFound(e.to_string()),
            PipelineError::PermissionDenied { .. } => Self::Forbidden(e.to_string()),
            PipelineError::InvalidToken(_)
            | PipelineError::UnknownIntent(_)
            | PipelineError::UnknownTool(_) => Self::BadRequest(e.to_string()),
            PipelineError::MutationRequiresPreview(_) => Self::Conflict(e.to_string()),
            PipelineError::Storage(_) | PipelineError::Config(_) | PipelineError::Service(_) => {
                tracing::error!(error = %e, "pipeline failure");
                Self::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
        };

        let body = json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience alias.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn not_found_response() {
        let id = Uuid::now_v7();
        let response = ApiError::from(PipelineError::SessionNotFound(id)).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], 404);
        assert!(json["error"].as_str().unwrap().contains(&id.to_string()));
    }

    #[tokio::test]
    async fn permission_denied_is_forbidden() {
        let err: ApiError = PipelineError::PermissionDenied {
            tool: "material_batch_consume".into(),
            role: "viewer".into(),
        }
        .into();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn storage_failure_is_internal() {
        let err: ApiError = PipelineError::Storage("connection reset".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn bad_request_response() {
        let err = ApiError::BadRequest("missing field".into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
