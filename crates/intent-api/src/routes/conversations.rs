//! Clarification dialogue endpoints.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use uuid::Uuid;

use intent_protocol::ConversationResponse;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReplyRequest {
    pub reply: String,
}

/// POST /api/v1/conversations/{id}/reply
pub async fn reply(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<ReplyRequest>,
) -> ApiResult<Json<ConversationResponse>> {
    if req.reply.trim().is_empty() {
        return Err(ApiError::BadRequest("reply must not be empty".into()));
    }
    let response = state
        .pipeline
        .continue_conversation(session_id, &req.reply)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/conversations/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<ConversationResponse>> {
    Ok(Json(state.pipeline.cancel_conversation(session_id).await?))
}
