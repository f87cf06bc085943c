//! Preview token confirm / cancel endpoints.
//!
//! A refused confirmation (expired, unknown, already resolved, wrong user)
//! is answered with 409 and the `ConfirmResult` body.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;

use intent_protocol::ConfirmResult;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

fn reply(result: ConfirmResult) -> (StatusCode, Json<ConfirmResult>) {
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(result))
}

/// POST /api/v1/previews/{token}/confirm
pub async fn confirm(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<(StatusCode, Json<ConfirmResult>)> {
    let result = state.pipeline.confirm_preview(&token, &req.user_id).await?;
    Ok(reply(result))
}

/// POST /api/v1/previews/{token}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<(StatusCode, Json<ConfirmResult>)> {
    let result = state
        .pipeline
        .cancel_preview(&token, &req.user_id, req.reason)
        .await?;
    Ok(reply(result))
}
