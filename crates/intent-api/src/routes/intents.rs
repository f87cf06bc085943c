//! Intent resolution endpoint.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;

use intent_pipeline::Resolution;
use intent_protocol::RequestContext;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Request body for resolving one user utterance.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub factory_id: String,
    pub user_id: String,
    /// Role used for tool permission checks.
    #[serde(default)]
    pub user_role: String,
    pub text: String,
}

/// POST /api/v1/intents/resolve
pub async fn resolve_intent(
    State(state): State<AppState>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<Json<Resolution>> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }
    if req.factory_id.is_empty() || req.user_id.is_empty() {
        return Err(ApiError::BadRequest("factory_id and user_id are required".into()));
    }
    let ctx = RequestContext::new(&req.factory_id, &req.user_id, &req.user_role);
    let resolution = state.pipeline.resolve_intent(&ctx, &req.text).await?;
    Ok(Json(resolution))
}
