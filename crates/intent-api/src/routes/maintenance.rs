//! Manual triggers for the scheduled maintenance tasks, plus the learning
//! loop's output.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};

use intent_pipeline::MaintenanceTask;
use intent_pipeline::maintenance::run_once;
use intent_protocol::OptimizationSuggestion;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /api/v1/maintenance/{task}
pub async fn run_task(
    State(state): State<AppState>,
    Path(task): Path<String>,
) -> ApiResult<Json<Value>> {
    let task: MaintenanceTask = task
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown maintenance task '{task}'")))?;
    let affected = run_once(&state.pipeline, task).await?;
    tracing::info!(task = %task, affected, "maintenance triggered via api");
    Ok(Json(json!({
        "task": task.as_str(),
        "affected": affected,
    })))
}

/// GET /api/v1/factories/{factory_id}/suggestions
pub async fn suggestions(
    State(state): State<AppState>,
    Path(factory_id): Path<String>,
) -> ApiResult<Json<Vec<OptimizationSuggestion>>> {
    Ok(Json(state.pipeline.suggestions(&factory_id).await?))
}
