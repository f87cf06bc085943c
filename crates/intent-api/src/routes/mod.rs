//! API route definitions and router builder.

pub mod conversations;
pub mod health;
pub mod intents;
pub mod maintenance;
pub mod previews;

use axum::Router;
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/intents/resolve", post(intents::resolve_intent))
        // Clarification dialogues
        .route("/conversations/{id}/reply", post(conversations::reply))
        .route("/conversations/{id}/cancel", post(conversations::cancel))
        // Try-Confirm-Cancel
        .route("/previews/{token}/confirm", post(previews::confirm))
        .route("/previews/{token}/cancel", post(previews::cancel))
        // Maintenance and learning output
        .route("/maintenance/{task}", post(maintenance::run_task))
        .route(
            "/factories/{factory_id}/suggestions",
            get(maintenance::suggestions),
        );

    Router::new()
        .route("/health", get(health::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use intent_pipeline::mock::RecordingExecutor;
    use intent_pipeline::{PipelineConfig, Services};

    fn app() -> Router {
        build_router(state())
    }

    fn state() -> AppState {
        AppState::in_memory(
            PipelineConfig::default(),
            Services::new(Arc::new(RecordingExecutor::with_result(json!({"rows": 3})))),
        )
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn resolve_body(text: &str) -> Value {
        json!({
            "factory_id": "F001",
            "user_id": "u-1",
            "user_role": "factory_admin",
            "text": text
        })
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["storage"], "memory");
    }

    #[tokio::test]
    async fn resolve_query_executes() {
        let app = app();
        let (status, json) = post_json(
            &app,
            "/api/v1/intents/resolve",
            resolve_body("最近7天带鱼入库多少"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["type"], "RESOLVED");
        assert_eq!(json["result"]["best_match_intent_code"], "MATERIAL_BATCH_QUERY");
        assert_eq!(json["execution"]["rows"], 3);
    }

    #[tokio::test]
    async fn resolve_rejects_empty_text() {
        let (status, json) =
            post_json(&app(), "/api/v1/intents/resolve", resolve_body("   ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["status"], 400);
    }

    #[tokio::test]
    async fn preview_confirm_is_single_use() {
        let app = app();
        let (_, preview) = post_json(
            &app,
            "/api/v1/intents/resolve",
            resolve_body("报废批次MB-20240301"),
        )
        .await;
        assert_eq!(preview["type"], "PREVIEW");
        assert_eq!(preview["status"], "PENDING");
        let token = preview["token"].as_str().unwrap().to_string();
        let uri = format!("/api/v1/previews/{token}/confirm");

        let (status, json) = post_json(&app, &uri, json!({"user_id": "u-2"})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["success"], false);

        let (status, json) = post_json(&app, &uri, json!({"user_id": "u-1"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);

        let (status, _) = post_json(&app, &uri, json!({"user_id": "u-1"})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn preview_cancel_then_confirm_fails() {
        let app = app();
        let (_, preview) = post_json(
            &app,
            "/api/v1/intents/resolve",
            resolve_body("报废批次MB-20240301"),
        )
        .await;
        let token = preview["token"].as_str().unwrap().to_string();

        let (status, _) = post_json(
            &app,
            &format!("/api/v1/previews/{token}/cancel"),
            json!({"user_id": "u-1", "reason": "录入错误"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post_json(
            &app,
            &format!("/api/v1/previews/{token}/confirm"),
            json!({"user_id": "u-1"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unclear_query_opens_conversation_that_can_be_cancelled() {
        let app = app();
        let (status, json) = post_json(
            &app,
            "/api/v1/intents/resolve",
            resolve_body("那个东西怎么弄"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["type"], "CONVERSATION");
        assert_eq!(json["round"], 1);
        let id = json["session_id"].as_str().unwrap().to_string();

        let (status, json) = post_json(
            &app,
            &format!("/api/v1/conversations/{id}/cancel"),
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "CANCELLED");
    }

    #[tokio::test]
    async fn reply_to_unknown_session_is_not_found() {
        let id = uuid::Uuid::now_v7();
        let (status, _) = post_json(
            &app(),
            &format!("/api/v1/conversations/{id}/reply"),
            json!({"reply": "1"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn maintenance_task_runs_and_rejects_unknown() {
        let app = app();
        let (status, json) = post_json(&app, "/api/v1/maintenance/sweep-tokens", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["task"], "sweep-tokens");
        assert_eq!(json["affected"], 0);

        let (status, _) = post_json(&app, "/api/v1/maintenance/vacuum", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn suggestions_start_empty() {
        let response = app()
            .oneshot(
                Request::get("/api/v1/factories/F001/suggestions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert!(json.is_empty());
    }
}
