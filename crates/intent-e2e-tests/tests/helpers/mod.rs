//! Shared test harness for E2E integration tests.
//!
//! Wires the real pipeline (in-memory stores, mock model services) behind
//! the real Axum router, so a test can drive it over HTTP or call the
//! pipeline directly and then inspect the stores.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use intent_api::routes::build_router;
use intent_api::state::AppState;
use intent_pipeline::mock::RecordingExecutor;
use intent_pipeline::{InMemoryCatalog, IntentPipeline, PipelineConfig, Services, Stores};
use intent_protocol::RequestContext;

pub const FACTORY: &str = "factory-qd-01";

/// End-to-end harness: one pipeline, its stores and the router over it.
pub struct TestHarness {
    pub state: AppState,
    pub router: Router,
    /// Store handles shared with the pipeline, for asserting persisted state.
    pub stores: Stores,
    pub executor: Arc<RecordingExecutor>,
}

impl TestHarness {
    /// Rule layer only, default config.
    pub fn new() -> Self {
        Self::build(PipelineConfig::default(), |_| {})
    }

    /// `configure` may attach embedding / classifier / LLM mocks.
    pub fn build(config: PipelineConfig, configure: impl FnOnce(&mut Services)) -> Self {
        let executor = Arc::new(RecordingExecutor::with_result(json!({"rows": 3})));
        let mut services = Services::new(executor.clone());
        configure(&mut services);

        let stores = Stores::in_memory();
        let pipeline = IntentPipeline::new(
            config,
            Arc::new(InMemoryCatalog::factory_defaults()),
            services,
            stores.clone(),
        );
        let state = AppState {
            pipeline: Arc::new(pipeline),
            pool: None,
        };
        let router = build_router(state.clone());

        Self {
            state,
            router,
            stores,
            executor,
        }
    }

    pub fn pipeline(&self) -> &Arc<IntentPipeline> {
        &self.state.pipeline
    }

    pub fn ctx(user_id: &str) -> RequestContext {
        RequestContext::new(FACTORY, user_id, "factory_admin")
    }

    /// POST a JSON body. Returns (HTTP status code, response JSON body).
    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .router
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
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        (status, json)
    }

    /// Resolve an utterance via POST /api/v1/intents/resolve.
    pub async fn resolve(&self, user_id: &str, text: &str) -> (StatusCode, Value) {
        self.post(
            "/api/v1/intents/resolve",
            json!({
                "factory_id": FACTORY,
                "user_id": user_id,
                "user_role": "factory_admin",
                "text": text,
            }),
        )
        .await
    }

    /// Answer a clarification question via POST /api/v1/conversations/{id}/reply.
    pub async fn reply(&self, session_id: &str, reply: &str) -> (StatusCode, Value) {
        let uri = format!("/api/v1/conversations/{session_id}/reply");
        self.post(&uri, json!({ "reply": reply })).await
    }

    /// Confirm a preview via POST /api/v1/previews/{token}/confirm.
    pub async fn confirm(&self, token: &str, user_id: &str) -> (StatusCode, Value) {
        let uri = format!("/api/v1/previews/{token}/confirm");
        self.post(&uri, json!({ "user_id": user_id })).await
    }

    pub async fn cancel(&self, token: &str, user_id: &str) -> (StatusCode, Value) {
        let uri = format!("/api/v1/previews/{token}/cancel");
        self.post(&uri, json!({ "user_id": user_id, "reason": "changed my mind" }))
            .await
    }

    pub async fn run_task(&self, task: &str) -> (StatusCode, Value) {
        self.post(&format!("/api/v1/maintenance/{task}"), json!({})).await
    }
}
