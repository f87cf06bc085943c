//! HTTP clients for the embedding, classifier and LLM endpoints.
//!
//! The LLM client speaks the Ollama `/api/chat` protocol. Embedding and
//! classifier endpoints are small JSON services:
//!
//! - `POST {base}/embed` `{"text"}` → `{"embedding": [f32]}`
//! - `POST {base}/classify` `{"text", "top_k", "min_confidence"}` →
//!   `{"predictions": [{"intent_code", "confidence"}]}`
//! - `GET {base}/health` → 200 when ready
//! - `POST {base}/execute` `{"intent_code", "parameters"}` → any JSON result

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use intent_protocol::IntentCandidate;

use crate::config::EndpointConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::services::{
    BusinessExecutor, ChatOptions, ClassifierService, EmbeddingService, LlmService, ServiceError,
    ServiceResult,
};

const DEFAULT_LLM_MODEL: &str = "qwen2.5:7b";

fn build_client(config: &EndpointConfig) -> PipelineResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| PipelineError::Config(format!("http client for {}: {e}", config.base_url)))
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

async fn ensure_success(resp: reqwest::Response) -> ServiceResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.is_server_error() {
        Err(ServiceError::Unavailable(format!("upstream returned {status}")))
    } else {
        Err(ServiceError::Http(format!("upstream returned {status}")))
    }
}

// ── Embedding ─────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EndpointConfig) -> PipelineResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingClient {
    async fn encode(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let resp = self
            .client
            .post(endpoint(&self.base_url, "embed"))
            .json(&EmbedRequest { text })
            .send()
            .await?;
        let body: EmbedResponse = ensure_success(resp).await?.json().await?;
        if body.embedding.is_empty() {
            return Err(ServiceError::InvalidResponse("empty embedding".into()));
        }
        Ok(body.embedding)
    }
}

// ── Classifier ────────────────────────────────────────────────

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
    top_k: usize,
    min_confidence: f64,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    predictions: Vec<IntentCandidate>,
}

pub struct HttpClassifierClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClassifierClient {
    pub fn new(config: &EndpointConfig) -> PipelineResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl ClassifierService for HttpClassifierClient {
    async fn classify(
        &self,
        text: &str,
        top_k: usize,
        min_confidence: f64,
    ) -> ServiceResult<Vec<IntentCandidate>> {
        let resp = self
            .client
            .post(endpoint(&self.base_url, "classify"))
            .json(&ClassifyRequest {
                text,
                top_k,
                min_confidence,
            })
            .send()
            .await?;
        let body: ClassifyResponse = ensure_success(resp).await?.json().await?;
        Ok(body
            .predictions
            .into_iter()
            .map(|p| IntentCandidate::new(p.intent_code, p.confidence))
            .collect())
    }

    async fn health_check(&self) -> bool {
        match self.client.get(endpoint(&self.base_url, "health")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "classifier health check failed");
                false
            }
        }
    }
}

// ── LLM (Ollama chat) ─────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama chat API response (only fields we need).
#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

pub struct OllamaLlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaLlmClient {
    pub fn new(config: &EndpointConfig) -> PipelineResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.clone(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl LlmService for OllamaLlmClient {
    async fn chat(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: ChatOptions,
    ) -> ServiceResult<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            format: options.json.then_some("json"),
            stream: false,
            options: SamplingOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        let resp = self
            .client
            .post(endpoint(&self.base_url, "api/chat"))
            .json(&body)
            .send()
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "llm request failed"))?;
        let chat: ChatResponse = ensure_success(resp).await?.json().await?;

        match chat.message {
            Some(m) if !m.content.trim().is_empty() => Ok(m.content),
            _ => Err(ServiceError::InvalidResponse("llm returned no content".into())),
        }
    }
}

// ── Business executor ─────────────────────────────────────────

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    intent_code: &'a str,
    parameters: &'a serde_json::Value,
}

pub struct HttpExecutorClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutorClient {
    pub fn new(config: &EndpointConfig) -> PipelineResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl BusinessExecutor for HttpExecutorClient {
    async fn execute(
        &self,
        intent_code: &str,
        parameters: &serde_json::Value,
    ) -> ServiceResult<serde_json::Value> {
        let resp = self
            .client
            .post(endpoint(&self.base_url, "execute"))
            .json(&ExecuteRequest {
                intent_code,
                parameters,
            })
            .send()
            .await?;
        let status = resp.status();
        if status.is_client_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Execution(format!("{intent_code} rejected ({status}): {body}")));
        }
        Ok(ensure_success(resp).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> EndpointConfig {
        EndpointConfig {
            base_url: server.uri(),
            timeout_secs: 2,
            model: Some("test-model".into()),
        }
    }

    #[tokio::test]
    async fn embedding_client_returns_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .and(body_partial_json(json!({"text": "带鱼入库"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1, 0.2]})))
            .mount(&server)
            .await;

        let client = HttpEmbeddingClient::new(&config(&server)).unwrap();
        assert_eq!(client.encode("带鱼入库").await.unwrap(), vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn embedding_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpEmbeddingClient::new(&config(&server)).unwrap();
        assert!(matches!(
            client.encode("x").await,
            Err(ServiceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn classifier_parses_predictions_and_health() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .and(body_partial_json(json!({"top_k": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [
                    {"intent_code": "MATERIAL_BATCH_QUERY", "confidence": 0.91},
                    {"intent_code": "SHIPMENT_QUERY", "confidence": 0.05}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpClassifierClient::new(&config(&server)).unwrap();
        let preds = client.classify("带鱼库存", 3, 0.0).await.unwrap();
        assert_eq!(preds[0].intent_code, "MATERIAL_BATCH_QUERY");
        assert!(client.health_check().await);
    }

    #[tokio::test]
    async fn classifier_health_false_when_unreachable() {
        let client = HttpClassifierClient::new(&EndpointConfig {
            base_url: "http://127.0.0.1:1".into(),
            timeout_secs: 1,
            model: None,
        })
        .unwrap();
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn ollama_chat_requests_json_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "test-model", "format": "json", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "{\"intent_code\": \"ALERT_QUERY\"}"}
            })))
            .mount(&server)
            .await;

        let client = OllamaLlmClient::new(&config(&server)).unwrap();
        let out = client.chat("sys", "user", ChatOptions::json()).await.unwrap();
        assert!(out.contains("ALERT_QUERY"));
    }

    #[tokio::test]
    async fn ollama_empty_message_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": null})))
            .mount(&server)
            .await;

        let client = OllamaLlmClient::new(&config(&server)).unwrap();
        assert!(matches!(
            client.chat("s", "u", ChatOptions::text()).await,
            Err(ServiceError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn executor_posts_intent_and_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(json!({
                "intent_code": "MATERIAL_BATCH_DISPOSE",
                "parameters": {"batch_id": "MB-20240301"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"disposed": 1})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(body_partial_json(json!({"intent_code": "UNKNOWN"})))
            .respond_with(ResponseTemplate::new(422).set_body_string("no such intent"))
            .mount(&server)
            .await;

        let client = HttpExecutorClient::new(&config(&server)).unwrap();
        let out = client
            .execute("MATERIAL_BATCH_DISPOSE", &json!({"batch_id": "MB-20240301"}))
            .await
            .unwrap();
        assert_eq!(out["disposed"], 1);
        assert!(matches!(
            client.execute("UNKNOWN", &json!({})).await,
            Err(ServiceError::Execution(_))
        ));
    }
}
