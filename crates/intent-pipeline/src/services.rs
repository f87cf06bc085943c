//! Collaborator seams: embedding, classifier, LLM and business executors.
//!
//! All four are opaque to the pipeline. HTTP implementations live in
//! [`crate::clients`], scripted ones in [`crate::mock`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use intent_protocol::IntentCandidate;

/// Failure of an external collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("service call timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Unavailable(e.to_string())
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Text → dense vector.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn encode(&self, text: &str) -> ServiceResult<Vec<f32>>;
}

/// Remote softmax classifier over the full intent taxonomy.
#[async_trait]
pub trait ClassifierService: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        top_k: usize,
        min_confidence: f64,
    ) -> ServiceResult<Vec<IntentCandidate>>;

    async fn health_check(&self) -> bool;
}

/// Sampling knobs passed through to the LLM backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the backend for a JSON-only answer when it supports that.
    pub json: bool,
}

impl ChatOptions {
    pub fn json() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 512,
            json: true,
        }
    }

    pub fn text() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 256,
            json: false,
        }
    }
}

#[async_trait]
pub trait LlmService: Send + Sync {
    async fn chat(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: ChatOptions,
    ) -> ServiceResult<String>;
}

/// The business service that actually performs an intent.
#[async_trait]
pub trait BusinessExecutor: Send + Sync {
    async fn execute(
        &self,
        intent_code: &str,
        parameters: &serde_json::Value,
    ) -> ServiceResult<serde_json::Value>;
}

/// Cosine similarity; 0.0 for empty or mismatched vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Pull the first JSON object out of an LLM reply that may be wrapped in
/// prose or a markdown fence.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();
    if let Some(start) = text.find('{')
        && let Some(end) = text.rfind('}')
        && end > start
    {
        return &text[start..=end];
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_degenerate_input() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn extract_json_strips_fences() {
        let raw = "```json\n{\"intent_code\": \"X\"}\n```";
        assert_eq!(extract_json(raw), "{\"intent_code\": \"X\"}");
        assert_eq!(extract_json("no json here"), "no json here");
    }
}
