//! Mock collaborators for testing.
//!
//! Deterministic embeddings, scripted classifier and LLM responses, and a
//! recording executor. Unit and end-to-end tests use these instead of live
//! model endpoints so the suite runs anywhere.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use intent_protocol::IntentCandidate;

use crate::services::{
    BusinessExecutor, ChatOptions, ClassifierService, EmbeddingService, LlmService, ServiceError,
    ServiceResult,
};

/// Dimension of the hashed bigram vectors.
pub const MOCK_EMBEDDING_DIM: usize = 256;

// ── Embedding ─────────────────────────────────────────────────

/// Hashes character bigrams into a fixed-size bag-of-bigrams vector, so
/// texts sharing more bigrams have higher cosine similarity.
pub struct MockEmbeddingService {
    overrides: Mutex<HashMap<String, Vec<f32>>>,
    available: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockEmbeddingService {
    pub fn new() -> Self {
        Self {
            overrides: Mutex::new(HashMap::new()),
            available: true,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails with `Unavailable`.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Every call sleeps first (for timeout tests).
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    /// Pin the vector returned for an exact text.
    pub fn set_vector(&self, text: &str, vector: Vec<f32>) {
        self.overrides.lock().unwrap().insert(text.to_string(), vector);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The deterministic vector for `text`.
    pub fn vector_for(text: &str) -> Vec<f32> {
        let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        let mut v = vec![0.0f32; MOCK_EMBEDDING_DIM];
        let mut bump = |s: &str| {
            let mut h = DefaultHasher::new();
            s.hash(&mut h);
            v[(h.finish() % MOCK_EMBEDDING_DIM as u64) as usize] += 1.0;
        };
        if chars.len() == 1 {
            bump(&chars[0].to_string());
        }
        for w in chars.windows(2) {
            bump(&w.iter().collect::<String>());
        }
        v
    }
}

impl Default for MockEmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingService for MockEmbeddingService {
    async fn encode(&self, text: &str) -> ServiceResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if !self.available {
            return Err(ServiceError::Unavailable("mock embedding offline".into()));
        }
        if let Some(v) = self.overrides.lock().unwrap().get(text) {
            return Ok(v.clone());
        }
        Ok(Self::vector_for(text))
    }
}

// ── Classifier ────────────────────────────────────────────────

/// Returns the same scripted predictions for every input.
pub struct MockClassifier {
    predictions: Vec<IntentCandidate>,
    healthy: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    health_checks: AtomicUsize,
}

impl MockClassifier {
    pub fn new(predictions: Vec<IntentCandidate>) -> Self {
        Self {
            predictions,
            healthy: true,
            delay: None,
            calls: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
        }
    }

    /// Health check fails; `classify` is never expected to run.
    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::new(Vec::new())
        }
    }

    /// Healthy, but `classify` sleeps for `delay` first.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierService for MockClassifier {
    async fn classify(
        &self,
        _text: &str,
        top_k: usize,
        min_confidence: f64,
    ) -> ServiceResult<Vec<IntentCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        Ok(self
            .predictions
            .iter()
            .filter(|c| c.confidence >= min_confidence)
            .take(top_k)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.healthy
    }
}

// ── LLM ───────────────────────────────────────────────────────

/// Pops one scripted reply per call (FIFO); an empty queue reads as an
/// unavailable backend.
pub struct MockLlm {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<(String, String)>>,
    available: bool,
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
            available: true,
            delay: None,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn slow(delay: Duration, responses: Vec<String>) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(responses)
        }
    }

    pub fn queue_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// `(system, user)` prompt pairs in call order.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmService for MockLlm {
    async fn chat(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _options: ChatOptions,
    ) -> ServiceResult<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_prompt.to_string()));
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if !self.available {
            return Err(ServiceError::Unavailable("mock llm offline".into()));
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ServiceError::Unavailable("no scripted response".into()))
    }
}

// ── Executor ──────────────────────────────────────────────────

/// Records every execution and returns a fixed result.
pub struct RecordingExecutor {
    executed: Mutex<Vec<(String, Value)>>,
    result: Value,
    fail: bool,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            result: json!({"ok": true}),
            fail: false,
        }
    }

    pub fn with_result(result: Value) -> Self {
        Self {
            result,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    /// `(intent_code, parameters)` in execution order.
    pub fn executed(&self) -> Vec<(String, Value)> {
        self.executed.lock().unwrap().clone()
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusinessExecutor for RecordingExecutor {
    async fn execute(&self, intent_code: &str, parameters: &Value) -> ServiceResult<Value> {
        self.executed
            .lock()
            .unwrap()
            .push((intent_code.to_string(), parameters.clone()));
        if self.fail {
            return Err(ServiceError::Execution(format!("{intent_code} failed")));
        }
        Ok(self.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cosine;

    #[tokio::test]
    async fn similar_texts_embed_closer() {
        let e = MockEmbeddingService::new();
        let a = e.encode("查询原料批次库存").await.unwrap();
        let b = e.encode("查一下原料批次库存").await.unwrap();
        let c = e.encode("员工考勤统计").await.unwrap();
        assert!(cosine(&a, &b) > cosine(&a, &c));
        assert_eq!(e.calls(), 3);
    }

    #[tokio::test]
    async fn embedding_is_deterministic() {
        assert_eq!(
            MockEmbeddingService::vector_for("带鱼入库"),
            MockEmbeddingService::vector_for("带鱼入库")
        );
    }

    #[tokio::test]
    async fn llm_pops_in_order_then_runs_dry() {
        let llm = MockLlm::new(vec!["a".into(), "b".into()]);
        assert_eq!(llm.chat("s", "u", ChatOptions::text()).await.unwrap(), "a");
        assert_eq!(llm.chat("s", "u", ChatOptions::text()).await.unwrap(), "b");
        assert!(llm.chat("s", "u", ChatOptions::text()).await.is_err());
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn classifier_filters_by_min_confidence() {
        let c = MockClassifier::new(vec![
            IntentCandidate::new("A", 0.9),
            IntentCandidate::new("B", 0.2),
        ]);
        let out = c.classify("x", 5, 0.5).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(c.health_check().await);
        assert!(!MockClassifier::unhealthy().health_check().await);
    }

    #[tokio::test]
    async fn executor_records_calls() {
        let ex = RecordingExecutor::new();
        ex.execute("ALERT_QUERY", &json!({"a": 1})).await.unwrap();
        assert_eq!(ex.calls(), 1);
        assert_eq!(ex.executed()[0].0, "ALERT_QUERY");
        assert!(RecordingExecutor::failing().execute("X", &json!({})).await.is_err());
    }
}
