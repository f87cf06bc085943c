//! Embedding caches.
//!
//! `RequestCache` lives for exactly one resolution and is dropped with it.
//! `IntentEmbeddingIndex` is shared and holds catalog example vectors, plus
//! the expressions learned from conversations, per `(factory, intent)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use intent_protocol::IntentDefinition;

use crate::learning::ExpressionStore;
use crate::services::{EmbeddingService, ServiceResult};

/// Query and sub-string embeddings for one request.
#[derive(Debug, Default)]
pub struct RequestCache {
    embeddings: Mutex<HashMap<String, Arc<Vec<f32>>>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn embedding(
        &self,
        service: &dyn EmbeddingService,
        text: &str,
    ) -> ServiceResult<Arc<Vec<f32>>> {
        if let Some(v) = self.lookup(text) {
            return Ok(v);
        }
        let v = Arc::new(service.encode(text).await?);
        if let Ok(mut map) = self.embeddings.lock() {
            map.insert(text.to_string(), v.clone());
        }
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.embeddings.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.embeddings.lock().ok()?.get(text).cloned()
    }
}

type IndexKey = (String, String);

/// Example-utterance vectors for catalog intents, shared across requests.
#[derive(Default)]
pub struct IntentEmbeddingIndex {
    vectors: RwLock<HashMap<IndexKey, Arc<Vec<Vec<f32>>>>>,
    expressions: Option<Arc<dyn ExpressionStore>>,
}

impl IntentEmbeddingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also index the expressions users confirmed for each intent.
    pub fn with_expressions(expressions: Arc<dyn ExpressionStore>) -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
            expressions: Some(expressions),
        }
    }

    /// Vectors for every example of `def` and every learned expression for
    /// it; an intent without examples is represented by its name and keywords.
    pub async fn vectors(
        &self,
        service: &dyn EmbeddingService,
        factory_id: &str,
        def: &IntentDefinition,
    ) -> ServiceResult<Arc<Vec<Vec<f32>>>> {
        let key = (factory_id.to_string(), def.intent_code.clone());
        if let Some(v) = self.vectors.read().await.get(&key) {
            return Ok(v.clone());
        }

        let mut texts: Vec<String> = if def.examples.is_empty() {
            vec![format!("{} {}", def.name, def.keywords.join(" "))]
        } else {
            def.examples.clone()
        };
        texts.extend(self.learned(factory_id, &def.intent_code).await);
        let mut encoded = Vec::with_capacity(texts.len());
        for t in &texts {
            encoded.push(service.encode(t).await?);
        }

        let encoded = Arc::new(encoded);
        self.vectors.write().await.insert(key, encoded.clone());
        Ok(encoded)
    }

    /// Drop a factory's vectors after its catalog changes.
    pub async fn invalidate(&self, factory_id: &str) {
        self.vectors.write().await.retain(|(f, _), _| f != factory_id);
    }

    /// Drop every vector so newly learned expressions are picked up.
    pub async fn clear(&self) {
        self.vectors.write().await.clear();
    }

    async fn learned(&self, factory_id: &str, intent_code: &str) -> Vec<String> {
        let Some(store) = &self.expressions else {
            return Vec::new();
        };
        match store.list(factory_id).await {
            Ok(all) => all
                .into_iter()
                .filter(|e| e.intent_code == intent_code)
                .map(|e| e.expression)
                .collect(),
            Err(e) => {
                tracing::warn!(factory_id = %factory_id, error = %e, "learned expressions unavailable");
                Vec::new()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }
}
