//! Layer 2: multi-label embedding similarity against catalog examples.

use std::sync::Arc;

use async_trait::async_trait;

use intent_protocol::{IntentCandidate, IntentMatchResult, MatchSource};

use super::cache::IntentEmbeddingIndex;
use super::{LadderInput, LadderLayer, LayerOutcome};
use crate::config::ThresholdConfig;
use crate::services::{EmbeddingService, cosine};

/// Map cosine similarity onto [0, 1] with a logistic curve.
pub fn similarity_to_confidence(similarity: f64, center: f64, steepness: f64) -> f64 {
    1.0 / (1.0 + (-steepness * (similarity - center)).exp())
}

pub struct EmbeddingLayer {
    service: Arc<dyn EmbeddingService>,
    index: Arc<IntentEmbeddingIndex>,
    candidate_threshold: f64,
    accept_threshold: f64,
    center: f64,
    steepness: f64,
}

impl EmbeddingLayer {
    pub fn new(
        service: Arc<dyn EmbeddingService>,
        index: Arc<IntentEmbeddingIndex>,
        thresholds: &ThresholdConfig,
    ) -> Self {
        Self {
            service,
            index,
            candidate_threshold: thresholds.embedding_candidate,
            accept_threshold: thresholds.embedding_accept,
            center: thresholds.sigmoid_center,
            steepness: thresholds.sigmoid_steepness,
        }
    }
}

#[async_trait]
impl LadderLayer for EmbeddingLayer {
    fn source(&self) -> MatchSource {
        MatchSource::Embedding
    }

    fn is_network(&self) -> bool {
        true
    }

    fn applies(&self, _best: Option<&IntentMatchResult>) -> bool {
        true
    }

    async fn evaluate(
        &self,
        input: &LadderInput<'_>,
        _best: Option<&IntentMatchResult>,
    ) -> LayerOutcome {
        let query = match input.cache.embedding(self.service.as_ref(), input.text).await {
            Ok(v) => v,
            Err(e) => return LayerOutcome::Unavailable(e.to_string()),
        };

        // Each intent is scored on its own; several may clear the threshold.
        let mut candidates = Vec::new();
        for def in input.intents {
            let examples = match self
                .index
                .vectors(self.service.as_ref(), input.factory_id, def)
                .await
            {
                Ok(v) => v,
                Err(e) => return LayerOutcome::Unavailable(e.to_string()),
            };
            let similarity = examples
                .iter()
                .map(|e| cosine(&query, e))
                .fold(0.0f64, f64::max);
            let confidence = similarity_to_confidence(similarity, self.center, self.steepness);
            if confidence >= self.candidate_threshold {
                candidates.push(IntentCandidate::new(def.intent_code.clone(), confidence));
            }
        }

        if candidates.is_empty() {
            return LayerOutcome::Skipped {
                reason: "no intent above embedding threshold".into(),
                tentative: None,
            };
        }

        let result = IntentMatchResult::from_candidates(MatchSource::Embedding, candidates);
        if result.confidence >= self.accept_threshold {
            LayerOutcome::Accepted(result)
        } else {
            LayerOutcome::Skipped {
                reason: "embedding match below acceptance".into(),
                tentative: Some(result),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::tests::Fixture;
    use crate::mock::MockEmbeddingService;

    fn layer(svc: Arc<MockEmbeddingService>) -> EmbeddingLayer {
        EmbeddingLayer::new(
            svc,
            Arc::new(IntentEmbeddingIndex::new()),
            &ThresholdConfig::default(),
        )
    }

    #[test]
    fn sigmoid_is_centered() {
        assert!((similarity_to_confidence(0.55, 0.55, 12.0) - 0.5).abs() < 1e-9);
        assert!(similarity_to_confidence(1.0, 0.55, 12.0) > 0.99);
        assert!(similarity_to_confidence(0.0, 0.55, 12.0) < 0.01);
    }

    #[tokio::test]
    async fn exact_example_is_accepted() {
        let f = Fixture::new("哪些物料快过期了");
        match layer(Arc::new(MockEmbeddingService::new())).evaluate(&f.input(), None).await {
            LayerOutcome::Accepted(r) => {
                assert_eq!(
                    r.best_match_intent_code.as_deref(),
                    Some("MATERIAL_EXPIRING_QUERY")
                );
                assert_eq!(r.source, MatchSource::Embedding);
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrelated_text_has_no_candidates() {
        let f = Fixture::new("今天天气不错呀朋友");
        assert!(matches!(
            layer(Arc::new(MockEmbeddingService::new())).evaluate(&f.input(), None).await,
            LayerOutcome::Skipped { tentative: None, .. }
        ));
    }

    #[tokio::test]
    async fn multi_label_keeps_every_candidate_over_threshold() {
        let svc = Arc::new(MockEmbeddingService::new());
        let f = Fixture::new("pinned query");
        // Pin one example of each shipment intent to the query's vector.
        let q = MockEmbeddingService::vector_for("今天发了多少货");
        svc.set_vector("pinned query", q.clone());
        svc.set_vector("本月出货量环比", q);

        match layer(svc).evaluate(&f.input(), None).await {
            LayerOutcome::Accepted(r) => {
                let codes: Vec<_> = r.candidates.iter().map(|c| c.intent_code.as_str()).collect();
                assert!(codes.contains(&"SHIPMENT_QUERY"));
                assert!(codes.contains(&"SHIPMENT_PERIOD_COMPARISON"));
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn service_down_is_unavailable() {
        let f = Fixture::new("查一下库存");
        assert!(matches!(
            layer(Arc::new(MockEmbeddingService::unavailable()))
                .evaluate(&f.input(), None)
                .await,
            LayerOutcome::Unavailable(_)
        ));
    }
}
