//! Layer 3: remote softmax classifier.
//!
//! Health is checked at most once per re-check interval; an unhealthy
//! service is skipped without being called.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use intent_protocol::{IntentMatchResult, MatchSource};

use super::{LadderInput, LadderLayer, LayerOutcome};
use crate::services::{ClassifierService, ServiceError};

const TOP_K: usize = 5;

pub struct ClassifierLayer {
    service: Arc<dyn ClassifierService>,
    accept: f64,
    recheck: Duration,
    health: Mutex<Option<(Instant, bool)>>,
}

impl ClassifierLayer {
    pub fn new(service: Arc<dyn ClassifierService>, accept: f64, recheck: Duration) -> Self {
        Self {
            service,
            accept,
            recheck,
            health: Mutex::new(None),
        }
    }

    async fn healthy(&self) -> bool {
        let mut cached = self.health.lock().await;
        if let Some((at, ok)) = *cached
            && at.elapsed() < self.recheck
        {
            return ok;
        }
        let ok = self.service.health_check().await;
        if !ok {
            tracing::warn!("classifier service unhealthy, skipping until re-check");
        }
        *cached = Some((Instant::now(), ok));
        ok
    }

    async fn mark_unhealthy(&self) {
        *self.health.lock().await = Some((Instant::now(), false));
    }
}

#[async_trait]
impl LadderLayer for ClassifierLayer {
    fn source(&self) -> MatchSource {
        MatchSource::Classifier
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
        if !self.healthy().await {
            return LayerOutcome::Unavailable("health check failed".into());
        }

        let predictions = match self.service.classify(input.text, TOP_K, 0.0).await {
            Ok(p) => p,
            Err(e) => {
                if matches!(e, ServiceError::Unavailable(_) | ServiceError::Timeout) {
                    self.mark_unhealthy().await;
                }
                return LayerOutcome::Unavailable(e.to_string());
            }
        };

        // The model may know intents this factory does not offer.
        let known: Vec<_> = predictions
            .into_iter()
            .filter(|p| input.knows(&p.intent_code))
            .collect();
        if known.is_empty() {
            return LayerOutcome::Skipped {
                reason: "no catalog intent predicted".into(),
                tentative: None,
            };
        }

        let result = IntentMatchResult::from_candidates(MatchSource::Classifier, known);
        if result.confidence >= self.accept {
            LayerOutcome::Accepted(result)
        } else {
            LayerOutcome::Skipped {
                reason: "classifier below acceptance".into(),
                tentative: Some(result),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::tests::Fixture;
    use crate::mock::MockClassifier;
    use intent_protocol::IntentCandidate;

    #[tokio::test]
    async fn confident_prediction_accepted() {
        let svc = Arc::new(MockClassifier::new(vec![
            IntentCandidate::new("ALERT_QUERY", 0.93),
            IntentCandidate::new("ALERT_ACKNOWLEDGE", 0.04),
        ]));
        let layer = ClassifierLayer::new(svc, 0.85, Duration::from_secs(60));
        let f = Fixture::new("最近的报警");
        match layer.evaluate(&f.input(), None).await {
            LayerOutcome::Accepted(r) => {
                assert_eq!(r.best_match_intent_code.as_deref(), Some("ALERT_QUERY"));
                assert_eq!(r.candidates.len(), 2);
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_intents_filtered() {
        let svc = Arc::new(MockClassifier::new(vec![IntentCandidate::new("NOT_IN_CATALOG", 0.99)]));
        let layer = ClassifierLayer::new(svc, 0.85, Duration::from_secs(60));
        let f = Fixture::new("x");
        assert!(matches!(
            layer.evaluate(&f.input(), None).await,
            LayerOutcome::Skipped { tentative: None, .. }
        ));
    }

    #[tokio::test]
    async fn unhealthy_skipped_and_health_cached() {
        let svc = Arc::new(MockClassifier::unhealthy());
        let layer = ClassifierLayer::new(svc.clone(), 0.85, Duration::from_secs(60));
        let f = Fixture::new("x");
        for _ in 0..3 {
            assert!(matches!(
                layer.evaluate(&f.input(), None).await,
                LayerOutcome::Unavailable(_)
            ));
        }
        assert_eq!(svc.health_checks(), 1);
        assert_eq!(svc.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn health_rechecked_after_interval() {
        let svc = Arc::new(MockClassifier::unhealthy());
        let layer = ClassifierLayer::new(svc.clone(), 0.85, Duration::from_secs(60));
        let f = Fixture::new("x");
        layer.evaluate(&f.input(), None).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        layer.evaluate(&f.input(), None).await;
        assert_eq!(svc.health_checks(), 2);
    }

    #[tokio::test]
    async fn low_confidence_is_tentative() {
        let svc = Arc::new(MockClassifier::new(vec![IntentCandidate::new("SHIPMENT_QUERY", 0.6)]));
        let layer = ClassifierLayer::new(svc, 0.85, Duration::from_secs(60));
        let f = Fixture::new("x");
        match layer.evaluate(&f.input(), None).await {
            LayerOutcome::Skipped { tentative: Some(r), .. } => assert_eq!(r.confidence, 0.6),
            other => panic!("expected tentative, got {other:?}"),
        }
    }
}
