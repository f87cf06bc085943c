//! Confidence ladder: rules → embedding → classifier → LLM rerank → LLM
//! fallback.
//!
//! Layers run in a fixed order and the first `Accepted` outcome ends the
//! walk, so provenance is always a single layer. Layers that are skipped
//! may leave a tentative result; the best one is returned when nothing
//! accepts. Network layers run under a per-layer timeout and a timeout
//! counts as `Unavailable`.

pub mod cache;
pub mod classifier;
pub mod embedding;
pub mod fallback;
pub mod rerank;
pub mod rule;

use std::time::Duration;

use async_trait::async_trait;

use intent_protocol::{ExtractedSlots, IntentDefinition, IntentMatchResult, MatchSource};

use crate::classifier::TwoStageResult;

pub use cache::{IntentEmbeddingIndex, RequestCache};
pub use classifier::ClassifierLayer;
pub use embedding::{EmbeddingLayer, similarity_to_confidence};
pub use fallback::FallbackLayer;
pub use rerank::RerankLayer;
pub use rule::RuleLayer;

/// What one layer concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerOutcome {
    /// Confident; the ladder stops here.
    Accepted(IntentMatchResult),
    /// Ran but was not confident. `tentative` is kept as a candidate answer.
    Skipped {
        reason: String,
        tentative: Option<IntentMatchResult>,
    },
    /// Backend down, unhealthy or timed out.
    Unavailable(String),
}

/// Everything a layer may look at for one query.
pub struct LadderInput<'a> {
    pub factory_id: &'a str,
    pub text: &'a str,
    pub slots: &'a ExtractedSlots,
    pub rule: &'a TwoStageResult,
    /// The factory's intent catalog.
    pub intents: &'a [IntentDefinition],
    pub cache: &'a RequestCache,
}

impl LadderInput<'_> {
    pub fn knows(&self, intent_code: &str) -> bool {
        self.intents.iter().any(|d| d.intent_code == intent_code)
    }
}

#[async_trait]
pub trait LadderLayer: Send + Sync {
    fn source(&self) -> MatchSource;

    /// Network layers run under the ladder's timeout.
    fn is_network(&self) -> bool;

    /// Whether the layer should run given the best tentative result so far.
    fn applies(&self, best: Option<&IntentMatchResult>) -> bool;

    async fn evaluate(
        &self,
        input: &LadderInput<'_>,
        best: Option<&IntentMatchResult>,
    ) -> LayerOutcome;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LadderOutcome {
    /// Accepted result, else the best tentative, else empty.
    pub result: IntentMatchResult,
    pub accepted_by: Option<MatchSource>,
    /// Layers actually evaluated, in order.
    pub invoked: Vec<MatchSource>,
    /// Every network layer that ran was unavailable and rules had nothing.
    pub all_unavailable: bool,
}

impl LadderOutcome {
    pub fn confidence(&self) -> f64 {
        self.result.confidence
    }
}

pub struct ConfidenceLadder {
    layers: Vec<Box<dyn LadderLayer>>,
    layer_timeout: Duration,
}

impl ConfidenceLadder {
    pub fn new(layers: Vec<Box<dyn LadderLayer>>, layer_timeout: Duration) -> Self {
        Self {
            layers,
            layer_timeout,
        }
    }

    pub fn layer_sources(&self) -> Vec<MatchSource> {
        self.layers.iter().map(|l| l.source()).collect()
    }

    pub async fn resolve(&self, input: &LadderInput<'_>) -> LadderOutcome {
        let mut best: Option<IntentMatchResult> = None;
        let mut invoked = Vec::new();
        let mut network_run = 0usize;
        let mut network_unavailable = 0usize;
        let mut rule_tentative = false;

        for layer in &self.layers {
            let source = layer.source();
            if !layer.applies(best.as_ref()) {
                tracing::debug!(layer = %source, "layer not applicable");
                continue;
            }
            invoked.push(source);

            let outcome = if layer.is_network() {
                network_run += 1;
                match tokio::time::timeout(self.layer_timeout, layer.evaluate(input, best.as_ref()))
                    .await
                {
                    Ok(o) => o,
                    Err(_) => LayerOutcome::Unavailable(format!(
                        "timed out after {}ms",
                        self.layer_timeout.as_millis()
                    )),
                }
            } else {
                layer.evaluate(input, best.as_ref()).await
            };

            match outcome {
                LayerOutcome::Accepted(result) => {
                    tracing::debug!(
                        layer = %source,
                        intent = ?result.best_match_intent_code,
                        confidence = result.confidence,
                        "layer accepted"
                    );
                    return LadderOutcome {
                        result,
                        accepted_by: Some(source),
                        invoked,
                        all_unavailable: false,
                    };
                }
                LayerOutcome::Skipped { reason, tentative } => {
                    tracing::debug!(layer = %source, %reason, "layer skipped");
                    if let Some(t) = tentative.filter(|t| !t.is_empty()) {
                        if !layer.is_network() {
                            rule_tentative = true;
                        }
                        if best.as_ref().is_none_or(|b| t.confidence > b.confidence) {
                            best = Some(t);
                        }
                    }
                }
                LayerOutcome::Unavailable(reason) => {
                    tracing::warn!(layer = %source, %reason, "layer unavailable");
                    if layer.is_network() {
                        network_unavailable += 1;
                    }
                }
            }
        }

        let all_unavailable =
            network_run > 0 && network_unavailable == network_run && !rule_tentative;
        LadderOutcome {
            result: best.unwrap_or_else(|| IntentMatchResult::empty(MatchSource::LlmFallback)),
            accepted_by: None,
            invoked,
            all_unavailable,
        }
    }
}
