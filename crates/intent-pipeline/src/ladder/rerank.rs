//! Layer 4: LLM rerank of mid-confidence candidates.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use intent_protocol::{IntentCandidate, IntentMatchResult, MatchSource, clamp_unit};

use super::{LadderInput, LadderLayer, LayerOutcome};
use crate::services::{ChatOptions, LlmService, extract_json};

const RERANK_TOP_N: usize = 5;

const SYSTEM_PROMPT: &str = r#"你是工厂管理系统的意图判别器。给定用户问题和若干候选意图(按初步得分从高到低排列)，选出最符合用户本意的一个。
只输出JSON，不要解释: {"intent_code": "<候选之一>", "confidence": <0.0-1.0>}"#;

#[derive(Deserialize)]
struct RerankChoice {
    intent_code: String,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct RerankLayer {
    llm: Arc<dyn LlmService>,
    low: f64,
    high: f64,
}

impl RerankLayer {
    pub fn new(llm: Arc<dyn LlmService>, low: f64, high: f64) -> Self {
        Self { llm, low, high }
    }

    fn prompt(input: &LadderInput<'_>, candidates: &[IntentCandidate]) -> String {
        let mut lines = vec![format!("用户问题: {}", input.text), "候选意图:".to_string()];
        for (i, c) in candidates.iter().enumerate() {
            let name = input
                .intents
                .iter()
                .find(|d| d.intent_code == c.intent_code)
                .map(|d| d.name.as_str())
                .unwrap_or("");
            lines.push(format!(
                "{}. {} ({}) 得分 {:.2}",
                i + 1,
                c.intent_code,
                name,
                c.confidence
            ));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl LadderLayer for RerankLayer {
    fn source(&self) -> MatchSource {
        MatchSource::LlmRerank
    }

    fn is_network(&self) -> bool {
        true
    }

    fn applies(&self, best: Option<&IntentMatchResult>) -> bool {
        best.is_some_and(|b| !b.is_empty() && b.confidence >= self.low && b.confidence < self.high)
    }

    async fn evaluate(
        &self,
        input: &LadderInput<'_>,
        best: Option<&IntentMatchResult>,
    ) -> LayerOutcome {
        let Some(best) = best else {
            return LayerOutcome::Skipped {
                reason: "nothing to rerank".into(),
                tentative: None,
            };
        };
        let candidates = best.top_n(RERANK_TOP_N);
        let Some(original_top) = candidates.first() else {
            return LayerOutcome::Skipped {
                reason: "nothing to rerank".into(),
                tentative: None,
            };
        };

        let raw = match self
            .llm
            .chat(SYSTEM_PROMPT, &Self::prompt(input, candidates), ChatOptions::json())
            .await
        {
            Ok(r) => r,
            Err(e) => return LayerOutcome::Unavailable(e.to_string()),
        };
        let choice: RerankChoice = match serde_json::from_str(extract_json(&raw)) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, raw = %raw, "rerank returned invalid JSON");
                return LayerOutcome::Skipped {
                    reason: "unparseable rerank answer".into(),
                    tentative: None,
                };
            }
        };

        // Only a listed candidate counts.
        let Some(chosen) = candidates.iter().find(|c| c.intent_code == choice.intent_code) else {
            tracing::warn!(intent = %choice.intent_code, "rerank chose an unlisted intent");
            return LayerOutcome::Skipped {
                reason: "rerank chose an unlisted intent".into(),
                tentative: None,
            };
        };

        let agreed = chosen.intent_code == original_top.intent_code;
        let confidence = clamp_unit(
            choice
                .confidence
                .unwrap_or(original_top.confidence)
                .max(original_top.confidence),
        );
        let mut ordered = vec![IntentCandidate::new(chosen.intent_code.clone(), confidence)];
        ordered.extend(
            candidates
                .iter()
                .filter(|c| c.intent_code != chosen.intent_code)
                .map(|c| IntentCandidate::new(c.intent_code.clone(), c.confidence.min(confidence))),
        );

        let mut result = IntentMatchResult::from_candidates(MatchSource::LlmRerank, ordered);
        result.rerank_agreed = Some(agreed);
        tracing::debug!(intent = %chosen.intent_code, agreed, "rerank chose");
        LayerOutcome::Accepted(result)
    }
}
