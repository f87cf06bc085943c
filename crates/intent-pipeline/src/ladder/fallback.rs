//! Layer 5: full-catalog classification by LLM.
//!
//! Runs only when everything above left nothing, or nothing above the
//! fallback threshold. The answer may carry tool-calling parameters.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use intent_protocol::{IntentMatchResult, MatchSource};

use super::{LadderInput, LadderLayer, LayerOutcome};
use crate::services::{ChatOptions, LlmService, extract_json};

const SYSTEM_PROMPT: &str = r#"你是工厂管理系统的意图分类器。根据下面的意图列表，判断用户问题对应哪个意图，并抽取执行所需的参数。
只输出JSON，不要解释:
{"intent_code": "<列表中的意图代码>", "confidence": <0.0-1.0>, "parameters": {<参数>}}
如果没有任何意图匹配，输出:
{"intent_code": null, "confidence": 0.0, "parameters": {}}"#;

#[derive(Deserialize)]
struct RawClassification {
    intent_code: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    parameters: serde_json::Value,
}

pub struct FallbackLayer {
    llm: Arc<dyn LlmService>,
    threshold: f64,
}

impl FallbackLayer {
    pub fn new(llm: Arc<dyn LlmService>, threshold: f64) -> Self {
        Self { llm, threshold }
    }

    fn prompt(input: &LadderInput<'_>) -> String {
        let mut lines = vec!["意图列表:".to_string()];
        for d in input.intents {
            let example = d.examples.first().map(String::as_str).unwrap_or("");
            lines.push(format!("- {}: {} 例: {}", d.intent_code, d.name, example));
        }
        lines.push(format!("用户问题: {}", input.text));
        lines.join("\n")
    }
}

#[async_trait]
impl LadderLayer for FallbackLayer {
    fn source(&self) -> MatchSource {
        MatchSource::LlmFallback
    }

    fn is_network(&self) -> bool {
        true
    }

    fn applies(&self, best: Option<&IntentMatchResult>) -> bool {
        best.is_none_or(|b| b.is_empty() || b.confidence < self.threshold)
    }

    async fn evaluate(
        &self,
        input: &LadderInput<'_>,
        _best: Option<&IntentMatchResult>,
    ) -> LayerOutcome {
        let raw = match self
            .llm
            .chat(SYSTEM_PROMPT, &Self::prompt(input), ChatOptions::json())
            .await
        {
            Ok(r) => r,
            Err(e) => return LayerOutcome::Unavailable(e.to_string()),
        };
        let parsed: RawClassification = match serde_json::from_str(extract_json(&raw)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, raw = %raw, "fallback returned invalid JSON");
                return LayerOutcome::Skipped {
                    reason: "unparseable classification".into(),
                    tentative: None,
                };
            }
        };

        let Some(code) = parsed.intent_code.filter(|c| !c.is_empty()) else {
            return LayerOutcome::Skipped {
                reason: "llm found no matching intent".into(),
                tentative: None,
            };
        };
        if !input.knows(&code) {
            tracing::warn!(intent = %code, "fallback returned unknown intent");
            return LayerOutcome::Skipped {
                reason: "llm returned an unknown intent".into(),
                tentative: None,
            };
        }

        let mut result = IntentMatchResult::single(MatchSource::LlmFallback, code, parsed.confidence);
        if parsed.parameters.as_object().is_some_and(|o| !o.is_empty()) {
            result.parameters = Some(parsed.parameters);
        }

        if result.confidence >= self.threshold {
            LayerOutcome::Accepted(result)
        } else {
            LayerOutcome::Skipped {
                reason: "llm classification below threshold".into(),
                tentative: Some(result),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::tests::Fixture;
    use crate::mock::MockLlm;

    fn layer(responses: Vec<&str>) -> FallbackLayer {
        FallbackLayer::new(
            Arc::new(MockLlm::new(responses.into_iter().map(String::from).collect())),
            0.3,
        )
    }

    #[test]
    fn applies_below_threshold_or_empty() {
        let l = layer(vec![]);
        assert!(l.applies(None));
        assert!(l.applies(Some(&IntentMatchResult::empty(MatchSource::Embedding))));
        assert!(l.applies(Some(&IntentMatchResult::single(MatchSource::Rule, "A", 0.2))));
        assert!(!l.applies(Some(&IntentMatchResult::single(MatchSource::Rule, "A", 0.5))));
    }

    #[tokio::test]
    async fn accepted_with_parameters() {
        let l = layer(vec![
            r#"好的。{"intent_code": "ALERT_QUERY", "confidence": 0.75, "parameters": {"level": "HIGH"}}"#,
        ]);
        let f = Fixture::new("有没有严重的问题");
        match l.evaluate(&f.input(), None).await {
            LayerOutcome::Accepted(r) => {
                assert_eq!(r.best_match_intent_code.as_deref(), Some("ALERT_QUERY"));
                assert_eq!(r.parameters.unwrap()["level"], "HIGH");
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn low_confidence_is_tentative() {
        let l = layer(vec![r#"{"intent_code": "ALERT_QUERY", "confidence": 0.1}"#]);
        let f = Fixture::new("那个东西");
        match l.evaluate(&f.input(), None).await {
            LayerOutcome::Skipped { tentative: Some(r), .. } => {
                assert_eq!(r.confidence, 0.1);
                assert!(r.parameters.is_none());
            }
            other => panic!("expected tentative, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn null_or_unknown_intent_skipped() {
        let f = Fixture::new("那个东西");
        let l = layer(vec![r#"{"intent_code": null, "confidence": 0.0, "parameters": {}}"#]);
        assert!(matches!(
            l.evaluate(&f.input(), None).await,
            LayerOutcome::Skipped { tentative: None, .. }
        ));
        let l = layer(vec![r#"{"intent_code": "LAUNCH_ROCKET", "confidence": 0.9}"#]);
        assert!(matches!(
            l.evaluate(&f.input(), None).await,
            LayerOutcome::Skipped { tentative: None, .. }
        ));
    }
}
