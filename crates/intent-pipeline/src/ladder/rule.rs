//! Layer 1: the two-stage rule classifier.

use async_trait::async_trait;

use intent_protocol::{IntentMatchResult, MatchSource};

use super::{LadderInput, LadderLayer, LayerOutcome};

pub struct RuleLayer {
    accept: f64,
}

impl RuleLayer {
    pub fn new(accept: f64) -> Self {
        Self { accept }
    }
}

#[async_trait]
impl LadderLayer for RuleLayer {
    fn source(&self) -> MatchSource {
        MatchSource::Rule
    }

    fn is_network(&self) -> bool {
        false
    }

    fn applies(&self, _best: Option<&IntentMatchResult>) -> bool {
        true
    }

    async fn evaluate(
        &self,
        input: &LadderInput<'_>,
        _best: Option<&IntentMatchResult>,
    ) -> LayerOutcome {
        let rule = input.rule;
        let Some(code) = rule.intent_code.as_deref() else {
            return LayerOutcome::Skipped {
                reason: "no domain keyword".into(),
                tentative: None,
            };
        };
        let result = IntentMatchResult::single(MatchSource::Rule, code, rule.confidence);

        let reason = if rule.confidence < self.accept {
            "below rule threshold"
        } else if !rule.is_unambiguous() {
            "several domains matched"
        } else if rule.synthesized || !input.knows(code) {
            "composed intent not in catalog"
        } else {
            return LayerOutcome::Accepted(result);
        };

        LayerOutcome::Skipped {
            reason: reason.into(),
            tentative: Some(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::tests::Fixture;

    async fn run(text: &str) -> LayerOutcome {
        let f = Fixture::new(text);
        RuleLayer::new(0.85).evaluate(&f.input(), None).await
    }

    #[tokio::test]
    async fn unambiguous_catalog_intent_accepted() {
        match run("最近7天带鱼入库多少").await {
            LayerOutcome::Accepted(r) => {
                assert_eq!(r.best_match_intent_code.as_deref(), Some("MATERIAL_BATCH_QUERY"));
                assert_eq!(r.source, MatchSource::Rule);
            }
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ambiguous_domains_skip_with_tentative() {
        match run("给客户安排发货").await {
            LayerOutcome::Skipped { tentative, .. } => {
                assert_eq!(
                    tentative.unwrap().best_match_intent_code.as_deref(),
                    Some("SHIPMENT_CREATE")
                );
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn synthesized_code_never_accepted() {
        assert!(matches!(run("删除这条告警").await, LayerOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn unknown_domain_has_no_tentative() {
        assert_eq!(
            run("你好").await,
            LayerOutcome::Skipped {
                reason: "no domain keyword".into(),
                tentative: None
            }
        );
    }
}
