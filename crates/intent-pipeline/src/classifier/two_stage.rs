//! Noun-first domain classification composed with context-sensitive action
//! classification.

use std::sync::Arc;

use intent_protocol::{ActionType, Domain, ExtractedSlots, QueryModifier, clamp_unit};

use super::keywords::{ActionRules, DomainKeywords};
use super::overlay::{self, OverlayResult};
use crate::catalog::IntentCatalog;

const BASELINE_CONFIDENCE: f64 = 0.90;
const DEFAULT_QUERY_PENALTY: f64 = 0.05;
const EXPLICIT_CONTEXT_BONUS: f64 = 0.02;

/// Which rule of the stage-2 cascade fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReason {
    TimeContext,
    QuestionPattern,
    StatusNoun,
    DeletionVerb,
    CreationVerb,
    MutationVerb,
    BareImperative,
    /// Nothing matched; querying is the safe default.
    DefaultQuery,
    /// A mutating verb appeared under negation or rhetorical phrasing.
    NegationDowngrade,
}

impl ActionReason {
    fn is_explicit_context(&self) -> bool {
        matches!(
            self,
            Self::TimeContext | Self::QuestionPattern | Self::StatusNoun
        )
    }
}

/// Phrasing flags produced by the normalizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhrasingFlags {
    pub negated: bool,
    pub rhetorical: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwoStageResult {
    pub domain: Domain,
    /// Every domain whose dictionary matched, in priority order.
    pub matched_domains: Vec<Domain>,
    pub action: ActionType,
    pub reason: ActionReason,
    pub overlay: OverlayResult,
    /// Modifier the composition used, if any.
    pub applied_modifier: Option<QueryModifier>,
    /// `None` only for the UNKNOWN domain.
    pub intent_code: Option<String>,
    /// True when the code came from `DOMAIN_ACTION` synthesis rather than the table.
    pub synthesized: bool,
    pub confidence: f64,
}

impl TwoStageResult {
    pub fn is_unambiguous(&self) -> bool {
        self.matched_domains.len() == 1
    }
}

#[derive(Clone)]
pub struct TwoStageClassifier {
    domains: Arc<DomainKeywords>,
    rules: Arc<ActionRules>,
}

impl Default for TwoStageClassifier {
    fn default() -> Self {
        Self::new(Arc::new(DomainKeywords::default()), Arc::new(ActionRules::default()))
    }
}

impl TwoStageClassifier {
    pub fn new(domains: Arc<DomainKeywords>, rules: Arc<ActionRules>) -> Self {
        Self { domains, rules }
    }

    pub fn domain_keywords(&self) -> &DomainKeywords {
        &self.domains
    }

    /// Stage 1: first dictionary hit in priority order.
    pub fn classify_domain(&self, text: &str) -> (Domain, Vec<Domain>) {
        let matched = self.domains.matches(text);
        let domain = matched.first().copied().unwrap_or(Domain::Unknown);
        (domain, matched)
    }

    /// Stage 2: ordered action cascade.
    pub fn classify_action(
        &self,
        text: &str,
        slots: &ExtractedSlots,
        flags: PhrasingFlags,
    ) -> (ActionType, ActionReason) {
        let r = &self.rules;
        let hit = |words: &[String]| ActionRules::first_hit(words, text).is_some();

        if slots.time_range.is_some() || hit(&r.time_words) {
            return (ActionType::Query, ActionReason::TimeContext);
        }
        if hit(&r.question_patterns) {
            return (ActionType::Query, ActionReason::QuestionPattern);
        }
        if hit(&r.status_nouns) {
            return (ActionType::Query, ActionReason::StatusNoun);
        }

        let negated = flags.negated || flags.rhetorical || hit(&r.negation_markers);
        let mutating = if hit(&r.deletion_verbs) {
            Some((ActionType::Delete, ActionReason::DeletionVerb))
        } else if hit(&r.creation_verbs) {
            Some((ActionType::Create, ActionReason::CreationVerb))
        } else if hit(&r.mutation_verbs) {
            Some((ActionType::Update, ActionReason::MutationVerb))
        } else if r.imperative_verbs.iter().any(|v| text.trim_start().starts_with(v.as_str())) {
            Some((ActionType::Create, ActionReason::BareImperative))
        } else {
            None
        };

        match mutating {
            Some(_) if negated => (ActionType::Query, ActionReason::NegationDowngrade),
            Some(found) => found,
            None => (ActionType::Query, ActionReason::DefaultQuery),
        }
    }

    /// Full two-stage classification plus overlay and composition.
    pub fn classify(
        &self,
        catalog: &dyn IntentCatalog,
        factory_id: &str,
        text: &str,
        slots: &ExtractedSlots,
        flags: PhrasingFlags,
    ) -> TwoStageResult {
        let (domain, matched_domains) = self.classify_domain(text);
        let (action, reason) = self.classify_action(text, slots, flags);
        let overlay = if action == ActionType::Query {
            overlay::analyze(slots)
        } else {
            OverlayResult::default()
        };

        let mut confidence = BASELINE_CONFIDENCE;
        if reason == ActionReason::DefaultQuery {
            confidence -= DEFAULT_QUERY_PENALTY;
        }
        if reason.is_explicit_context() {
            confidence += EXPLICIT_CONTEXT_BONUS;
        }

        if domain == Domain::Unknown {
            return TwoStageResult {
                domain,
                matched_domains,
                action,
                reason,
                overlay,
                applied_modifier: None,
                intent_code: None,
                synthesized: false,
                confidence: 0.0,
            };
        }

        let mut applied_modifier = None;
        let mut intent_code = None;
        for m in &overlay.modifiers {
            if let Some(code) = catalog.compose(factory_id, domain, action, Some(*m)) {
                applied_modifier = Some(*m);
                intent_code = Some(code);
                break;
            }
        }
        let intent_code = intent_code.or_else(|| catalog.compose(factory_id, domain, action, None));
        let synthesized = intent_code.is_none();
        let intent_code =
            intent_code.unwrap_or_else(|| format!("{}_{}", domain.as_str(), action.as_str()));

        tracing::debug!(
            %domain,
            %action,
            ?reason,
            modifier = ?applied_modifier,
            intent = %intent_code,
            "two-stage classification"
        );

        TwoStageResult {
            domain,
            matched_domains,
            action,
            reason,
            overlay,
            applied_modifier,
            intent_code: Some(intent_code),
            synthesized,
            confidence: clamp_unit(confidence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use chrono::NaiveDate;
    use intent_slots::SlotExtractor;

    fn run(text: &str) -> TwoStageResult {
        run_with(text, PhrasingFlags::default())
    }

    fn run_with(text: &str, flags: PhrasingFlags) -> TwoStageResult {
        let slots =
            SlotExtractor::new().extract_at(text, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        let catalog = InMemoryCatalog::factory_defaults();
        TwoStageClassifier::default().classify(&catalog, "f1", text, &slots, flags)
    }

    #[test]
    fn recent_material_inbound_is_query() {
        let r = run("最近7天带鱼入库多少");
        assert_eq!(r.domain, Domain::Material);
        assert_eq!(r.action, ActionType::Query);
        assert_eq!(r.reason, ActionReason::TimeContext);
        assert_eq!(r.intent_code.as_deref(), Some("MATERIAL_BATCH_QUERY"));
        assert!(r.is_unambiguous());
        assert!((r.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn ranking_overlay_picks_customer_ranking() {
        let r = run("销量最高的客户是谁");
        assert_eq!(r.domain, Domain::Customer);
        assert_eq!(r.applied_modifier, Some(QueryModifier::Ranking));
        assert_eq!(r.intent_code.as_deref(), Some("CUSTOMER_RANKING"));
    }

    #[test]
    fn deletion_verb_is_delete() {
        let r = run("报废批次MB-20240301");
        assert_eq!(r.action, ActionType::Delete);
        assert_eq!(r.intent_code.as_deref(), Some("MATERIAL_BATCH_DISPOSE"));
    }

    #[test]
    fn creation_and_mutation_verbs() {
        assert_eq!(run("创建生产计划").action, ActionType::Create);
        assert_eq!(run("把设备EQ-001改成维修中").action, ActionType::Update);
    }

    #[test]
    fn bare_imperative_is_create() {
        let r = run("入库一批带鱼");
        assert_eq!(r.action, ActionType::Create);
        assert_eq!(r.reason, ActionReason::BareImperative);
    }

    #[test]
    fn silence_defaults_to_query_with_penalty() {
        let r = run("带鱼原料");
        assert_eq!(r.action, ActionType::Query);
        assert_eq!(r.reason, ActionReason::DefaultQuery);
        assert!((r.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn negation_never_mutates() {
        let r = run("不要删除这个批次");
        assert_eq!(r.action, ActionType::Query);
        assert_eq!(r.reason, ActionReason::NegationDowngrade);

        let r = run_with(
            "作废这个批次",
            PhrasingFlags {
                negated: false,
                rhetorical: true,
            },
        );
        assert_eq!(r.action, ActionType::Query);
    }

    #[test]
    fn unknown_domain_yields_no_intent() {
        let r = run("你好");
        assert_eq!(r.domain, Domain::Unknown);
        assert!(r.intent_code.is_none());
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn missing_composition_synthesizes_domain_action() {
        let r = run("删除这条告警");
        assert_eq!(r.domain, Domain::Alert);
        assert_eq!(r.action, ActionType::Delete);
        assert!(r.synthesized);
        assert_eq!(r.intent_code.as_deref(), Some("ALERT_DELETE"));
    }

    #[test]
    fn multiple_domains_are_ambiguous() {
        let r = run("给客户安排发货");
        assert_eq!(r.domain, Domain::Shipment);
        assert!(!r.is_unambiguous());
        assert_eq!(r.intent_code.as_deref(), Some("SHIPMENT_CREATE"));
    }
}
