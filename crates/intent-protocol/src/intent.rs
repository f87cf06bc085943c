use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::slots::SlotType;

// ── Classification Vocabulary ─────────────────────────────────

/// Business domain a query is about (stage 1 of the two-stage classifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Domain {
    Material,
    Shipment,
    Attendance,
    Equipment,
    Quality,
    Processing,
    Alert,
    Supplier,
    Customer,
    Unknown,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Material => "MATERIAL",
            Self::Shipment => "SHIPMENT",
            Self::Attendance => "ATTENDANCE",
            Self::Equipment => "EQUIPMENT",
            Self::Quality => "QUALITY",
            Self::Processing => "PROCESSING",
            Self::Alert => "ALERT",
            Self::Supplier => "SUPPLIER",
            Self::Customer => "CUSTOMER",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the user wants to do within the domain (stage 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Query,
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Anything other than a read changes business state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Query)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refinements produced by the comparison overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryModifier {
    Ranking,
    Yoy,
    Mom,
    Qoq,
    Comparison,
    Stats,
    Aggregation,
    Future,
}

impl QueryModifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ranking => "RANKING",
            Self::Yoy => "YOY",
            Self::Mom => "MOM",
            Self::Qoq => "QOQ",
            Self::Comparison => "COMPARISON",
            Self::Stats => "STATS",
            Self::Aggregation => "AGGREGATION",
            Self::Future => "FUTURE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

// ── Catalog Entries ───────────────────────────────────────────

/// A catalog entry: one business action/query and the slots it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub intent_code: String,
    pub name: String,
    pub domain: Domain,
    pub action: ActionType,
    #[serde(default)]
    pub required_slots: Vec<SlotType>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Example utterances; their embeddings back the embedding layer.
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// False when the intent must be routed through the tool router.
    #[serde(default = "default_true")]
    pub executor_bound: bool,
    /// Business entity the intent operates on ("material_batch", "plan", ...).
    #[serde(default)]
    pub entity_type: Option<String>,
}

fn default_true() -> bool {
    true
}

impl IntentDefinition {
    pub fn is_mutating(&self) -> bool {
        self.action.is_mutating()
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_level == RiskLevel::High || self.action == ActionType::Delete
    }
}

// ── Match Results ─────────────────────────────────────────────

/// Which ladder layer produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchSource {
    Rule,
    Embedding,
    Classifier,
    LlmRerank,
    LlmFallback,
}

impl MatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "RULE",
            Self::Embedding => "EMBEDDING",
            Self::Classifier => "CLASSIFIER",
            Self::LlmRerank => "LLM_RERANK",
            Self::LlmFallback => "LLM_FALLBACK",
        }
    }
}

impl std::fmt::Display for MatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MatchSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RULE" => Ok(Self::Rule),
            "EMBEDDING" => Ok(Self::Embedding),
            "CLASSIFIER" => Ok(Self::Classifier),
            "LLM_RERANK" => Ok(Self::LlmRerank),
            "LLM_FALLBACK" => Ok(Self::LlmFallback),
            other => Err(format!("unknown match source: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub intent_code: String,
    pub confidence: f64,
}

impl IntentCandidate {
    pub fn new(intent_code: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent_code: intent_code.into(),
            confidence: clamp_unit(confidence),
        }
    }
}

/// Normalized output of the confidence ladder.
///
/// `candidates` is sorted by descending confidence and `best_match_intent_code`
/// always equals the first candidate when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMatchResult {
    pub best_match_intent_code: Option<String>,
    pub confidence: f64,
    pub source: MatchSource,
    pub candidates: Vec<IntentCandidate>,
    pub timestamp_ms: i64,
    /// Set by the rerank layer: did the LLM keep the original top candidate?
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_agreed: Option<bool>,
    /// Tool-calling parameters emitted by the LLM fallback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl IntentMatchResult {
    pub fn from_candidates(source: MatchSource, mut candidates: Vec<IntentCandidate>) -> Self {
        for c in &mut candidates {
            c.confidence = clamp_unit(c.confidence);
        }
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let (best, confidence) = candidates
            .first()
            .map(|c| (Some(c.intent_code.clone()), c.confidence))
            .unwrap_or((None, 0.0));
        Self {
            best_match_intent_code: best,
            confidence,
            source,
            candidates,
            timestamp_ms: Utc::now().timestamp_millis(),
            rerank_agreed: None,
            parameters: None,
        }
    }

    pub fn single(source: MatchSource, intent_code: impl Into<String>, confidence: f64) -> Self {
        Self::from_candidates(source, vec![IntentCandidate::new(intent_code, confidence)])
    }

    pub fn empty(source: MatchSource) -> Self {
        Self::from_candidates(source, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.best_match_intent_code.is_none()
    }

    pub fn top(&self) -> Option<&IntentCandidate> {
        self.candidates.first()
    }

    pub fn top_n(&self, n: usize) -> &[IntentCandidate] {
        &self.candidates[..self.candidates.len().min(n)]
    }

    /// Rescore every candidate and restore the ordering invariant.
    pub fn rescored(self, mut f: impl FnMut(&IntentCandidate) -> f64) -> Self {
        let candidates = self
            .candidates
            .iter()
            .map(|c| IntentCandidate::new(c.intent_code.clone(), f(c)))
            .collect();
        let mut out = Self::from_candidates(self.source, candidates);
        out.timestamp_ms = self.timestamp_ms;
        out.rerank_agreed = self.rerank_agreed;
        out.parameters = self.parameters;
        out
    }
}

pub fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_sorted_and_best_is_first() {
        let r = IntentMatchResult::from_candidates(
            MatchSource::Embedding,
            vec![
                IntentCandidate::new("A", 0.61),
                IntentCandidate::new("B", 0.92),
                IntentCandidate::new("C", 0.75),
            ],
        );
        assert_eq!(r.best_match_intent_code.as_deref(), Some("B"));
        assert_eq!(r.confidence, 0.92);
        let order: Vec<_> = r.candidates.iter().map(|c| c.intent_code.as_str()).collect();
        assert_eq!(order, ["B", "C", "A"]);
    }

    #[test]
    fn confidence_is_clamped() {
        let r = IntentMatchResult::single(MatchSource::Rule, "X", 1.7);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(IntentCandidate::new("Y", -0.2).confidence, 0.0);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
    }

    #[test]
    fn empty_result_has_no_best() {
        let r = IntentMatchResult::empty(MatchSource::LlmFallback);
        assert!(r.is_empty());
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn rescored_reorders() {
        let r = IntentMatchResult::from_candidates(
            MatchSource::Classifier,
            vec![IntentCandidate::new("A", 0.8), IntentCandidate::new("B", 0.7)],
        );
        let r = r.rescored(|c| if c.intent_code == "B" { 0.9 } else { c.confidence });
        assert_eq!(r.best_match_intent_code.as_deref(), Some("B"));
        assert_eq!(r.source, MatchSource::Classifier);
    }

    #[test]
    fn delete_is_high_risk() {
        let def = IntentDefinition {
            intent_code: "MATERIAL_BATCH_DELETE".into(),
            name: "删除批次".into(),
            domain: Domain::Material,
            action: ActionType::Delete,
            required_slots: vec![SlotType::BatchId],
            keywords: vec![],
            examples: vec![],
            risk_level: RiskLevel::Low,
            executor_bound: true,
            entity_type: None,
        };
        assert!(def.is_high_risk());
        assert!(def.is_mutating());
    }

    #[test]
    fn match_source_serialization() {
        assert_eq!(
            serde_json::to_string(&MatchSource::LlmRerank).unwrap(),
            r#""LLM_RERANK""#
        );
    }
}
