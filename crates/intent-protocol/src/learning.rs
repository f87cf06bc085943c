use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::MatchSource;

/// A low-confidence resolution recorded for offline analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveLearningSample {
    pub id: Uuid,
    pub factory_id: String,
    pub user_id: String,
    pub user_input: String,
    pub normalized_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_intent_code: Option<String>,
    pub confidence_score: f64,
    pub match_method: MatchSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// One observed intent-to-intent step within a user's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionObservation {
    pub factory_id: String,
    pub from_intent: String,
    pub to_intent: String,
    pub observed_at: DateTime<Utc>,
}

/// A smoothed cell of the per-tenant Markov transition matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentTransitionEntry {
    pub factory_id: String,
    pub from_intent: String,
    pub to_intent: String,
    pub probability: f64,
    pub observation_count: u64,
}

/// A confirmed (input, intent) pair learned from a completed dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedExpression {
    pub factory_id: String,
    pub intent_code: String,
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionKind {
    /// Add the cluster's phrasings as expressions of an existing intent.
    AddExpression,
    /// Add a recurring term as a keyword of an existing intent.
    AddKeyword,
    /// No intent covers the cluster; a new catalog entry is needed.
    NewIntent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub factory_id: String,
    pub kind: SuggestionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_code: Option<String>,
    pub cluster_id: u32,
    pub sample_count: usize,
    pub examples: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestion_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&SuggestionKind::NewIntent).unwrap(),
            r#""NEW_INTENT""#
        );
    }

    #[test]
    fn sample_skips_empty_cluster() {
        let s = ActiveLearningSample {
            id: Uuid::now_v7(),
            factory_id: "F001".into(),
            user_id: "u-1".into(),
            user_input: "那个东西咋样了".into(),
            normalized_input: "那个东西怎么样了".into(),
            matched_intent_code: None,
            confidence_score: 0.12,
            match_method: MatchSource::LlmFallback,
            cluster_id: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("cluster_id"));
        assert!(json.contains("LLM_FALLBACK"));
    }
}
