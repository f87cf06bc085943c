use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intent::IntentCandidate;
use crate::query::RequestContext;

/// Lifecycle status of a clarification dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    TimedOut,
    MaxRoundsReached,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
            Self::MaxRoundsReached => "MAX_ROUNDS_REACHED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "MAX_ROUNDS_REACHED" => Ok(Self::MaxRoundsReached),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            intent_code: None,
            confidence: None,
            at,
        }
    }

    pub fn assistant(content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            intent_code: None,
            confidence: None,
            at,
        }
    }
}

/// A multi-turn clarification dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: Uuid,
    pub factory_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub current_round: u32,
    pub max_rounds: u32,
    /// The query that started the dialogue.
    pub original_input: String,
    pub candidate_intents: Vec<IntentCandidate>,
    pub history: Vec<ConversationTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_intent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Bumped by the store on every write; a write carrying an older value
    /// is rejected.
    #[serde(default)]
    pub version: u64,
}

impl ConversationSession {
    pub fn new(
        ctx: &RequestContext,
        original_input: impl Into<String>,
        candidate_intents: Vec<IntentCandidate>,
        max_rounds: u32,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let original_input = original_input.into();
        Self {
            session_id: Uuid::now_v7(),
            factory_id: ctx.factory_id.clone(),
            user_id: ctx.user_id.clone(),
            status: SessionStatus::Active,
            current_round: 0,
            max_rounds,
            history: vec![ConversationTurn::user(original_input.clone(), now)],
            original_input,
            candidate_intents,
            resolved_intent: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn rounds_exhausted(&self) -> bool {
        self.current_round >= self.max_rounds
    }
}

/// First (or merged) clarification question returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPrompt {
    pub session_id: Uuid,
    /// 1-based number of the question being asked.
    pub round: u32,
    pub max_rounds: u32,
    pub question: String,
    pub options: Vec<IntentCandidate>,
}

/// Result of feeding one user reply into a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub message: String,
    pub round: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<IntentCandidate>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(now: DateTime<Utc>) -> ConversationSession {
        let ctx = RequestContext::new("F001", "u-1", "operator");
        ConversationSession::new(&ctx, "那个怎么弄", vec![], 5, Duration::minutes(10), now)
    }

    #[test]
    fn new_session_starts_at_round_zero() {
        let now = Utc::now();
        let s = session(now);
        assert!(s.is_active());
        assert_eq!(s.current_round, 0);
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.history[0].role, TurnRole::User);
        assert!(!s.is_expired(now));
        assert!(s.is_expired(now + Duration::minutes(10)));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!SessionStatus::Active.is_terminal());
        for s in [
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::TimedOut,
            SessionStatus::MaxRoundsReached,
        ] {
            assert!(s.is_terminal());
            assert_eq!(s.as_str().parse::<SessionStatus>().unwrap(), s);
        }
    }

    #[test]
    fn status_serialization() {
        let json = serde_json::to_string(&SessionStatus::MaxRoundsReached).unwrap();
        assert_eq!(json, r#""MAX_ROUNDS_REACHED""#);
    }
}
