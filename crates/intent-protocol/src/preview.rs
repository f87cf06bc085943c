use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a Try-Confirm-Cancel preview token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreviewStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl PreviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::str::FromStr for PreviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "CANCELLED" => Ok(Self::Cancelled),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unknown preview status: {other}")),
        }
    }
}

/// Snapshot of a proposed mutation, awaiting explicit confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewToken {
    pub token: String,
    pub factory_id: String,
    pub user_id: String,
    pub intent_code: String,
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub operation: String,
    pub preview_data: serde_json::Value,
    pub current_values: serde_json::Value,
    pub new_values: serde_json::Value,
    pub status: PreviewStatus,
    /// High-risk operations carry an explicit confirmation question.
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_question: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl PreviewToken {
    pub fn is_pending(&self) -> bool {
        self.status == PreviewStatus::Pending
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Outcome of confirming or cancelling a preview token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<serde_json::Value>,
}

impl ConfirmResult {
    pub fn success(message: impl Into<String>, execution_result: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            execution_result,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            execution_result: None,
        }
    }
}
