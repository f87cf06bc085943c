use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tenant/user context already resolved by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestContext {
    /// Factory (tenant) the request is issued against.
    pub factory_id: String,
    /// Authenticated user.
    pub user_id: String,
    /// Role of the user (e.g. "factory_admin", "operator", "viewer").
    pub user_role: String,
}

impl RequestContext {
    pub fn new(
        factory_id: impl Into<String>,
        user_id: impl Into<String>,
        user_role: impl Into<String>,
    ) -> Self {
        Self {
            factory_id: factory_id.into(),
            user_id: user_id.into(),
            user_role: user_role.into(),
        }
    }
}

/// Immutable input to one resolution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub factory_id: String,
    pub user_id: String,
    pub user_role: String,
    pub timestamp: DateTime<Utc>,
}

impl Query {
    pub fn new(ctx: &RequestContext, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            factory_id: ctx.factory_id.clone(),
            user_id: ctx.user_id.clone(),
            user_role: ctx.user_role.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Same query context, different text (used after normalization).
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..self.clone()
        }
    }

    pub fn context(&self) -> RequestContext {
        RequestContext {
            factory_id: self.factory_id.clone(),
            user_id: self.user_id.clone(),
            user_role: self.user_role.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_carries_context() {
        let ctx = RequestContext::new("F001", "u-1", "operator");
        let q = Query::new(&ctx, "今天产量多少");
        assert_eq!(q.factory_id, "F001");
        assert_eq!(q.context(), ctx);
    }

    #[test]
    fn with_text_keeps_timestamp() {
        let ctx = RequestContext::new("F001", "u-1", "operator");
        let q = Query::new(&ctx, "瞅瞅库存");
        let rewritten = q.with_text("查看库存");
        assert_eq!(rewritten.text, "查看库存");
        assert_eq!(rewritten.timestamp, q.timestamp);
    }
}
