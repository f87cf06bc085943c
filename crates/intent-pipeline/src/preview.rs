//! Try-Confirm-Cancel gate for mutating intents.
//!
//! `create` snapshots the proposed change without side effects. `confirm`
//! moves a PENDING token to CONFIRMED with a compare-and-set and only the
//! winner of that transition calls the executor, so a token runs at most
//! once. This is the only path through which the pipeline performs writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use uuid::Uuid;

use intent_protocol::{ConfirmResult, PreviewStatus, PreviewToken, RequestContext};

use crate::error::PipelineResult;
use crate::services::BusinessExecutor;

pub const MSG_EXPIRED: &str = "令牌已过期，请重新发起预览";
pub const MSG_INVALID: &str = "预览令牌无效或已处理";
pub const MSG_FORBIDDEN: &str = "无权确认该预览";

// ── Store ─────────────────────────────────────────────────────

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, token: PreviewToken) -> PipelineResult<()>;

    async fn get(&self, token: &str) -> PipelineResult<Option<PreviewToken>>;

    /// Atomically move a token from `expected` to `next`. Returns the
    /// updated token, or `None` when the token was not in `expected`.
    async fn transition(
        &self,
        token: &str,
        expected: PreviewStatus,
        next: PreviewStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> PipelineResult<Option<PreviewToken>>;

    /// Move every PENDING token past its deadline to EXPIRED.
    async fn expire_stale(&self, now: DateTime<Utc>) -> PipelineResult<usize>;
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<HashMap<String, PreviewToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn insert(&self, token: PreviewToken) -> PipelineResult<()> {
        self.tokens.lock().await.insert(token.token.clone(), token);
        Ok(())
    }

    async fn get(&self, token: &str) -> PipelineResult<Option<PreviewToken>> {
        Ok(self.tokens.lock().await.get(token).cloned())
    }

    async fn transition(
        &self,
        token: &str,
        expected: PreviewStatus,
        next: PreviewStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> PipelineResult<Option<PreviewToken>> {
        let mut tokens = self.tokens.lock().await;
        let Some(t) = tokens.get_mut(token) else {
            return Ok(None);
        };
        if t.status != expected {
            return Ok(None);
        }
        t.status = next;
        t.resolved_at = Some(at);
        if reason.is_some() {
            t.cancel_reason = reason;
        }
        Ok(Some(t.clone()))
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let mut expired = 0;
        for t in self.tokens.lock().await.values_mut() {
            if t.is_pending() && t.is_expired(now) {
                t.status = PreviewStatus::Expired;
                t.resolved_at = Some(now);
                expired += 1;
            }
        }
        Ok(expired)
    }
}

// ── Gate ──────────────────────────────────────────────────────

/// What a preview proposes to change.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewRequest {
    pub intent_code: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub operation: String,
    pub current_values: Value,
    pub new_values: Value,
    pub requires_confirmation: bool,
    pub confirmation_question: Option<String>,
}

pub struct PreviewGate {
    store: Arc<dyn TokenStore>,
    executor: Arc<dyn BusinessExecutor>,
    ttl: chrono::Duration,
}

impl PreviewGate {
    pub fn new(
        store: Arc<dyn TokenStore>,
        executor: Arc<dyn BusinessExecutor>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            executor,
            ttl,
        }
    }

    pub async fn create_at(
        &self,
        ctx: &RequestContext,
        request: PreviewRequest,
        now: DateTime<Utc>,
    ) -> PipelineResult<PreviewToken> {
        let preview_data = json!({
            "intent_code": request.intent_code,
            "operation": request.operation,
            "entity_type": request.entity_type,
            "entity_id": request.entity_id,
            "changes": diff(&request.current_values, &request.new_values),
        });
        let token = PreviewToken {
            token: Uuid::now_v7().simple().to_string(),
            factory_id: ctx.factory_id.clone(),
            user_id: ctx.user_id.clone(),
            intent_code: request.intent_code,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            operation: request.operation,
            preview_data,
            current_values: request.current_values,
            new_values: request.new_values,
            status: PreviewStatus::Pending,
            requires_confirmation: request.requires_confirmation,
            confirmation_question: request.confirmation_question,
            created_at: now,
            expires_at: now + self.ttl,
            resolved_at: None,
            cancel_reason: None,
        };
        self.store.insert(token.clone()).await?;
        tracing::info!(
            token = %token.token,
            factory_id = %token.factory_id,
            intent = %token.intent_code,
            "preview created"
        );
        Ok(token)
    }

    pub async fn confirm(&self, token: &str, user_id: &str) -> PipelineResult<ConfirmResult> {
        self.confirm_at(token, user_id, Utc::now()).await
    }

    pub async fn confirm_at(
        &self,
        token: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<ConfirmResult> {
        let current = match self.check(token, user_id, now).await? {
            Ok(t) => t,
            Err(rejection) => return Ok(rejection),
        };
        let Some(confirmed) = self
            .store
            .transition(token, PreviewStatus::Pending, PreviewStatus::Confirmed, now, None)
            .await?
        else {
            return Ok(ConfirmResult::failure(MSG_INVALID));
        };

        let parameters = execution_parameters(&confirmed);
        match self.executor.execute(&current.intent_code, &parameters).await {
            Ok(result) => {
                tracing::info!(token = %token, intent = %current.intent_code, "preview confirmed and executed");
                Ok(ConfirmResult::success("操作已确认并执行", Some(result)))
            }
            Err(e) => {
                tracing::error!(token = %token, intent = %current.intent_code, error = %e, "confirmed operation failed");
                Ok(ConfirmResult::failure(format!("操作执行失败: {e}")))
            }
        }
    }

    pub async fn cancel(
        &self,
        token: &str,
        user_id: &str,
        reason: Option<String>,
    ) -> PipelineResult<ConfirmResult> {
        self.cancel_at(token, user_id, reason, Utc::now()).await
    }

    pub async fn cancel_at(
        &self,
        token: &str,
        user_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> PipelineResult<ConfirmResult> {
        if let Err(rejection) = self.check(token, user_id, now).await? {
            return Ok(rejection);
        }
        match self
            .store
            .transition(token, PreviewStatus::Pending, PreviewStatus::Cancelled, now, reason)
            .await?
        {
            Some(_) => {
                tracing::info!(token = %token, "preview cancelled");
                Ok(ConfirmResult::success("已取消操作", None))
            }
            None => Ok(ConfirmResult::failure(MSG_INVALID)),
        }
    }

    /// Expire stale PENDING tokens. Safe to re-run.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let n = self.store.expire_stale(now).await?;
        if n > 0 {
            tracing::info!(expired = n, "preview token sweep");
        }
        Ok(n)
    }

    /// Validate existence, ownership, status and deadline. An expired
    /// token is moved to EXPIRED on the way out.
    async fn check(
        &self,
        token: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<Result<PreviewToken, ConfirmResult>> {
        let Some(current) = self.store.get(token).await? else {
            return Ok(Err(ConfirmResult::failure(MSG_INVALID)));
        };
        if current.user_id != user_id {
            tracing::warn!(token = %token, user_id = %user_id, "preview resolution by another user");
            return Ok(Err(ConfirmResult::failure(MSG_FORBIDDEN)));
        }
        if !current.is_pending() {
            return Ok(Err(ConfirmResult::failure(MSG_INVALID)));
        }
        if current.is_expired(now) {
            self.store
                .transition(token, PreviewStatus::Pending, PreviewStatus::Expired, now, None)
                .await?;
            return Ok(Err(ConfirmResult::failure(MSG_EXPIRED)));
        }
        Ok(Ok(current))
    }
}

/// Field-level `{from, to}` for every key whose value changes.
fn diff(current: &Value, proposed: &Value) -> Value {
    let Some(proposed) = proposed.as_object() else {
        return json!({});
    };
    let mut changes = Map::new();
    for (k, to) in proposed {
        let from = current.get(k).cloned().unwrap_or(Value::Null);
        if &from != to {
            changes.insert(k.clone(), json!({"from": from, "to": to}));
        }
    }
    Value::Object(changes)
}

fn execution_parameters(token: &PreviewToken) -> Value {
    let mut params = token.new_values.as_object().cloned().unwrap_or_default();
    if let Some(id) = &token.entity_id {
        params.entry("entity_id").or_insert_with(|| json!(id));
    }
    params.insert("operation".into(), json!(token.operation));
    Value::Object(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingExecutor;
    use chrono::Duration;

    fn gate(executor: Arc<RecordingExecutor>) -> (PreviewGate, Arc<InMemoryTokenStore>) {
        let store = Arc::new(InMemoryTokenStore::new());
        (
            PreviewGate::new(store.clone(), executor, Duration::seconds(300)),
            store,
        )
    }

    fn dispose() -> PreviewRequest {
        PreviewRequest {
            intent_code: "MATERIAL_BATCH_DISPOSE".into(),
            entity_type: "material_batch".into(),
            entity_id: Some("MB-20240301".into()),
            operation: "DISPOSE".into(),
            current_values: json!({"status": "IN_STOCK", "quantity": 200}),
            new_values: json!({"status": "DISPOSED", "quantity": 200}),
            requires_confirmation: true,
            confirmation_question: Some("确认报废批次MB-20240301吗？".into()),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("f1", "u1", "factory_admin")
    }

    #[tokio::test]
    async fn create_has_no_side_effects() {
        let exec = Arc::new(RecordingExecutor::new());
        let (gate, _) = gate(exec.clone());
        let now = Utc::now();
        let t = gate.create_at(&ctx(), dispose(), now).await.unwrap();
        assert_eq!(t.status, PreviewStatus::Pending);
        assert_eq!(t.expires_at, now + Duration::seconds(300));
        assert_eq!(t.preview_data["changes"]["status"]["to"], "DISPOSED");
        assert!(t.preview_data["changes"].get("quantity").is_none());
        assert_eq!(exec.calls(), 0);
    }

    #[tokio::test]
    async fn confirm_executes_exactly_once() {
        let exec = Arc::new(RecordingExecutor::new());
        let (gate, _) = gate(exec.clone());
        let now = Utc::now();
        let t = gate.create_at(&ctx(), dispose(), now).await.unwrap();

        let first = gate.confirm_at(&t.token, "u1", now).await.unwrap();
        assert!(first.success);
        let second = gate.confirm_at(&t.token, "u1", now).await.unwrap();
        assert_eq!(second, ConfirmResult::failure(MSG_INVALID));
        let cancel = gate.cancel_at(&t.token, "u1", None, now).await.unwrap();
        assert!(!cancel.success);

        let executed = exec.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "MATERIAL_BATCH_DISPOSE");
        assert_eq!(executed[0].1["entity_id"], "MB-20240301");
        assert_eq!(executed[0].1["status"], "DISPOSED");
    }

    #[tokio::test]
    async fn expired_token_never_executes() {
        let exec = Arc::new(RecordingExecutor::new());
        let (gate, store) = gate(exec.clone());
        let now = Utc::now();
        let t = gate.create_at(&ctx(), dispose(), now).await.unwrap();

        let r = gate
            .confirm_at(&t.token, "u1", now + Duration::seconds(301))
            .await
            .unwrap();
        assert_eq!(r, ConfirmResult::failure(MSG_EXPIRED));
        assert_eq!(exec.calls(), 0);
        let stored = store.get(&t.token).await.unwrap().unwrap();
        assert_eq!(stored.status, PreviewStatus::Expired);
    }

    #[tokio::test]
    async fn other_user_is_rejected() {
        let exec = Arc::new(RecordingExecutor::new());
        let (gate, _) = gate(exec.clone());
        let now = Utc::now();
        let t = gate.create_at(&ctx(), dispose(), now).await.unwrap();
        let r = gate.confirm_at(&t.token, "intruder", now).await.unwrap();
        assert_eq!(r, ConfirmResult::failure(MSG_FORBIDDEN));
        // The owner can still confirm.
        assert!(gate.confirm_at(&t.token, "u1", now).await.unwrap().success);
    }

    #[tokio::test]
    async fn cancel_records_reason() {
        let exec = Arc::new(RecordingExecutor::new());
        let (gate, store) = gate(exec.clone());
        let now = Utc::now();
        let t = gate.create_at(&ctx(), dispose(), now).await.unwrap();
        let r = gate
            .cancel_at(&t.token, "u1", Some("选错批次".into()), now)
            .await
            .unwrap();
        assert!(r.success);
        let stored = store.get(&t.token).await.unwrap().unwrap();
        assert_eq!(stored.status, PreviewStatus::Cancelled);
        assert_eq!(stored.cancel_reason.as_deref(), Some("选错批次"));
        assert_eq!(exec.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let (gate, _) = gate(Arc::new(RecordingExecutor::new()));
        let r = gate.confirm_at("nope", "u1", Utc::now()).await.unwrap();
        assert_eq!(r.message, MSG_INVALID);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let (gate, _) = gate(Arc::new(RecordingExecutor::new()));
        let now = Utc::now();
        gate.create_at(&ctx(), dispose(), now).await.unwrap();
        gate.create_at(&ctx(), dispose(), now + Duration::seconds(200)).await.unwrap();
        let later = now + Duration::seconds(400);
        assert_eq!(gate.sweep_at(later).await.unwrap(), 1);
        assert_eq!(gate.sweep_at(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_execution_still_consumes_token() {
        let exec = Arc::new(RecordingExecutor::failing());
        let (gate, _) = gate(exec.clone());
        let now = Utc::now();
        let t = gate.create_at(&ctx(), dispose(), now).await.unwrap();
        let r = gate.confirm_at(&t.token, "u1", now).await.unwrap();
        assert!(!r.success);
        assert!(!gate.confirm_at(&t.token, "u1", now).await.unwrap().success);
        assert_eq!(exec.calls(), 1);
    }
}
