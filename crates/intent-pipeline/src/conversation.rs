//! Multi-round clarification dialogues.
//!
//! A session is opened when the ladder cannot settle on an intent. Each
//! reply is re-scored, merged with what the session already knows, and the
//! session either completes, asks again, or runs out of rounds. At most one
//! ACTIVE session exists per `(factory, user)`; a second start merges into
//! the existing one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use uuid::Uuid;

use intent_protocol::{
    ConversationPrompt, ConversationResponse, ConversationSession, ConversationTurn,
    IntentCandidate, IntentDefinition, IntentMatchResult, LearnedExpression, RequestContext,
    SessionStatus, clamp_unit,
};
use intent_slots::numerals::parse_count;

use crate::catalog::IntentCatalog;
use crate::config::ConversationConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::learning::ExpressionStore;

/// Every lost write means another writer won, so this bounds the concurrent
/// writers one session can absorb.
const MAX_WRITE_ATTEMPTS: usize = 16;

static RE_CHOICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:第|选)?\s*([0-9]{1,2}|[一二两三四五六七八九十]{1,3})\s*(?:个|项|号|条)?[。.!！]?$")
        .unwrap()
});

static RE_TERM_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s,，。.!！?？、;；:：]+").unwrap());

/// Prefixes and suffixes that carry no intent on their own.
const FILLERS: &[&str] = &[
    "我想要", "我想", "我要", "帮我", "给我", "请", "是", "就是", "查询", "查看", "查", "看看",
    "的", "吧", "呢", "啊", "了",
];

// ── Store ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Created(ConversationSession),
    /// An ACTIVE session already existed for the user.
    Existing(ConversationSession),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert `session` unless the user already has an ACTIVE one. An
    /// existing session that has expired is timed out and replaced.
    /// Must be atomic per `(factory, user)`.
    async fn create_or_get_active(
        &self,
        session: ConversationSession,
        now: DateTime<Utc>,
    ) -> PipelineResult<StartOutcome>;

    async fn get(&self, session_id: Uuid) -> PipelineResult<Option<ConversationSession>>;

    /// Overwrite a session that is still ACTIVE and still at
    /// `session.version` in the store, bumping the version. Returns `false`
    /// when it went terminal or was written since it was read, leaving it
    /// untouched.
    async fn update_active(&self, session: &ConversationSession) -> PipelineResult<bool>;

    async fn list_active(&self) -> PipelineResult<Vec<ConversationSession>>;
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<Uuid, ConversationSession>,
    active: HashMap<(String, String), Uuid>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<SessionTable>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_or_get_active(
        &self,
        session: ConversationSession,
        now: DateTime<Utc>,
    ) -> PipelineResult<StartOutcome> {
        let mut table = self.inner.lock().await;
        let key = (session.factory_id.clone(), session.user_id.clone());
        if let Some(id) = table.active.get(&key).copied()
            && let Some(existing) = table.sessions.get_mut(&id)
        {
            if existing.is_active() && !existing.is_expired(now) {
                return Ok(StartOutcome::Existing(existing.clone()));
            }
            if existing.is_active() {
                existing.status = SessionStatus::TimedOut;
                existing.updated_at = now;
            }
        }
        table.active.insert(key, session.session_id);
        table.sessions.insert(session.session_id, session.clone());
        Ok(StartOutcome::Created(session))
    }

    async fn get(&self, session_id: Uuid) -> PipelineResult<Option<ConversationSession>> {
        Ok(self.inner.lock().await.sessions.get(&session_id).cloned())
    }

    async fn update_active(&self, session: &ConversationSession) -> PipelineResult<bool> {
        let mut table = self.inner.lock().await;
        let Some(stored) = table.sessions.get_mut(&session.session_id) else {
            return Ok(false);
        };
        if !stored.is_active() || stored.version != session.version {
            return Ok(false);
        }
        *stored = session.clone();
        stored.version += 1;
        if session.status.is_terminal() {
            let key = (session.factory_id.clone(), session.user_id.clone());
            if table.active.get(&key) == Some(&session.session_id) {
                table.active.remove(&key);
            }
        }
        Ok(true)
    }

    async fn list_active(&self) -> PipelineResult<Vec<ConversationSession>> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect())
    }
}

// ── Manager ───────────────────────────────────────────────────

pub struct ConversationManager {
    store: Arc<dyn SessionStore>,
    expressions: Arc<dyn ExpressionStore>,
    catalog: Arc<dyn IntentCatalog>,
    config: ConversationConfig,
    resolution: f64,
}

impl ConversationManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        expressions: Arc<dyn ExpressionStore>,
        catalog: Arc<dyn IntentCatalog>,
        config: ConversationConfig,
        resolution: f64,
    ) -> Self {
        Self {
            store,
            expressions,
            catalog,
            config,
            resolution,
        }
    }

    pub async fn session(&self, session_id: Uuid) -> PipelineResult<ConversationSession> {
        self.store
            .get(session_id)
            .await?
            .ok_or(PipelineError::SessionNotFound(session_id))
    }

    pub async fn start(
        &self,
        ctx: &RequestContext,
        input: &str,
        candidates: Vec<IntentCandidate>,
    ) -> PipelineResult<ConversationPrompt> {
        self.start_at(ctx, input, candidates, Utc::now()).await
    }

    /// Open a session, or merge into the user's ACTIVE one.
    pub async fn start_at(
        &self,
        ctx: &RequestContext,
        input: &str,
        candidates: Vec<IntentCandidate>,
        now: DateTime<Utc>,
    ) -> PipelineResult<ConversationPrompt> {
        let candidates = top_k(candidates, self.config.top_k);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let fresh = ConversationSession::new(
                ctx,
                input,
                candidates.clone(),
                self.config.max_rounds,
                self.config.ttl(),
                now,
            );
            let mut session = match self.store.create_or_get_active(fresh, now).await? {
                StartOutcome::Created(s) => {
                    tracing::info!(
                        session_id = %s.session_id,
                        factory_id = %s.factory_id,
                        user_id = %s.user_id,
                        candidates = s.candidate_intents.len(),
                        "conversation started"
                    );
                    s
                }
                StartOutcome::Existing(mut s) => {
                    tracing::info!(session_id = %s.session_id, "merging into active conversation");
                    s.history.push(ConversationTurn::user(input, now));
                    s.candidate_intents =
                        merge_candidates(&s.candidate_intents, &candidates, self.config.top_k);
                    s
                }
            };

            let question = self.question(&session.factory_id, &session.candidate_intents);
            session
                .history
                .push(ConversationTurn::assistant(question.clone(), now));
            session.updated_at = now;
            if self.store.update_active(&session).await? {
                return Ok(ConversationPrompt {
                    session_id: session.session_id,
                    round: session.current_round + 1,
                    max_rounds: session.max_rounds,
                    question,
                    options: session.candidate_intents.clone(),
                });
            }
            // The session went terminal between read and write; start over.
            tracing::debug!(session_id = %session.session_id, "active session closed concurrently, retrying");
        }
        Err(PipelineError::Storage(
            "could not settle an active conversation session".into(),
        ))
    }

    /// Feed one user reply into the session.
    ///
    /// `score` re-runs slot extraction and the ladder over the reply text.
    /// It runs at most once; a reply that races another write to the same
    /// session is re-applied to the fresh state.
    pub async fn continue_at<F, Fut>(
        &self,
        session_id: Uuid,
        reply: &str,
        score: F,
        now: DateTime<Utc>,
    ) -> PipelineResult<ConversationResponse>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = PipelineResult<IntentMatchResult>>,
    {
        let mut score = Some(score);
        let mut scored: Option<IntentMatchResult> = None;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut session = self.session(session_id).await?;
            if !session.is_active() {
                return Ok(closed_response(&session));
            }
            if session.is_expired(now) {
                session.status = SessionStatus::TimedOut;
                session.updated_at = now;
                match self.persist(session, "会话已超时，请重新提问").await? {
                    Some(response) => return Ok(response),
                    None => continue,
                }
            }

            session.history.push(ConversationTurn::user(reply, now));
            session.updated_at = now;

            let picked = parse_choice(reply)
                .and_then(|choice| session.candidate_intents.get(choice - 1).cloned());
            let outcome = match picked {
                Some(picked) => self.complete(session, picked.intent_code, 1.0, None, now).await?,
                None => {
                    let result = if let Some(r) = scored.clone() {
                        r
                    } else {
                        let Some(f) = score.take() else {
                            return Err(PipelineError::Storage("reply scorer already consumed".into()));
                        };
                        let r = f(reply.to_string()).await?;
                        scored = Some(r.clone());
                        r
                    };
                    self.advance(session, reply, result, now).await?
                }
            };
            if let Some(response) = outcome {
                return Ok(response);
            }
            tracing::debug!(session_id = %session_id, "conversation changed concurrently, reapplying reply");
        }
        Err(PipelineError::Storage(
            "conversation kept changing while applying the reply".into(),
        ))
    }

    /// Apply a scored reply: complete, exhaust or ask again.
    async fn advance(
        &self,
        mut session: ConversationSession,
        reply: &str,
        result: IntentMatchResult,
        now: DateTime<Utc>,
    ) -> PipelineResult<Option<ConversationResponse>> {
        let known = session.candidate_intents.clone();
        let boost = self.config.history_boost;
        let result = result.rescored(|c| {
            if known.iter().any(|k| k.intent_code == c.intent_code) {
                clamp_unit(c.confidence + boost)
            } else {
                c.confidence
            }
        });

        if let Some(best) = result.top().cloned()
            && best.confidence >= self.resolution
        {
            return self
                .complete(session, best.intent_code, best.confidence, Some(reply), now)
                .await;
        }

        session.current_round += 1;
        session.candidate_intents =
            merge_candidates(&session.candidate_intents, &result.candidates, self.config.top_k);

        if session.rounds_exhausted() {
            session.status = SessionStatus::MaxRoundsReached;
            let (id, rounds) = (session.session_id, session.current_round);
            let response = self
                .persist(session, "多次澄清后仍无法确定您的需求，请换个说法重新提问")
                .await?;
            if response.is_some() {
                tracing::info!(session_id = %id, rounds, "conversation reached max rounds");
            }
            return Ok(response);
        }

        let question = self.question(&session.factory_id, &session.candidate_intents);
        session
            .history
            .push(ConversationTurn::assistant(question.clone(), now));
        self.persist(session, &question).await
    }

    /// Idempotent: a terminal session is returned unchanged.
    pub async fn cancel_at(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> PipelineResult<ConversationResponse> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut session = self.session(session_id).await?;
            if !session.is_active() {
                return Ok(closed_response(&session));
            }
            session.status = SessionStatus::Cancelled;
            session.updated_at = now;
            if let Some(response) = self.persist(session, "已取消本次对话").await? {
                tracing::info!(session_id = %session_id, "conversation cancelled");
                return Ok(response);
            }
        }
        Err(PipelineError::Storage(
            "conversation kept changing while cancelling".into(),
        ))
    }

    /// Time out expired sessions and close exhausted ones. Safe to re-run.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let mut swept = 0;
        for mut session in self.store.list_active().await? {
            let next = if session.is_expired(now) {
                SessionStatus::TimedOut
            } else if session.rounds_exhausted() {
                SessionStatus::MaxRoundsReached
            } else {
                continue;
            };
            session.status = next;
            session.updated_at = now;
            if self.store.update_active(&session).await? {
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(swept, "conversation sweep");
        }
        Ok(swept)
    }

    async fn complete(
        &self,
        mut session: ConversationSession,
        intent_code: String,
        confidence: f64,
        reply: Option<&str>,
        now: DateTime<Utc>,
    ) -> PipelineResult<Option<ConversationResponse>> {
        session.status = SessionStatus::Completed;
        session.resolved_intent = Some(intent_code.clone());
        if let Some(turn) = session.history.last_mut() {
            turn.intent_code = Some(intent_code.clone());
            turn.confidence = Some(confidence);
        }

        let definition = self.catalog.get(&session.factory_id, &intent_code);
        let keyword = reply.and_then(|r| novel_term(r, &session.original_input, definition.as_ref()));
        let factory_id = session.factory_id.clone();
        let original_input = session.original_input.clone();

        let message = format!("好的，已确认为「{}」", display_name(definition.as_ref(), &intent_code));
        let Some(mut response) = self.persist(session, &message).await? else {
            return Ok(None);
        };
        if response.status != SessionStatus::Completed {
            return Ok(Some(response));
        }
        response.intent_code = Some(intent_code.clone());
        tracing::info!(
            session_id = %response.session_id,
            intent = %intent_code,
            confidence,
            "conversation completed"
        );

        let learned = LearnedExpression {
            factory_id,
            intent_code,
            expression: original_input,
            keyword,
            created_at: now,
        };
        if let Err(e) = self.expressions.save(learned).await {
            tracing::warn!(error = %e, "failed to persist learned expression");
        }
        Ok(Some(response))
    }

    /// Write `session` back. `None` means another write got there first and
    /// the session is still ACTIVE, so the caller should re-read and retry.
    /// If it went terminal meanwhile, that closed state is the response.
    async fn persist(
        &self,
        session: ConversationSession,
        message: &str,
    ) -> PipelineResult<Option<ConversationResponse>> {
        if !self.store.update_active(&session).await? {
            let current = self.session(session.session_id).await?;
            if current.is_active() {
                return Ok(None);
            }
            return Ok(Some(closed_response(&current)));
        }
        let candidates = (session.status == SessionStatus::Active)
            .then(|| session.candidate_intents.clone());
        Ok(Some(ConversationResponse {
            session_id: session.session_id,
            status: session.status,
            message: message.to_string(),
            round: session.current_round,
            intent_code: session.resolved_intent.clone(),
            candidates,
        }))
    }

    fn question(&self, factory_id: &str, options: &[IntentCandidate]) -> String {
        if options.is_empty() {
            return "抱歉，我没能理解您的需求。能换个说法，或者说明要查询或操作的对象吗？".into();
        }
        let mut lines = vec!["请问您想要的是以下哪一项？".to_string()];
        for (i, c) in options.iter().enumerate() {
            let def = self.catalog.get(factory_id, &c.intent_code);
            lines.push(format!("{}. {}", i + 1, display_name(def.as_ref(), &c.intent_code)));
        }
        lines.push("请回复序号，或补充更多描述。".into());
        lines.join("\n")
    }
}

fn closed_response(session: &ConversationSession) -> ConversationResponse {
    let message = match session.status {
        SessionStatus::Completed => "该对话已完成",
        SessionStatus::Cancelled => "该对话已取消",
        SessionStatus::TimedOut => "会话已超时，请重新提问",
        SessionStatus::MaxRoundsReached => "该对话已达到最大轮次，请重新提问",
        SessionStatus::Active => "对话进行中",
    };
    ConversationResponse {
        session_id: session.session_id,
        status: session.status,
        message: message.into(),
        round: session.current_round,
        intent_code: session.resolved_intent.clone(),
        candidates: None,
    }
}

fn display_name<'a>(def: Option<&'a IntentDefinition>, code: &'a str) -> &'a str {
    def.map(|d| d.name.as_str()).unwrap_or(code)
}

/// 1-based option index from replies like "2", "第二个", "选3".
pub fn parse_choice(reply: &str) -> Option<usize> {
    let caps = RE_CHOICE.captures(reply.trim())?;
    let n = parse_count(caps.get(1)?.as_str())? as usize;
    (n >= 1).then_some(n)
}

fn top_k(mut candidates: Vec<IntentCandidate>, k: usize) -> Vec<IntentCandidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.truncate(k);
    candidates
}

/// Union by intent code keeping the higher score, best first.
fn merge_candidates(
    existing: &[IntentCandidate],
    incoming: &[IntentCandidate],
    k: usize,
) -> Vec<IntentCandidate> {
    let mut merged: Vec<IntentCandidate> = existing.to_vec();
    for c in incoming {
        match merged.iter_mut().find(|m| m.intent_code == c.intent_code) {
            Some(m) => m.confidence = m.confidence.max(c.confidence),
            None => merged.push(c.clone()),
        }
    }
    top_k(merged, k)
}

/// A 2–6 character term from the reply that neither the original input
/// nor the intent's name and keywords already contain.
fn novel_term(reply: &str, original: &str, def: Option<&IntentDefinition>) -> Option<String> {
    RE_TERM_SPLIT
        .split(reply)
        .map(strip_fillers)
        .filter(|t| (2..=6).contains(&t.chars().count()))
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !original.contains(t))
        .find(|t| {
            def.is_none_or(|d| !d.name.contains(t) && !d.keywords.iter().any(|k| k == t))
        })
        .map(String::from)
}

fn strip_fillers(segment: &str) -> &str {
    let mut s = segment.trim();
    loop {
        let before = s.len();
        for f in FILLERS {
            s = s.strip_prefix(f).unwrap_or(s);
            s = s.strip_suffix(f).unwrap_or(s);
        }
        if s.len() == before {
            return s;
        }
    }
}
