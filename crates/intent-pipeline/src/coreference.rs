//! Coreference resolution against recent conversation context.
//!
//! Pronouns, demonstratives, definite descriptions, temporal and positional
//! references are detected by pattern, then looked up against the entities
//! mentioned most recently for the same `(factory, user)`. The LLM is only
//! consulted when rule lookup leaves a reference unresolved.

use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::sync::RwLock;

use intent_protocol::{ExtractedSlots, RequestContext, SlotType, TimeRange};

use crate::services::{ChatOptions, LlmService, extract_json};

const CONTEXT_CAPACITY: usize = 10;

// ── Context ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMention {
    pub slot_type: SlotType,
    pub value: String,
    pub mentioned_at: DateTime<Utc>,
}

/// What the user talked about recently.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    /// Bounded, newest last.
    pub entities: VecDeque<EntityMention>,
    /// Entities of the most recent turn only, in the order they were mentioned.
    pub last_turn_entities: Vec<EntityMention>,
    pub last_time_range: Option<TimeRange>,
    pub last_intent: Option<String>,
}

impl ConversationContext {
    /// Most recent entity whose type is in `accept` (any type when empty).
    pub fn most_recent(&self, accept: &[SlotType]) -> Option<&EntityMention> {
        self.entities
            .iter()
            .rev()
            .find(|e| accept.is_empty() || accept.contains(&e.slot_type))
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.last_time_range.is_none() && self.last_intent.is_none()
    }

    fn record(&mut self, slots: &ExtractedSlots, intent_code: Option<&str>, now: DateTime<Utc>) {
        let mentions: Vec<EntityMention> = slots
            .matches
            .iter()
            .filter(|m| m.slot_type.is_entity_id() || m.slot_type == SlotType::PersonName)
            .map(|m| EntityMention {
                slot_type: m.slot_type,
                value: m.value.clone(),
                mentioned_at: now,
            })
            .collect();

        if !mentions.is_empty() {
            for m in &mentions {
                self.entities.retain(|e| !(e.slot_type == m.slot_type && e.value == m.value));
                self.entities.push_back(m.clone());
            }
            while self.entities.len() > CONTEXT_CAPACITY {
                self.entities.pop_front();
            }
            self.last_turn_entities = mentions;
        }
        if let Some(tr) = &slots.time_range {
            self.last_time_range = Some(tr.clone());
        }
        if let Some(code) = intent_code {
            self.last_intent = Some(code.to_string());
        }
    }
}

/// Per-`(factory, user)` context shared across requests.
#[derive(Debug, Default)]
pub struct ContextMemory {
    inner: RwLock<HashMap<(String, String), ConversationContext>>,
}

impl ContextMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, ctx: &RequestContext) -> ConversationContext {
        self.inner
            .read()
            .await
            .get(&key(ctx))
            .cloned()
            .unwrap_or_default()
    }

    /// Fold one resolved turn into the user's context.
    pub async fn record(
        &self,
        ctx: &RequestContext,
        slots: &ExtractedSlots,
        intent_code: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.inner
            .write()
            .await
            .entry(key(ctx))
            .or_default()
            .record(slots, intent_code, now);
    }

    pub async fn clear(&self, ctx: &RequestContext) {
        self.inner.write().await.remove(&key(ctx));
    }
}

fn key(ctx: &RequestContext) -> (String, String) {
    (ctx.factory_id.clone(), ctx.user_id.clone())
}

// ── Detection ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceClass {
    Pronoun,
    Proximal,
    Distal,
    Definite,
    Temporal,
    Positional,
    Ellipsis,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedReference {
    pub class: ReferenceClass,
    pub marker: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReference {
    pub class: ReferenceClass,
    pub marker: String,
    pub value: String,
    pub slot_type: Option<SlotType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreferenceResult {
    pub resolved_text: String,
    pub resolved_entities: Vec<ResolvedReference>,
    pub unresolved: Vec<DetectedReference>,
}

impl CoreferenceResult {
    fn unchanged(text: &str) -> Self {
        Self {
            resolved_text: text.to_string(),
            resolved_entities: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        !self.resolved_entities.is_empty()
    }
}

static RE_PRONOUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"它们|它|他们|她们|他|她").unwrap());
static RE_PROXIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"这(?:个|批|台|位|家|条|笔|单|些)").unwrap());
static RE_DISTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"那(?:个|批|台|位|家|条|笔|单|些)").unwrap());
static RE_DEFINITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"上述|刚才那个|刚才的|前面说的|上面的|之前那个").unwrap());
static RE_TEMPORAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"那天|当天|当时|那段时间|那时候|同一天").unwrap());
static RE_POSITIONAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"第([一二三四五12345])个|前者|后者|最后一个").unwrap());
static RE_ELLIPSIS_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:那么|那|还有)").unwrap());

/// Detect references; decorative words (这样, 那么, 这里, ...) never match.
pub fn detect(text: &str) -> Vec<DetectedReference> {
    let mut found = Vec::new();
    let families: [(&Regex, ReferenceClass); 6] = [
        (&RE_DEFINITE, ReferenceClass::Definite),
        (&RE_TEMPORAL, ReferenceClass::Temporal),
        (&RE_POSITIONAL, ReferenceClass::Positional),
        (&RE_PROXIMAL, ReferenceClass::Proximal),
        (&RE_DISTAL, ReferenceClass::Distal),
        (&RE_PRONOUN, ReferenceClass::Pronoun),
    ];
    for (re, class) in families {
        for m in re.find_iter(text) {
            if found
                .iter()
                .any(|d: &DetectedReference| m.start() < d.end && d.start < m.end())
            {
                continue;
            }
            found.push(DetectedReference {
                class,
                marker: m.as_str().to_string(),
                start: m.start(),
                end: m.end(),
            });
        }
    }

    if found.is_empty() && is_elliptical(text) {
        let head = RE_ELLIPSIS_HEAD.find(text).map(|m| m.end()).unwrap_or(0);
        found.push(DetectedReference {
            class: ReferenceClass::Ellipsis,
            marker: text[..head].to_string(),
            start: 0,
            end: head,
        });
    }

    found.sort_by_key(|d| d.start);
    found
}

/// "那出库呢" / "还有库存" style follow-ups.
pub fn is_elliptical(text: &str) -> bool {
    let t = text.trim();
    RE_ELLIPSIS_HEAD.is_match(t) || t.ends_with('呢')
}

/// Entity types a demonstrative's measure word points at.
fn type_hint(marker: &str) -> &'static [SlotType] {
    let measure = marker.chars().last();
    match (marker, measure) {
        (_, Some('批')) => &[SlotType::BatchId, SlotType::MaterialId],
        (_, Some('台')) => &[SlotType::DeviceId],
        (_, Some('位')) => &[SlotType::PersonName, SlotType::EmployeeId],
        (_, Some('家')) => &[SlotType::CustomerId, SlotType::SupplierId],
        (_, Some('笔' | '单')) => &[SlotType::OrderId],
        ("他" | "她" | "他们" | "她们", _) => &[SlotType::PersonName, SlotType::EmployeeId],
        _ => &[],
    }
}

// ── Resolution ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct CoreferenceResolver;

impl CoreferenceResolver {
    pub fn new() -> Self {
        Self
    }

    /// Rule-based resolution: most recent matching entity wins.
    pub fn resolve(&self, text: &str, context: &ConversationContext) -> CoreferenceResult {
        let detected = detect(text);
        if detected.is_empty() {
            return CoreferenceResult::unchanged(text);
        }

        let mut replacements: Vec<(usize, usize, String)> = Vec::new();
        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();

        for d in detected {
            let hit = match d.class {
                ReferenceClass::Temporal => context
                    .last_time_range
                    .as_ref()
                    .map(|tr| (tr.original_expression.clone(), Some(SlotType::TimeRange))),
                ReferenceClass::Positional => positional(&d.marker, context)
                    .map(|e| (e.value.clone(), Some(e.slot_type))),
                ReferenceClass::Ellipsis => {
                    // Carry the previous time window into the follow-up.
                    let carry = context
                        .last_time_range
                        .as_ref()
                        .filter(|_| !text_has_time(text))
                        .map(|tr| tr.original_expression.clone())
                        .unwrap_or_default();
                    if carry.is_empty() && context.last_intent.is_none() {
                        None
                    } else {
                        Some((carry, None))
                    }
                }
                _ => context
                    .most_recent(type_hint(&d.marker))
                    .map(|e| (e.value.clone(), Some(e.slot_type))),
            };

            match hit {
                Some((value, slot_type)) => {
                    replacements.push((d.start, d.end, value.clone()));
                    resolved.push(ResolvedReference {
                        class: d.class,
                        marker: d.marker,
                        value,
                        slot_type,
                    });
                }
                None => unresolved.push(d),
            }
        }

        let mut out = text.to_string();
        for (start, end, value) in replacements.into_iter().rev() {
            out.replace_range(start..end, &value);
        }

        CoreferenceResult {
            resolved_text: out,
            resolved_entities: resolved,
            unresolved,
        }
    }

    /// Rule-based first; the LLM only sees what the rules left unresolved.
    /// Any LLM failure keeps the rule output.
    pub async fn resolve_with_llm(
        &self,
        text: &str,
        context: &ConversationContext,
        llm: &dyn LlmService,
    ) -> CoreferenceResult {
        let rule = self.resolve(text, context);
        if rule.unresolved.is_empty() || context.is_empty() {
            return rule;
        }

        let recent: Vec<String> = context
            .entities
            .iter()
            .rev()
            .map(|e| format!("{}={}", e.slot_type, e.value))
            .collect();
        let user_prompt = format!(
            "最近提到的实体(新到旧): {}\n上一个意图: {}\n待改写: {}",
            recent.join(", "),
            context.last_intent.as_deref().unwrap_or("无"),
            rule.resolved_text
        );

        match llm.chat(COREF_PROMPT, &user_prompt, ChatOptions::json()).await {
            Ok(raw) => match serde_json::from_str::<LlmRewrite>(extract_json(&raw)) {
                Ok(rw) if !rw.resolved_text.trim().is_empty() => {
                    tracing::debug!(original = text, rewritten = %rw.resolved_text, "llm coreference");
                    CoreferenceResult {
                        resolved_text: rw.resolved_text,
                        resolved_entities: rule.resolved_entities,
                        unresolved: Vec::new(),
                    }
                }
                Ok(_) => rule,
                Err(e) => {
                    tracing::warn!(error = %e, "llm coreference returned invalid JSON");
                    rule
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "llm coreference unavailable");
                rule
            }
        }
    }
}

const COREF_PROMPT: &str = r#"你负责工厂管理系统的指代消解。根据最近提到的实体，把用户句子中的代词和指示词替换成具体实体，不要改变句意。
只输出JSON: {"resolved_text": "<改写后的句子>"}"#;

#[derive(Deserialize)]
struct LlmRewrite {
    resolved_text: String,
}

fn positional<'a>(marker: &str, context: &'a ConversationContext) -> Option<&'a EntityMention> {
    let list = &context.last_turn_entities;
    let idx = match marker {
        "前者" => 0,
        "后者" | "最后一个" => list.len().checked_sub(1)?,
        _ => {
            let caps = RE_POSITIONAL.captures(marker)?;
            let n = intent_slots::numerals::parse_count(caps.get(1)?.as_str())? as usize;
            n.checked_sub(1)?
        }
    };
    list.get(idx)
}

fn text_has_time(text: &str) -> bool {
    let today = Utc::now().date_naive();
    !intent_slots::time_range::candidates(text, today).is_empty()
}
