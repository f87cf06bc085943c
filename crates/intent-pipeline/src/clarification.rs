//! Missing-parameter detection and clarification questions.
//!
//! A required slot counts as present when the user gave it, when the
//! conversation context holds a recent entity of the same type, or (for
//! QUERY intents) when it is a time range that can default to today.
//! High-risk intents never infer: every required slot must be explicit.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;

use intent_protocol::{ActionType, ExtractedSlots, IntentDefinition, SlotType};

use crate::coreference::ConversationContext;
use crate::services::{ChatOptions, LlmService, extract_json};

const MAX_QUESTIONS: usize = 3;

const SYSTEM_PROMPT: &str = r#"你是工厂管理助手。用户的请求缺少一些必要信息，请用自然、简短的中文向用户追问。
每个缺失项最多一个问题，总数不超过3个。只输出JSON: {"questions": ["问题1", "问题2"]}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SlotFamily {
    Time,
    Material,
    Equipment,
    Party,
    Order,
    Operation,
    Other,
}

fn family(slot: SlotType) -> SlotFamily {
    match slot {
        SlotType::TimeRange => SlotFamily::Time,
        SlotType::MaterialId | SlotType::BatchId | SlotType::ProductId => SlotFamily::Material,
        SlotType::DeviceId => SlotFamily::Equipment,
        SlotType::CustomerId
        | SlotType::SupplierId
        | SlotType::EmployeeId
        | SlotType::PersonName
        | SlotType::Department => SlotFamily::Party,
        SlotType::OrderId => SlotFamily::Order,
        SlotType::Status | SlotType::Number => SlotFamily::Operation,
        SlotType::Metric | SlotType::Comparison => SlotFamily::Other,
    }
}

fn template(slot: SlotType) -> &'static str {
    match slot {
        SlotType::TimeRange => "请问要查询哪个时间范围？例如：今天、最近7天、上个月。",
        SlotType::BatchId => "请提供批次号，例如 MB-20240301。",
        SlotType::MaterialId => "请问是哪种原料？",
        SlotType::ProductId => "请问是哪个产品？请提供产品编号。",
        SlotType::DeviceId => "请问是哪台设备？请提供设备编号。",
        SlotType::CustomerId => "请问是哪个客户？",
        SlotType::SupplierId => "请问是哪个供应商？",
        SlotType::EmployeeId | SlotType::PersonName => "请问是哪位员工？",
        SlotType::Department => "请问是哪个部门或车间？",
        SlotType::OrderId => "请提供订单号。",
        SlotType::Status => "请问要把状态改成什么？",
        SlotType::Number => "请问数量是多少？",
        SlotType::Metric => "请问要看哪项指标？",
        SlotType::Comparison => "请问要怎么对比？例如：同比、环比。",
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClarificationDecision {
    /// Required slots neither given nor inferable, in declaration order.
    pub missing: Vec<SlotType>,
    /// Values filled in from context or defaults.
    pub inferred: BTreeMap<SlotType, String>,
    /// High-risk intent with missing slots.
    pub mandatory: bool,
    pub questions: Vec<String>,
}

impl ClarificationDecision {
    pub fn needed(&self) -> bool {
        !self.missing.is_empty()
    }
}

#[derive(Deserialize)]
struct LlmQuestions {
    questions: Vec<String>,
}

#[derive(Default)]
pub struct ClarificationDecider {
    llm: Option<Arc<dyn LlmService>>,
}

impl ClarificationDecider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Phrase questions with the LLM, keeping templates as fallback.
    pub fn with_llm(llm: Arc<dyn LlmService>) -> Self {
        Self { llm: Some(llm) }
    }

    pub fn decide(
        &self,
        definition: &IntentDefinition,
        slots: &ExtractedSlots,
        context: Option<&ConversationContext>,
        today: NaiveDate,
    ) -> ClarificationDecision {
        let high_risk = definition.is_high_risk();
        let mut decision = ClarificationDecision::default();

        for &slot in &definition.required_slots {
            if slots.has(slot) {
                continue;
            }
            if !high_risk && let Some(value) = infer(slot, definition, context, today) {
                decision.inferred.insert(slot, value);
                continue;
            }
            decision.missing.push(slot);
        }

        decision.mandatory = high_risk && decision.needed();
        decision.questions = template_questions(&decision.missing);
        if decision.needed() {
            tracing::debug!(
                intent = %definition.intent_code,
                missing = ?decision.missing,
                mandatory = decision.mandatory,
                "clarification needed"
            );
        }
        decision
    }

    /// Like [`decide`](Self::decide), with LLM-phrased questions when an LLM
    /// is configured. Any LLM failure keeps the template questions.
    pub async fn decide_with_llm(
        &self,
        text: &str,
        definition: &IntentDefinition,
        slots: &ExtractedSlots,
        context: Option<&ConversationContext>,
        today: NaiveDate,
    ) -> ClarificationDecision {
        let mut decision = self.decide(definition, slots, context, today);
        let Some(llm) = &self.llm else {
            return decision;
        };
        if !decision.needed() {
            return decision;
        }

        let missing: Vec<&str> = decision.missing.iter().map(|s| s.as_str()).collect();
        let prompt = format!(
            "用户请求: {text}\n意图: {}\n缺失信息: {}\n参考问题: {}",
            definition.name,
            missing.join(", "),
            decision.questions.join(" ")
        );
        match llm.chat(SYSTEM_PROMPT, &prompt, ChatOptions::json()).await {
            Ok(raw) => match serde_json::from_str::<LlmQuestions>(extract_json(&raw)) {
                Ok(q) if !q.questions.is_empty() && q.questions.iter().all(|s| !s.trim().is_empty()) => {
                    decision.questions = q.questions.into_iter().take(MAX_QUESTIONS).collect();
                }
                Ok(_) => tracing::debug!("llm returned no usable questions, keeping templates"),
                Err(e) => tracing::warn!(error = %e, "clarification questions unparseable"),
            },
            Err(e) => tracing::warn!(error = %e, "llm unavailable for clarification, keeping templates"),
        }
        decision
    }
}

fn infer(
    slot: SlotType,
    definition: &IntentDefinition,
    context: Option<&ConversationContext>,
    today: NaiveDate,
) -> Option<String> {
    if slot == SlotType::TimeRange {
        if let Some(tr) = context.and_then(|c| c.last_time_range.as_ref()) {
            return Some(format!("{}~{}", tr.start_date, tr.end_date));
        }
        return (definition.action == ActionType::Query).then(|| format!("{today}~{today}"));
    }
    context
        .and_then(|c| c.most_recent(&[slot]))
        .map(|e| e.value.clone())
}

fn template_questions(missing: &[SlotType]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut questions = Vec::new();
    for &slot in missing {
        let f = family(slot);
        if seen.contains(&f) {
            continue;
        }
        seen.push(f);
        questions.push(template(slot).to_string());
        if questions.len() == MAX_QUESTIONS {
            break;
        }
    }
    questions
}
