//! The single entry point over the whole resolution flow.
//!
//! normalize → extract slots → two-stage rules → confidence ladder →
//! calibrate → {conversation | clarification | preview | execute}.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use intent_protocol::{
    ActiveLearningSample, ConfirmResult, ConversationPrompt, ConversationResponse, ExtractedSlots,
    IntentCandidate, IntentDefinition, IntentMatchResult, OptimizationSuggestion,
    PreviewToken, RequestContext, SessionStatus, SlotType,
};
use intent_slots::SlotExtractor;

use crate::calibrator::{ConfidenceCalibrator, InMemoryTransitionStore, TransitionStore};
use crate::catalog::IntentCatalog;
use crate::clarification::ClarificationDecider;
use crate::classifier::{ActionRules, DomainKeywords, TwoStageClassifier};
use crate::clients::{HttpClassifierClient, HttpEmbeddingClient, OllamaLlmClient};
use crate::config::{PipelineConfig, ServicesConfig};
use crate::conversation::{ConversationManager, InMemorySessionStore, SessionStore};
use crate::coreference::{ContextMemory, ConversationContext};
use crate::error::PipelineResult;
use crate::ladder::{
    ClassifierLayer, ConfidenceLadder, EmbeddingLayer, FallbackLayer, IntentEmbeddingIndex,
    LadderInput, LadderLayer, RequestCache, RerankLayer, RuleLayer,
};
use crate::learning::{
    ExpressionStore, InMemoryExpressionStore, InMemorySampleStore, LearningAnalyzer,
    LearningCollector, LearningReport, SampleStore,
};
use crate::normalizer::{NormalizedQuery, Normalizer};
use crate::preview::{InMemoryTokenStore, PreviewGate, PreviewRequest, TokenStore};
use crate::services::{BusinessExecutor, ClassifierService, EmbeddingService, LlmService};
use crate::tool_router::{ToolOutcome, ToolPlan, ToolRegistry, ToolRouter};

const REPHRASE_MESSAGE: &str = "服务暂时繁忙，未能理解您的问题，请换个说法再试一次";

// ── Wiring ────────────────────────────────────────────────────

/// External collaborators. Absent services simply remove their ladder layer.
#[derive(Clone)]
pub struct Services {
    pub embedding: Option<Arc<dyn EmbeddingService>>,
    pub classifier: Option<Arc<dyn ClassifierService>>,
    pub llm: Option<Arc<dyn LlmService>>,
    pub executor: Arc<dyn BusinessExecutor>,
    /// Tools for intents without a bound executor.
    pub tools: Option<Arc<ToolRegistry>>,
}

impl Services {
    pub fn new(executor: Arc<dyn BusinessExecutor>) -> Self {
        Self {
            embedding: None,
            classifier: None,
            llm: None,
            executor,
            tools: None,
        }
    }

    /// HTTP clients for every endpoint present in the config.
    pub fn from_config(
        config: &ServicesConfig,
        executor: Arc<dyn BusinessExecutor>,
    ) -> PipelineResult<Self> {
        let mut services = Self::new(executor);
        if let Some(c) = &config.embedding {
            services.embedding = Some(Arc::new(HttpEmbeddingClient::new(c)?));
        }
        if let Some(c) = &config.classifier {
            services.classifier = Some(Arc::new(HttpClassifierClient::new(c)?));
        }
        if let Some(c) = &config.llm {
            services.llm = Some(Arc::new(OllamaLlmClient::new(c)?));
        }
        Ok(services)
    }
}

/// Durable state behind the pipeline.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub transitions: Arc<dyn TransitionStore>,
    pub samples: Arc<dyn SampleStore>,
    pub expressions: Arc<dyn ExpressionStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            tokens: Arc::new(InMemoryTokenStore::new()),
            transitions: Arc::new(InMemoryTransitionStore::new()),
            samples: Arc::new(InMemorySampleStore::new()),
            expressions: Arc::new(InMemoryExpressionStore::new()),
        }
    }
}

// ── Results ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedIntent {
    pub result: IntentMatchResult,
    pub parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_plan: Option<ToolPlan>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_outcomes: Vec<ToolOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClarificationPrompt {
    pub intent_code: String,
    pub missing: Vec<SlotType>,
    pub questions: Vec<String>,
    /// High-risk intent: the answer cannot be inferred.
    pub mandatory: bool,
    pub result: IntentMatchResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Resolved(ResolvedIntent),
    Clarification(ClarificationPrompt),
    Conversation(ConversationPrompt),
    Preview(PreviewToken),
    /// Every collaborator was unavailable.
    Rephrase { message: String },
}

// ── Pipeline ──────────────────────────────────────────────────

pub struct IntentPipeline {
    config: PipelineConfig,
    catalog: Arc<dyn IntentCatalog>,
    extractor: SlotExtractor,
    normalizer: Normalizer,
    classifier: TwoStageClassifier,
    ladder: ConfidenceLadder,
    intent_index: Arc<IntentEmbeddingIndex>,
    calibrator: ConfidenceCalibrator,
    context: ContextMemory,
    conversations: ConversationManager,
    clarifier: ClarificationDecider,
    tools: Option<ToolRouter>,
    preview: PreviewGate,
    collector: LearningCollector,
    analyzer: LearningAnalyzer,
    samples: Arc<dyn SampleStore>,
    llm: Option<Arc<dyn LlmService>>,
    executor: Arc<dyn BusinessExecutor>,
}

impl IntentPipeline {
    /// Wire the pipeline. Starts the learning writer, so it must be called
    /// inside a Tokio runtime.
    pub fn new(
        config: PipelineConfig,
        catalog: Arc<dyn IntentCatalog>,
        services: Services,
        stores: Stores,
    ) -> Self {
        let domains = Arc::new(DomainKeywords::default());
        let classifier = TwoStageClassifier::new(domains.clone(), Arc::new(ActionRules::default()));
        let normalizer = Normalizer::new(domains);
        let t = &config.thresholds;

        let intent_index =
            Arc::new(IntentEmbeddingIndex::with_expressions(stores.expressions.clone()));
        let mut layers: Vec<Box<dyn LadderLayer>> = vec![Box::new(RuleLayer::new(t.rule_accept))];
        if let Some(e) = &services.embedding {
            layers.push(Box::new(EmbeddingLayer::new(e.clone(), intent_index.clone(), t)));
        }
        if let Some(c) = &services.classifier {
            layers.push(Box::new(ClassifierLayer::new(
                c.clone(),
                t.classifier_accept,
                config.timeouts.health_recheck(),
            )));
        }
        if let Some(llm) = &services.llm {
            layers.push(Box::new(RerankLayer::new(llm.clone(), t.rerank_low, t.rerank_high)));
            layers.push(Box::new(FallbackLayer::new(llm.clone(), t.fallback)));
        }
        let ladder = ConfidenceLadder::new(layers, config.timeouts.layer());
        tracing::info!(layers = ?ladder.layer_sources(), "confidence ladder assembled");

        let clarifier = match (&services.llm, config.behavior.llm_questions) {
            (Some(llm), true) => ClarificationDecider::with_llm(llm.clone()),
            _ => ClarificationDecider::new(),
        };
        let tools = match (&services.tools, &services.embedding) {
            (Some(registry), Some(embedding)) => Some(ToolRouter::new(
                registry.clone(),
                embedding.clone(),
                services.llm.clone(),
                config.tool_router.clone(),
            )),
            (Some(_), None) => {
                tracing::warn!("tool registry given without an embedding service, tool routing disabled");
                None
            }
            _ => None,
        };

        let (collector, _writer) = LearningCollector::spawn(
            stores.samples.clone(),
            config.learning.channel_capacity,
            t.collection,
        );

        Self {
            calibrator: ConfidenceCalibrator::new(stores.transitions.clone(), &config.calibration),
            conversations: ConversationManager::new(
                stores.sessions.clone(),
                stores.expressions.clone(),
                catalog.clone(),
                config.conversation.clone(),
                t.resolution,
            ),
            preview: PreviewGate::new(stores.tokens.clone(), services.executor.clone(), config.preview.ttl()),
            analyzer: LearningAnalyzer::new(
                stores.samples.clone(),
                stores.expressions.clone(),
                &config.learning,
            ),
            samples: stores.samples,
            extractor: SlotExtractor::new(),
            context: ContextMemory::new(),
            llm: services.llm,
            executor: services.executor,
            config,
            catalog,
            normalizer,
            classifier,
            ladder,
            intent_index,
            clarifier,
            tools,
            collector,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn resolve_intent(&self, ctx: &RequestContext, text: &str) -> PipelineResult<Resolution> {
        self.resolve_intent_at(ctx, text, Utc::now()).await
    }

    pub async fn resolve_intent_at(
        &self,
        ctx: &RequestContext,
        text: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<Resolution> {
        let factory = ctx.factory_id.as_str();
        let memory = self.context.get(ctx).await;
        let context = (!memory.is_empty()).then_some(&memory);

        let normalized = self.normalize(text, context).await;
        let today = now.date_naive();
        let slots = self.extractor.extract_at(&normalized.text, today);
        let (result, all_unavailable) = self.score(factory, &normalized, &slots).await;

        if all_unavailable {
            tracing::warn!(factory_id = %factory, "every ladder layer unavailable");
            return Ok(Resolution::Rephrase {
                message: REPHRASE_MESSAGE.into(),
            });
        }

        let result = self
            .calibrator
            .calibrate_result(factory, memory.last_intent.as_deref(), result)
            .await;
        self.collect_sample(ctx, &normalized, &result, now);

        let definition = result
            .best_match_intent_code
            .as_deref()
            .and_then(|code| self.catalog.get(factory, code));
        let definition = match definition {
            Some(d) if result.confidence >= self.config.thresholds.fallback => d,
            _ => {
                let candidates = self.conversation_options(factory, &memory, &result).await;
                let prompt = self.conversations.start_at(ctx, text, candidates, now).await?;
                return Ok(Resolution::Conversation(prompt));
            }
        };

        tracing::info!(
            factory_id = %factory,
            intent = %definition.intent_code,
            confidence = result.confidence,
            source = %result.source,
            "intent resolved"
        );
        if let Some(prev) = memory.last_intent.as_deref() {
            self.calibrator
                .observe(factory, prev, &definition.intent_code, now)
                .await?;
        }
        self.context
            .record(ctx, &slots, Some(&definition.intent_code), now)
            .await;

        let decision = if self.config.behavior.llm_questions {
            self.clarifier
                .decide_with_llm(&normalized.text, &definition, &slots, context, today)
                .await
        } else {
            self.clarifier.decide(&definition, &slots, context, today)
        };
        if decision.needed() {
            return Ok(Resolution::Clarification(ClarificationPrompt {
                intent_code: definition.intent_code.clone(),
                missing: decision.missing,
                questions: decision.questions,
                mandatory: decision.mandatory,
                result,
            }));
        }

        let parameters = build_parameters(&slots, &decision.inferred, result.parameters.as_ref());

        if definition.is_mutating() {
            let token = self
                .preview
                .create_at(ctx, preview_request(&definition, &slots, parameters), now)
                .await?;
            return Ok(Resolution::Preview(token));
        }

        let mut resolved = ResolvedIntent {
            result,
            parameters,
            execution: None,
            execution_error: None,
            tool_plan: None,
            tool_outcomes: Vec::new(),
        };
        if definition.executor_bound {
            if self.config.behavior.auto_execute_queries {
                match self
                    .executor
                    .execute(&definition.intent_code, &resolved.parameters)
                    .await
                {
                    Ok(v) => resolved.execution = Some(v),
                    Err(e) => {
                        tracing::warn!(intent = %definition.intent_code, error = %e, "query execution failed");
                        resolved.execution_error = Some(e.to_string());
                    }
                }
            }
        } else if let Some(router) = &self.tools {
            self.route_tools(router, ctx, &normalized.text, &mut resolved).await?;
        }
        Ok(Resolution::Resolved(resolved))
    }

    async fn route_tools(
        &self,
        router: &ToolRouter,
        ctx: &RequestContext,
        text: &str,
        resolved: &mut ResolvedIntent,
    ) -> PipelineResult<()> {
        let candidates = match router
            .retrieve_candidate_tools(text, self.config.tool_router.top_k)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "tool retrieval failed");
                resolved.execution_error = Some(e.to_string());
                return Ok(());
            }
        };
        let plan = router.select_tools(text, &resolved.result, candidates).await;
        if plan.is_empty() {
            return Ok(());
        }
        // Permission denials surface to the caller.
        resolved.tool_outcomes = router.execute_tool_chain(ctx, &plan).await?;
        resolved.tool_plan = Some(plan);
        Ok(())
    }

    async fn normalize(&self, text: &str, context: Option<&ConversationContext>) -> NormalizedQuery {
        match (&self.llm, self.config.behavior.llm_rewrite) {
            (Some(llm), true) => {
                self.normalizer
                    .normalize_with_llm(text, context, llm.as_ref())
                    .await
            }
            _ => self.normalizer.normalize(text, context),
        }
    }

    /// Rules plus ladder. The request cache lives exactly as long as this call.
    async fn score(
        &self,
        factory: &str,
        normalized: &NormalizedQuery,
        slots: &ExtractedSlots,
    ) -> (IntentMatchResult, bool) {
        let rule = self.classifier.classify(
            self.catalog.as_ref(),
            factory,
            &normalized.text,
            slots,
            normalized.flags(),
        );
        let intents = self.catalog.intents(factory);
        let cache = RequestCache::new();
        let input = LadderInput {
            factory_id: factory,
            text: &normalized.text,
            slots,
            rule: &rule,
            intents: &intents,
            cache: &cache,
        };
        let outcome = self.ladder.resolve(&input).await;
        tracing::debug!(
            invoked = ?outcome.invoked,
            accepted_by = ?outcome.accepted_by,
            confidence = outcome.confidence(),
            cached_embeddings = cache.len(),
            "ladder finished"
        );
        (outcome.result, outcome.all_unavailable)
    }

    /// Ladder candidates, topped up with likely successors of the user's
    /// previous intent.
    async fn conversation_options(
        &self,
        factory: &str,
        memory: &ConversationContext,
        result: &IntentMatchResult,
    ) -> Vec<IntentCandidate> {
        let mut options: Vec<IntentCandidate> = result
            .candidates
            .iter()
            .filter(|c| self.catalog.get(factory, &c.intent_code).is_some())
            .cloned()
            .collect();
        if options.len() < self.config.conversation.top_k
            && let Some(prev) = memory.last_intent.as_deref()
        {
            for next in self
                .calibrator
                .top_next(factory, prev, self.config.conversation.top_k)
                .await
            {
                if !options.iter().any(|o| o.intent_code == next.intent_code) {
                    // Successor probability stands in for a score.
                    options.push(IntentCandidate::new(next.intent_code, next.confidence * 0.5));
                }
            }
        }
        options
    }

    fn collect_sample(
        &self,
        ctx: &RequestContext,
        normalized: &NormalizedQuery,
        result: &IntentMatchResult,
        now: DateTime<Utc>,
    ) {
        if !self.collector.should_collect(result.confidence) {
            return;
        }
        self.collector.collect(ActiveLearningSample {
            id: Uuid::now_v7(),
            factory_id: ctx.factory_id.clone(),
            user_id: ctx.user_id.clone(),
            user_input: normalized.original.clone(),
            normalized_input: normalized.text.clone(),
            matched_intent_code: result.best_match_intent_code.clone(),
            confidence_score: result.confidence,
            match_method: result.source,
            cluster_id: None,
            created_at: now,
        });
    }

    // ── Conversations ─────────────────────────────────────────

    pub async fn continue_conversation(
        &self,
        session_id: Uuid,
        reply: &str,
    ) -> PipelineResult<ConversationResponse> {
        self.continue_conversation_at(session_id, reply, Utc::now()).await
    }

    pub async fn continue_conversation_at(
        &self,
        session_id: Uuid,
        reply: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<ConversationResponse> {
        let session = self.conversations.session(session_id).await?;
        let factory = session.factory_id.clone();
        let ctx = RequestContext::new(&session.factory_id, &session.user_id, "");
        // Replies like "那批呢" lean on the same memory as a fresh query.
        let memory = self.context.get(&ctx).await;
        let context = (!memory.is_empty()).then_some(&memory);
        let scorer = |text: String| {
            let factory = factory.as_str();
            async move {
                let normalized = self.normalize(&text, context).await;
                let slots = self.extractor.extract_at(&normalized.text, now.date_naive());
                let (result, _) = self.score(factory, &normalized, &slots).await;
                Ok(result)
            }
        };
        let response = self
            .conversations
            .continue_at(session_id, reply, scorer, now)
            .await?;

        if response.status == SessionStatus::Completed
            && let Some(code) = response.intent_code.as_deref()
        {
            if let Some(prev) = memory.last_intent.as_deref() {
                self.calibrator.observe(&factory, prev, code, now).await?;
            }
            self.context
                .record(&ctx, &ExtractedSlots::empty(reply), Some(code), now)
                .await;
        }
        Ok(response)
    }

    pub async fn cancel_conversation(&self, session_id: Uuid) -> PipelineResult<ConversationResponse> {
        self.conversations.cancel_at(session_id, Utc::now()).await
    }

    // ── Preview ───────────────────────────────────────────────

    pub async fn confirm_preview(&self, token: &str, user_id: &str) -> PipelineResult<ConfirmResult> {
        self.preview.confirm(token, user_id).await
    }

    pub async fn confirm_preview_at(
        &self,
        token: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> PipelineResult<ConfirmResult> {
        self.preview.confirm_at(token, user_id, now).await
    }

    pub async fn cancel_preview(
        &self,
        token: &str,
        user_id: &str,
        reason: Option<String>,
    ) -> PipelineResult<ConfirmResult> {
        self.preview.cancel(token, user_id, reason).await
    }

    // ── Maintenance ───────────────────────────────────────────

    pub async fn recompute_transitions(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        self.calibrator.recompute(now).await
    }

    pub async fn sweep_sessions(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        self.conversations.sweep_expired_at(now).await
    }

    pub async fn sweep_tokens(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        self.preview.sweep_at(now).await
    }

    pub async fn run_learning(&self, now: DateTime<Utc>) -> PipelineResult<LearningReport> {
        let report = self.analyzer.run(now).await?;
        // Expressions confirmed since the last run join the embedding index.
        self.intent_index.clear().await;
        Ok(report)
    }

    pub async fn suggestions(&self, factory_id: &str) -> PipelineResult<Vec<OptimizationSuggestion>> {
        self.samples.suggestions(factory_id).await
    }

    pub async fn top_next_intents(
        &self,
        factory_id: &str,
        current_intent: &str,
        k: usize,
    ) -> Vec<IntentCandidate> {
        self.calibrator.top_next(factory_id, current_intent, k).await
    }
}

/// Slot values keyed by lower-case slot name, then inferred values, then
/// LLM-extracted parameters; earlier sources win.
fn build_parameters(
    slots: &ExtractedSlots,
    inferred: &std::collections::BTreeMap<SlotType, String>,
    extracted: Option<&Value>,
) -> Value {
    let mut params = Map::new();
    for (t, v) in &slots.values {
        params.insert(t.as_str().to_ascii_lowercase(), json!(v));
    }
    if let Some(tr) = &slots.time_range {
        params.insert("start_date".into(), json!(tr.start_date.to_string()));
        params.insert("end_date".into(), json!(tr.end_date.to_string()));
    }
    for (t, v) in inferred {
        params
            .entry(t.as_str().to_ascii_lowercase())
            .or_insert_with(|| json!(v));
        if *t == SlotType::TimeRange
            && let Some((start, end)) = v.split_once('~')
        {
            params.entry("start_date").or_insert_with(|| json!(start));
            params.entry("end_date").or_insert_with(|| json!(end));
        }
    }
    if let Some(Value::Object(extra)) = extracted {
        for (k, v) in extra {
            params.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Value::Object(params)
}

fn preview_request(
    definition: &IntentDefinition,
    slots: &ExtractedSlots,
    parameters: Value,
) -> PreviewRequest {
    let entity_id = slots.entity_matches().next().map(|m| m.value.clone());
    let high_risk = definition.is_high_risk();
    PreviewRequest {
        intent_code: definition.intent_code.clone(),
        entity_type: definition
            .entity_type
            .clone()
            .unwrap_or_else(|| definition.domain.as_str().to_ascii_lowercase()),
        entity_id,
        operation: definition.action.as_str().to_string(),
        // Current business state is owned by the executor side.
        current_values: json!({}),
        new_values: parameters,
        requires_confirmation: high_risk,
        confirmation_question: high_risk
            .then(|| format!("确认执行「{}」吗？该操作不可撤销。", definition.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::mock::{MockClassifier, MockEmbeddingService, MockLlm, RecordingExecutor};
    use intent_protocol::{MatchSource, PreviewStatus};

    fn ctx() -> RequestContext {
        RequestContext::new("f1", "u1", "factory_admin")
    }

    fn pipeline_with(services: Services) -> IntentPipeline {
        IntentPipeline::new(
            PipelineConfig::default(),
            Arc::new(InMemoryCatalog::factory_defaults()),
            services,
            Stores::in_memory(),
        )
    }

    #[tokio::test]
    async fn rule_match_executes_query() {
        let exec = Arc::new(RecordingExecutor::with_result(json!({"total_kg": 320})));
        let p = pipeline_with(Services::new(exec.clone()));
        match p.resolve_intent(&ctx(), "最近7天带鱼入库多少").await.unwrap() {
            Resolution::Resolved(r) => {
                assert_eq!(r.result.best_match_intent_code.as_deref(), Some("MATERIAL_BATCH_QUERY"));
                assert_eq!(r.result.source, MatchSource::Rule);
                assert_eq!(r.execution, Some(json!({"total_kg": 320})));
                assert!(r.parameters.get("start_date").is_some());
            }
            other => panic!("expected resolved, got {other:?}"),
        }
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn mutating_intent_goes_through_preview() {
        let exec = Arc::new(RecordingExecutor::new());
        let p = pipeline_with(Services::new(exec.clone()));
        let token = match p.resolve_intent(&ctx(), "报废批次MB-20240301").await.unwrap() {
            Resolution::Preview(t) => t,
            other => panic!("expected preview, got {other:?}"),
        };
        assert_eq!(token.status, PreviewStatus::Pending);
        assert!(token.requires_confirmation);
        assert_eq!(exec.calls(), 0);

        assert!(p.confirm_preview(&token.token, "u1").await.unwrap().success);
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn high_risk_without_target_requires_clarification() {
        let p = pipeline_with(Services::new(Arc::new(RecordingExecutor::new())));
        match p.resolve_intent(&ctx(), "把那批原料报废").await.unwrap() {
            Resolution::Clarification(c) => {
                assert!(c.mandatory);
                assert_eq!(c.missing, vec![SlotType::BatchId]);
            }
            other => panic!("expected clarification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unrecognised_query_opens_conversation() {
        let llm = Arc::new(MockLlm::new(vec![
            r#"{"intent_code": "ALERT_QUERY", "confidence": 0.2}"#.into(),
        ]));
        let mut services = Services::new(Arc::new(RecordingExecutor::new()));
        services.llm = Some(llm);
        let p = pipeline_with(services);
        match p.resolve_intent(&ctx(), "那个东西怎么弄").await.unwrap() {
            Resolution::Conversation(prompt) => {
                assert_eq!(prompt.round, 1);
                assert_eq!(prompt.max_rounds, 5);
                assert_eq!(prompt.options[0].intent_code, "ALERT_QUERY");
            }
            other => panic!("expected conversation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_services_down_asks_to_rephrase() {
        let mut services = Services::new(Arc::new(RecordingExecutor::new()));
        services.embedding = Some(Arc::new(MockEmbeddingService::unavailable()));
        services.classifier = Some(Arc::new(MockClassifier::unhealthy()));
        services.llm = Some(Arc::new(MockLlm::unavailable()));
        let p = pipeline_with(services);
        assert!(matches!(
            p.resolve_intent(&ctx(), "那个东西怎么弄").await.unwrap(),
            Resolution::Rephrase { .. }
        ));
    }

    #[tokio::test]
    async fn conversation_completion_feeds_calibration() {
        let llm = Arc::new(MockLlm::new(vec![
            r#"{"intent_code": "ALERT_QUERY", "confidence": 0.2}"#.into(),
        ]));
        let mut services = Services::new(Arc::new(RecordingExecutor::new()));
        services.llm = Some(llm);
        let p = pipeline_with(services);
        let now = Utc::now();

        p.resolve_intent_at(&ctx(), "今天的发货情况", now).await.unwrap();
        let prompt = match p.resolve_intent_at(&ctx(), "那个东西怎么弄", now).await.unwrap() {
            Resolution::Conversation(prompt) => prompt,
            other => panic!("expected conversation, got {other:?}"),
        };
        let resp = p
            .continue_conversation_at(prompt.session_id, "1", now)
            .await
            .unwrap();
        assert_eq!(resp.status, SessionStatus::Completed);

        assert_eq!(p.recompute_transitions(now).await.unwrap(), 1);
        let next = p.top_next_intents("f1", "SHIPMENT_QUERY", 3).await;
        assert_eq!(next[0].intent_code, resp.intent_code.unwrap());
    }

    /// Records every text it encodes. Query texts are orthogonal to the
    /// catalog so nothing clears the embedding threshold.
    #[derive(Default)]
    struct RecordingEmbedding {
        texts: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl EmbeddingService for RecordingEmbedding {
        async fn encode(&self, text: &str) -> crate::services::ServiceResult<Vec<f32>> {
            self.texts.lock().unwrap().push(text.to_string());
            if text.contains("东西") || text.contains("20240777") || text.contains("那批") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
    }

    #[tokio::test]
    async fn conversation_reply_resolves_references_from_memory() {
        let embedding = Arc::new(RecordingEmbedding::default());
        let mut services = Services::new(Arc::new(RecordingExecutor::new()));
        services.embedding = Some(embedding.clone());
        let p = pipeline_with(services);
        let now = Utc::now();

        // Puts MB-20240777 into the user's memory.
        p.resolve_intent_at(&ctx(), "报废批次MB-20240777", now).await.unwrap();
        let prompt = match p.resolve_intent_at(&ctx(), "东西怎么弄", now).await.unwrap() {
            Resolution::Conversation(prompt) => prompt,
            other => panic!("expected conversation, got {other:?}"),
        };
        let seen = embedding.texts.lock().unwrap().len();

        let resp = p
            .continue_conversation_at(prompt.session_id, "那批呢", now)
            .await
            .unwrap();
        assert_eq!(resp.status, SessionStatus::Active);

        let texts = embedding.texts.lock().unwrap();
        let reply_texts = &texts[seen..];
        assert!(reply_texts.iter().any(|t| t.contains("MB-20240777")), "{reply_texts:?}");
        assert!(reply_texts.iter().all(|t| !t.contains("那批")), "{reply_texts:?}");
    }

    #[test]
    fn parameters_prefer_explicit_slots() {
        let mut slots = ExtractedSlots::empty("x");
        slots.values.insert(SlotType::BatchId, "MB-1".into());
        let mut inferred = std::collections::BTreeMap::new();
        inferred.insert(SlotType::TimeRange, "2024-03-15~2024-03-15".to_string());
        let extra = json!({"batch_id": "MB-2", "reason": "过期"});
        let p = build_parameters(&slots, &inferred, Some(&extra));
        assert_eq!(p["batch_id"], "MB-1");
        assert_eq!(p["start_date"], "2024-03-15");
        assert_eq!(p["reason"], "过期");
    }
}
