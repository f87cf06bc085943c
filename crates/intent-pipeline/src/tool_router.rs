//! Tool routing for intents without a statically bound executor.
//!
//! Tools are ranked by embedding similarity to the query. When the top two
//! are too close to call, a single-elimination tournament of pairwise LLM
//! judgements picks the leader. The LLM then plans which tools to run and in
//! what order; without a usable plan the leader runs alone.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::task::JoinSet;

use intent_protocol::{IntentMatchResult, RequestContext};

use crate::config::ToolRouterConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::services::{
    BusinessExecutor, ChatOptions, EmbeddingService, LlmService, cosine, extract_json,
};

const PLAN_SYSTEM_PROMPT: &str = r#"你是工厂管理系统的工具编排器。根据用户问题，从候选工具中选择需要调用的工具，并决定执行方式。
互不依赖的工具用 PARALLEL；后一个工具需要前一个结果时用 SEQUENTIAL，并给出 order(从1开始)。
只输出JSON: {"mode": "PARALLEL|SEQUENTIAL", "tools": [{"name": "<工具名>", "order": 1, "parameters": {}}]}"#;

const JUDGE_SYSTEM_PROMPT: &str =
    "你是工具评审。比较两个工具哪个更适合回答用户问题。只回答一个字母: A 或 B。";

// ── Registry ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    /// Writes business state; never executed by the router.
    #[serde(default)]
    pub mutating: bool,
    /// Roles allowed to run the tool. Empty allows everyone.
    #[serde(default)]
    pub allowed_roles: Vec<String>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: json!({"type": "object", "properties": {}}),
            mutating: false,
            allowed_roles: Vec::new(),
        }
    }

    pub fn permits(&self, role: &str) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.iter().any(|r| r == role)
    }

    fn embedding_text(&self) -> String {
        format!("{} {}", self.name, self.description)
    }
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    executor: Arc<dyn BusinessExecutor>,
}

/// Tools indexed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a later registration under the same name replaces it.
    pub fn register(&mut self, descriptor: ToolDescriptor, executor: Arc<dyn BusinessExecutor>) {
        let entry = RegisteredTool {
            descriptor,
            executor,
        };
        match self.index.get(&entry.descriptor.name) {
            Some(&i) => self.tools[i] = entry,
            None => {
                self.index
                    .insert(entry.descriptor.name.clone(), self.tools.len());
                self.tools.push(entry);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i].descriptor)
    }

    fn executor(&self, name: &str) -> Option<Arc<dyn BusinessExecutor>> {
        self.index.get(name).map(|&i| self.tools[i].executor.clone())
    }

    pub fn list(&self) -> Vec<&ToolDescriptor> {
        self.tools.iter().map(|t| &t.descriptor).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── Plans ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCandidate {
    pub name: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    /// 1-based position for SEQUENTIAL plans.
    pub order: u32,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPlan {
    pub mode: ExecutionMode,
    pub calls: Vec<ToolCall>,
}

impl ToolPlan {
    pub fn single(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            calls: vec![ToolCall {
                name: name.into(),
                order: 1,
                parameters,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    fn success(tool_name: &str, output: Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: true,
            output: Some(output),
            error: None,
        }
    }

    fn failure(tool_name: &str, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    mode: ExecutionMode,
    tools: Vec<RawCall>,
}

#[derive(Deserialize)]
struct RawCall {
    name: String,
    #[serde(default)]
    order: Option<u32>,
    #[serde(default)]
    parameters: Option<Value>,
}

// ── Router ────────────────────────────────────────────────────

pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    embeddings: Arc<dyn EmbeddingService>,
    llm: Option<Arc<dyn LlmService>>,
    config: ToolRouterConfig,
    tool_vectors: RwLock<HashMap<String, Arc<Vec<f32>>>>,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        embeddings: Arc<dyn EmbeddingService>,
        llm: Option<Arc<dyn LlmService>>,
        config: ToolRouterConfig,
    ) -> Self {
        Self {
            registry,
            embeddings,
            llm,
            config,
            tool_vectors: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    async fn tool_vector(&self, tool: &ToolDescriptor) -> PipelineResult<Arc<Vec<f32>>> {
        if let Some(v) = self.tool_vectors.read().await.get(&tool.name) {
            return Ok(v.clone());
        }
        let v = Arc::new(self.embeddings.encode(&tool.embedding_text()).await?);
        self.tool_vectors
            .write()
            .await
            .insert(tool.name.clone(), v.clone());
        Ok(v)
    }

    /// Registered tools ranked by cosine similarity to the query.
    pub async fn retrieve_candidate_tools(
        &self,
        query: &str,
        top_k: usize,
    ) -> PipelineResult<Vec<ToolCandidate>> {
        if self.registry.is_empty() {
            return Ok(Vec::new());
        }
        let q = self.embeddings.encode(query).await?;
        let mut ranked = Vec::with_capacity(self.registry.len());
        for tool in self.registry.list() {
            let v = self.tool_vector(tool).await?;
            ranked.push(ToolCandidate {
                name: tool.name.clone(),
                similarity: cosine(&q, &v),
            });
        }
        ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        ranked.truncate(top_k);
        Ok(ranked)
    }

    /// Choose tools and an execution order for the query.
    pub async fn select_tools(
        &self,
        query: &str,
        intent: &IntentMatchResult,
        mut candidates: Vec<ToolCandidate>,
    ) -> ToolPlan {
        if candidates.is_empty() {
            return ToolPlan::default();
        }
        if let Some(winner) = self.tournament(query, &candidates).await
            && let Some(pos) = candidates.iter().position(|c| c.name == winner)
        {
            let leader = candidates.remove(pos);
            candidates.insert(0, leader);
        }

        let default_params = intent.parameters.clone().unwrap_or_else(|| json!({}));
        match self.plan_with_llm(query, &candidates, &default_params).await {
            Some(plan) => plan,
            None => ToolPlan::single(candidates[0].name.clone(), default_params),
        }
    }

    async fn plan_with_llm(
        &self,
        query: &str,
        candidates: &[ToolCandidate],
        default_params: &Value,
    ) -> Option<ToolPlan> {
        let llm = self.llm.as_ref()?;
        let mut lines = vec![format!("用户问题: {query}"), "候选工具:".to_string()];
        for c in candidates {
            if let Some(t) = self.registry.get(&c.name) {
                lines.push(format!("- {}: {} 参数: {}", t.name, t.description, t.parameters_schema));
            }
        }

        let raw = match llm
            .chat(PLAN_SYSTEM_PROMPT, &lines.join("\n"), ChatOptions::json())
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "tool planning unavailable, using top candidate");
                return None;
            }
        };
        let parsed: RawPlan = match serde_json::from_str(extract_json(&raw)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, raw = %raw, "tool plan unparseable");
                return None;
            }
        };

        let mut calls: Vec<ToolCall> = Vec::new();
        for (i, c) in parsed.tools.into_iter().enumerate() {
            if !candidates.iter().any(|k| k.name == c.name) {
                tracing::warn!(tool = %c.name, "plan named a tool outside the candidates");
                return None;
            }
            if calls.iter().any(|k| k.name == c.name) {
                continue;
            }
            let parameters = match c.parameters {
                Some(Value::Object(m)) if !m.is_empty() => Value::Object(m),
                _ => default_params.clone(),
            };
            calls.push(ToolCall {
                name: c.name,
                order: c.order.unwrap_or(i as u32 + 1),
                parameters,
            });
        }
        if calls.is_empty() {
            return None;
        }
        calls.sort_by_key(|c| c.order);
        tracing::debug!(mode = ?parsed.mode, tools = calls.len(), "tool plan selected");
        Some(ToolPlan {
            mode: parsed.mode,
            calls,
        })
    }

    /// Single-elimination over the candidates close to the leader. `None`
    /// when no tournament is warranted or any judgement fails.
    async fn tournament(&self, query: &str, candidates: &[ToolCandidate]) -> Option<String> {
        if !self.config.tournament_enabled || candidates.len() < 2 {
            return None;
        }
        let llm = self.llm.as_ref()?;
        let leader = candidates[0].similarity;
        if leader - candidates[1].similarity >= self.config.tournament_gap {
            return None;
        }

        let mut round: Vec<&ToolCandidate> = candidates
            .iter()
            .filter(|c| leader - c.similarity < self.config.tournament_gap)
            .collect();
        tracing::debug!(contenders = round.len(), "tool tournament started");
        while round.len() > 1 {
            let mut next = Vec::with_capacity(round.len().div_ceil(2));
            for pair in round.chunks(2) {
                match pair {
                    [a, b] => next.push(self.judge(llm.as_ref(), query, a, b).await?),
                    [bye] => next.push(*bye),
                    _ => {}
                }
            }
            round = next;
        }
        round.first().map(|c| c.name.clone())
    }

    async fn judge<'a>(
        &self,
        llm: &dyn LlmService,
        query: &str,
        a: &'a ToolCandidate,
        b: &'a ToolCandidate,
    ) -> Option<&'a ToolCandidate> {
        let describe = |c: &ToolCandidate| {
            self.registry
                .get(&c.name)
                .map(|t| format!("{}: {}", t.name, t.description))
                .unwrap_or_else(|| c.name.clone())
        };
        let prompt = format!("用户问题: {query}\nA. {}\nB. {}", describe(a), describe(b));
        let answer = match llm.chat(JUDGE_SYSTEM_PROMPT, &prompt, ChatOptions::text()).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "tool judgement unavailable, using top similarity");
                return None;
            }
        };
        match answer.trim().trim_matches(|c: char| !c.is_ascii_alphabetic()) {
            s if s.eq_ignore_ascii_case("a") => Some(a),
            s if s.eq_ignore_ascii_case("b") => Some(b),
            other => {
                tracing::warn!(answer = %other, "tool judgement not A or B");
                None
            }
        }
    }

    /// Run a plan. Permissions and mutability are checked for every call
    /// before anything runs. A failed SEQUENTIAL step stops the chain.
    pub async fn execute_tool_chain(
        &self,
        ctx: &RequestContext,
        plan: &ToolPlan,
    ) -> PipelineResult<Vec<ToolOutcome>> {
        for call in &plan.calls {
            let tool = self
                .registry
                .get(&call.name)
                .ok_or_else(|| PipelineError::UnknownTool(call.name.clone()))?;
            if !tool.permits(&ctx.user_role) {
                tracing::warn!(tool = %tool.name, role = %ctx.user_role, "tool denied for role");
                return Err(PipelineError::PermissionDenied {
                    tool: tool.name.clone(),
                    role: ctx.user_role.clone(),
                });
            }
            if tool.mutating {
                return Err(PipelineError::MutationRequiresPreview(tool.name.clone()));
            }
        }

        match plan.mode {
            ExecutionMode::Parallel => Ok(self.run_parallel(plan).await),
            ExecutionMode::Sequential => Ok(self.run_sequential(plan).await),
        }
    }

    async fn run_parallel(&self, plan: &ToolPlan) -> Vec<ToolOutcome> {
        let mut set = JoinSet::new();
        for (i, call) in plan.calls.iter().enumerate() {
            let Some(executor) = self.registry.executor(&call.name) else {
                continue;
            };
            let name = call.name.clone();
            let params = call.parameters.clone();
            set.spawn(async move {
                let outcome = match executor.execute(&name, &params).await {
                    Ok(v) => ToolOutcome::success(&name, v),
                    Err(e) => ToolOutcome::failure(&name, e.to_string()),
                };
                (i, outcome)
            });
        }

        let mut slots: Vec<Option<ToolOutcome>> = vec![None; plan.calls.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, outcome)) => slots[i] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "tool task panicked"),
            }
        }
        slots
            .into_iter()
            .zip(&plan.calls)
            .map(|(o, call)| o.unwrap_or_else(|| ToolOutcome::failure(&call.name, "tool task aborted")))
            .collect()
    }

    async fn run_sequential(&self, plan: &ToolPlan) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(plan.calls.len());
        let mut previous: Option<Value> = None;
        for call in &plan.calls {
            let Some(executor) = self.registry.executor(&call.name) else {
                continue;
            };
            let mut params = call.parameters.clone();
            if let Some(prev) = previous.take() {
                match params.as_object_mut() {
                    Some(m) => {
                        m.insert("previous_result".into(), prev);
                    }
                    None => params = json!({"previous_result": prev}),
                }
            }
            match executor.execute(&call.name, &params).await {
                Ok(v) => {
                    previous = Some(v.clone());
                    outcomes.push(ToolOutcome::success(&call.name, v));
                }
                Err(e) => {
                    tracing::warn!(tool = %call.name, error = %e, "tool chain stopped");
                    outcomes.push(ToolOutcome::failure(&call.name, e.to_string()));
                    break;
                }
            }
        }
        outcomes
    }
}
