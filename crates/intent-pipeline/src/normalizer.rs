//! Dialect and query-quality preprocessing.
//!
//! Rewrites colloquial input into canonical vocabulary, lifts negation and
//! rhetorical markers into flags, resolves references against the user's
//! recent context and decides whether an LLM rewrite is warranted.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;

use crate::classifier::{DomainKeywords, PhrasingFlags};
use crate::coreference::{self, ConversationContext, CoreferenceResolver, CoreferenceResult};
use crate::services::{ChatOptions, LlmService, extract_json};

/// Queries longer than this with no domain keyword are worth an LLM rewrite.
const LONG_QUERY_CHARS: usize = 12;

static RE_NEGATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"千万别|不要|不需要|不用|不必|^别").unwrap());
static RE_RHETORICAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"难道|岂不是|何必").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct QueryQuality {
    pub char_len: usize,
    pub has_domain_keyword: bool,
    pub elliptical: bool,
    pub pronoun_heavy: bool,
    pub needs_llm_rewrite: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuery {
    pub original: String,
    /// Canonical text handed to slot extraction and classification.
    pub text: String,
    pub is_negated: bool,
    pub is_rhetorical: bool,
    pub quality: QueryQuality,
    pub coreference: Option<CoreferenceResult>,
    pub rewritten_by_llm: bool,
}

impl NormalizedQuery {
    pub fn flags(&self) -> PhrasingFlags {
        PhrasingFlags {
            negated: self.is_negated,
            rhetorical: self.is_rhetorical,
        }
    }
}

pub struct Normalizer {
    /// Longest colloquial form first.
    dialect: Vec<(String, String)>,
    domains: Arc<DomainKeywords>,
    coreference: CoreferenceResolver,
}

impl Normalizer {
    pub fn new(domains: Arc<DomainKeywords>) -> Self {
        Self::with_dialect(domains, default_dialect())
    }

    pub fn with_dialect(domains: Arc<DomainKeywords>, mut dialect: Vec<(String, String)>) -> Self {
        dialect.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        Self {
            dialect,
            domains,
            coreference: CoreferenceResolver::new(),
        }
    }

    /// Single left-to-right pass; at each position the longest colloquial
    /// form wins and replaced text is never rescanned.
    pub fn apply_dialect(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        'scan: while !rest.is_empty() {
            for (from, to) in &self.dialect {
                if rest.starts_with(from.as_str()) {
                    out.push_str(to);
                    rest = &rest[from.len()..];
                    continue 'scan;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
        out
    }

    /// Rule-only normalization.
    pub fn normalize(&self, text: &str, context: Option<&ConversationContext>) -> NormalizedQuery {
        let canonical = self.apply_dialect(text.trim());

        let is_negated = RE_NEGATION.is_match(&canonical);
        let is_rhetorical = RE_RHETORICAL.is_match(&canonical);
        let stripped = RE_RHETORICAL.replace_all(&canonical, "");
        let stripped = RE_NEGATION.replace_all(&stripped, "").trim().to_string();

        let coreference = context
            .filter(|c| !c.is_empty())
            .map(|c| self.coreference.resolve(&stripped, c));
        let resolved = coreference
            .as_ref()
            .map(|c| c.resolved_text.clone())
            .unwrap_or_else(|| stripped.clone());

        let quality = self.quality(&stripped, coreference.as_ref());

        NormalizedQuery {
            original: text.to_string(),
            text: resolved,
            is_negated,
            is_rhetorical,
            quality,
            coreference,
            rewritten_by_llm: false,
        }
    }

    /// Rule normalization, then (when warranted) LLM-assisted coreference and
    /// rewrite. Any LLM failure falls back to the rule output.
    pub async fn normalize_with_llm(
        &self,
        text: &str,
        context: Option<&ConversationContext>,
        llm: &dyn LlmService,
    ) -> NormalizedQuery {
        let mut q = self.normalize(text, context);
        if !q.quality.needs_llm_rewrite {
            return q;
        }

        if let Some(ctx) = context
            && q.coreference.as_ref().is_some_and(|c| !c.unresolved.is_empty())
        {
            let pre_coref = self.coreference_input(&q);
            let c = self.coreference.resolve_with_llm(&pre_coref, ctx, llm).await;
            q.text = c.resolved_text.clone();
            q.coreference = Some(c);
            if !q.coreference.as_ref().is_some_and(|c| !c.unresolved.is_empty()) {
                q.rewritten_by_llm = true;
                return q;
            }
        }

        let prompt = format!("原始问题: {}\n规则处理结果: {}", q.original, q.text);
        match llm.chat(REWRITE_PROMPT, &prompt, ChatOptions::json()).await {
            Ok(raw) => match serde_json::from_str::<Rewrite>(extract_json(&raw)) {
                Ok(rw) if !rw.rewritten.trim().is_empty() => {
                    tracing::debug!(original = %q.original, rewritten = %rw.rewritten, "llm rewrite");
                    q.text = rw.rewritten.trim().to_string();
                    q.rewritten_by_llm = true;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "llm rewrite returned invalid JSON"),
            },
            Err(e) => tracing::warn!(error = %e, "llm rewrite unavailable, keeping rule output"),
        }
        q
    }

    fn coreference_input(&self, q: &NormalizedQuery) -> String {
        let canonical = self.apply_dialect(q.original.trim());
        let stripped = RE_RHETORICAL.replace_all(&canonical, "");
        RE_NEGATION.replace_all(&stripped, "").trim().to_string()
    }

    fn quality(&self, text: &str, coref: Option<&CoreferenceResult>) -> QueryQuality {
        let char_len = text.chars().count();
        let has_domain_keyword = self.domains.any_match(text);
        let elliptical = coreference::is_elliptical(text);
        let references = coreference::detect(text);
        let pronoun_heavy = references.len() >= 2;

        let unresolved = match coref {
            Some(c) => !c.unresolved.is_empty(),
            None => !references.is_empty(),
        };
        let needs_llm_rewrite = ((elliptical || pronoun_heavy) && unresolved)
            || (!has_domain_keyword && char_len > LONG_QUERY_CHARS);

        QueryQuality {
            char_len,
            has_domain_keyword,
            elliptical,
            pronoun_heavy,
            needs_llm_rewrite,
        }
    }
}

const REWRITE_PROMPT: &str = r#"你负责把工厂管理系统用户的口语化、省略或指代不清的问题改写成一句完整、规范的查询或操作指令。保留所有实体编号、时间和数量，不要添加用户没有说的内容。
只输出JSON: {"rewritten": "<改写后的句子>"}"#;

#[derive(Deserialize)]
struct Rewrite {
    rewritten: String,
}

fn default_dialect() -> Vec<(String, String)> {
    [
        ("瞅瞅", "查看"),
        ("瞅一下", "查看"),
        ("瞧瞧", "查看"),
        ("给我看看", "查看"),
        ("啥时候", "什么时候"),
        ("多会儿", "什么时候"),
        ("啥", "什么"),
        ("咋样", "怎么样"),
        ("咋", "怎么"),
        ("整个", "创建"),
        ("弄个", "创建"),
        ("搞个", "创建"),
        ("木有", "没有"),
        ("俺", "我"),
    ]
    .into_iter()
    .map(|(a, b)| (a.to_string(), b.to_string()))
    .collect()
}
