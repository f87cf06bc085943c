//! Pipeline configuration, loadable from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub tool_router: ToolRouterConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

impl PipelineConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> PipelineResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{path}: {e}")))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> PipelineResult<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject threshold combinations the ladder cannot work with.
    pub fn validate(&self) -> PipelineResult<()> {
        let t = &self.thresholds;
        let unit = [
            ("rule_accept", t.rule_accept),
            ("embedding_candidate", t.embedding_candidate),
            ("embedding_accept", t.embedding_accept),
            ("classifier_accept", t.classifier_accept),
            ("rerank_low", t.rerank_low),
            ("rerank_high", t.rerank_high),
            ("fallback", t.fallback),
            ("resolution", t.resolution),
            ("collection", t.collection),
        ];
        for (name, v) in unit {
            if !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::Config(format!(
                    "thresholds.{name} must be within [0, 1], got {v}"
                )));
            }
        }
        if t.rerank_low >= t.rerank_high {
            return Err(PipelineError::Config(
                "thresholds.rerank_low must be below rerank_high".into(),
            ));
        }
        if self.conversation.max_rounds == 0 {
            return Err(PipelineError::Config(
                "conversation.max_rounds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Thresholds ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    /// Rule layer accepts at or above this (and only for a single matched domain).
    #[serde(default = "default_rule_accept")]
    pub rule_accept: f64,
    /// Embedding layer keeps every intent scoring at or above this.
    #[serde(default = "default_embedding_candidate")]
    pub embedding_candidate: f64,
    /// Embedding layer accepts outright at or above this.
    #[serde(default = "default_embedding_accept")]
    pub embedding_accept: f64,
    #[serde(default = "default_classifier_accept")]
    pub classifier_accept: f64,
    /// LLM rerank runs when the best score lies in `[rerank_low, rerank_high)`.
    #[serde(default = "default_rerank_low")]
    pub rerank_low: f64,
    #[serde(default = "default_rerank_high")]
    pub rerank_high: f64,
    /// Below this the LLM fallback runs; below it afterwards a conversation starts.
    #[serde(default = "default_fallback")]
    pub fallback: f64,
    /// A conversation reply resolves the session at or above this.
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Samples below this confidence go to the active-learning collector.
    #[serde(default = "default_collection")]
    pub collection: f64,
    /// Cosine → confidence sigmoid centre.
    #[serde(default = "default_sigmoid_center")]
    pub sigmoid_center: f64,
    #[serde(default = "default_sigmoid_steepness")]
    pub sigmoid_steepness: f64,
}

fn default_rule_accept() -> f64 {
    0.85
}
fn default_embedding_candidate() -> f64 {
    0.6
}
fn default_embedding_accept() -> f64 {
    0.85
}
fn default_classifier_accept() -> f64 {
    0.85
}
fn default_rerank_low() -> f64 {
    0.58
}
fn default_rerank_high() -> f64 {
    0.85
}
fn default_fallback() -> f64 {
    0.3
}
fn default_resolution() -> f64 {
    0.6
}
fn default_collection() -> f64 {
    0.7
}
fn default_sigmoid_center() -> f64 {
    0.55
}
fn default_sigmoid_steepness() -> f64 {
    12.0
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            rule_accept: default_rule_accept(),
            embedding_candidate: default_embedding_candidate(),
            embedding_accept: default_embedding_accept(),
            classifier_accept: default_classifier_accept(),
            rerank_low: default_rerank_low(),
            rerank_high: default_rerank_high(),
            fallback: default_fallback(),
            resolution: default_resolution(),
            collection: default_collection(),
            sigmoid_center: default_sigmoid_center(),
            sigmoid_steepness: default_sigmoid_steepness(),
        }
    }
}

// ── Conversation / Preview ────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Options offered per clarification question.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Boost for a reply candidate already present in the session.
    #[serde(default = "default_history_boost")]
    pub history_boost: f64,
}

fn default_max_rounds() -> u32 {
    5
}
fn default_session_ttl_secs() -> u64 {
    600
}
fn default_top_k() -> usize {
    3
}
fn default_history_boost() -> f64 {
    0.1
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            ttl_secs: default_session_ttl_secs(),
            top_k: default_top_k(),
            history_boost: default_history_boost(),
        }
    }
}

impl ConversationConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_token_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    300
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl PreviewConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

// ── Learning / Calibration ────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LearningConfig {
    /// Bounded channel between the hot path and the sample writer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Character-bigram Jaccard similarity for joining a cluster.
    #[serde(default = "default_cluster_similarity")]
    pub cluster_similarity: f64,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
}

fn default_channel_capacity() -> usize {
    1024
}
fn default_cluster_similarity() -> f64 {
    0.5
}
fn default_min_cluster_size() -> usize {
    3
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            cluster_similarity: default_cluster_similarity(),
            min_cluster_size: default_min_cluster_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    /// Weight of the transition probability in the geometric blend.
    #[serde(default = "default_calibration_weight")]
    pub weight: f64,
    #[serde(default = "default_window_days")]
    pub window_days: i64,
}

fn default_calibration_weight() -> f64 {
    0.2
}
fn default_window_days() -> i64 {
    30
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            weight: default_calibration_weight(),
            window_days: default_window_days(),
        }
    }
}

// ── Tool Router ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRouterConfig {
    #[serde(default = "default_tool_top_k")]
    pub top_k: usize,
    /// Top-two similarity gap under which the tournament runs.
    #[serde(default = "default_tournament_gap")]
    pub tournament_gap: f64,
    #[serde(default = "default_true")]
    pub tournament_enabled: bool,
}

fn default_tool_top_k() -> usize {
    5
}
fn default_tournament_gap() -> f64 {
    0.10
}
fn default_true() -> bool {
    true
}

impl Default for ToolRouterConfig {
    fn default() -> Self {
        Self {
            top_k: default_tool_top_k(),
            tournament_gap: default_tournament_gap(),
            tournament_enabled: true,
        }
    }
}

// ── Timeouts / Services ───────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Per-layer budget for every network ladder layer.
    #[serde(default = "default_layer_timeout_ms")]
    pub layer_ms: u64,
    /// How long a classifier health-check result stays valid.
    #[serde(default = "default_health_recheck_secs")]
    pub health_recheck_secs: u64,
}

fn default_layer_timeout_ms() -> u64 {
    3000
}
fn default_health_recheck_secs() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            layer_ms: default_layer_timeout_ms(),
            health_recheck_secs: default_health_recheck_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn layer(&self) -> Duration {
        Duration::from_millis(self.layer_ms)
    }

    pub fn health_recheck(&self) -> Duration {
        Duration::from_secs(self.health_recheck_secs)
    }
}

/// One HTTP collaborator endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default = "default_endpoint_timeout_secs")]
    pub timeout_secs: u64,
    /// Model name, for endpoints that take one.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_endpoint_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub embedding: Option<EndpointConfig>,
    #[serde(default)]
    pub classifier: Option<EndpointConfig>,
    #[serde(default)]
    pub llm: Option<EndpointConfig>,
    /// Business executor for resolved intents and confirmed previews.
    #[serde(default)]
    pub executor: Option<EndpointConfig>,
}

// ── Maintenance / Behavior ────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_session_sweep_secs")]
    pub session_sweep_secs: u64,
    #[serde(default = "default_token_sweep_secs")]
    pub token_sweep_secs: u64,
    #[serde(default = "default_transition_recompute_secs")]
    pub transition_recompute_secs: u64,
    #[serde(default = "default_learning_secs")]
    pub learning_secs: u64,
}

fn default_session_sweep_secs() -> u64 {
    60
}
fn default_token_sweep_secs() -> u64 {
    60
}
fn default_transition_recompute_secs() -> u64 {
    3600
}
fn default_learning_secs() -> u64 {
    86_400
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            session_sweep_secs: default_session_sweep_secs(),
            token_sweep_secs: default_token_sweep_secs(),
            transition_recompute_secs: default_transition_recompute_secs(),
            learning_secs: default_learning_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorConfig {
    /// Run QUERY intents with a bound executor straight away.
    #[serde(default = "default_true")]
    pub auto_execute_queries: bool,
    /// Let the normalizer ask the LLM to rewrite elliptical queries.
    #[serde(default)]
    pub llm_rewrite: bool,
    /// Let the clarification decider phrase questions with the LLM.
    #[serde(default)]
    pub llm_questions: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            auto_execute_queries: true,
            llm_rewrite: false,
            llm_questions: false,
        }
    }
}
