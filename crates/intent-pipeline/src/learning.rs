//! Active learning: low-confidence sample collection, clustering and
//! optimization suggestions.
//!
//! Collection is fire-and-forget: the hot path does a non-blocking
//! `try_send` into a bounded channel and a background writer persists
//! samples. A full channel drops the sample with a warning.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use intent_protocol::{
    ActiveLearningSample, LearnedExpression, OptimizationSuggestion, SuggestionKind,
};

use crate::config::LearningConfig;
use crate::error::PipelineResult;

/// Suggestions carrying this cluster id come from confirmed dialogues, not
/// from sample clustering.
pub const NO_CLUSTER: u32 = 0;

const MAX_SUGGESTION_EXAMPLES: usize = 5;

// ── Stores ────────────────────────────────────────────────────

#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn insert(&self, sample: ActiveLearningSample) -> PipelineResult<()>;

    async fn samples(&self, factory_id: &str) -> PipelineResult<Vec<ActiveLearningSample>>;

    async fn factories(&self) -> PipelineResult<Vec<String>>;

    async fn assign_clusters(&self, assignments: &[(Uuid, u32)]) -> PipelineResult<()>;

    /// Replace a factory's suggestions.
    async fn save_suggestions(
        &self,
        factory_id: &str,
        suggestions: Vec<OptimizationSuggestion>,
    ) -> PipelineResult<()>;

    async fn suggestions(&self, factory_id: &str) -> PipelineResult<Vec<OptimizationSuggestion>>;
}

#[async_trait]
pub trait ExpressionStore: Send + Sync {
    async fn save(&self, expression: LearnedExpression) -> PipelineResult<()>;

    async fn list(&self, factory_id: &str) -> PipelineResult<Vec<LearnedExpression>>;
}

#[derive(Default)]
pub struct InMemorySampleStore {
    samples: Mutex<Vec<ActiveLearningSample>>,
    suggestions: Mutex<HashMap<String, Vec<OptimizationSuggestion>>>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn insert(&self, sample: ActiveLearningSample) -> PipelineResult<()> {
        self.samples.lock().await.push(sample);
        Ok(())
    }

    async fn samples(&self, factory_id: &str) -> PipelineResult<Vec<ActiveLearningSample>> {
        Ok(self
            .samples
            .lock()
            .await
            .iter()
            .filter(|s| s.factory_id == factory_id)
            .cloned()
            .collect())
    }

    async fn factories(&self) -> PipelineResult<Vec<String>> {
        let mut f: Vec<String> = self
            .samples
            .lock()
            .await
            .iter()
            .map(|s| s.factory_id.clone())
            .collect();
        f.sort();
        f.dedup();
        Ok(f)
    }

    async fn assign_clusters(&self, assignments: &[(Uuid, u32)]) -> PipelineResult<()> {
        let by_id: HashMap<Uuid, u32> = assignments.iter().copied().collect();
        for s in self.samples.lock().await.iter_mut() {
            if let Some(c) = by_id.get(&s.id) {
                s.cluster_id = Some(*c);
            }
        }
        Ok(())
    }

    async fn save_suggestions(
        &self,
        factory_id: &str,
        suggestions: Vec<OptimizationSuggestion>,
    ) -> PipelineResult<()> {
        self.suggestions
            .lock()
            .await
            .insert(factory_id.to_string(), suggestions);
        Ok(())
    }

    async fn suggestions(&self, factory_id: &str) -> PipelineResult<Vec<OptimizationSuggestion>> {
        Ok(self
            .suggestions
            .lock()
            .await
            .get(factory_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryExpressionStore {
    expressions: Mutex<Vec<LearnedExpression>>,
}

impl InMemoryExpressionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpressionStore for InMemoryExpressionStore {
    async fn save(&self, expression: LearnedExpression) -> PipelineResult<()> {
        let mut all = self.expressions.lock().await;
        let duplicate = all.iter().any(|e| {
            e.factory_id == expression.factory_id
                && e.intent_code == expression.intent_code
                && e.expression == expression.expression
        });
        if !duplicate {
            all.push(expression);
        }
        Ok(())
    }

    async fn list(&self, factory_id: &str) -> PipelineResult<Vec<LearnedExpression>> {
        Ok(self
            .expressions
            .lock()
            .await
            .iter()
            .filter(|e| e.factory_id == factory_id)
            .cloned()
            .collect())
    }
}

// ── Collector ─────────────────────────────────────────────────

/// Hot-path handle. Cloning shares the same channel.
#[derive(Clone)]
pub struct LearningCollector {
    tx: mpsc::Sender<ActiveLearningSample>,
    threshold: f64,
}

impl LearningCollector {
    /// Start the background writer and return the collector handle.
    pub fn spawn(
        store: Arc<dyn SampleStore>,
        capacity: usize,
        threshold: f64,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ActiveLearningSample>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                if let Err(e) = store.insert(sample).await {
                    tracing::warn!(error = %e, "failed to persist learning sample");
                }
            }
            tracing::debug!("learning writer stopped");
        });
        (Self { tx, threshold }, handle)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn should_collect(&self, confidence: f64) -> bool {
        confidence < self.threshold
    }

    /// Never blocks. Returns whether the sample was queued.
    pub fn collect(&self, sample: ActiveLearningSample) -> bool {
        match self.tx.try_send(sample) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(s)) => {
                tracing::warn!(factory_id = %s.factory_id, "learning channel full, sample dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("learning writer stopped, sample dropped");
                false
            }
        }
    }
}

// ── Clustering ────────────────────────────────────────────────

pub fn bigrams(text: &str) -> HashSet<String> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if chars.len() == 1 {
        return HashSet::from([chars[0].to_string()]);
    }
    chars.windows(2).map(|w| w.iter().collect()).collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    inter / union
}

/// Greedy single pass: each text joins the first cluster whose seed is at
/// least `threshold` similar, else starts a new one. Returns member indices.
pub fn cluster_texts(texts: &[&str], threshold: f64) -> Vec<Vec<usize>> {
    let grams: Vec<HashSet<String>> = texts.iter().map(|t| bigrams(t)).collect();
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for (i, g) in grams.iter().enumerate() {
        match clusters
            .iter_mut()
            .find(|c| jaccard(&grams[c[0]], g) >= threshold)
        {
            Some(c) => c.push(i),
            None => clusters.push(vec![i]),
        }
    }
    clusters
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningReport {
    pub factories: usize,
    pub samples: usize,
    pub clusters: usize,
    pub suggestions: usize,
}

/// Offline pass over collected samples and learned expressions.
pub struct LearningAnalyzer {
    samples: Arc<dyn SampleStore>,
    expressions: Arc<dyn ExpressionStore>,
    similarity: f64,
    min_cluster_size: usize,
}

impl LearningAnalyzer {
    pub fn new(
        samples: Arc<dyn SampleStore>,
        expressions: Arc<dyn ExpressionStore>,
        config: &LearningConfig,
    ) -> Self {
        Self {
            samples,
            expressions,
            similarity: config.cluster_similarity,
            min_cluster_size: config.min_cluster_size.max(1),
        }
    }

    /// Cluster every factory's samples and regenerate its suggestions.
    /// Idempotent: rerunning over the same samples yields the same result.
    pub async fn run(&self, now: DateTime<Utc>) -> PipelineResult<LearningReport> {
        let mut report = LearningReport::default();
        for factory in self.samples.factories().await? {
            let mut samples = self.samples.samples(&factory).await?;
            samples.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

            let texts: Vec<&str> = samples.iter().map(|s| s.normalized_input.as_str()).collect();
            let clusters = cluster_texts(&texts, self.similarity);

            let mut assignments = Vec::with_capacity(samples.len());
            let mut suggestions = Vec::new();
            for (idx, members) in clusters.iter().enumerate() {
                let cluster_id = idx as u32 + 1;
                assignments.extend(members.iter().map(|&m| (samples[m].id, cluster_id)));
                if members.len() >= self.min_cluster_size {
                    let group: Vec<&ActiveLearningSample> =
                        members.iter().map(|&m| &samples[m]).collect();
                    suggestions.push(suggest_for_cluster(&factory, cluster_id, &group));
                }
            }
            suggestions.extend(self.keyword_suggestions(&factory).await?);

            self.samples.assign_clusters(&assignments).await?;
            report.factories += 1;
            report.samples += samples.len();
            report.clusters += clusters.len();
            report.suggestions += suggestions.len();
            tracing::info!(
                factory_id = %factory,
                samples = samples.len(),
                clusters = clusters.len(),
                suggestions = suggestions.len(),
                at = %now,
                "learning pass complete"
            );
            self.samples.save_suggestions(&factory, suggestions).await?;
        }
        Ok(report)
    }

    async fn keyword_suggestions(&self, factory: &str) -> PipelineResult<Vec<OptimizationSuggestion>> {
        let mut by_keyword: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for e in self.expressions.list(factory).await? {
            if let Some(k) = e.keyword {
                by_keyword
                    .entry((e.intent_code, k))
                    .or_default()
                    .push(e.expression);
            }
        }
        Ok(by_keyword
            .into_iter()
            .map(|((intent, keyword), exprs)| OptimizationSuggestion {
                factory_id: factory.to_string(),
                kind: SuggestionKind::AddKeyword,
                intent_code: Some(intent),
                cluster_id: NO_CLUSTER,
                sample_count: exprs.len(),
                examples: std::iter::once(keyword)
                    .chain(exprs)
                    .take(MAX_SUGGESTION_EXAMPLES)
                    .collect(),
            })
            .collect())
    }
}

fn suggest_for_cluster(
    factory: &str,
    cluster_id: u32,
    group: &[&ActiveLearningSample],
) -> OptimizationSuggestion {
    let mut votes: BTreeMap<&str, usize> = BTreeMap::new();
    for s in group {
        if let Some(code) = s.matched_intent_code.as_deref() {
            *votes.entry(code).or_default() += 1;
        }
    }
    let majority = votes
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .filter(|(_, n)| **n * 2 > group.len())
        .map(|(code, _)| code.to_string());

    let mut examples: Vec<String> = Vec::new();
    for s in group {
        if examples.len() >= MAX_SUGGESTION_EXAMPLES {
            break;
        }
        if !examples.contains(&s.user_input) {
            examples.push(s.user_input.clone());
        }
    }

    OptimizationSuggestion {
        factory_id: factory.to_string(),
        kind: if majority.is_some() {
            SuggestionKind::AddExpression
        } else {
            SuggestionKind::NewIntent
        },
        intent_code: majority,
        cluster_id,
        sample_count: group.len(),
        examples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use intent_protocol::MatchSource;

    fn sample(factory: &str, text: &str, intent: Option<&str>, offset: i64) -> ActiveLearningSample {
        ActiveLearningSample {
            id: Uuid::now_v7(),
            factory_id: factory.into(),
            user_id: "u1".into(),
            user_input: text.into(),
            normalized_input: text.into(),
            matched_intent_code: intent.map(String::from),
            confidence_score: 0.4,
            match_method: MatchSource::Embedding,
            cluster_id: None,
            created_at: Utc::now() + Duration::seconds(offset),
        }
    }

    #[test]
    fn jaccard_of_bigrams() {
        let a = bigrams("带鱼库存");
        let b = bigrams("带鱼库存多少");
        // {带鱼,鱼库,库存} vs {带鱼,鱼库,库存,存多,多少}
        assert!((jaccard(&a, &b) - 0.6).abs() < 1e-9);
        assert_eq!(jaccard(&bigrams("出勤"), &bigrams("告警")), 0.0);
    }

    #[test]
    fn greedy_clustering_compares_to_seed() {
        let clusters = cluster_texts(
            &["带鱼库存", "带鱼库存多少", "员工考勤", "带鱼库存呢", "员工考勤表"],
            0.5,
        );
        assert_eq!(clusters, vec![vec![0, 1, 3], vec![2, 4]]);
    }

    #[tokio::test]
    async fn collector_never_blocks_and_drops_when_full() {
        let store = Arc::new(InMemorySampleStore::new());
        let (tx, _rx) = mpsc::channel(1);
        let collector = LearningCollector { tx, threshold: 0.7 };
        assert!(collector.collect(sample("f1", "a", None, 0)));
        assert!(!collector.collect(sample("f1", "b", None, 0)));
        assert!(store.samples("f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writer_persists_samples() {
        let store = Arc::new(InMemorySampleStore::new());
        let (collector, handle) = LearningCollector::spawn(store.clone(), 8, 0.7);
        assert!(collector.should_collect(0.5));
        assert!(!collector.should_collect(0.7));
        collector.collect(sample("f1", "带鱼库存", None, 0));
        drop(collector);
        handle.await.unwrap();
        assert_eq!(store.samples("f1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn analyzer_assigns_clusters_and_suggests() {
        let samples = Arc::new(InMemorySampleStore::new());
        let expressions = Arc::new(InMemoryExpressionStore::new());
        for (i, (t, intent)) in [
            ("带鱼库存", Some("MATERIAL_BATCH_QUERY")),
            ("带鱼库存多少", Some("MATERIAL_BATCH_QUERY")),
            ("带鱼库存呢", None),
            ("设备保养周期", None),
            ("设备保养周期表", None),
            ("设备保养周期多久", None),
            ("你好", None),
        ]
        .into_iter()
        .enumerate()
        {
            samples.insert(sample("f1", t, intent, i as i64)).await.unwrap();
        }

        let analyzer = LearningAnalyzer::new(samples.clone(), expressions, &LearningConfig::default());
        let report = analyzer.run(Utc::now()).await.unwrap();
        assert_eq!(report.clusters, 3);
        assert_eq!(report.suggestions, 2);

        let suggestions = samples.suggestions("f1").await.unwrap();
        assert_eq!(suggestions[0].kind, SuggestionKind::AddExpression);
        assert_eq!(suggestions[0].intent_code.as_deref(), Some("MATERIAL_BATCH_QUERY"));
        assert_eq!(suggestions[1].kind, SuggestionKind::NewIntent);
        assert!(samples.samples("f1").await.unwrap().iter().all(|s| s.cluster_id.is_some()));

        // Rerun is idempotent.
        analyzer.run(Utc::now()).await.unwrap();
        assert_eq!(samples.suggestions("f1").await.unwrap(), suggestions);
    }

    #[tokio::test]
    async fn learned_keywords_become_suggestions() {
        let samples = Arc::new(InMemorySampleStore::new());
        let expressions = Arc::new(InMemoryExpressionStore::new());
        samples.insert(sample("f1", "x", None, 0)).await.unwrap();
        expressions
            .save(LearnedExpression {
                factory_id: "f1".into(),
                intent_code: "ALERT_QUERY".into(),
                expression: "那个红灯".into(),
                keyword: Some("红灯".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        LearningAnalyzer::new(samples.clone(), expressions, &LearningConfig::default())
            .run(Utc::now())
            .await
            .unwrap();
        let s = samples.suggestions("f1").await.unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].kind, SuggestionKind::AddKeyword);
        assert_eq!(s[0].cluster_id, NO_CLUSTER);
        assert_eq!(s[0].examples[0], "红灯");
    }

    #[tokio::test]
    async fn expressions_deduplicated() {
        let store = InMemoryExpressionStore::new();
        let e = LearnedExpression {
            factory_id: "f1".into(),
            intent_code: "ALERT_QUERY".into(),
            expression: "红灯亮了".into(),
            keyword: None,
            created_at: Utc::now(),
        };
        store.save(e.clone()).await.unwrap();
        store.save(e).await.unwrap();
        assert_eq!(store.list("f1").await.unwrap().len(), 1);
    }
}
