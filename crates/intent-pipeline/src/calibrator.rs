//! Markov-transition confidence calibration.
//!
//! Per tenant, `P(to | from)` is estimated with Laplace smoothing from the
//! intent sequences observed in a rolling window. The matrix is rebuilt by
//! the scheduled recompute, never per request; calibration reads the last
//! snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};

use intent_protocol::{
    IntentCandidate, IntentMatchResult, IntentTransitionEntry, TransitionObservation, clamp_unit,
};

use crate::config::CalibrationConfig;
use crate::error::PipelineResult;

// ── Store ─────────────────────────────────────────────────────

#[async_trait]
pub trait TransitionStore: Send + Sync {
    async fn record(&self, observation: TransitionObservation) -> PipelineResult<()>;

    async fn observations_since(
        &self,
        factory_id: &str,
        since: DateTime<Utc>,
    ) -> PipelineResult<Vec<TransitionObservation>>;

    /// Drop a factory's observations older than `before`. Returns how many went.
    async fn prune_before(&self, factory_id: &str, before: DateTime<Utc>) -> PipelineResult<usize>;

    /// Factories with at least one observation.
    async fn factories(&self) -> PipelineResult<Vec<String>>;

    /// Replace a factory's persisted matrix.
    async fn save_matrix(
        &self,
        factory_id: &str,
        entries: Vec<IntentTransitionEntry>,
    ) -> PipelineResult<()>;

    async fn load_matrix(&self, factory_id: &str) -> PipelineResult<Vec<IntentTransitionEntry>>;
}

#[derive(Default)]
pub struct InMemoryTransitionStore {
    observations: Mutex<Vec<TransitionObservation>>,
    matrices: RwLock<HashMap<String, Vec<IntentTransitionEntry>>>,
}

impl InMemoryTransitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransitionStore for InMemoryTransitionStore {
    async fn record(&self, observation: TransitionObservation) -> PipelineResult<()> {
        self.observations.lock().await.push(observation);
        Ok(())
    }

    async fn observations_since(
        &self,
        factory_id: &str,
        since: DateTime<Utc>,
    ) -> PipelineResult<Vec<TransitionObservation>> {
        Ok(self
            .observations
            .lock()
            .await
            .iter()
            .filter(|o| o.factory_id == factory_id && o.observed_at >= since)
            .cloned()
            .collect())
    }

    async fn prune_before(&self, factory_id: &str, before: DateTime<Utc>) -> PipelineResult<usize> {
        let mut observations = self.observations.lock().await;
        let len = observations.len();
        observations.retain(|o| o.factory_id != factory_id || o.observed_at >= before);
        Ok(len - observations.len())
    }

    async fn factories(&self) -> PipelineResult<Vec<String>> {
        let mut f: Vec<String> = self
            .observations
            .lock()
            .await
            .iter()
            .map(|o| o.factory_id.clone())
            .collect();
        f.sort();
        f.dedup();
        Ok(f)
    }

    async fn save_matrix(
        &self,
        factory_id: &str,
        entries: Vec<IntentTransitionEntry>,
    ) -> PipelineResult<()> {
        self.matrices
            .write()
            .await
            .insert(factory_id.to_string(), entries);
        Ok(())
    }

    async fn load_matrix(&self, factory_id: &str) -> PipelineResult<Vec<IntentTransitionEntry>> {
        Ok(self
            .matrices
            .read()
            .await
            .get(factory_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ── Matrix ────────────────────────────────────────────────────

/// One smoothed row `P(· | from)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionRow {
    pub probabilities: BTreeMap<String, f64>,
    /// Mass reserved for every unobserved successor.
    pub other: f64,
    pub total: u64,
}

impl TransitionRow {
    pub fn probability(&self, to: &str) -> f64 {
        self.probabilities.get(to).copied().unwrap_or(self.other)
    }

    fn max_probability(&self) -> f64 {
        self.probabilities.values().copied().fold(self.other, f64::max)
    }
}

/// Build smoothed rows from raw observations:
/// `P(to|from) = (c + 1) / (total + V + 1)`, other = `1 / (total + V + 1)`.
pub fn build_rows(observations: &[TransitionObservation]) -> BTreeMap<String, TransitionRow> {
    let mut counts: BTreeMap<&str, BTreeMap<&str, u64>> = BTreeMap::new();
    for o in observations {
        *counts
            .entry(o.from_intent.as_str())
            .or_default()
            .entry(o.to_intent.as_str())
            .or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(from, tos)| {
            let total: u64 = tos.values().sum();
            let denom = (total + tos.len() as u64 + 1) as f64;
            let probabilities = tos
                .iter()
                .map(|(to, c)| (to.to_string(), (*c as f64 + 1.0) / denom))
                .collect();
            (
                from.to_string(),
                TransitionRow {
                    probabilities,
                    other: 1.0 / denom,
                    total,
                },
            )
        })
        .collect()
}

fn rows_to_entries(
    factory_id: &str,
    rows: &BTreeMap<String, TransitionRow>,
    observations: &[TransitionObservation],
) -> Vec<IntentTransitionEntry> {
    let mut out = Vec::new();
    for (from, row) in rows {
        for (to, p) in &row.probabilities {
            let count = observations
                .iter()
                .filter(|o| &o.from_intent == from && &o.to_intent == to)
                .count() as u64;
            out.push(IntentTransitionEntry {
                factory_id: factory_id.to_string(),
                from_intent: from.clone(),
                to_intent: to.clone(),
                probability: *p,
                observation_count: count,
            });
        }
    }
    out
}

fn entries_to_rows(entries: &[IntentTransitionEntry]) -> BTreeMap<String, TransitionRow> {
    let mut rows: BTreeMap<String, TransitionRow> = BTreeMap::new();
    for e in entries {
        let row = rows.entry(e.from_intent.clone()).or_default();
        row.probabilities.insert(e.to_intent.clone(), e.probability);
        row.total += e.observation_count;
    }
    for row in rows.values_mut() {
        let v = row.probabilities.len() as u64;
        row.other = 1.0 / (row.total + v + 1) as f64;
    }
    rows
}

// ── Calibrator ────────────────────────────────────────────────

pub struct ConfidenceCalibrator {
    store: Arc<dyn TransitionStore>,
    weight: f64,
    window: Duration,
    snapshot: RwLock<HashMap<String, BTreeMap<String, TransitionRow>>>,
}

impl ConfidenceCalibrator {
    pub fn new(store: Arc<dyn TransitionStore>, config: &CalibrationConfig) -> Self {
        Self {
            store,
            weight: config.weight.clamp(0.0, 1.0),
            window: Duration::days(config.window_days),
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    /// Append one `(previous → current)` step.
    pub async fn observe(
        &self,
        factory_id: &str,
        from_intent: &str,
        to_intent: &str,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        self.store
            .record(TransitionObservation {
                factory_id: factory_id.to_string(),
                from_intent: from_intent.to_string(),
                to_intent: to_intent.to_string(),
                observed_at: at,
            })
            .await
    }

    /// Rebuild every factory's matrix from the rolling window and drop the
    /// observations that fell out of it. Returns the number of matrix cells
    /// written. Idempotent.
    pub async fn recompute(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let since = now - self.window;
        let mut written = 0;
        for factory in self.store.factories().await? {
            let observations = self.store.observations_since(&factory, since).await?;
            let rows = build_rows(&observations);
            let entries = rows_to_entries(&factory, &rows, &observations);
            written += entries.len();
            self.store.save_matrix(&factory, entries).await?;
            self.snapshot.write().await.insert(factory.clone(), rows);
            let pruned = self.store.prune_before(&factory, since).await?;
            tracing::debug!(
                factory_id = %factory,
                observations = observations.len(),
                pruned,
                "transition matrix rebuilt"
            );
        }
        Ok(written)
    }

    /// Load a persisted matrix into the snapshot (startup path).
    pub async fn load(&self, factory_id: &str) -> PipelineResult<()> {
        let entries = self.store.load_matrix(factory_id).await?;
        if !entries.is_empty() {
            self.snapshot
                .write()
                .await
                .insert(factory_id.to_string(), entries_to_rows(&entries));
        }
        Ok(())
    }

    pub async fn row(&self, factory_id: &str, from_intent: &str) -> Option<TransitionRow> {
        self.snapshot
            .read()
            .await
            .get(factory_id)?
            .get(from_intent)
            .cloned()
    }

    /// `raw^(1-w) · (P / Pmax)^w`; unchanged without history.
    pub async fn calibrate(
        &self,
        factory_id: &str,
        previous_intent: Option<&str>,
        current_intent: &str,
        raw_confidence: f64,
    ) -> f64 {
        let Some(prev) = previous_intent else {
            return raw_confidence;
        };
        match self.row(factory_id, prev).await {
            Some(row) => blend(raw_confidence, &row, current_intent, self.weight),
            None => raw_confidence,
        }
    }

    /// Calibrate every candidate of a ladder result, restoring its ordering.
    pub async fn calibrate_result(
        &self,
        factory_id: &str,
        previous_intent: Option<&str>,
        result: IntentMatchResult,
    ) -> IntentMatchResult {
        let Some(prev) = previous_intent else {
            return result;
        };
        let Some(row) = self.row(factory_id, prev).await else {
            return result;
        };
        let weight = self.weight;
        result.rescored(|c| blend(c.confidence, &row, &c.intent_code, weight))
    }

    /// The `k` most likely successors of `current_intent`.
    pub async fn top_next(
        &self,
        factory_id: &str,
        current_intent: &str,
        k: usize,
    ) -> Vec<IntentCandidate> {
        let Some(row) = self.row(factory_id, current_intent).await else {
            return Vec::new();
        };
        let mut next: Vec<IntentCandidate> = row
            .probabilities
            .iter()
            .map(|(to, p)| IntentCandidate::new(to.clone(), *p))
            .collect();
        next.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        next.truncate(k);
        next
    }

    pub async fn entries(&self, factory_id: &str) -> PipelineResult<Vec<IntentTransitionEntry>> {
        self.store.load_matrix(factory_id).await
    }
}

fn blend(raw: f64, row: &TransitionRow, to: &str, weight: f64) -> f64 {
    let pmax = row.max_probability();
    if pmax <= 0.0 {
        return clamp_unit(raw);
    }
    let relative = row.probability(to) / pmax;
    clamp_unit(clamp_unit(raw).powf(1.0 - weight) * relative.powf(weight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use intent_protocol::MatchSource;

    async fn calibrator_with(steps: &[(&str, &str, i64)]) -> (ConfidenceCalibrator, DateTime<Utc>) {
        let now = Utc::now();
        let store = Arc::new(InMemoryTransitionStore::new());
        let cal = ConfidenceCalibrator::new(store, &CalibrationConfig::default());
        for (from, to, days_ago) in steps {
            cal.observe("f1", from, to, now - Duration::days(*days_ago))
                .await
                .unwrap();
        }
        cal.recompute(now).await.unwrap();
        (cal, now)
    }

    #[test]
    fn rows_sum_to_one_with_other_mass() {
        let obs: Vec<TransitionObservation> = [("A", "B"), ("A", "B"), ("A", "C"), ("D", "A")]
            .iter()
            .map(|(f, t)| TransitionObservation {
                factory_id: "f1".into(),
                from_intent: f.to_string(),
                to_intent: t.to_string(),
                observed_at: Utc::now(),
            })
            .collect();
        let rows = build_rows(&obs);
        for row in rows.values() {
            let sum: f64 = row.probabilities.values().sum::<f64>() + row.other;
            assert!((sum - 1.0).abs() < 1e-9);
        }
        let a = &rows["A"];
        // total 3, V 2 → denominator 6
        assert!((a.probability("B") - 3.0 / 6.0).abs() < 1e-9);
        assert!((a.probability("C") - 2.0 / 6.0).abs() < 1e-9);
        assert!((a.probability("Z") - 1.0 / 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn likely_successor_keeps_confidence_unlikely_is_penalized() {
        let (cal, _) = calibrator_with(&[("A", "B", 1), ("A", "B", 1), ("A", "B", 2), ("A", "C", 3)]).await;
        let likely = cal.calibrate("f1", Some("A"), "B", 0.8).await;
        let unlikely = cal.calibrate("f1", Some("A"), "Z", 0.8).await;
        assert!((likely - 0.8f64.powf(0.8)).abs() < 1e-9);
        assert!(unlikely < likely);
        assert!(unlikely < 0.8);
    }

    #[tokio::test]
    async fn no_history_is_identity() {
        let (cal, _) = calibrator_with(&[("A", "B", 1)]).await;
        assert_eq!(cal.calibrate("f1", None, "B", 0.42).await, 0.42);
        assert_eq!(cal.calibrate("f1", Some("Q"), "B", 0.42).await, 0.42);
        assert_eq!(cal.calibrate("f2", Some("A"), "B", 0.42).await, 0.42);
    }

    #[tokio::test]
    async fn window_excludes_old_observations() {
        let (cal, _) = calibrator_with(&[("A", "B", 45), ("A", "C", 1)]).await;
        let row = cal.row("f1", "A").await.unwrap();
        assert_eq!(row.total, 1);
        assert!(!row.probabilities.contains_key("B"));
    }

    #[tokio::test]
    async fn recompute_prunes_observations_outside_window() {
        let now = Utc::now();
        let store = Arc::new(InMemoryTransitionStore::new());
        let cal = ConfidenceCalibrator::new(store.clone(), &CalibrationConfig::default());
        cal.observe("f1", "A", "B", now - Duration::days(60)).await.unwrap();
        cal.observe("f1", "A", "C", now - Duration::days(1)).await.unwrap();
        cal.observe("f2", "A", "B", now - Duration::days(60)).await.unwrap();

        cal.recompute(now).await.unwrap();

        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let kept = store.observations_since("f1", epoch).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].to_intent, "C");
        assert!(store.observations_since("f2", epoch).await.unwrap().is_empty());

        // Nothing left to prune on a second run.
        cal.recompute(now).await.unwrap();
        assert_eq!(store.observations_since("f1", epoch).await.unwrap().len(), 1);
        assert_eq!(cal.row("f1", "A").await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn top_next_orders_by_probability() {
        let (cal, _) = calibrator_with(&[("A", "B", 1), ("A", "B", 1), ("A", "C", 1)]).await;
        let next = cal.top_next("f1", "A", 1).await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].intent_code, "B");
    }

    #[tokio::test]
    async fn recompute_is_idempotent_and_persists() {
        let (cal, now) = calibrator_with(&[("A", "B", 1), ("A", "C", 1)]).await;
        let first = cal.entries("f1").await.unwrap();
        cal.recompute(now).await.unwrap();
        assert_eq!(cal.entries("f1").await.unwrap(), first);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn calibrated_result_stays_sorted() {
        let (cal, _) = calibrator_with(&[("A", "C", 1), ("A", "C", 1), ("A", "C", 1)]).await;
        let raw = IntentMatchResult::from_candidates(
            MatchSource::Embedding,
            vec![IntentCandidate::new("B", 0.70), IntentCandidate::new("C", 0.69)],
        );
        let out = cal.calibrate_result("f1", Some("A"), raw).await;
        assert_eq!(out.best_match_intent_code.as_deref(), Some("C"));
        assert!(out.candidates[0].confidence >= out.candidates[1].confidence);
    }

    #[tokio::test]
    async fn load_restores_snapshot_from_store() {
        let store = Arc::new(InMemoryTransitionStore::new());
        let cal = ConfidenceCalibrator::new(store.clone(), &CalibrationConfig::default());
        cal.observe("f1", "A", "B", Utc::now()).await.unwrap();
        cal.recompute(Utc::now()).await.unwrap();

        let fresh = ConfidenceCalibrator::new(store, &CalibrationConfig::default());
        assert!(fresh.row("f1", "A").await.is_none());
        fresh.load("f1").await.unwrap();
        let row = fresh.row("f1", "A").await.unwrap();
        assert!((row.probability("B") - 2.0 / 3.0).abs() < 1e-9);
    }
}
