//! Intent transition observations and the derived Markov matrix.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use intent_pipeline::PipelineResult;
use intent_pipeline::calibrator::TransitionStore;
use intent_protocol::{IntentTransitionEntry, TransitionObservation};

use super::storage;

/// Matrix row returned from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct MatrixRow {
    from_intent: String,
    to_intent: String,
    probability: f64,
    observation_count: i64,
}

pub struct PgTransitionStore {
    pool: PgPool,
}

impl PgTransitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransitionStore for PgTransitionStore {
    async fn record(&self, observation: TransitionObservation) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO intent_transition_observations (factory_id, from_intent, to_intent, observed_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&observation.factory_id)
        .bind(&observation.from_intent)
        .bind(&observation.to_intent)
        .bind(observation.observed_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn observations_since(
        &self,
        factory_id: &str,
        since: DateTime<Utc>,
    ) -> PipelineResult<Vec<TransitionObservation>> {
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT from_intent, to_intent, observed_at FROM intent_transition_observations
             WHERE factory_id = $1 AND observed_at >= $2
             ORDER BY observed_at",
        )
        .bind(factory_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .into_iter()
            .map(|(from_intent, to_intent, observed_at)| TransitionObservation {
                factory_id: factory_id.to_string(),
                from_intent,
                to_intent,
                observed_at,
            })
            .collect())
    }

    async fn prune_before(&self, factory_id: &str, before: DateTime<Utc>) -> PipelineResult<usize> {
        let result = sqlx::query(
            "DELETE FROM intent_transition_observations WHERE factory_id = $1 AND observed_at < $2",
        )
        .bind(factory_id)
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }

    async fn factories(&self) -> PipelineResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT factory_id FROM intent_transition_observations ORDER BY factory_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(|(f,)| f).collect())
    }

    async fn save_matrix(
        &self,
        factory_id: &str,
        entries: Vec<IntentTransitionEntry>,
    ) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM intent_transition_matrix WHERE factory_id = $1")
            .bind(factory_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        for e in &entries {
            sqlx::query(
                "INSERT INTO intent_transition_matrix (factory_id, from_intent, to_intent, probability, observation_count)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(factory_id)
            .bind(&e.from_intent)
            .bind(&e.to_intent)
            .bind(e.probability)
            .bind(e.observation_count as i64)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        tracing::debug!(factory_id = %factory_id, cells = entries.len(), "transition matrix saved");
        Ok(())
    }

    async fn load_matrix(&self, factory_id: &str) -> PipelineResult<Vec<IntentTransitionEntry>> {
        let rows: Vec<MatrixRow> = sqlx::query_as(
            "SELECT from_intent, to_intent, probability, observation_count
             FROM intent_transition_matrix WHERE factory_id = $1
             ORDER BY from_intent, probability DESC",
        )
        .bind(factory_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .into_iter()
            .map(|r| IntentTransitionEntry {
                factory_id: factory_id.to_string(),
                from_intent: r.from_intent,
                to_intent: r.to_intent,
                probability: r.probability,
                observation_count: r.observation_count.max(0) as u64,
            })
            .collect())
    }
}
