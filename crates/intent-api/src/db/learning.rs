//! Active-learning samples, suggestions and learned expressions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use intent_pipeline::PipelineResult;
use intent_pipeline::learning::{ExpressionStore, SampleStore};
use intent_protocol::{ActiveLearningSample, LearnedExpression, OptimizationSuggestion};

use super::{corrupt, storage};

/// Sample row returned from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SampleRow {
    id: Uuid,
    factory_id: String,
    user_id: String,
    user_input: String,
    normalized_input: String,
    matched_intent_code: Option<String>,
    confidence_score: f64,
    match_method: String,
    cluster_id: Option<i32>,
    created_at: DateTime<Utc>,
}

impl TryFrom<SampleRow> for ActiveLearningSample {
    type Error = intent_pipeline::PipelineError;

    fn try_from(r: SampleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            factory_id: r.factory_id,
            user_id: r.user_id,
            user_input: r.user_input,
            normalized_input: r.normalized_input,
            matched_intent_code: r.matched_intent_code,
            confidence_score: r.confidence_score,
            match_method: r.match_method.parse().map_err(corrupt)?,
            cluster_id: r.cluster_id.map(|c| c.max(0) as u32),
            created_at: r.created_at,
        })
    }
}

pub struct PgSampleStore {
    pool: PgPool,
}

impl PgSampleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SampleStore for PgSampleStore {
    async fn insert(&self, s: ActiveLearningSample) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO active_learning_samples
             (id, factory_id, user_id, user_input, normalized_input, matched_intent_code, confidence_score, match_method, cluster_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(s.id)
        .bind(&s.factory_id)
        .bind(&s.user_id)
        .bind(&s.user_input)
        .bind(&s.normalized_input)
        .bind(&s.matched_intent_code)
        .bind(s.confidence_score)
        .bind(s.match_method.as_str())
        .bind(s.cluster_id.map(|c| c as i32))
        .bind(s.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn samples(&self, factory_id: &str) -> PipelineResult<Vec<ActiveLearningSample>> {
        let rows: Vec<SampleRow> = sqlx::query_as(
            "SELECT * FROM active_learning_samples WHERE factory_id = $1 ORDER BY created_at, id",
        )
        .bind(factory_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(ActiveLearningSample::try_from).collect()
    }

    async fn factories(&self) -> PipelineResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT factory_id FROM active_learning_samples ORDER BY factory_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(|(f,)| f).collect())
    }

    async fn assign_clusters(&self, assignments: &[(Uuid, u32)]) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for (id, cluster) in assignments {
            sqlx::query("UPDATE active_learning_samples SET cluster_id = $2 WHERE id = $1")
                .bind(id)
                .bind(*cluster as i32)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)
    }

    async fn save_suggestions(
        &self,
        factory_id: &str,
        suggestions: Vec<OptimizationSuggestion>,
    ) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM optimization_suggestions WHERE factory_id = $1")
            .bind(factory_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        for s in &suggestions {
            sqlx::query("INSERT INTO optimization_suggestions (factory_id, data) VALUES ($1, $2)")
                .bind(factory_id)
                .bind(Json(s))
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)
    }

    async fn suggestions(&self, factory_id: &str) -> PipelineResult<Vec<OptimizationSuggestion>> {
        let rows: Vec<(Json<OptimizationSuggestion>,)> = sqlx::query_as(
            "SELECT data FROM optimization_suggestions WHERE factory_id = $1 ORDER BY id",
        )
        .bind(factory_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(|(Json(s),)| s).collect())
    }
}

pub struct PgExpressionStore {
    pool: PgPool,
}

impl PgExpressionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExpressionStore for PgExpressionStore {
    async fn save(&self, e: LearnedExpression) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO learned_expressions (factory_id, intent_code, expression, keyword, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (factory_id, intent_code, expression) DO NOTHING",
        )
        .bind(&e.factory_id)
        .bind(&e.intent_code)
        .bind(&e.expression)
        .bind(&e.keyword)
        .bind(e.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn list(&self, factory_id: &str) -> PipelineResult<Vec<LearnedExpression>> {
        let rows: Vec<(String, String, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT intent_code, expression, keyword, created_at FROM learned_expressions
             WHERE factory_id = $1 ORDER BY created_at",
        )
        .bind(factory_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .into_iter()
            .map(|(intent_code, expression, keyword, created_at)| LearnedExpression {
                factory_id: factory_id.to_string(),
                intent_code,
                expression,
                keyword,
                created_at,
            })
            .collect())
    }
}
