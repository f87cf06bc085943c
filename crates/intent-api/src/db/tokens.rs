//! Preview tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use intent_pipeline::PipelineResult;
use intent_pipeline::preview::TokenStore;
use intent_protocol::{PreviewStatus, PreviewToken};

use super::storage;

pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn insert(&self, token: PreviewToken) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO preview_tokens (token, factory_id, user_id, status, expires_at, data)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&token.token)
        .bind(&token.factory_id)
        .bind(&token.user_id)
        .bind(token.status.as_str())
        .bind(token.expires_at)
        .bind(Json(&token))
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get(&self, token: &str) -> PipelineResult<Option<PreviewToken>> {
        let row: Option<(Json<PreviewToken>,)> =
            sqlx::query_as("SELECT data FROM preview_tokens WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.map(|(Json(t),)| t))
    }

    async fn transition(
        &self,
        token: &str,
        expected: PreviewStatus,
        next: PreviewStatus,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> PipelineResult<Option<PreviewToken>> {
        // The status column is the lock: only one caller matches `expected`.
        let row: Option<(Json<PreviewToken>,)> = sqlx::query_as(
            "UPDATE preview_tokens
             SET status = $3,
                 data = data || jsonb_build_object('status', $3::text, 'resolved_at', $4::timestamptz, 'cancel_reason', $5::text)
             WHERE token = $1 AND status = $2
             RETURNING data",
        )
        .bind(token)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(|(Json(t),)| t))
    }

    async fn expire_stale(&self, now: DateTime<Utc>) -> PipelineResult<usize> {
        let expired = sqlx::query(
            "UPDATE preview_tokens
             SET status = 'EXPIRED',
                 data = data || jsonb_build_object('status', 'EXPIRED', 'resolved_at', $1::timestamptz)
             WHERE status = 'PENDING' AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?
        .rows_affected();
        Ok(expired as usize)
    }
}
