//! Conversation sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use intent_pipeline::PipelineResult;
use intent_pipeline::conversation::{SessionStore, StartOutcome};
use intent_protocol::{ConversationSession, SessionStatus};

use super::storage;

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn active_for_update(
    tx: &mut Transaction<'_, Postgres>,
    factory_id: &str,
    user_id: &str,
) -> Result<Option<ConversationSession>, sqlx::Error> {
    let row: Option<(Json<ConversationSession>,)> = sqlx::query_as(
        "SELECT data FROM conversation_sessions
         WHERE factory_id = $1 AND user_id = $2 AND status = 'ACTIVE'
         FOR UPDATE",
    )
    .bind(factory_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|(Json(s),)| s))
}

async fn write(
    tx: &mut Transaction<'_, Postgres>,
    session: &ConversationSession,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE conversation_sessions SET status = $2, expires_at = $3, data = $4, updated_at = now()
         WHERE session_id = $1",
    )
    .bind(session.session_id)
    .bind(session.status.as_str())
    .bind(session.expires_at)
    .bind(Json(session))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_or_get_active(
        &self,
        session: ConversationSession,
        now: DateTime<Utc>,
    ) -> PipelineResult<StartOutcome> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        if let Some(mut existing) = active_for_update(&mut tx, &session.factory_id, &session.user_id)
            .await
            .map_err(storage)?
        {
            if !existing.is_expired(now) {
                tx.commit().await.map_err(storage)?;
                return Ok(StartOutcome::Existing(existing));
            }
            existing.status = SessionStatus::TimedOut;
            existing.updated_at = now;
            write(&mut tx, &existing).await.map_err(storage)?;
            tracing::info!(session_id = %existing.session_id, "expired session timed out on restart");
        }

        // A concurrent insert for the same user loses on the partial index.
        let inserted = sqlx::query(
            "INSERT INTO conversation_sessions (session_id, factory_id, user_id, status, expires_at, data)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (factory_id, user_id) WHERE status = 'ACTIVE' DO NOTHING",
        )
        .bind(session.session_id)
        .bind(&session.factory_id)
        .bind(&session.user_id)
        .bind(session.status.as_str())
        .bind(session.expires_at)
        .bind(Json(&session))
        .execute(&mut *tx)
        .await
        .map_err(storage)?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await.map_err(storage)?;
            return Ok(StartOutcome::Created(session));
        }
        let winner = active_for_update(&mut tx, &session.factory_id, &session.user_id)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        match winner {
            Some(s) => Ok(StartOutcome::Existing(s)),
            None => Err(intent_pipeline::PipelineError::Storage(
                "active session vanished during insert".into(),
            )),
        }
    }

    async fn get(&self, session_id: Uuid) -> PipelineResult<Option<ConversationSession>> {
        let row: Option<(Json<ConversationSession>,)> =
            sqlx::query_as("SELECT data FROM conversation_sessions WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.map(|(Json(s),)| s))
    }

    async fn update_active(&self, session: &ConversationSession) -> PipelineResult<bool> {
        let mut next = session.clone();
        next.version += 1;
        let updated = sqlx::query(
            "UPDATE conversation_sessions SET status = $2, expires_at = $3, data = $4, updated_at = now()
             WHERE session_id = $1 AND status = 'ACTIVE'
               AND COALESCE((data->>'version')::bigint, 0) = $5",
        )
        .bind(session.session_id)
        .bind(session.status.as_str())
        .bind(session.expires_at)
        .bind(Json(&next))
        .bind(session.version as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn list_active(&self) -> PipelineResult<Vec<ConversationSession>> {
        let rows: Vec<(Json<ConversationSession>,)> =
            sqlx::query_as("SELECT data FROM conversation_sessions WHERE status = 'ACTIVE'")
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
        Ok(rows.into_iter().map(|(Json(s),)| s).collect())
    }
}
