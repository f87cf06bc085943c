//! PostgreSQL-backed stores.
//!
//! Each sub-module implements one of the pipeline's store traits over a
//! `PgPool`. Sessions and preview tokens keep their full document as JSONB
//! next to the columns that the compare-and-set updates filter on.

pub mod learning;
pub mod sessions;
pub mod tokens;
pub mod transitions;

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use intent_pipeline::{PipelineError, Stores};

pub use learning::{PgExpressionStore, PgSampleStore};
pub use sessions::PgSessionStore;
pub use tokens::PgTokenStore;
pub use transitions::PgTransitionStore;

/// Connect to PostgreSQL and run migrations.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    tracing::info!("running database migrations");
    sqlx::raw_sql(include_str!("../../migrations/001_conversation_sessions.sql"))
        .execute(&pool)
        .await?;
    sqlx::raw_sql(include_str!("../../migrations/002_preview_tokens.sql"))
        .execute(&pool)
        .await?;
    sqlx::raw_sql(include_str!("../../migrations/003_intent_transitions.sql"))
        .execute(&pool)
        .await?;
    sqlx::raw_sql(include_str!("../../migrations/004_active_learning.sql"))
        .execute(&pool)
        .await?;
    tracing::info!("migrations complete");

    Ok(pool)
}

/// Every pipeline store over one pool.
pub fn stores(pool: PgPool) -> Stores {
    Stores {
        sessions: Arc::new(PgSessionStore::new(pool.clone())),
        tokens: Arc::new(PgTokenStore::new(pool.clone())),
        transitions: Arc::new(PgTransitionStore::new(pool.clone())),
        samples: Arc::new(PgSampleStore::new(pool.clone())),
        expressions: Arc::new(PgExpressionStore::new(pool)),
    }
}

pub(crate) fn storage(e: sqlx::Error) -> PipelineError {
    PipelineError::Storage(e.to_string())
}

pub(crate) fn corrupt(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Storage(format!("corrupt row: {e}"))
}
