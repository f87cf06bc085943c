//! Shared application state for the Axum server.
//!
//! Supports two modes:
//! - **Database mode**: pipeline stores backed by a `PgPool` (production).
//! - **In-memory mode**: the pipeline's in-memory stores (tests and development).

use std::sync::Arc;

use sqlx::PgPool;

use intent_pipeline::{InMemoryCatalog, IntentPipeline, PipelineConfig, Services, Stores};

/// Shared application state, cheap to clone into each handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IntentPipeline>,
    /// PostgreSQL connection pool (None in test/in-memory mode).
    pub pool: Option<PgPool>,
}

impl AppState {
    /// State over Postgres-backed stores.
    pub fn with_pool(config: PipelineConfig, services: Services, pool: PgPool) -> Self {
        let stores = crate::db::stores(pool.clone());
        Self {
            pipeline: Arc::new(IntentPipeline::new(
                config,
                Arc::new(InMemoryCatalog::factory_defaults()),
                services,
                stores,
            )),
            pool: Some(pool),
        }
    }

    /// In-memory state. Must be created inside a Tokio runtime.
    pub fn in_memory(config: PipelineConfig, services: Services) -> Self {
        Self {
            pipeline: Arc::new(IntentPipeline::new(
                config,
                Arc::new(InMemoryCatalog::factory_defaults()),
                services,
                Stores::in_memory(),
            )),
            pool: None,
        }
    }
}
