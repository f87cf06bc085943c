//! Factory intent API: intent resolution REST server.
//!
//! Serves resolve / conversation / preview endpoints over the pipeline and
//! runs the maintenance loops in the background.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use intent_api::bedrock::BedrockLlm;
use intent_api::config::ApiConfig;
use intent_api::state::AppState;
use intent_api::{db, routes};
use intent_pipeline::clients::HttpExecutorClient;
use intent_pipeline::maintenance::{self, MaintenanceTask};
use intent_pipeline::{BusinessExecutor, LlmService, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "intent-api starting");

    let config = ApiConfig::from_env();
    let pipeline_config = config.pipeline()?;

    let executor_endpoint = pipeline_config
        .services
        .executor
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no business executor configured (EXECUTOR_URL)"))?;
    let executor: Arc<dyn BusinessExecutor> = Arc::new(HttpExecutorClient::new(&executor_endpoint)?);
    let mut services = Services::from_config(&pipeline_config.services, executor)?;
    if config.bedrock_enabled {
        tracing::info!("using AWS Bedrock as LLM backend");
        let llm: Arc<dyn LlmService> = Arc::new(BedrockLlm::from_env().await);
        services.llm = Some(llm);
    }

    let maintenance_config = pipeline_config.maintenance.clone();

    // Connect to PostgreSQL if DATABASE_URL is set, otherwise use in-memory state.
    let state = if let Some(database_url) = &config.database_url {
        tracing::info!("connecting to PostgreSQL");
        let pool = db::connect(database_url).await?;
        AppState::with_pool(pipeline_config, services, pool)
    } else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        AppState::in_memory(pipeline_config, services)
    };

    // Calibration starts from the persisted window, not an empty matrix.
    let cells = maintenance::run_once(&state.pipeline, MaintenanceTask::RecomputeTransitions).await?;
    tracing::info!(cells, "transition matrix loaded");
    let _maintenance = maintenance::spawn_all(state.pipeline.clone(), &maintenance_config);

    let app = routes::build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
