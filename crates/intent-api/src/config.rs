//! API server configuration.

use serde::Deserialize;

use intent_pipeline::config::EndpointConfig;
use intent_pipeline::{PipelineConfig, PipelineResult};

/// Top-level API server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address (e.g., "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// PostgreSQL connection URL; in-memory stores when absent.
    pub database_url: Option<String>,
    /// Enable AWS Bedrock as the LLM backend (BEDROCK_ENABLED env var).
    #[serde(default)]
    pub bedrock_enabled: bool,
    /// TOML pipeline configuration (PIPELINE_CONFIG env var).
    pub pipeline_config: Option<String>,
    /// Collaborator base URLs; each overrides the TOML `[services]` entry.
    #[serde(default)]
    pub embedding_url: Option<String>,
    #[serde(default)]
    pub classifier_url: Option<String>,
    #[serde(default)]
    pub llm_url: Option<String>,
    #[serde(default)]
    pub executor_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

fn override_endpoint(slot: &mut Option<EndpointConfig>, url: &Option<String>) {
    let Some(url) = url else {
        return;
    };
    match slot {
        Some(e) => e.base_url = url.clone(),
        None => {
            *slot = Some(EndpointConfig {
                base_url: url.clone(),
                timeout_secs: 5,
                model: None,
            })
        }
    }
}

impl ApiConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            database_url: std::env::var("DATABASE_URL").ok(),
            bedrock_enabled: env_flag("BEDROCK_ENABLED"),
            pipeline_config: std::env::var("PIPELINE_CONFIG").ok(),
            embedding_url: std::env::var("EMBEDDING_URL").ok(),
            classifier_url: std::env::var("CLASSIFIER_URL").ok(),
            llm_url: std::env::var("LLM_URL").ok(),
            executor_url: std::env::var("EXECUTOR_URL").ok(),
        }
    }

    /// The pipeline config file (or defaults) with URL overrides applied.
    pub fn pipeline(&self) -> PipelineResult<PipelineConfig> {
        let mut config = match &self.pipeline_config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };
        let services = &mut config.services;
        override_endpoint(&mut services.embedding, &self.embedding_url);
        override_endpoint(&mut services.classifier, &self.classifier_url);
        override_endpoint(&mut services.llm, &self.llm_url);
        override_endpoint(&mut services.executor, &self.executor_url);
        Ok(config)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_url: None,
            bedrock_enabled: false,
            pipeline_config: None,
            embedding_url: None,
            classifier_url: None,
            llm_url: None,
            executor_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ApiConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert!(!config.bedrock_enabled);
    }

    #[test]
    fn urls_override_pipeline_services() {
        let config = ApiConfig {
            embedding_url: Some("http://embed:8000".into()),
            executor_url: Some("http://biz:8080".into()),
            ..ApiConfig::default()
        };
        let pipeline = config.pipeline().unwrap();
        assert_eq!(
            pipeline.services.embedding.unwrap().base_url,
            "http://embed:8000"
        );
        assert_eq!(pipeline.services.executor.unwrap().base_url, "http://biz:8080");
        assert!(pipeline.services.llm.is_none());
    }

    #[test]
    fn missing_pipeline_file_is_config_error() {
        let config = ApiConfig {
            pipeline_config: Some("/nonexistent/pipeline.toml".into()),
            ..ApiConfig::default()
        };
        assert!(matches!(
            config.pipeline(),
            Err(intent_pipeline::PipelineError::Config(_))
        ));
    }
}
