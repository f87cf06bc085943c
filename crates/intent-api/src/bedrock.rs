//! AWS Bedrock LLM backend over the model-agnostic Converse API.
//!
//! Serves every LLM call the pipeline makes (rewrite, rerank, fallback,
//! clarification questions, tool tournament) when `BEDROCK_ENABLED` is set.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_bedrockruntime::Client as BedrockClient;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, ConverseOutput, InferenceConfiguration, Message,
    SystemContentBlock,
};
use tokio::time::timeout;

use intent_pipeline::services::{ChatOptions, LlmService, ServiceResult};
use intent_pipeline::ServiceError;

/// Configuration for the Bedrock backend.
#[derive(Debug, Clone)]
pub struct BedrockConfig {
    /// Bedrock model ID (e.g., "us.amazon.nova-lite-v1:0").
    pub model_id: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl BedrockConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let model_id =
            std::env::var("BEDROCK_MODEL_ID").unwrap_or_else(|_| "us.amazon.nova-lite-v1:0".into());
        let timeout_secs: u64 = std::env::var("BEDROCK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);
        Self {
            model_id,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

pub struct BedrockLlm {
    client: BedrockClient,
    config: BedrockConfig,
}

impl BedrockLlm {
    /// Create a backend with a pre-built Bedrock client.
    pub fn new(client: BedrockClient, config: BedrockConfig) -> Self {
        Self { client, config }
    }

    /// Build the client from the default AWS credential chain.
    pub async fn from_env() -> Self {
        let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(BedrockClient::new(&aws), BedrockConfig::from_env())
    }

    async fn converse(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: ChatOptions,
    ) -> anyhow::Result<Option<String>> {
        let user_message = Message::builder()
            .role(ConversationRole::User)
            .content(ContentBlock::Text(user_prompt.to_string()))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build message: {e}"))?;

        let inference = InferenceConfiguration::builder()
            .temperature(options.temperature)
            .max_tokens(i32::try_from(options.max_tokens).unwrap_or(i32::MAX))
            .build();

        let response = self
            .client
            .converse()
            .model_id(&self.config.model_id)
            .system(SystemContentBlock::Text(system_prompt.to_string()))
            .messages(user_message)
            .inference_config(inference)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("bedrock converse error: {e}"))?;

        let output = response
            .output()
            .ok_or_else(|| anyhow::anyhow!("no output in bedrock response"))?;

        Ok(match output {
            ConverseOutput::Message(msg) => first_text(msg.content()),
            _ => None,
        })
    }
}

fn first_text(blocks: &[ContentBlock]) -> Option<String> {
    blocks.iter().find_map(|block| match block {
        ContentBlock::Text(t) => Some(t.clone()),
        _ => None,
    })
}

#[async_trait]
impl LlmService for BedrockLlm {
    async fn chat(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: ChatOptions,
    ) -> ServiceResult<String> {
        match timeout(self.config.timeout, self.converse(system_prompt, user_prompt, options)).await {
            Ok(Ok(Some(text))) => Ok(text),
            Ok(Ok(None)) => Err(ServiceError::InvalidResponse(
                "bedrock returned no text block".into(),
            )),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "bedrock call failed");
                Err(ServiceError::Unavailable(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.timeout.as_secs(),
                    "bedrock call timed out"
                );
                Err(ServiceError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_text_skips_non_text_blocks() {
        let blocks = vec![ContentBlock::Text("{\"intent_code\": \"ALERT_QUERY\"}".into())];
        assert_eq!(
            first_text(&blocks).as_deref(),
            Some("{\"intent_code\": \"ALERT_QUERY\"}")
        );
        assert!(first_text(&[]).is_none());
    }

    #[test]
    fn config_defaults_without_env() {
        // SAFETY: test-only; no other test in this crate reads these vars.
        unsafe {
            std::env::remove_var("BEDROCK_MODEL_ID");
            std::env::remove_var("BEDROCK_TIMEOUT_SECS");
        }
        let c = BedrockConfig::from_env();
        assert_eq!(c.model_id, "us.amazon.nova-lite-v1:0");
        assert_eq!(c.timeout, Duration::from_secs(5));
    }
}
