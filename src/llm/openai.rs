use std::env;
use std::time::Duration;

use async_openai::error::OpenAIError;
use async_openai::types::{CreateChatCompletionRequest, CreateChatCompletionResponse};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::StagehandConfig;

use super::error::StagehandLlmError;
use super::provider::ChatCompletionProvider;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// [`ChatCompletionProvider`] backed by OpenAI-compatible APIs.
#[derive(Clone, Debug)]
pub struct OpenAiChatProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiChatProvider {
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }

    /// Build a client from `model_api_key` (or `MODEL_API_KEY` / `OPENAI_API_KEY`)
    /// and the optional `model_client_options` overrides.
    pub fn from_config(config: &StagehandConfig) -> Result<Self, StagehandLlmError> {
        let api_key = config
            .model_api_key
            .clone()
            .or_else(|| env::var("MODEL_API_KEY").ok())
            .or_else(|| env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
            .ok_or(StagehandLlmError::MissingApiKey)?;

        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        let mut timeout = DEFAULT_REQUEST_TIMEOUT;

        if let Some(options) = config.model_client_options.as_ref() {
            if let Some(api_base) =
                extract_string(options, &["api_base", "apiBase", "base_url", "baseURL"])
            {
                openai_config = openai_config.with_api_base(api_base);
            }

            if let Some(org_id) = extract_string(options, &["organization", "org_id", "orgId"]) {
                openai_config = openai_config.with_org_id(org_id);
            }

            if let Some(project_id) =
                extract_string(options, &["project", "project_id", "projectId"])
            {
                openai_config = openai_config.with_project_id(project_id);
            }

            if let Some(ms) = ["timeout_ms", "timeoutMs"]
                .iter()
                .find_map(|key| options.get(*key).and_then(Value::as_u64))
            {
                timeout = Duration::from_millis(ms);
            }
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StagehandLlmError::InvalidRequest(err.to_string()))?;

        Ok(Self::new(
            Client::with_config(openai_config).with_http_client(http),
        ))
    }
}

#[async_trait]
impl ChatCompletionProvider for OpenAiChatProvider {
    async fn create_chat_completion(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse, OpenAIError> {
        self.client.chat().create(request).await
    }
}

fn extract_string(options: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| options.get(*key).and_then(Value::as_str))
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn option_aliases_are_accepted() {
        let options = json!({ "baseURL": "http://localhost:8080/v1", "orgId": "org-1" });
        let options = options.as_object().unwrap();
        assert_eq!(
            extract_string(options, &["api_base", "apiBase", "base_url", "baseURL"]).as_deref(),
            Some("http://localhost:8080/v1")
        );
        assert!(extract_string(options, &["project", "projectId"]).is_none());
    }

    #[test]
    fn explicit_key_builds_provider() {
        let config = StagehandConfig {
            model_api_key: Some("sk-test".to_string()),
            ..StagehandConfig::default()
        };
        assert!(OpenAiChatProvider::from_config(&config).is_ok());
    }
}
