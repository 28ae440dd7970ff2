use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_openai::types::{
    ChatCompletionRequestMessage, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    CreateChatCompletionResponse, ResponseFormat,
};
use serde_json::json;

use crate::config::StagehandConfig;
use crate::logging::StagehandLogger;
use crate::metrics::{SharedMetrics, StagehandFunctionName};

use super::error::StagehandLlmError;
use super::openai::OpenAiChatProvider;
use super::provider::ChatCompletionProvider;

/// Optional parameters that influence chat completion requests.
#[derive(Debug, Default, Clone)]
pub struct ChatCompletionOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
}

/// Provider-neutral chat client that records token usage per engine operation.
pub struct StagehandLlmClient<P: ChatCompletionProvider> {
    provider: P,
    default_model: String,
    logger: Arc<StagehandLogger>,
    metrics: Option<SharedMetrics>,
}

impl<P> fmt::Debug for StagehandLlmClient<P>
where
    P: ChatCompletionProvider + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagehandLlmClient")
            .field("provider", &self.provider)
            .field("default_model", &self.default_model)
            .field("metrics_attached", &self.metrics.is_some())
            .finish()
    }
}

impl<P: ChatCompletionProvider> StagehandLlmClient<P> {
    pub fn new(default_model: impl Into<String>, provider: P, logger: Arc<StagehandLogger>) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
            logger,
            metrics: None,
        }
    }

    /// Record usage of every successful completion into `metrics`.
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn build_request(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        options: ChatCompletionOptions,
    ) -> Result<CreateChatCompletionRequest, StagehandLlmError> {
        let ChatCompletionOptions {
            model,
            temperature,
            max_completion_tokens,
            response_format,
        } = options;
        let model = model.unwrap_or_else(|| self.default_model.clone());
        if model.trim().is_empty() {
            return Err(StagehandLlmError::MissingDefaultModel);
        }

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(model);
        builder.messages(messages);
        if let Some(temperature) = temperature {
            builder.temperature(temperature);
        }
        if let Some(max_completion_tokens) = max_completion_tokens {
            builder.max_completion_tokens(max_completion_tokens);
        }
        if let Some(response_format) = response_format {
            builder.response_format(response_format);
        }

        builder
            .build()
            .map_err(|err| StagehandLlmError::InvalidRequest(err.to_string()))
    }

    /// Run one completion and return the text of its first choice.
    pub async fn complete_text(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        options: ChatCompletionOptions,
        function: StagehandFunctionName,
    ) -> Result<String, StagehandLlmError> {
        let request = self.build_request(messages, options)?;
        let response = self.execute_request(request, function).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(StagehandLlmError::EmptyResponse)
    }

    async fn execute_request(
        &self,
        request: CreateChatCompletionRequest,
        function: StagehandFunctionName,
    ) -> Result<CreateChatCompletionResponse, StagehandLlmError> {
        let model = request.model.clone();
        self.logger.debug(
            "sending chat completion request",
            Some("llm"),
            Some(json!({ "model": model, "function": function.as_str() })),
        );

        let start = Instant::now();
        match self.provider.create_chat_completion(request).await {
            Ok(response) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                self.record_usage(&response, elapsed_ms, function);
                self.logger.debug(
                    "chat completion succeeded",
                    Some("llm"),
                    Some(json!({ "model": model, "durationMs": elapsed_ms })),
                );
                Ok(response)
            }
            Err(err) => {
                self.logger.error(
                    "chat completion failed",
                    Some("llm"),
                    Some(json!({ "model": model, "error": err.to_string() })),
                );
                Err(StagehandLlmError::OpenAi(err))
            }
        }
    }

    fn record_usage(
        &self,
        response: &CreateChatCompletionResponse,
        elapsed_ms: u64,
        function: StagehandFunctionName,
    ) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let (prompt, completion) = response
            .usage
            .as_ref()
            .map(|usage| (usage.prompt_tokens as u64, usage.completion_tokens as u64))
            .unwrap_or((0, 0));
        let mut guard = match metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.record(function, prompt, completion, elapsed_ms);
    }
}

impl StagehandLlmClient<OpenAiChatProvider> {
    /// Wire the OpenAI provider from configuration.
    pub fn from_config(
        config: &StagehandConfig,
        logger: Arc<StagehandLogger>,
    ) -> Result<Self, StagehandLlmError> {
        let provider = OpenAiChatProvider::from_config(config)?;
        Ok(StagehandLlmClient::new(
            config.model_name.as_str(),
            provider,
            logger,
        ))
    }
}
