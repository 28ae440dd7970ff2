use thiserror::Error;

use async_openai::error::OpenAIError;

use crate::backend::BackendError;

/// Errors surfaced by the chat completion layer.
#[derive(Debug, Error)]
pub enum StagehandLlmError {
    #[error("missing OpenAI API key; set MODEL_API_KEY or OPENAI_API_KEY")]
    MissingApiKey,
    #[error("missing default model configuration")]
    MissingDefaultModel,
    #[error("invalid chat completion request: {0}")]
    InvalidRequest(String),
    #[error("chat completion returned no content")]
    EmptyResponse,
    #[error(transparent)]
    OpenAi(#[from] OpenAIError),
}

impl From<StagehandLlmError> for BackendError {
    fn from(err: StagehandLlmError) -> Self {
        match err {
            StagehandLlmError::EmptyResponse => BackendError::MalformedResponse(err.to_string()),
            StagehandLlmError::MissingApiKey | StagehandLlmError::MissingDefaultModel => {
                BackendError::Unavailable(err.to_string())
            }
            StagehandLlmError::OpenAi(OpenAIError::Reqwest(ref source)) if source.is_timeout() => {
                BackendError::Timeout(err.to_string())
            }
            other => BackendError::Request(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn timed_out_request_maps_to_backend_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .expect("client");
        let source = client.get(server.uri()).send().await.expect_err("timed out");

        let err: BackendError = StagehandLlmError::OpenAi(OpenAIError::Reqwest(source)).into();
        assert!(matches!(err, BackendError::Timeout(_)), "{err:?}");
    }

    #[test]
    fn other_failures_keep_their_category() {
        assert!(matches!(
            BackendError::from(StagehandLlmError::EmptyResponse),
            BackendError::MalformedResponse(_)
        ));
        assert!(matches!(
            BackendError::from(StagehandLlmError::MissingApiKey),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            BackendError::from(StagehandLlmError::InvalidRequest("bad".into())),
            BackendError::Request(_)
        ));
    }
}
