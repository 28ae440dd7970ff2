//! [`ReasoningBackend`] implemented on top of a chat completion model.

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use serde_json::Value;

use crate::backend::{
    BackendError, ExtractQuery, ExtractResponse, ReasoningBackend, ResolveQuery, ResolveResponse,
};
use crate::metrics::StagehandFunctionName;

use super::client::{ChatCompletionOptions, StagehandLlmClient};
use super::error::StagehandLlmError;
use super::prompts::{
    build_act_system_prompt, build_act_user_message, build_extract_system_prompt,
    build_extract_user_prompt,
};
use super::provider::ChatCompletionProvider;

pub struct LlmReasoningBackend<P: ChatCompletionProvider> {
    client: StagehandLlmClient<P>,
    system_prompt: Option<String>,
}

impl<P: ChatCompletionProvider> LlmReasoningBackend<P> {
    pub fn new(client: StagehandLlmClient<P>) -> Self {
        Self {
            client,
            system_prompt: None,
        }
    }

    /// Append caller instructions to every system prompt.
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn client(&self) -> &StagehandLlmClient<P> {
        &self.client
    }
}

fn messages(system: String, user: String) -> Result<Vec<ChatCompletionRequestMessage>, BackendError> {
    let system = ChatCompletionRequestSystemMessageArgs::default()
        .content(system)
        .build()
        .map_err(|err| StagehandLlmError::InvalidRequest(err.to_string()))?;
    let user = ChatCompletionRequestUserMessageArgs::default()
        .content(user)
        .build()
        .map_err(|err| StagehandLlmError::InvalidRequest(err.to_string()))?;
    Ok(vec![system.into(), user.into()])
}

fn extract_response_format(schema: &Value) -> ResponseFormat {
    ResponseFormat::JsonSchema {
        json_schema: ResponseFormatJsonSchema {
            description: None,
            name: "extraction_schema".to_string(),
            schema: Some(schema.clone()),
            strict: Some(false),
        },
    }
}

/// Parse the act reply, tolerating a fenced block and a bare array of matches.
fn parse_resolve_response(raw: &str) -> Result<ResolveResponse, BackendError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let value: Value = serde_json::from_str(body)
        .map_err(|err| BackendError::MalformedResponse(format!("act reply is not JSON: {err}")))?;
    let value = match value {
        Value::Array(matches) => serde_json::json!({ "matches": matches }),
        other => other,
    };
    serde_json::from_value(value)
        .map_err(|err| BackendError::MalformedResponse(format!("unexpected act reply: {err}")))
}

#[async_trait]
impl<P: ChatCompletionProvider> ReasoningBackend for LlmReasoningBackend<P> {
    async fn resolve_action(
        &self,
        query: &ResolveQuery<'_>,
    ) -> Result<ResolveResponse, BackendError> {
        let messages = messages(
            build_act_system_prompt(self.system_prompt.as_deref()),
            build_act_user_message(query),
        )?;
        let options = ChatCompletionOptions {
            temperature: Some(0.1),
            response_format: Some(ResponseFormat::JsonObject),
            ..ChatCompletionOptions::default()
        };
        let raw = self
            .client
            .complete_text(messages, options, StagehandFunctionName::Act)
            .await?;
        parse_resolve_response(&raw)
    }

    async fn extract_structured(
        &self,
        query: &ExtractQuery<'_>,
    ) -> Result<ExtractResponse, BackendError> {
        let messages = messages(
            build_extract_system_prompt(query.text_projection, self.system_prompt.as_deref()),
            build_extract_user_prompt(query.instruction, query.content),
        )?;
        let options = ChatCompletionOptions {
            temperature: Some(0.1),
            response_format: Some(extract_response_format(query.schema)),
            ..ChatCompletionOptions::default()
        };
        let raw = self
            .client
            .complete_text(messages, options, StagehandFunctionName::Extract)
            .await?;
        Ok(ExtractResponse { raw })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::backend::BackendMatch;
    use crate::llm::client::tests::RecordingProvider;
    use crate::logging::StagehandLogger;
    use crate::types::page::{ActionKind, CandidateId, ElementCandidate};

    fn backend(reply: &str) -> LlmReasoningBackend<RecordingProvider> {
        LlmReasoningBackend::new(StagehandLlmClient::new(
            "gpt-4o",
            RecordingProvider::replying(reply),
            Arc::new(StagehandLogger::default()),
        ))
    }

    fn button(id: u32, text: &str) -> ElementCandidate {
        ElementCandidate {
            id: CandidateId(id),
            role: "button".to_string(),
            tag: "button".to_string(),
            visible_text: text.to_string(),
            attributes: BTreeMap::new(),
            bounding_box: None,
            interactable: true,
            visible: true,
            in_viewport: true,
            locator: format!("xpath=/html[1]/body[1]/button[{id}]"),
        }
    }

    #[tokio::test]
    async fn act_reply_is_parsed_into_matches() {
        let backend = backend(
            r#"{"matches":[{"candidateId":4,"operation":"click","confidence":0.92,"description":"click $100"}]}"#,
        );
        let candidates = vec![button(2, "$25"), button(4, "$100")];
        let query = ResolveQuery {
            instruction: "click the $100 gift card",
            selector_hint: None,
            action_kind: None,
            variable_names: &[],
            candidates: &candidates,
        };

        let response = backend.resolve_action(&query).await.expect("resolve");
        assert_eq!(
            response.matches,
            vec![BackendMatch {
                candidate_id: CandidateId(4),
                operation: Some(ActionKind::Click),
                arguments: Vec::new(),
                confidence: 0.92,
                description: "click $100".to_string(),
            }]
        );

        let requests = backend.client().provider().requests.lock().await;
        assert!(matches!(
            requests[0].response_format,
            Some(ResponseFormat::JsonObject)
        ));
    }

    #[tokio::test]
    async fn extraction_sends_schema_and_returns_raw_text() {
        let backend = backend(r#"{"itemAdded":true}"#)
            .with_system_prompt(Some("Answer tersely.".to_string()));
        let schema = json!({ "type": "object", "properties": { "itemAdded": { "type": "boolean" } } });
        let query = ExtractQuery {
            instruction: "was the item added?",
            content: "Added to cart",
            schema: &schema,
            text_projection: true,
        };

        let response = backend.extract_structured(&query).await.expect("extract");
        assert_eq!(response.raw, r#"{"itemAdded":true}"#);

        let requests = backend.client().provider().requests.lock().await;
        match &requests[0].response_format {
            Some(ResponseFormat::JsonSchema { json_schema }) => {
                assert_eq!(json_schema.name, "extraction_schema");
                assert_eq!(json_schema.schema.as_ref(), Some(&schema));
            }
            other => panic!("unexpected response format: {other:?}"),
        }
    }

    #[test]
    fn bare_and_fenced_act_replies_are_accepted() {
        let fenced = parse_resolve_response("```json\n{\"matches\":[]}\n```").expect("fenced");
        assert!(fenced.matches.is_empty());

        let bare = parse_resolve_response(r#"[{"candidateId":1,"confidence":0.7}]"#).expect("bare");
        assert_eq!(bare.matches[0].candidate_id, CandidateId(1));

        assert!(matches!(
            parse_resolve_response("I think the second button"),
            Err(BackendError::MalformedResponse(_))
        ));
    }
}
