//! Extraction Engine: page content plus a schema in, validated data out.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::a11y::{inject_urls, project_dom, project_text};
use crate::backend::{BackendError, ExtractQuery, ReasoningBackend};
use crate::browser::BrowserDriver;
use crate::observer::ObservationError;
use crate::schema::{ExtractionSchema, ValidationError};
use crate::types::dom::DomSnapshot;
use crate::types::page::{ExtractionMode, ExtractionRequest, ExtractionResult};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Observation(#[from] ObservationError),
    #[error("reasoning backend failed: {0}")]
    BackendFailure(#[source] BackendError),
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionEngine;

impl ExtractionEngine {
    pub fn new() -> Self {
        Self
    }

    pub async fn extract(
        &self,
        driver: &dyn BrowserDriver,
        backend: &dyn ReasoningBackend,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResult, ExtractionError> {
        let dom = driver
            .current_dom_snapshot()
            .await
            .map_err(ObservationError::from)?;
        self.extract_from(&dom, backend, request).await
    }

    /// Run one extraction against an already captured document. The backend
    /// is called exactly once; schema problems come back in the result.
    pub async fn extract_from(
        &self,
        dom: &DomSnapshot,
        backend: &dyn ReasoningBackend,
        request: &ExtractionRequest,
    ) -> Result<ExtractionResult, ExtractionError> {
        let (content, id_to_url) = match request.mode {
            ExtractionMode::FullDom => {
                let projection = project_dom(dom);
                (projection.simplified, Some(projection.id_to_url))
            }
            ExtractionMode::TextProjection => (project_text(dom), None),
        };

        let schema = request.schema.to_json_schema();
        let query = ExtractQuery {
            instruction: &request.instruction,
            content: &content,
            schema: &schema,
            text_projection: request.mode == ExtractionMode::TextProjection,
        };
        let response = backend
            .extract_structured(&query)
            .await
            .map_err(ExtractionError::BackendFailure)?;

        Ok(interpret_output(
            response.raw,
            &request.schema,
            id_to_url.as_ref(),
        ))
    }
}

/// Parse and validate raw backend output.
pub fn interpret_output(
    raw: String,
    schema: &ExtractionSchema,
    id_to_url: Option<&HashMap<String, String>>,
) -> ExtractionResult {
    let mut value = match serde_json::from_str::<Value>(strip_code_fence(&raw)) {
        Ok(value) => value,
        Err(err) => {
            return ExtractionResult {
                data: None,
                raw,
                validation_errors: vec![ValidationError::malformed(format!(
                    "output is not JSON: {err}"
                ))],
            };
        }
    };

    if !schema.has_field("data") {
        value = unwrap_data_envelope(value);
    }
    if let Some(id_to_url) = id_to_url {
        inject_urls(&mut value, id_to_url);
    }

    let (cleaned, validation_errors) = schema.validate(&value);
    ExtractionResult {
        data: validation_errors.is_empty().then_some(cleaned),
        raw,
        validation_errors,
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    // Drop the language tag on the opening fence.
    match body.split_once('\n') {
        Some((tag, rest)) if !tag.trim().contains(['{', '[']) => rest.trim(),
        _ => body.trim(),
    }
}

fn unwrap_data_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::backend::{ExtractResponse, ResolveQuery, ResolveResponse};
    use crate::schema::{SchemaField, ValidationErrorKind};
    use crate::types::dom::RawDomNode;

    struct CannedBackend {
        raw: String,
        queries: Mutex<Vec<(String, bool)>>,
    }

    impl CannedBackend {
        fn new(raw: &str) -> Self {
            Self {
                raw: raw.to_string(),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReasoningBackend for CannedBackend {
        async fn resolve_action(
            &self,
            _query: &ResolveQuery<'_>,
        ) -> Result<ResolveResponse, BackendError> {
            Ok(ResolveResponse::default())
        }

        async fn extract_structured(
            &self,
            query: &ExtractQuery<'_>,
        ) -> Result<ExtractResponse, BackendError> {
            self.queries
                .lock()
                .unwrap()
                .push((query.content.to_string(), query.text_projection));
            Ok(ExtractResponse {
                raw: self.raw.clone(),
            })
        }
    }

    fn cart_schema() -> ExtractionSchema {
        ExtractionSchema::object([
            SchemaField::required("itemAdded", ExtractionSchema::boolean()),
            SchemaField::optional("selectedAmount", ExtractionSchema::number()),
        ])
    }

    fn cart_page() -> DomSnapshot {
        DomSnapshot::new(
            "https://shop.test/cart",
            RawDomNode::element("body").with_children(vec![
                RawDomNode::element("h1").with_text("Shopping Cart"),
                RawDomNode::element("p").with_text("Amazon.com eGift Card $50.00"),
                RawDomNode::element("a")
                    .with_attr("href", "https://shop.test/checkout")
                    .with_text("Proceed to checkout"),
            ]),
        )
    }

    #[tokio::test]
    async fn cart_extraction_yields_valid_data() {
        let backend = CannedBackend::new(r#"{"itemAdded": true, "selectedAmount": 50}"#);
        let request =
            ExtractionRequest::new("extract the cart information", cart_schema()).text_projection();

        let result = ExtractionEngine::new()
            .extract_from(&cart_page(), &backend, &request)
            .await
            .expect("extracted");

        assert!(result.is_valid());
        assert_eq!(
            result.data,
            Some(json!({ "itemAdded": true, "selectedAmount": 50 }))
        );
        let queries = backend.queries.lock().unwrap();
        assert!(queries[0].1);
        assert!(queries[0].0.contains("Amazon.com eGift Card $50.00"));
    }

    #[tokio::test]
    async fn missing_required_field_leaves_data_absent() {
        let backend = CannedBackend::new(r#"{"selectedAmount": 50}"#);
        let request = ExtractionRequest::new("extract the cart information", cart_schema());

        let result = ExtractionEngine::new()
            .extract_from(&cart_page(), &backend, &request)
            .await
            .expect("extracted");

        assert!(result.data.is_none());
        assert_eq!(result.raw, r#"{"selectedAmount": 50}"#);
        assert_eq!(result.validation_errors.len(), 1);
        assert_eq!(result.validation_errors[0].path, "$.itemAdded");
        assert!(result.validation_errors[0].is_missing_field());
    }

    #[tokio::test]
    async fn full_dom_mode_sends_outline_and_injects_link_urls() {
        let page = cart_page();
        let link_id = project_dom(&page)
            .id_to_url
            .into_iter()
            .find(|(_, url)| url.ends_with("/checkout"))
            .map(|(id, _)| id)
            .expect("link id");
        let backend = CannedBackend::new(&format!(r#"{{"checkoutUrl": {link_id}}}"#));
        let schema = ExtractionSchema::object([SchemaField::required(
            "checkoutUrl",
            ExtractionSchema::string(),
        )]);

        let result = ExtractionEngine::new()
            .extract_from(&page, &backend, &ExtractionRequest::new("checkout link", schema))
            .await
            .expect("extracted");

        assert_eq!(
            result.data,
            Some(json!({ "checkoutUrl": "https://shop.test/checkout" }))
        );
        let queries = backend.queries.lock().unwrap();
        assert!(!queries[0].1);
        assert!(queries[0].0.contains("link: Proceed to checkout"));
    }

    #[test]
    fn non_json_output_is_malformed() {
        let result = interpret_output("the cart has one item".to_string(), &cart_schema(), None);
        assert!(result.data.is_none());
        assert!(matches!(
            result.validation_errors[0].kind,
            ValidationErrorKind::MalformedOutput { .. }
        ));
        assert_eq!(result.validation_errors[0].path, "$");
    }

    #[test]
    fn data_envelope_and_code_fences_are_unwrapped() {
        let raw = "```json\n{\"data\": {\"itemAdded\": false}}\n```".to_string();
        let result = interpret_output(raw, &cart_schema(), None);
        assert_eq!(result.data, Some(json!({ "itemAdded": false })));
    }

    #[test]
    fn every_violation_is_collected() {
        let schema = ExtractionSchema::object([
            SchemaField::required("itemAdded", ExtractionSchema::boolean()),
            SchemaField::required(
                "selectedAmount",
                ExtractionSchema::number().with_minimum(25.0),
            ),
            SchemaField::required("currency", ExtractionSchema::string()),
        ]);
        let raw = r#"{"itemAdded": "yes", "selectedAmount": 10}"#.to_string();
        let result = interpret_output(raw, &schema, None);
        assert!(result.data.is_none());
        assert_eq!(result.validation_errors.len(), 3);
    }
}
