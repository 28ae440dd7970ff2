//! The reasoning backend seam.
//!
//! The resolver and the extraction engine only see [`ReasoningBackend`]; the
//! OpenAI-compatible implementation lives in [`crate::llm`], and tests plug in
//! scripted doubles.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::types::page::{ActionKind, CandidateId, ElementCandidate};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(String),
    #[error("backend returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("backend request timed out: {0}")]
    Timeout(String),
    #[error("backend is unavailable: {0}")]
    Unavailable(String),
}

/// Grounding context for one action resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveQuery<'a> {
    pub instruction: &'a str,
    pub selector_hint: Option<&'a str>,
    pub action_kind: Option<ActionKind>,
    /// Names of the variables the caller can substitute, never their values.
    pub variable_names: &'a [String],
    pub candidates: &'a [ElementCandidate],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendMatch {
    pub candidate_id: CandidateId,
    #[serde(default)]
    pub operation: Option<ActionKind>,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

/// Plausible matches, in any order. An empty list means nothing on the page
/// fits the instruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub matches: Vec<BackendMatch>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractQuery<'a> {
    pub instruction: &'a str,
    pub content: &'a str,
    /// JSON Schema of the expected output.
    pub schema: &'a Value,
    pub text_projection: bool,
}

/// Raw backend output before any parsing or validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractResponse {
    pub raw: String,
}

/// Instruction-to-action and content-to-data inference.
///
/// Implementations must tolerate concurrent calls from several sessions.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn resolve_action(
        &self,
        query: &ResolveQuery<'_>,
    ) -> Result<ResolveResponse, BackendError>;

    async fn extract_structured(
        &self,
        query: &ExtractQuery<'_>,
    ) -> Result<ExtractResponse, BackendError>;
}

/// Bounds the number of in-flight calls to a shared backend.
pub struct ConcurrencyLimitedBackend {
    inner: Arc<dyn ReasoningBackend>,
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimitedBackend {
    pub fn new(inner: Arc<dyn ReasoningBackend>, limit: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl ReasoningBackend for ConcurrencyLimitedBackend {
    async fn resolve_action(
        &self,
        query: &ResolveQuery<'_>,
    ) -> Result<ResolveResponse, BackendError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable("backend limiter closed".to_string()))?;
        self.inner.resolve_action(query).await
    }

    async fn extract_structured(
        &self,
        query: &ExtractQuery<'_>,
    ) -> Result<ExtractResponse, BackendError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable("backend limiter closed".to_string()))?;
        self.inner.extract_structured(query).await
    }
}
