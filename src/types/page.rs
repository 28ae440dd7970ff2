use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{ExtractionSchema, ValidationError};
use crate::types::dom::BoundingBox;

/// Operation the executor performs on a resolved element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Click,
    Type,
    Select,
    Hover,
    Press,
    ScrollIntoView,
}

impl ActionKind {
    /// Parse the method names reasoning backends tend to emit.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "click" | "doubleclick" => Some(Self::Click),
            "type" | "fill" | "input" => Some(Self::Type),
            "select" | "selectoption" | "selectoptionfromdropdown" => Some(Self::Select),
            "hover" => Some(Self::Hover),
            "press" | "presskey" | "keypress" => Some(Self::Press),
            "scrollintoview" | "scrollto" | "scroll" => Some(Self::ScrollIntoView),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Select => "select",
            Self::Hover => "hover",
            Self::Press => "press",
            Self::ScrollIntoView => "scrollIntoView",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A natural-language action to ground against the current page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_kind: Option<ActionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_hint: Option<String>,
    /// Values substituted for `%name%` placeholders in backend arguments.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ActionRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            action_kind: None,
            selector_hint: None,
            variables: HashMap::new(),
            timeout_ms: None,
        }
    }

    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.action_kind = Some(kind);
        self
    }

    pub fn with_selector_hint(mut self, hint: impl Into<String>) -> Self {
        self.selector_hint = Some(hint.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Identifier of an element within one [`CandidateSnapshot`].
///
/// The value is the element's pre-order position in the DOM tree the snapshot
/// was built from, so ids compare in document order. Ids from different
/// snapshots are unrelated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub u32);

impl CandidateId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementCandidate {
    pub id: CandidateId,
    pub role: String,
    pub tag: String,
    pub visible_text: String,
    pub attributes: BTreeMap<String, String>,
    pub bounding_box: Option<BoundingBox>,
    pub interactable: bool,
    pub visible: bool,
    pub in_viewport: bool,
    pub locator: String,
}

/// Element entry in the snapshot arena. Only tag, attributes and ancestry are
/// kept, which is what selector matching needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotNode {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub parent: Option<usize>,
}

/// Result of one observer pass. Built from scratch on every observe and never
/// patched; any navigation or input makes it stale.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSnapshot {
    pub url: String,
    pub nodes: Vec<SnapshotNode>,
    /// Ranked best first and capped.
    pub candidates: Vec<ElementCandidate>,
}

impl CandidateSnapshot {
    pub fn candidate(&self, id: CandidateId) -> Option<&ElementCandidate> {
        self.candidates.iter().find(|candidate| candidate.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }
}

/// A grounded action ready for execution.
///
/// Not `Clone`: [`ActionExecutor::execute`](crate::executor::ActionExecutor::execute)
/// takes it by value, so each resolution is executed at most once.
#[derive(Debug, PartialEq)]
pub struct ResolvedAction {
    target: CandidateId,
    locator: String,
    operation: ActionKind,
    parameters: Vec<String>,
    confidence: f64,
    description: String,
}

impl ResolvedAction {
    pub(crate) fn new(
        target: CandidateId,
        locator: String,
        operation: ActionKind,
        parameters: Vec<String>,
        confidence: f64,
        description: String,
    ) -> Self {
        Self {
            target,
            locator,
            operation,
            parameters,
            confidence,
            description,
        }
    }

    pub fn target(&self) -> CandidateId {
        self.target
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn operation(&self) -> ActionKind {
        self.operation
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// How the page came to rest after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettleState {
    /// No network requests were in flight for the quiet window.
    Quiescent,
    /// The idle bound elapsed first.
    IdleTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub target: CandidateId,
    pub operation: ActionKind,
    pub settle: SettleState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActOutcome {
    pub execution: ExecutionOutcome,
    pub confidence: f64,
    /// Observe/resolve/execute passes taken. Above 1 only after a transient
    /// failure triggered the automatic retry.
    pub attempts: u32,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtractionMode {
    #[default]
    FullDom,
    TextProjection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub instruction: String,
    pub schema: ExtractionSchema,
    pub mode: ExtractionMode,
    pub timeout_ms: Option<u64>,
}

impl ExtractionRequest {
    pub fn new(instruction: impl Into<String>, schema: ExtractionSchema) -> Self {
        Self {
            instruction: instruction.into(),
            schema,
            mode: ExtractionMode::FullDom,
            timeout_ms: None,
        }
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn text_projection(self) -> Self {
        self.with_mode(ExtractionMode::TextProjection)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Outcome of an extraction. Validation failures are reported here rather
/// than as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    /// Present only when `validation_errors` is empty.
    pub data: Option<Value>,
    pub raw: String,
    pub validation_errors: Vec<ValidationError>,
}

impl ExtractionResult {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }
}
