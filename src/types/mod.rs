//! Shared data structures for the grounding and extraction pipelines.
//!
//! `dom` holds the raw tree a browser driver reports; `page` holds the
//! requests, candidates and outcomes that flow between the components.

pub mod dom;
pub mod page;

pub use dom::{BoundingBox, DomSnapshot, RawDomNode, ViewportSize};
pub use page::{
    ActOutcome, ActionKind, ActionRequest, CandidateId, CandidateSnapshot, ElementCandidate,
    ExecutionOutcome, ExtractionMode, ExtractionRequest, ExtractionResult, ResolvedAction,
    SettleState, SnapshotNode,
};
