//! Instruction Resolver: grounds an [`ActionRequest`] on exactly one candidate.

use std::collections::HashMap;

use thiserror::Error;

use crate::backend::{BackendError, BackendMatch, ReasoningBackend, ResolveQuery};
use crate::config::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::selector::{SelectorError, SelectorHint};
use crate::types::page::{
    ActionKind, ActionRequest, CandidateSnapshot, ElementCandidate, ResolvedAction,
};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no element on the page matches `{instruction}`")]
    NoMatch { instruction: String },
    #[error("invalid selector hint `{hint}`: {reason}")]
    InvalidHint {
        hint: String,
        #[source]
        reason: SelectorError,
    },
    #[error("reasoning backend failed: {0}")]
    BackendFailure(#[source] BackendError),
}

impl ResolutionError {
    fn no_match(request: &ActionRequest) -> Self {
        ResolutionError::NoMatch {
            instruction: request.instruction.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstructionResolver {
    confidence_threshold: f64,
}

impl Default for InstructionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl InstructionResolver {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Resolve `request` against `snapshot`.
    ///
    /// A selector hint restricts the pool the backend may choose from; it is
    /// never used on its own. When the hint leaves a single candidate and the
    /// backend confirms it, the match is taken at full confidence.
    pub async fn resolve(
        &self,
        backend: &dyn ReasoningBackend,
        request: &ActionRequest,
        snapshot: &CandidateSnapshot,
    ) -> Result<ResolvedAction, ResolutionError> {
        let hint = request
            .selector_hint
            .as_deref()
            .map(|raw| {
                SelectorHint::parse(raw).map_err(|reason| ResolutionError::InvalidHint {
                    hint: raw.to_string(),
                    reason,
                })
            })
            .transpose()?;

        let pool: Vec<&ElementCandidate> = snapshot
            .candidates
            .iter()
            .filter(|candidate| candidate.interactable)
            .filter(|candidate| {
                hint.as_ref()
                    .is_none_or(|hint| hint.matches_candidate(snapshot, candidate))
            })
            .collect();
        if pool.is_empty() {
            return Err(ResolutionError::no_match(request));
        }
        let hinted = match (&hint, pool.as_slice()) {
            (Some(_), [only]) => Some(only.id),
            _ => None,
        };

        let grounding: Vec<ElementCandidate> = pool.iter().map(|c| (*c).clone()).collect();
        let mut variable_names: Vec<String> = request.variables.keys().cloned().collect();
        variable_names.sort();
        let query = ResolveQuery {
            instruction: &request.instruction,
            selector_hint: hint.as_ref().map(SelectorHint::as_str),
            action_kind: request.action_kind,
            variable_names: &variable_names,
            candidates: &grounding,
        };
        let response = backend
            .resolve_action(&query)
            .await
            .map_err(ResolutionError::BackendFailure)?;

        let best = response
            .matches
            .into_iter()
            .filter_map(|found| {
                let candidate = pool.iter().find(|c| c.id == found.candidate_id)?;
                let confidence = if Some(candidate.id) == hinted {
                    1.0
                } else if found.confidence.is_nan() {
                    0.0
                } else {
                    found.confidence.clamp(0.0, 1.0)
                };
                Some((*candidate, found, confidence))
            })
            .filter(|(_, _, confidence)| *confidence >= self.confidence_threshold)
            .max_by(|(a, _, a_conf), (b, _, b_conf)| {
                a_conf.total_cmp(b_conf).then_with(|| b.id.cmp(&a.id))
            });

        let Some((candidate, found, confidence)) = best else {
            return Err(ResolutionError::no_match(request));
        };
        Ok(build_action(request, candidate, found, confidence))
    }
}

fn build_action(
    request: &ActionRequest,
    candidate: &ElementCandidate,
    found: BackendMatch,
    confidence: f64,
) -> ResolvedAction {
    let operation = request
        .action_kind
        .or(found.operation)
        .unwrap_or(ActionKind::Click);
    let parameters = substitute_variables(&found.arguments, &request.variables);
    let description = if found.description.trim().is_empty() {
        format!(
            "{operation} {} \"{}\"",
            candidate.role, candidate.visible_text
        )
    } else {
        found.description
    };
    ResolvedAction::new(
        candidate.id,
        candidate.locator.clone(),
        operation,
        parameters,
        confidence,
        description,
    )
}

fn substitute_variables(args: &[String], variables: &HashMap<String, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut current = arg.clone();
            for (key, value) in variables {
                let needle = format!("%{key}%");
                current = current.replace(&needle, value);
            }
            current
        })
        .collect()
}
