//! Page Observer: turns the live document into a bounded, ranked candidate set.

use std::cmp::Reverse;

use thiserror::Error;

use crate::a11y::{accessible_name, element_role, normalize_whitespace};
use crate::browser::{BrowserDriver, DriverError};
use crate::config::DEFAULT_MAX_CANDIDATES;
use crate::types::dom::{DomSnapshot, RawDomNode};
use crate::types::page::{CandidateId, CandidateSnapshot, ElementCandidate, SnapshotNode};

/// The page could not be observed right now. Retry after a settle wait.
#[derive(Debug, Error)]
pub enum ObservationError {
    #[error("page is mid-navigation")]
    Navigating,
    #[error("page is unreachable: {0}")]
    Unreachable(String),
}

impl From<DriverError> for ObservationError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Navigating | DriverError::TargetDetached(_) => {
                ObservationError::Navigating
            }
            other => ObservationError::Unreachable(other.to_string()),
        }
    }
}

const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "checkbox",
    "combobox",
    "link",
    "listbox",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "radio",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
    "tab",
    "textbox",
    "treeitem",
];

const SCORE_INTERACTABLE: u8 = 8;
const SCORE_VISIBLE: u8 = 4;
const SCORE_IN_VIEWPORT: u8 = 2;
const SCORE_HAS_TEXT: u8 = 1;

fn is_interactive(node: &RawDomNode, role: &str) -> bool {
    let tag = node.tag.to_ascii_lowercase();
    match tag.as_str() {
        "a" if node.attr("href").is_some() => return true,
        "button" | "select" | "textarea" | "option" | "summary" => return true,
        "input" => {
            return !node
                .attr("type")
                .is_some_and(|kind| kind.eq_ignore_ascii_case("hidden"));
        }
        _ => {}
    }
    INTERACTIVE_ROLES.contains(&role)
        || node.attr("onclick").is_some()
        || node
            .attr("tabindex")
            .and_then(|value| value.trim().parse::<i32>().ok())
            .is_some_and(|index| index >= 0)
        || node
            .attr("contenteditable")
            .is_some_and(|value| value.is_empty() || value.eq_ignore_ascii_case("true"))
}

fn is_disabled(node: &RawDomNode) -> bool {
    node.attr("disabled").is_some()
        || node
            .attr("aria-disabled")
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

fn score(candidate: &ElementCandidate) -> u8 {
    let mut score = 0;
    if candidate.interactable {
        score += SCORE_INTERACTABLE;
    }
    if candidate.visible {
        score += SCORE_VISIBLE;
    }
    if candidate.in_viewport {
        score += SCORE_IN_VIEWPORT;
    }
    if !candidate.visible_text.is_empty() {
        score += SCORE_HAS_TEXT;
    }
    score
}

#[derive(Debug, Clone)]
pub struct PageObserver {
    max_candidates: usize,
}

impl Default for PageObserver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CANDIDATES)
    }
}

impl PageObserver {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            max_candidates: max_candidates.max(1),
        }
    }

    pub fn max_candidates(&self) -> usize {
        self.max_candidates
    }

    /// Capture the page and rank its candidates. Nothing is cached between
    /// calls.
    pub async fn observe(
        &self,
        driver: &dyn BrowserDriver,
    ) -> Result<CandidateSnapshot, ObservationError> {
        let dom = driver.current_dom_snapshot().await?;
        Ok(self.build_snapshot(&dom))
    }

    pub fn build_snapshot(&self, dom: &DomSnapshot) -> CandidateSnapshot {
        let mut nodes: Vec<SnapshotNode> = Vec::new();
        let mut effective_visible: Vec<bool> = Vec::new();
        let mut candidates: Vec<ElementCandidate> = Vec::new();

        dom.root.walk(&mut |index, parent, node| {
            let visible = node.visible && parent.is_none_or(|p| effective_visible[p]);
            effective_visible.push(visible);
            nodes.push(SnapshotNode {
                tag: node.tag.to_ascii_lowercase(),
                attributes: node.attributes.clone(),
                parent,
            });

            let role = element_role(node);
            let interactive = is_interactive(node, &role);
            let has_own_text = node
                .text
                .as_deref()
                .is_some_and(|text| !normalize_whitespace(text).is_empty());
            if !interactive && !(visible && has_own_text) {
                return;
            }

            let in_viewport = visible
                && node
                    .bounding_box
                    .is_some_and(|bounds| bounds.intersects_viewport(&dom.viewport));
            candidates.push(ElementCandidate {
                id: CandidateId(index as u32),
                role,
                tag: node.tag.to_ascii_lowercase(),
                visible_text: accessible_name(node).unwrap_or_default(),
                attributes: node.attributes.clone(),
                bounding_box: node.bounding_box,
                interactable: interactive && visible && !is_disabled(node),
                visible,
                in_viewport,
                locator: node.locator.clone().unwrap_or_default(),
            });
        });

        candidates.sort_by_key(|candidate| Reverse(score(candidate)));
        candidates.truncate(self.max_candidates);

        CandidateSnapshot {
            url: dom.url.clone(),
            nodes,
            candidates,
        }
    }
}
