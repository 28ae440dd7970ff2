//! Selector hints for narrowing the candidate pool.
//!
//! Supports the CSS subset that shows up in automation scripts: type and
//! universal selectors, `#id`, `.class`, attribute selectors with `=`, `~=`,
//! `|=`, `^=`, `$=` and `*=`, descendant and child combinators, and selector
//! lists. An `xpath=` prefix (or a leading `/`) matches element locators
//! directly. Pseudo-classes and sibling combinators are rejected.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::types::page::{CandidateSnapshot, ElementCandidate, SnapshotNode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,
    #[error("unexpected `{found}` at position {position}")]
    UnexpectedChar { found: char, position: usize },
    #[error("{construct} is not supported (position {position})")]
    Unsupported {
        construct: &'static str,
        position: usize,
    },
    #[error("unexpected end of selector")]
    UnexpectedEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Equals,
    Includes,
    DashMatch,
    Prefix,
    Suffix,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrSelector {
    name: String,
    test: Option<(AttrOp, String)>,
}

impl AttrSelector {
    fn matches(&self, node: &SnapshotNode) -> bool {
        let Some(actual) = node.attributes.get(&self.name) else {
            return false;
        };
        let Some((op, expected)) = &self.test else {
            return true;
        };
        match op {
            AttrOp::Equals => actual == expected,
            AttrOp::Includes => actual.split_whitespace().any(|word| word == expected),
            AttrOp::DashMatch => {
                actual == expected || actual.starts_with(&format!("{expected}-"))
            }
            AttrOp::Prefix => !expected.is_empty() && actual.starts_with(expected.as_str()),
            AttrOp::Suffix => !expected.is_empty() && actual.ends_with(expected.as_str()),
            AttrOp::Substring => !expected.is_empty() && actual.contains(expected.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attributes: Vec<AttrSelector>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.ids.is_empty()
            && self.classes.is_empty()
            && self.attributes.is_empty()
    }

    fn matches(&self, node: &SnapshotNode) -> bool {
        if let Some(tag) = &self.tag {
            if !node.tag.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if !self
            .ids
            .iter()
            .all(|id| node.attributes.get("id").is_some_and(|actual| actual == id))
        {
            return false;
        }
        if !self.classes.is_empty() {
            let classes = node.attributes.get("class").map(String::as_str).unwrap_or("");
            if !self
                .classes
                .iter()
                .all(|class| classes.split_whitespace().any(|actual| actual == class))
            {
                return false;
            }
        }
        self.attributes.iter().all(|attr| attr.matches(node))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

/// One comma-separated alternative: compounds left to right with the
/// combinator joining each compound to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    compounds: Vec<Compound>,
    combinators: Vec<Combinator>,
}

impl Complex {
    fn matches(&self, nodes: &[SnapshotNode], index: usize) -> bool {
        self.match_at(self.compounds.len() - 1, nodes, index)
    }

    fn match_at(&self, position: usize, nodes: &[SnapshotNode], index: usize) -> bool {
        let Some(node) = nodes.get(index) else {
            return false;
        };
        if !self.compounds[position].matches(node) {
            return false;
        }
        if position == 0 {
            return true;
        }
        match self.combinators[position - 1] {
            Combinator::Child => node
                .parent
                .is_some_and(|parent| self.match_at(position - 1, nodes, parent)),
            Combinator::Descendant => {
                let mut ancestor = node.parent;
                while let Some(current) = ancestor {
                    if self.match_at(position - 1, nodes, current) {
                        return true;
                    }
                    ancestor = nodes.get(current).and_then(|node| node.parent);
                }
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Css(Vec<Complex>),
    Locator(String),
}

/// A parsed selector hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorHint {
    raw: String,
    matcher: Matcher,
}

impl SelectorHint {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SelectorError::Empty);
        }
        let matcher = if let Some(path) = trimmed.strip_prefix("xpath=") {
            Matcher::Locator(path.trim().to_string())
        } else if trimmed.starts_with('/') {
            Matcher::Locator(trimmed.to_string())
        } else {
            Matcher::Css(Parser::new(trimmed).parse_list()?)
        };
        Ok(Self {
            raw: trimmed.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the arena node at `index` matches. Locator hints never match
    /// by index; use [`matches_candidate`](Self::matches_candidate).
    pub fn matches(&self, nodes: &[SnapshotNode], index: usize) -> bool {
        match &self.matcher {
            Matcher::Css(list) => list.iter().any(|complex| complex.matches(nodes, index)),
            Matcher::Locator(_) => false,
        }
    }

    pub fn matches_candidate(
        &self,
        snapshot: &CandidateSnapshot,
        candidate: &ElementCandidate,
    ) -> bool {
        match &self.matcher {
            Matcher::Css(_) => self.matches(&snapshot.nodes, candidate.id.index()),
            Matcher::Locator(path) => {
                let locator = candidate
                    .locator
                    .strip_prefix("xpath=")
                    .unwrap_or(&candidate.locator);
                locator == path
            }
        }
    }
}

impl FromStr for SelectorHint {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SelectorHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

struct Parser {
    chars: Vec<char>,
    position: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            position: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += 1;
        Some(ch)
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.position;
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
        self.position > start
    }

    fn expect(&mut self, expected: char) -> Result<(), SelectorError> {
        match self.bump() {
            Some(ch) if ch == expected => Ok(()),
            Some(found) => Err(SelectorError::UnexpectedChar {
                found,
                position: self.position - 1,
            }),
            None => Err(SelectorError::UnexpectedEnd),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<Complex>, SelectorError> {
        let mut list = vec![self.parse_complex()?];
        while self.peek() == Some(',') {
            self.bump();
            list.push(self.parse_complex()?);
        }
        match self.peek() {
            None => Ok(list),
            Some(found) => Err(SelectorError::UnexpectedChar {
                found,
                position: self.position,
            }),
        }
    }

    fn parse_complex(&mut self) -> Result<Complex, SelectorError> {
        self.skip_whitespace();
        let mut compounds = vec![self.parse_compound()?];
        let mut combinators = Vec::new();
        loop {
            let had_space = self.skip_whitespace();
            let combinator = match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.bump();
                    self.skip_whitespace();
                    Combinator::Child
                }
                Some('+') | Some('~') => {
                    return Err(SelectorError::Unsupported {
                        construct: "sibling combinator",
                        position: self.position,
                    });
                }
                Some(_) if had_space => Combinator::Descendant,
                Some(found) => {
                    return Err(SelectorError::UnexpectedChar {
                        found,
                        position: self.position,
                    });
                }
            };
            combinators.push(combinator);
            compounds.push(self.parse_compound()?);
        }
        Ok(Complex {
            compounds,
            combinators,
        })
    }

    fn parse_compound(&mut self) -> Result<Compound, SelectorError> {
        let mut compound = Compound::default();
        let mut universal = false;
        match self.peek() {
            Some('*') => {
                self.bump();
                universal = true;
            }
            Some(ch) if is_ident_char(ch) => {
                compound.tag = Some(self.parse_ident()?.to_ascii_lowercase());
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.bump();
                    compound.ids.push(self.parse_ident()?);
                }
                Some('.') => {
                    self.bump();
                    compound.classes.push(self.parse_ident()?);
                }
                Some('[') => {
                    self.bump();
                    compound.attributes.push(self.parse_attribute()?);
                }
                Some(':') => {
                    return Err(SelectorError::Unsupported {
                        construct: "pseudo-class",
                        position: self.position,
                    });
                }
                _ => break,
            }
        }
        if compound.is_empty() && !universal {
            return match self.peek() {
                Some(found) => Err(SelectorError::UnexpectedChar {
                    found,
                    position: self.position,
                }),
                None => Err(SelectorError::UnexpectedEnd),
            };
        }
        Ok(compound)
    }

    fn parse_ident(&mut self) -> Result<String, SelectorError> {
        let mut ident = String::new();
        while let Some(ch) = self.peek() {
            if ch == '\\' {
                self.bump();
                ident.push(self.bump().ok_or(SelectorError::UnexpectedEnd)?);
            } else if is_ident_char(ch) {
                self.bump();
                ident.push(ch);
            } else {
                break;
            }
        }
        if ident.is_empty() {
            return match self.peek() {
                Some(found) => Err(SelectorError::UnexpectedChar {
                    found,
                    position: self.position,
                }),
                None => Err(SelectorError::UnexpectedEnd),
            };
        }
        Ok(ident)
    }

    fn parse_attribute(&mut self) -> Result<AttrSelector, SelectorError> {
        self.skip_whitespace();
        let name = self.parse_ident()?.to_ascii_lowercase();
        self.skip_whitespace();
        let op = match self.peek() {
            Some(']') => {
                self.bump();
                return Ok(AttrSelector { name, test: None });
            }
            Some('=') => {
                self.bump();
                AttrOp::Equals
            }
            Some(prefix @ ('~' | '|' | '^' | '$' | '*')) => {
                self.bump();
                self.expect('=')?;
                match prefix {
                    '~' => AttrOp::Includes,
                    '|' => AttrOp::DashMatch,
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    _ => AttrOp::Substring,
                }
            }
            Some(found) => {
                return Err(SelectorError::UnexpectedChar {
                    found,
                    position: self.position,
                });
            }
            None => return Err(SelectorError::UnexpectedEnd),
        };
        self.skip_whitespace();
        let value = match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.bump();
                let mut value = String::new();
                loop {
                    match self.bump() {
                        Some('\\') => value.push(self.bump().ok_or(SelectorError::UnexpectedEnd)?),
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => return Err(SelectorError::UnexpectedEnd),
                    }
                }
                value
            }
            _ => self.parse_ident()?,
        };
        self.skip_whitespace();
        self.expect(']')?;
        Ok(AttrSelector {
            name,
            test: Some((op, value)),
        })
    }
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '-' || ch == '_' || !ch.is_ascii()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn node(tag: &str, attrs: &[(&str, &str)], parent: Option<usize>) -> SnapshotNode {
        SnapshotNode {
            tag: tag.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            parent,
        }
    }

    // body > div.packages > button.package-select-button (x2), form > button[data-testid]
    fn arena() -> Vec<SnapshotNode> {
        vec![
            node("body", &[], None),
            node("div", &[("class", "packages grid")], Some(0)),
            node("button", &[("class", "package-select-button"), ("id", "p25")], Some(1)),
            node("button", &[("class", "package-select-button selected")], Some(1)),
            node("form", &[("id", "cart")], Some(0)),
            node("span", &[], Some(4)),
            node(
                "button",
                &[("data-testid", "add-to-cart-button"), ("lang", "en-US")],
                Some(5),
            ),
        ]
    }

    fn matching(selector: &str) -> Vec<usize> {
        let hint = SelectorHint::parse(selector).expect("selector parses");
        let nodes = arena();
        (0..nodes.len()).filter(|i| hint.matches(&nodes, *i)).collect()
    }

    #[test]
    fn class_selector() {
        assert_eq!(matching(".package-select-button"), vec![2, 3]);
        assert_eq!(matching("button.package-select-button.selected"), vec![3]);
    }

    #[test]
    fn id_and_type_selectors() {
        assert_eq!(matching("#p25"), vec![2]);
        assert_eq!(matching("BUTTON"), vec![2, 3, 6]);
        assert_eq!(matching("*"), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn attribute_operators() {
        assert_eq!(matching("button[data-testid='add-to-cart-button']"), vec![6]);
        assert_eq!(matching("[data-testid]"), vec![6]);
        assert_eq!(matching("[data-testid^=add]"), vec![6]);
        assert_eq!(matching("[data-testid$=\"button\"]"), vec![6]);
        assert_eq!(matching("[class*=select]"), vec![2, 3]);
        assert_eq!(matching("[class~=grid]"), vec![1]);
        assert_eq!(matching("[lang|=en]"), vec![6]);
    }

    #[test]
    fn combinators() {
        assert_eq!(matching("form button"), vec![6]);
        assert_eq!(matching("form > button"), Vec::<usize>::new());
        assert_eq!(matching("div.packages>button"), vec![2, 3]);
        assert_eq!(matching("body form > span > button"), vec![6]);
    }

    #[test]
    fn selector_lists() {
        assert_eq!(matching("#p25, #cart"), vec![2, 4]);
    }

    #[test]
    fn unsupported_constructs_are_rejected() {
        assert!(matches!(
            SelectorHint::parse("button:not(.x)"),
            Err(SelectorError::Unsupported { construct: "pseudo-class", .. })
        ));
        assert!(matches!(
            SelectorHint::parse("div + button"),
            Err(SelectorError::Unsupported { .. })
        ));
        assert_eq!(SelectorHint::parse("  "), Err(SelectorError::Empty));
        assert_eq!(
            SelectorHint::parse("[data-testid='x'"),
            Err(SelectorError::UnexpectedEnd)
        );
        assert!(SelectorHint::parse("div >").is_err());
    }

    #[test]
    fn xpath_hints_match_locators() {
        let hint = SelectorHint::parse("xpath=/html/body/button[1]").expect("hint");
        let candidate = ElementCandidate {
            id: crate::types::page::CandidateId(2),
            role: "button".into(),
            tag: "button".into(),
            visible_text: "$25".into(),
            attributes: BTreeMap::new(),
            bounding_box: None,
            interactable: true,
            visible: true,
            in_viewport: true,
            locator: "xpath=/html/body/button[1]".into(),
        };
        let snapshot = CandidateSnapshot {
            url: String::new(),
            nodes: arena(),
            candidates: vec![candidate.clone()],
        };
        assert!(hint.matches_candidate(&snapshot, &candidate));
        assert!(!hint.matches(&snapshot.nodes, 2));
    }
}
