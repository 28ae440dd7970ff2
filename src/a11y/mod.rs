//! Content projections of a [`DomSnapshot`].
//!
//! Full-DOM extraction receives an accessibility-like outline: one line per
//! meaningful node, `[id] role: name`, indented by depth, with structural
//! wrappers collapsed. Text-projection extraction receives only the visible
//! text, one block per line. Node ids are pre-order positions in the raw tree,
//! the same numbering the observer uses for candidates.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::dom::{DomSnapshot, RawDomNode};

const MAX_NAME_CHARS: usize = 200;

/// One node of the projected outline.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedNode {
    pub id: u32,
    pub role: String,
    pub name: Option<String>,
    pub children: Vec<ProjectedNode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentProjection {
    pub tree: Vec<ProjectedNode>,
    pub simplified: String,
    /// Link node id (as a string) to its href.
    pub id_to_url: HashMap<String, String>,
}

pub fn format_simplified_tree(node: &ProjectedNode, level: usize) -> String {
    let indent = "  ".repeat(level);
    let name_part = node
        .name
        .as_ref()
        .filter(|name| !name.is_empty())
        .map(|name| format!(": {name}"))
        .unwrap_or_default();
    let mut result = format!("{indent}[{}] {}{name_part}\n", node.id, node.role);
    for child in &node.children {
        result.push_str(&format_simplified_tree(child, level + 1));
    }
    result
}

pub(crate) fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(value: String, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value;
    }
    let mut truncated: String = value.chars().take(limit).collect();
    truncated.push('…');
    truncated
}

/// ARIA role of an element: the explicit role if present, otherwise the
/// implicit role of its tag.
pub fn element_role(node: &RawDomNode) -> String {
    if let Some(role) = node
        .role
        .as_deref()
        .or_else(|| node.attr("role"))
        .map(str::trim)
        .filter(|role| !role.is_empty())
    {
        return role.to_ascii_lowercase();
    }

    let tag = node.tag.to_ascii_lowercase();
    let role = match tag.as_str() {
        "a" if node.attr("href").is_some() => "link",
        "button" | "summary" => "button",
        "input" => match node
            .attr("type")
            .map(str::to_ascii_lowercase)
            .as_deref()
            .unwrap_or("text")
        {
            "checkbox" => "checkbox",
            "radio" => "radio",
            "button" | "submit" | "reset" | "image" => "button",
            "range" => "slider",
            "number" => "spinbutton",
            "search" => "searchbox",
            "hidden" => "none",
            _ => "textbox",
        },
        "select" => "combobox",
        "textarea" => "textbox",
        "option" => "option",
        "img" => "img",
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
        "ul" | "ol" => "list",
        "li" => "listitem",
        "nav" => "navigation",
        "main" => "main",
        "header" => "banner",
        "footer" => "contentinfo",
        "form" => "form",
        "table" => "table",
        "tr" => "row",
        "td" => "cell",
        "th" => "columnheader",
        "dialog" => "dialog",
        "section" => "region",
        "article" => "article",
        "aside" => "complementary",
        "p" => "paragraph",
        "label" => "label",
        _ => "generic",
    };
    role.to_string()
}

/// Name given to an element without looking at its descendants.
fn own_name(node: &RawDomNode) -> Option<String> {
    node.name
        .as_deref()
        .or_else(|| node.attr("aria-label"))
        .or_else(|| node.attr("alt"))
        .or_else(|| node.attr("title"))
        .or_else(|| node.attr("placeholder"))
        .map(normalize_whitespace)
        .filter(|name| !name.is_empty())
}

/// Visible text of an element and its visible descendants.
pub fn text_content(node: &RawDomNode) -> String {
    fn collect(node: &RawDomNode, out: &mut Vec<String>) {
        if !node.visible {
            return;
        }
        if let Some(text) = node.text.as_deref() {
            let text = normalize_whitespace(text);
            if !text.is_empty() {
                out.push(text);
            }
        }
        for child in &node.children {
            collect(child, out);
        }
    }
    let mut parts = Vec::new();
    collect(node, &mut parts);
    parts.join(" ")
}

/// Label a user would read for this element: its explicit name, else its
/// visible text, else its form value.
pub fn accessible_name(node: &RawDomNode) -> Option<String> {
    own_name(node)
        .or_else(|| Some(text_content(node)).filter(|text| !text.is_empty()))
        .or_else(|| {
            node.attr("value")
                .map(normalize_whitespace)
                .filter(|value| !value.is_empty())
        })
        .map(|name| truncate_chars(name, MAX_NAME_CHARS))
}

fn subtree_size(node: &RawDomNode) -> u32 {
    1 + node.children.iter().map(subtree_size).sum::<u32>()
}

fn is_structural(role: &str) -> bool {
    matches!(role, "generic" | "none" | "presentation")
}

fn remove_redundant_static_text_children(
    parent_name: Option<&str>,
    children: Vec<ProjectedNode>,
) -> Vec<ProjectedNode> {
    let Some(target) = parent_name
        .map(normalize_whitespace)
        .filter(|name| !name.is_empty())
    else {
        return children;
    };

    let combined = children
        .iter()
        .filter(|child| child.role == "StaticText")
        .filter_map(|child| child.name.as_deref())
        .map(normalize_whitespace)
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    if combined == target {
        children
            .into_iter()
            .filter(|child| child.role != "StaticText")
            .collect()
    } else {
        children
    }
}

fn project_node(
    node: &RawDomNode,
    next: &mut u32,
    id_to_url: &mut HashMap<String, String>,
) -> Option<ProjectedNode> {
    if !node.visible {
        *next += subtree_size(node);
        return None;
    }

    let id = *next;
    *next += 1;

    let mut role = element_role(node);
    if role == "link" {
        if let Some(href) = node.attr("href").filter(|href| !href.is_empty()) {
            id_to_url.insert(id.to_string(), href.to_string());
        }
    }

    let children: Vec<ProjectedNode> = node
        .children
        .iter()
        .filter_map(|child| project_node(child, next, id_to_url))
        .collect();

    let own_text = node
        .text
        .as_deref()
        .map(normalize_whitespace)
        .filter(|text| !text.is_empty());

    let name = if is_structural(&role) {
        match own_text {
            Some(text) => {
                role = "StaticText".to_string();
                Some(truncate_chars(text, MAX_NAME_CHARS))
            }
            None => own_name(node),
        }
    } else {
        accessible_name(node)
    };

    if is_structural(&role) && name.is_none() {
        let mut children = children;
        return match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(ProjectedNode {
                id,
                role,
                name,
                children,
            }),
        };
    }

    let children = remove_redundant_static_text_children(name.as_deref(), children);
    Some(ProjectedNode {
        id,
        role,
        name,
        children,
    })
}

/// Accessibility-like outline used for full-DOM extraction.
pub fn project_dom(snapshot: &DomSnapshot) -> ContentProjection {
    let mut next = 0u32;
    let mut id_to_url = HashMap::new();
    let tree: Vec<ProjectedNode> = project_node(&snapshot.root, &mut next, &mut id_to_url)
        .into_iter()
        .collect();
    let simplified = tree
        .iter()
        .map(|node| format_simplified_tree(node, 0))
        .collect::<Vec<_>>()
        .join("\n");
    ContentProjection {
        tree,
        simplified,
        id_to_url,
    }
}

/// Visible text of the page, one text block per line. Images contribute their
/// alt text and form fields their current value.
pub fn project_text(snapshot: &DomSnapshot) -> String {
    fn collect(node: &RawDomNode, lines: &mut Vec<String>) {
        if !node.visible {
            return;
        }
        let tag = node.tag.to_ascii_lowercase();
        let line = match tag.as_str() {
            "img" => node
                .attr("alt")
                .map(normalize_whitespace)
                .filter(|alt| !alt.is_empty())
                .map(|alt| format!("[image: {alt}]")),
            "input" | "textarea" | "select" => node
                .attr("value")
                .map(normalize_whitespace)
                .filter(|value| !value.is_empty())
                .map(|value| match own_name(node) {
                    Some(label) => format!("{label}: {value}"),
                    None => value,
                }),
            _ => node
                .text
                .as_deref()
                .map(normalize_whitespace)
                .filter(|text| !text.is_empty()),
        };
        if let Some(line) = line {
            if lines.last() != Some(&line) {
                lines.push(line);
            }
        }
        for child in &node.children {
            collect(child, lines);
        }
    }

    let mut lines = Vec::new();
    collect(&snapshot.root, &mut lines);
    lines.join("\n")
}

/// Replace link ids with their hrefs in every field whose name contains
/// `url`, at any depth.
pub fn inject_urls(value: &mut Value, id_to_url: &HashMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key.to_ascii_lowercase().contains("url") {
                    replace_with_url(val, id_to_url);
                }
                inject_urls(val, id_to_url);
            }
        }
        Value::Array(items) => {
            for item in items {
                inject_urls(item, id_to_url);
            }
        }
        _ => {}
    }
}

fn replace_with_url(value: &mut Value, id_to_url: &HashMap<String, String>) {
    let id = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        Value::Array(items) => {
            for item in items {
                replace_with_url(item, id_to_url);
            }
            return;
        }
        _ => None,
    };
    if let Some(url) = id.and_then(|id| id_to_url.get(&id.to_string())) {
        *value = Value::String(url.clone());
    }
}
