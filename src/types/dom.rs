use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Element rectangle in CSS pixels relative to the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Whether any part of the box lies inside a viewport of the given size.
    pub fn intersects_viewport(&self, viewport: &ViewportSize) -> bool {
        if self.is_empty() {
            return false;
        }
        self.x < viewport.width
            && self.y < viewport.height
            && self.x + self.width > 0.0
            && self.y + self.height > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

impl Default for ViewportSize {
    fn default() -> Self {
        Self {
            width: 1288.0,
            height: 711.0,
        }
    }
}

/// One element of the raw tree reported by a browser driver.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawDomNode {
    pub tag: String,
    /// Explicit ARIA role, if the element declares one.
    pub role: Option<String>,
    /// Accessible name computed by the driver (aria-label, alt, placeholder...).
    pub name: Option<String>,
    /// Text owned directly by this element, excluding descendants.
    pub text: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub bounding_box: Option<BoundingBox>,
    pub visible: bool,
    /// Driver-specific handle used to address the element for input dispatch.
    pub locator: Option<String>,
    pub children: Vec<RawDomNode>,
}

impl RawDomNode {
    pub fn element(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            visible: true,
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_box(mut self, bounding_box: BoundingBox) -> Self {
        self.bounding_box = Some(bounding_box);
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn with_children(mut self, children: Vec<RawDomNode>) -> Self {
        self.children = children;
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Visit every node in pre-order, passing the node's pre-order index and
    /// the index of its parent.
    pub fn walk<F>(&self, visit: &mut F)
    where
        F: FnMut(usize, Option<usize>, &RawDomNode),
    {
        let mut next = 0usize;
        walk_inner(self, None, &mut next, visit);
    }
}

fn walk_inner<F>(node: &RawDomNode, parent: Option<usize>, next: &mut usize, visit: &mut F)
where
    F: FnMut(usize, Option<usize>, &RawDomNode),
{
    let index = *next;
    *next += 1;
    visit(index, parent, node);
    for child in &node.children {
        walk_inner(child, Some(index), next, visit);
    }
}

/// Point-in-time capture of a page as reported by
/// [`BrowserDriver::current_dom_snapshot`](crate::browser::BrowserDriver::current_dom_snapshot).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DomSnapshot {
    pub url: String,
    pub title: String,
    pub viewport: ViewportSize,
    pub root: RawDomNode,
}

impl DomSnapshot {
    pub fn new(url: impl Into<String>, root: RawDomNode) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            viewport: ViewportSize::default(),
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_assigns_preorder_indices() {
        let root = RawDomNode::element("body").with_children(vec![
            RawDomNode::element("div").with_children(vec![RawDomNode::element("span")]),
            RawDomNode::element("p"),
        ]);

        let mut seen = Vec::new();
        root.walk(&mut |index, parent, node| seen.push((index, parent, node.tag.clone())));

        assert_eq!(
            seen,
            vec![
                (0, None, "body".to_string()),
                (1, Some(0), "div".to_string()),
                (2, Some(1), "span".to_string()),
                (3, Some(0), "p".to_string()),
            ]
        );
    }

    #[test]
    fn viewport_intersection() {
        let viewport = ViewportSize {
            width: 100.0,
            height: 100.0,
        };
        assert!(BoundingBox::new(10.0, 10.0, 5.0, 5.0).intersects_viewport(&viewport));
        assert!(!BoundingBox::new(10.0, 150.0, 5.0, 5.0).intersects_viewport(&viewport));
        assert!(!BoundingBox::new(10.0, 10.0, 0.0, 5.0).intersects_viewport(&viewport));
    }

    #[test]
    fn snapshot_deserializes_from_driver_json() {
        let value = serde_json::json!({
            "url": "https://example.com",
            "viewport": { "width": 800.0, "height": 600.0 },
            "root": {
                "tag": "body",
                "visible": true,
                "children": [{
                    "tag": "button",
                    "text": "Go",
                    "visible": true,
                    "attributes": { "id": "go" },
                    "boundingBox": { "x": 1.0, "y": 2.0, "width": 30.0, "height": 10.0 },
                    "locator": "xpath=/html/body/button"
                }]
            }
        });
        let snapshot: DomSnapshot = serde_json::from_value(value).expect("snapshot");
        let button = &snapshot.root.children[0];
        assert_eq!(button.attr("id"), Some("go"));
        assert_eq!(button.locator.as_deref(), Some("xpath=/html/body/button"));
        assert_eq!(snapshot.viewport.width, 800.0);
    }
}
