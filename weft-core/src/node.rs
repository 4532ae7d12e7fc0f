use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Session-local node identity. Never shared with peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(pub u64);

impl NodeKey {
    pub const ROOT: NodeKey = NodeKey(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Open property bag carried by every node.
pub type Props = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Element,
    Text,
    Decorator,
    LineBreak,
}

impl NodeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeCategory::Element => "element",
            NodeCategory::Text => "text",
            NodeCategory::Decorator => "decorator",
            NodeCategory::LineBreak => "linebreak",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "element" => Some(NodeCategory::Element),
            "text" => Some(NodeCategory::Text),
            "decorator" => Some(NodeCategory::Decorator),
            "linebreak" => Some(NodeCategory::LineBreak),
            _ => None,
        }
    }
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Element {
        first: Option<NodeKey>,
        last: Option<NodeKey>,
        size: usize,
    },
    Text {
        text: String,
    },
    LineBreak,
    Decorator,
}

impl NodeKind {
    pub fn empty(category: NodeCategory) -> Self {
        match category {
            NodeCategory::Element => NodeKind::Element { first: None, last: None, size: 0 },
            NodeCategory::Text => NodeKind::Text { text: String::new() },
            NodeCategory::Decorator => NodeKind::Decorator,
            NodeCategory::LineBreak => NodeKind::LineBreak,
        }
    }

    pub fn category(&self) -> NodeCategory {
        match self {
            NodeKind::Element { .. } => NodeCategory::Element,
            NodeKind::Text { .. } => NodeCategory::Text,
            NodeKind::Decorator => NodeCategory::Decorator,
            NodeKind::LineBreak => NodeCategory::LineBreak,
        }
    }
}

/// A node of the local tree. Siblings form a doubly linked chain owned by
/// the parent element (`first`/`last`/`size`).
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub key: NodeKey,
    pub node_type: String,
    pub parent: Option<NodeKey>,
    pub prev: Option<NodeKey>,
    pub next: Option<NodeKey>,
    pub props: Props,
    pub kind: NodeKind,
}

impl Node {
    pub fn new(key: NodeKey, node_type: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            key,
            node_type: node_type.into(),
            parent: None,
            prev: None,
            next: None,
            props: Props::new(),
            kind,
        }
    }

    pub fn category(&self) -> NodeCategory {
        self.kind.category()
    }

    pub fn is_element(&self) -> bool {
        matches!(self.kind, NodeKind::Element { .. })
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, NodeKind::Text { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }

    /// Length in chars for text nodes, 0 otherwise.
    pub fn text_len(&self) -> usize {
        self.text().map_or(0, |t| t.chars().count())
    }

    pub fn first_child(&self) -> Option<NodeKey> {
        match self.kind {
            NodeKind::Element { first, .. } => first,
            _ => None,
        }
    }

    pub fn last_child(&self) -> Option<NodeKey> {
        match self.kind {
            NodeKind::Element { last, .. } => last,
            _ => None,
        }
    }

    pub fn child_count(&self) -> usize {
        match self.kind {
            NodeKind::Element { size, .. } => size,
            _ => 0,
        }
    }

    /// Text nodes in "normal" mode take part in normalization.
    pub fn is_simple_text(&self) -> bool {
        self.is_text()
            && self
                .props
                .get("mode")
                .map_or(true, |mode| mode.as_str() == Some("normal"))
    }

    /// Two text nodes can be merged into one when nothing but their content differs.
    pub fn can_merge_with(&self, other: &Node) -> bool {
        self.is_simple_text()
            && other.is_simple_text()
            && self.node_type == other.node_type
            && self.props == other.props
    }
}

/// Registry of the type tags the editor accepts, each bound to a category.
#[derive(Debug, Clone)]
pub struct NodeTypes {
    types: HashMap<String, NodeCategory>,
}

impl Default for NodeTypes {
    fn default() -> Self {
        let mut types = Self { types: HashMap::new() };
        types
            .register("root", NodeCategory::Element)
            .register("paragraph", NodeCategory::Element)
            .register("heading", NodeCategory::Element)
            .register("quote", NodeCategory::Element)
            .register("text", NodeCategory::Text)
            .register("linebreak", NodeCategory::LineBreak);
        types
    }
}

impl NodeTypes {
    /// A registry holding only the root type.
    pub fn empty() -> Self {
        let mut types = Self { types: HashMap::new() };
        types.register("root", NodeCategory::Element);
        types
    }

    pub fn register(&mut self, node_type: impl Into<String>, category: NodeCategory) -> &mut Self {
        self.types.insert(node_type.into(), category);
        self
    }

    pub fn category_of(&self, node_type: &str) -> Option<NodeCategory> {
        self.types.get(node_type).copied()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.types.contains_key(node_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_string_forms() {
        for category in [
            NodeCategory::Element,
            NodeCategory::Text,
            NodeCategory::Decorator,
            NodeCategory::LineBreak,
        ] {
            assert_eq!(NodeCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(NodeCategory::parse("table"), None);
    }

    #[test]
    fn test_simple_text_and_merge() {
        let mut a = Node::new(NodeKey(1), "text", NodeKind::Text { text: "a".into() });
        let mut b = Node::new(NodeKey(2), "text", NodeKind::Text { text: "b".into() });
        assert!(a.can_merge_with(&b));

        b.props.insert("format".into(), json!(1));
        assert!(!a.can_merge_with(&b));

        a.props.insert("mode".into(), json!("token"));
        assert!(!a.is_simple_text());
    }

    #[test]
    fn test_default_types() {
        let types = NodeTypes::default();
        assert_eq!(types.category_of("paragraph"), Some(NodeCategory::Element));
        assert_eq!(types.category_of("linebreak"), Some(NodeCategory::LineBreak));
        assert!(!types.contains("image"));
    }
}
