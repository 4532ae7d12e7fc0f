use crate::error::CoreError;
use crate::node::{Node, NodeKey, NodeKind};
use crate::selection::RangeSelection;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::sync::Arc;

/// Committed snapshot of the local tree. Nodes are shared between
/// snapshots and copied on first write.
#[derive(Debug, Clone)]
pub struct EditorState {
    nodes: FxHashMap<NodeKey, Arc<Node>>,
    selection: Option<RangeSelection>,
}

impl Default for EditorState {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorState {
    pub fn new() -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(
            NodeKey::ROOT,
            Arc::new(Node::new(NodeKey::ROOT, "root", NodeKind::empty(crate::NodeCategory::Element))),
        );
        Self { nodes, selection: None }
    }

    pub fn get(&self, key: NodeKey) -> Option<&Node> {
        self.nodes.get(&key).map(Arc::as_ref)
    }

    pub fn node(&self, key: NodeKey) -> Result<&Node, CoreError> {
        self.get(key).ok_or(CoreError::NodeNotFound(key))
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().child_count() == 0
    }

    pub fn root(&self) -> &Node {
        // The root entry is inserted on construction and never collected.
        self.nodes
            .get(&NodeKey::ROOT)
            .map(Arc::as_ref)
            .unwrap_or_else(|| unreachable!("root node missing from editor state"))
    }

    pub fn selection(&self) -> Option<&RangeSelection> {
        self.selection.as_ref()
    }

    pub(crate) fn set_selection(&mut self, selection: Option<RangeSelection>) {
        self.selection = selection;
    }

    pub(crate) fn insert(&mut self, node: Node) {
        self.nodes.insert(node.key, Arc::new(node));
    }

    pub(crate) fn remove(&mut self, key: NodeKey) -> Option<Arc<Node>> {
        self.nodes.remove(&key)
    }

    pub(crate) fn get_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.nodes.get_mut(&key).map(Arc::make_mut)
    }

    /// Children of `key` in sibling order.
    pub fn children_keys(&self, key: NodeKey) -> Result<Vec<NodeKey>, CoreError> {
        let node = self.node(key)?;
        let mut keys = Vec::with_capacity(node.child_count());
        let mut cursor = node.first_child();
        while let Some(child) = cursor {
            keys.push(child);
            cursor = self.node(child)?.next;
        }
        Ok(keys)
    }

    /// Whether the node is reachable from the root through parent links.
    pub fn is_attached(&self, key: NodeKey) -> bool {
        let mut cursor = Some(key);
        while let Some(current) = cursor {
            if current.is_root() {
                return true;
            }
            cursor = match self.get(current) {
                Some(node) => node.parent,
                None => return false,
            };
        }
        false
    }

    /// Plain text of a subtree. Block siblings are separated by a blank line.
    pub fn text_content(&self, key: NodeKey) -> String {
        let Some(node) = self.get(key) else {
            return String::new();
        };
        match &node.kind {
            NodeKind::Text { text } => text.clone(),
            NodeKind::LineBreak => "\n".to_string(),
            NodeKind::Decorator => String::new(),
            NodeKind::Element { .. } => {
                let children = self.children_keys(key).unwrap_or_default();
                let mut out = String::new();
                let mut prev_block = false;
                for child in children {
                    let is_block = self.get(child).is_some_and(Node::is_element);
                    if is_block && prev_block {
                        out.push_str("\n\n");
                    }
                    out.push_str(&self.text_content(child));
                    prev_block = is_block;
                }
                out
            }
        }
    }

    /// Serialized export of the attached tree.
    pub fn to_json(&self) -> Value {
        self.export_node(NodeKey::ROOT)
    }

    pub fn export_node(&self, key: NodeKey) -> Value {
        let Some(node) = self.get(key) else {
            return Value::Null;
        };
        let mut out = node.props.clone();
        out.insert("type".into(), json!(node.node_type));
        match &node.kind {
            NodeKind::Text { text } => {
                out.insert("text".into(), json!(text));
            }
            NodeKind::Element { .. } => {
                let children = self
                    .children_keys(key)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|child| self.export_node(child))
                    .collect::<Vec<_>>();
                out.insert("children".into(), Value::Array(children));
            }
            NodeKind::LineBreak | NodeKind::Decorator => {}
        }
        Value::Object(out)
    }

    /// Verifies sibling links, parent pointers and child counters of the attached tree.
    pub fn check_integrity(&self) -> Result<(), CoreError> {
        let mut stack = vec![NodeKey::ROOT];
        while let Some(key) = stack.pop() {
            let node = self.node(key)?;
            let NodeKind::Element { first, last, size } = node.kind else {
                continue;
            };
            let mut count = 0;
            let mut prev: Option<NodeKey> = None;
            let mut cursor = first;
            while let Some(child_key) = cursor {
                let child = self.node(child_key)?;
                if child.parent != Some(key) {
                    return Err(integrity(child_key, "parent pointer does not match owner"));
                }
                if child.prev != prev {
                    return Err(integrity(child_key, "previous sibling link is broken"));
                }
                count += 1;
                if count > size {
                    return Err(integrity(key, "sibling chain is longer than the child counter"));
                }
                prev = Some(child_key);
                cursor = child.next;
                stack.push(child_key);
            }
            if prev != last {
                return Err(integrity(key, "last child does not end the sibling chain"));
            }
            if count != size {
                return Err(integrity(key, "child counter does not match sibling chain"));
            }
        }
        Ok(())
    }
}

fn integrity(key: NodeKey, reason: &str) -> CoreError {
    CoreError::Integrity { key, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::Editor;
    use serde_json::json;

    #[test]
    fn test_new_state_has_root_only() {
        let state = EditorState::new();
        assert_eq!(state.len(), 1);
        assert!(state.is_empty());
        assert!(state.is_attached(NodeKey::ROOT));
        assert!(state.check_integrity().is_ok());
    }

    #[test]
    fn test_export_and_text_content() {
        let mut editor = Editor::new();
        editor
            .update(&[], |u| -> Result<(), CoreError> {
                for text in ["one", "two"] {
                    let p = u.create_element("paragraph")?;
                    let t = u.create_text(text)?;
                    u.append(p, t)?;
                    u.append(NodeKey::ROOT, p)?;
                }
                Ok(())
            })
            .unwrap();

        let state = editor.state();
        assert_eq!(state.text_content(NodeKey::ROOT), "one\n\ntwo");
        let exported = state.to_json();
        assert_eq!(exported["type"], json!("root"));
        assert_eq!(exported["children"][1]["children"][0]["text"], json!("two"));
    }
}
