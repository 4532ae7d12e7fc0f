use crate::node::{NodeKey, NodeKind};
use crate::state::EditorState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointKind {
    /// Offset counts chars inside a text node.
    Text,
    /// Offset counts children of an element.
    Element,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub key: NodeKey,
    pub offset: usize,
    pub kind: PointKind,
}

impl Point {
    pub fn text(key: NodeKey, offset: usize) -> Self {
        Self { key, offset, kind: PointKind::Text }
    }

    pub fn element(key: NodeKey, offset: usize) -> Self {
        Self { key, offset, kind: PointKind::Element }
    }

    /// A point is valid when its node is attached and the offset fits the node.
    pub fn is_valid_in(&self, state: &EditorState) -> bool {
        let Some(node) = state.get(self.key) else {
            return false;
        };
        if !state.is_attached(self.key) {
            return false;
        }
        match (&node.kind, self.kind) {
            (NodeKind::Text { .. }, PointKind::Text) => self.offset <= node.text_len(),
            (NodeKind::Element { size, .. }, PointKind::Element) => self.offset <= *size,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeSelection {
    pub anchor: Point,
    pub focus: Point,
}

impl RangeSelection {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self { anchor, focus }
    }

    pub fn collapsed(point: Point) -> Self {
        Self { anchor: point, focus: point }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    pub fn needs_recovery(&self, state: &EditorState) -> bool {
        !self.anchor.is_valid_in(state) || !self.focus.is_valid_in(state)
    }

    /// Caret offset inside `key`, if the selection is a caret placed in that node.
    pub fn caret_in(&self, key: NodeKey) -> Option<usize> {
        (self.is_collapsed() && self.anchor.key == key && self.anchor.kind == PointKind::Text)
            .then_some(self.anchor.offset)
    }
}

/// The last position of the document: end of the deepest last text node,
/// or the end of the deepest last element.
pub fn end_of_document(state: &EditorState) -> Point {
    let mut key = NodeKey::ROOT;
    loop {
        let Some(node) = state.get(key) else {
            return Point::element(NodeKey::ROOT, state.root().child_count());
        };
        match &node.kind {
            NodeKind::Element { last: Some(last), .. } => {
                let is_block = state.get(*last).is_some_and(|child| child.is_element() || child.is_text());
                if is_block {
                    key = *last;
                } else {
                    return Point::element(key, node.child_count());
                }
            }
            NodeKind::Element { last: None, .. } => return Point::element(key, 0),
            NodeKind::Text { .. } => return Point::text(key, node.text_len()),
            _ => return Point::element(NodeKey::ROOT, state.root().child_count()),
        }
    }
}

pub fn select_end(state: &EditorState) -> RangeSelection {
    RangeSelection::collapsed(end_of_document(state))
}
