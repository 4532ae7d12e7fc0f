use crate::node::{NodeKey, NodeKind};
use crate::selection::{Point, PointKind, RangeSelection};
use crate::state::EditorState;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq)]
enum Span {
    Text,
    /// Line breaks and decorators occupy one position. They are addressed
    /// through their parent element.
    Inline { parent: NodeKey, index: usize },
    Element { children: Vec<NodeKey> },
}

#[derive(Debug, Clone)]
struct Entry {
    key: NodeKey,
    start: usize,
    end: usize,
    span: Span,
}

/// Flat character offsets over a whole tree, used to carry a selection
/// across structural changes.
#[derive(Debug, Clone)]
pub struct OffsetView {
    entries: Vec<Entry>,
    index: FxHashMap<NodeKey, usize>,
    len: usize,
}

impl OffsetView {
    pub fn new(state: &EditorState) -> Self {
        let mut view = Self { entries: Vec::new(), index: FxHashMap::default(), len: 0 };
        let mut cursor = 0;
        view.visit(state, NodeKey::ROOT, None, &mut cursor);
        view.len = cursor;
        view
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn visit(&mut self, state: &EditorState, key: NodeKey, slot: Option<(NodeKey, usize)>, cursor: &mut usize) {
        let Some(node) = state.get(key) else {
            return;
        };
        let start = *cursor;
        let span = match &node.kind {
            NodeKind::Text { .. } => {
                *cursor += node.text_len();
                Span::Text
            }
            NodeKind::LineBreak | NodeKind::Decorator => {
                *cursor += 1;
                let (parent, index) = slot.unwrap_or((NodeKey::ROOT, 0));
                Span::Inline { parent, index }
            }
            NodeKind::Element { .. } => {
                let children = state.children_keys(key).unwrap_or_default();
                let mut prev_block = false;
                for (index, child) in children.iter().enumerate() {
                    let is_block = state.get(*child).is_some_and(|n| n.is_element());
                    if is_block && prev_block {
                        *cursor += 1;
                    }
                    self.visit(state, *child, Some((key, index)), cursor);
                    prev_block = is_block;
                }
                Span::Element { children }
            }
        };
        self.index.insert(key, self.entries.len());
        self.entries.push(Entry { key, start, end: *cursor, span });
    }

    fn entry(&self, key: NodeKey) -> Option<&Entry> {
        self.index.get(&key).and_then(|i| self.entries.get(*i))
    }

    /// Document offset of a point, if its node is part of this view.
    pub fn offset_of(&self, point: &Point) -> Option<usize> {
        let entry = self.entry(point.key)?;
        match (&entry.span, point.kind) {
            (Span::Text, PointKind::Text) => Some((entry.start + point.offset).min(entry.end)),
            (Span::Element { children }, PointKind::Element) => match children.get(point.offset) {
                Some(child) => self.entry(*child).map(|c| c.start),
                None => Some(entry.end),
            },
            _ => None,
        }
    }

    /// Point at a document offset. Text positions win over element
    /// positions; the earliest matching node wins among equals.
    pub fn point_at(&self, offset: usize) -> Option<Point> {
        if offset > self.len {
            return None;
        }
        let text = self
            .entries
            .iter()
            .filter(|e| e.span == Span::Text && e.start <= offset && offset <= e.end)
            .min_by_key(|e| e.start);
        if let Some(entry) = text {
            return Some(Point::text(entry.key, offset - entry.start));
        }

        let empty = self.entries.iter().find(|e| {
            matches!(&e.span, Span::Element { children } if children.is_empty()) && e.start == offset
        });
        if let Some(entry) = empty {
            return Some(Point::element(entry.key, 0));
        }

        self.entries.iter().find_map(|e| match e.span {
            Span::Inline { parent, index } if e.start == offset => Some(Point::element(parent, index)),
            Span::Inline { parent, index } if e.end == offset => Some(Point::element(parent, index + 1)),
            _ => None,
        })
    }

    /// Anchor and focus offsets, in that order.
    pub fn offsets_from_selection(&self, selection: &RangeSelection) -> Option<(usize, usize)> {
        Some((self.offset_of(&selection.anchor)?, self.offset_of(&selection.focus)?))
    }

    pub fn selection_from_offsets(&self, anchor: usize, focus: usize) -> Option<RangeSelection> {
        Some(RangeSelection::new(self.point_at(anchor)?, self.point_at(focus)?))
    }
}
