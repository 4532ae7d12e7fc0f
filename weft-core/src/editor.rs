use crate::error::CoreError;
use crate::node::{Node, NodeCategory, NodeKey, NodeKind, NodeTypes, Props};
use crate::selection::{Point, PointKind, RangeSelection};
use crate::state::EditorState;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// Tag carried by updates that apply changes received from peers.
pub const COLLABORATION_TAG: &str = "collaboration";
/// Tag carried by undo/redo replays.
pub const HISTORIC_TAG: &str = "historic";

/// Nodes written during an update.
///
/// Elements map to `true` when written directly and `false` when only a
/// descendant changed.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    pub elements: FxHashMap<NodeKey, bool>,
    pub leaves: FxHashSet<NodeKey>,
}

impl DirtySet {
    pub fn is_element_dirty(&self, key: NodeKey) -> bool {
        self.elements.contains_key(&key)
    }

    pub fn is_intentionally_dirty(&self, key: NodeKey) -> bool {
        self.elements.get(&key).copied().unwrap_or(false)
    }

    pub fn is_leaf_dirty(&self, key: NodeKey) -> bool {
        self.leaves.contains(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.leaves.is_empty()
    }
}

/// Everything a listener needs to know about one committed update.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub prev_state: EditorState,
    pub next_state: EditorState,
    pub dirty: DirtySet,
    pub normalized_nodes: FxHashSet<NodeKey>,
    pub tags: BTreeSet<String>,
}

impl UpdateRecord {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Updates that replay changes which already exist in the replica.
    pub fn is_replayed(&self) -> bool {
        self.has_tag(COLLABORATION_TAG) || self.has_tag(HISTORIC_TAG)
    }
}

pub struct Editor {
    state: EditorState,
    types: NodeTypes,
    next_key: u64,
}

impl Default for Editor {
    fn default() -> Self {
        Self::new()
    }
}

impl Editor {
    pub fn new() -> Self {
        Self::with_types(NodeTypes::default())
    }

    pub fn with_types(types: NodeTypes) -> Self {
        Self { state: EditorState::new(), types, next_key: 1 }
    }

    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn types(&self) -> &NodeTypes {
        &self.types
    }

    /// Runs `f` as one batch. The committed state only changes when `f`
    /// and the commit both succeed.
    pub fn update<F, R, E>(&mut self, tags: &[&str], f: F) -> Result<(R, UpdateRecord), E>
    where
        F: FnOnce(&mut EditorUpdate<'_>) -> Result<R, E>,
        E: From<CoreError>,
    {
        let mut update = EditorUpdate {
            prev: self.state.clone(),
            pending: self.state.clone(),
            types: &self.types,
            next_key: &mut self.next_key,
            dirty: DirtySet::default(),
            normalized: FxHashSet::default(),
            separate: FxHashSet::default(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
        };
        let value = f(&mut update)?;
        let record = update.commit()?;
        self.state = record.next_state.clone();
        log::trace!(
            "committed update: {} dirty elements, {} dirty leaves, tags {:?}",
            record.dirty.elements.len(),
            record.dirty.leaves.len(),
            record.tags
        );
        Ok((value, record))
    }
}

/// Mutable view of the pending state inside [`Editor::update`].
pub struct EditorUpdate<'a> {
    prev: EditorState,
    pending: EditorState,
    types: &'a NodeTypes,
    next_key: &'a mut u64,
    dirty: DirtySet,
    normalized: FxHashSet<NodeKey>,
    separate: FxHashSet<NodeKey>,
    tags: BTreeSet<String>,
}

impl<'a> EditorUpdate<'a> {
    /// The committed state this update started from.
    pub fn prev_state(&self) -> &EditorState {
        &self.prev
    }

    /// Nodes written so far in this update.
    pub fn dirty(&self) -> &DirtySet {
        &self.dirty
    }

    /// Keeps normalization from merging `key` into a preceding text node.
    /// It may still absorb the text node after it.
    pub fn keep_separate(&mut self, key: NodeKey) {
        self.separate.insert(key);
    }

    pub fn state(&self) -> &EditorState {
        &self.pending
    }

    pub fn types(&self) -> &NodeTypes {
        self.types
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn add_tag(&mut self, tag: &str) {
        self.tags.insert(tag.to_string());
    }

    pub fn get(&self, key: NodeKey) -> Option<&Node> {
        self.pending.get(key)
    }

    pub fn node(&self, key: NodeKey) -> Result<&Node, CoreError> {
        self.pending.node(key)
    }

    pub fn selection(&self) -> Option<&RangeSelection> {
        self.pending.selection()
    }

    pub fn set_selection(&mut self, selection: Option<RangeSelection>) {
        self.pending.set_selection(selection);
    }

    /// Marks the node dirty and hands out a private copy of it.
    pub fn writable(&mut self, key: NodeKey) -> Result<&mut Node, CoreError> {
        let node = self.pending.node(key)?;
        let is_element = node.is_element();
        let parent = node.parent;
        if is_element {
            self.dirty.elements.insert(key, true);
        } else {
            self.dirty.leaves.insert(key);
        }
        self.mark_parents_dirty(parent);
        self.pending.get_mut(key).ok_or(CoreError::NodeNotFound(key))
    }

    fn mark_parents_dirty(&mut self, mut parent: Option<NodeKey>) {
        while let Some(key) = parent {
            if self.dirty.elements.contains_key(&key) {
                return;
            }
            let Some(node) = self.pending.get(key) else {
                break;
            };
            self.dirty.elements.insert(key, false);
            parent = node.parent;
        }
    }

    fn next_key(&mut self) -> NodeKey {
        let key = NodeKey(*self.next_key);
        *self.next_key += 1;
        key
    }

    /// Creates a detached node of a registered type.
    pub fn create_node(&mut self, node_type: &str, props: Props) -> Result<NodeKey, CoreError> {
        let category = self
            .types
            .category_of(node_type)
            .ok_or_else(|| CoreError::UnknownType(node_type.to_string()))?;
        let key = self.next_key();
        let mut node = Node::new(key, node_type, NodeKind::empty(category));
        node.props = props;
        self.pending.insert(node);
        self.writable(key)?;
        Ok(key)
    }

    /// Creates a detached node from serialized parts, checking the type
    /// is registered under the same category.
    pub fn import_node(
        &mut self,
        node_type: &str,
        category: NodeCategory,
        props: Props,
        text: Option<String>,
    ) -> Result<NodeKey, CoreError> {
        let registered = self
            .types
            .category_of(node_type)
            .ok_or_else(|| CoreError::UnknownType(node_type.to_string()))?;
        if registered != category {
            return Err(CoreError::CategoryMismatch {
                node_type: node_type.to_string(),
                registered,
                requested: category,
            });
        }
        let key = self.create_node(node_type, props)?;
        if let Some(text) = text {
            self.set_text(key, text)?;
        }
        Ok(key)
    }

    pub fn create_element(&mut self, node_type: &str) -> Result<NodeKey, CoreError> {
        self.create_node(node_type, Props::new())
    }

    pub fn create_text(&mut self, text: &str) -> Result<NodeKey, CoreError> {
        let mut props = Props::new();
        props.insert("detail".into(), json!(0));
        props.insert("format".into(), json!(0));
        props.insert("mode".into(), json!("normal"));
        props.insert("style".into(), json!(""));
        let key = self.create_node("text", props)?;
        self.set_text(key, text)?;
        Ok(key)
    }

    pub fn create_line_break(&mut self) -> Result<NodeKey, CoreError> {
        self.create_node("linebreak", Props::new())
    }

    pub fn create_decorator(&mut self, node_type: &str) -> Result<NodeKey, CoreError> {
        self.create_node(node_type, Props::new())
    }

    /// Links a detached node into `parent` right after `after`, or first
    /// when `after` is `None`.
    pub fn link_after(&mut self, parent: NodeKey, after: Option<NodeKey>, child: NodeKey) -> Result<(), CoreError> {
        if child.is_root() || self.node(child)?.parent.is_some() {
            return Err(CoreError::AlreadyAttached(child));
        }
        let parent_node = self.node(parent)?;
        if !parent_node.is_element() {
            return Err(CoreError::WrongKind { key: parent, expected: NodeCategory::Element });
        }
        let next = match after {
            Some(sibling) => {
                let sibling_node = self.node(sibling)?;
                if sibling_node.parent != Some(parent) {
                    return Err(CoreError::Integrity {
                        key: sibling,
                        reason: format!("not a child of {parent}"),
                    });
                }
                sibling_node.next
            }
            None => parent_node.first_child(),
        };

        let node = self.writable(child)?;
        node.parent = Some(parent);
        node.prev = after;
        node.next = next;

        match after {
            Some(sibling) => self.writable(sibling)?.next = Some(child),
            None => set_first(self.writable(parent)?, Some(child)),
        }
        match next {
            Some(sibling) => self.writable(sibling)?.prev = Some(child),
            None => set_last(self.writable(parent)?, Some(child)),
        }
        if let NodeKind::Element { size, .. } = &mut self.writable(parent)?.kind {
            *size += 1;
        }
        Ok(())
    }

    pub fn append(&mut self, parent: NodeKey, child: NodeKey) -> Result<(), CoreError> {
        let last = self.node(parent)?.last_child();
        self.link_after(parent, last, child)
    }

    pub fn insert_after(&mut self, sibling: NodeKey, child: NodeKey) -> Result<(), CoreError> {
        let parent = self.node(sibling)?.parent.ok_or(CoreError::Integrity {
            key: sibling,
            reason: "sibling is detached".to_string(),
        })?;
        self.link_after(parent, Some(sibling), child)
    }

    pub fn insert_before(&mut self, sibling: NodeKey, child: NodeKey) -> Result<(), CoreError> {
        let node = self.node(sibling)?;
        let prev = node.prev;
        let parent = node.parent.ok_or(CoreError::Integrity {
            key: sibling,
            reason: "sibling is detached".to_string(),
        })?;
        self.link_after(parent, prev, child)
    }

    /// Unlinks a node from its parent. Detached nodes are collected at commit.
    pub fn detach(&mut self, key: NodeKey) -> Result<(), CoreError> {
        if key.is_root() {
            return Err(CoreError::RootDetach);
        }
        let node = self.node(key)?;
        let (Some(parent), prev, next) = (node.parent, node.prev, node.next) else {
            return Ok(());
        };

        match prev {
            Some(sibling) => self.writable(sibling)?.next = next,
            None => set_first(self.writable(parent)?, next),
        }
        match next {
            Some(sibling) => self.writable(sibling)?.prev = prev,
            None => set_last(self.writable(parent)?, prev),
        }
        if let NodeKind::Element { size, .. } = &mut self.writable(parent)?.kind {
            *size = size.saturating_sub(1);
        }

        let node = self.writable(key)?;
        node.parent = None;
        node.prev = None;
        node.next = None;
        Ok(())
    }

    pub fn remove(&mut self, key: NodeKey) -> Result<(), CoreError> {
        self.detach(key)
    }

    pub fn set_text(&mut self, key: NodeKey, text: impl Into<String>) -> Result<(), CoreError> {
        match &mut self.writable(key)?.kind {
            NodeKind::Text { text: current } => {
                *current = text.into();
                Ok(())
            }
            _ => Err(CoreError::WrongKind { key, expected: NodeCategory::Text }),
        }
    }

    /// Replaces `delete` chars at char `offset` with `insert`. Out-of-range
    /// values are clamped to the text.
    pub fn splice_text(&mut self, key: NodeKey, offset: usize, delete: usize, insert: &str) -> Result<(), CoreError> {
        let current = self
            .node(key)?
            .text()
            .ok_or(CoreError::WrongKind { key, expected: NodeCategory::Text })?;
        let chars: Vec<char> = current.chars().collect();
        let start = offset.min(chars.len());
        let end = start.saturating_add(delete).min(chars.len());
        let mut next: String = chars[..start].iter().collect();
        next.push_str(insert);
        next.extend(&chars[end..]);
        self.set_text(key, next)
    }

    pub fn set_prop(&mut self, key: NodeKey, name: &str, value: Value) -> Result<(), CoreError> {
        self.writable(key)?.props.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_props(&mut self, key: NodeKey, props: Props) -> Result<(), CoreError> {
        self.writable(key)?.props = props;
        Ok(())
    }

    fn commit(mut self) -> Result<UpdateRecord, CoreError> {
        self.normalize()?;
        self.collect_garbage();
        if cfg!(debug_assertions) {
            self.pending.check_integrity()?;
        }
        Ok(UpdateRecord {
            prev_state: self.prev,
            next_state: self.pending,
            dirty: self.dirty,
            normalized_nodes: self.normalized,
            tags: self.tags,
        })
    }

    /// Removes empty text nodes and merges adjacent text nodes that only
    /// differ in content. The earlier node of a merged pair survives.
    fn normalize(&mut self) -> Result<(), CoreError> {
        let mut leaves: Vec<NodeKey> = self.dirty.leaves.iter().copied().collect();
        leaves.sort();
        for key in leaves {
            let simple = self.pending.get(key).is_some_and(Node::is_simple_text);
            if simple && self.pending.is_attached(key) {
                self.normalize_text(key)?;
            }
        }
        Ok(())
    }

    fn normalize_text(&mut self, key: NodeKey) -> Result<(), CoreError> {
        if self.node(key)?.text_len() == 0 {
            self.normalized.insert(key);
            return self.detach(key);
        }

        let mut current = key;
        while let Some(prev) = self.node(current)?.prev {
            let prev_node = self.node(prev)?;
            if !prev_node.is_simple_text() {
                break;
            }
            if prev_node.text_len() == 0 {
                self.normalized.insert(prev);
                self.detach(prev)?;
                continue;
            }
            if !self.separate.contains(&current) && prev_node.can_merge_with(self.node(current)?) {
                self.merge_text(prev, current)?;
                current = prev;
            }
            break;
        }

        while let Some(next) = self.node(current)?.next {
            let next_node = self.node(next)?;
            if !next_node.is_simple_text() {
                break;
            }
            if next_node.text_len() == 0 {
                self.normalized.insert(next);
                self.detach(next)?;
                continue;
            }
            if !self.separate.contains(&next) && next_node.can_merge_with(self.node(current)?) {
                self.merge_text(current, next)?;
            }
            break;
        }
        Ok(())
    }

    fn merge_text(&mut self, survivor: NodeKey, merged: NodeKey) -> Result<(), CoreError> {
        let head = self.node(survivor)?.text().unwrap_or_default().to_string();
        let tail = self.node(merged)?.text().unwrap_or_default().to_string();
        let shift = head.chars().count();
        self.set_text(survivor, head + &tail)?;
        self.detach(merged)?;
        self.normalized.insert(survivor);
        self.normalized.insert(merged);

        if let Some(mut selection) = self.pending.selection().copied() {
            for point in [&mut selection.anchor, &mut selection.focus] {
                if point.key == merged && point.kind == PointKind::Text {
                    *point = Point::text(survivor, point.offset + shift);
                }
            }
            self.pending.set_selection(Some(selection));
        }
        Ok(())
    }

    fn collect_garbage(&mut self) {
        let candidates: Vec<NodeKey> = self
            .dirty
            .elements
            .keys()
            .chain(self.dirty.leaves.iter())
            .copied()
            .collect();
        for key in candidates {
            if !key.is_root() && self.pending.contains(key) && !self.pending.is_attached(key) {
                self.remove_subtree(key);
            }
        }
    }

    fn remove_subtree(&mut self, key: NodeKey) {
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.pending.remove(current) {
                let mut cursor = node.first_child();
                while let Some(child) = cursor {
                    // Only descend into children that still point back here.
                    cursor = match self.pending.get(child) {
                        Some(child_node) if child_node.parent == Some(current) => {
                            stack.push(child);
                            child_node.next
                        }
                        _ => None,
                    };
                }
            }
        }
    }
}

fn set_first(node: &mut Node, key: Option<NodeKey>) {
    if let NodeKind::Element { first, .. } = &mut node.kind {
        *first = key;
    }
}

fn set_last(node: &mut Node, key: Option<NodeKey>) {
    if let NodeKind::Element { last, .. } = &mut node.kind {
        *last = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph_with(u: &mut EditorUpdate<'_>, texts: &[&str]) -> Result<(NodeKey, Vec<NodeKey>), CoreError> {
        let p = u.create_element("paragraph")?;
        let mut keys = Vec::new();
        for text in texts {
            let t = u.create_text(text)?;
            u.append(p, t)?;
            keys.push(t);
        }
        u.append(NodeKey::ROOT, p)?;
        Ok((p, keys))
    }

    #[test]
    fn test_failed_update_leaves_state_untouched() {
        let mut editor = Editor::new();
        let result = editor.update(&[], |u| -> Result<(), CoreError> {
            let p = u.create_element("paragraph")?;
            u.append(NodeKey::ROOT, p)?;
            u.create_element("table")?;
            Ok(())
        });
        assert_eq!(result.unwrap_err(), CoreError::UnknownType("table".into()));
        assert!(editor.state().is_empty());
    }

    #[test]
    fn test_dirty_marking() {
        let mut editor = Editor::new();
        let ((p, texts), _) = editor.update(&[], |u| paragraph_with(u, &["hello"])).unwrap();
        let t = texts[0];

        let (_, record) = editor
            .update(&[], |u| u.splice_text(t, 5, 0, " world"))
            .unwrap();
        assert!(record.dirty.is_leaf_dirty(t));
        assert!(record.dirty.is_element_dirty(p));
        assert!(!record.dirty.is_intentionally_dirty(p));
        assert!(!record.dirty.is_intentionally_dirty(NodeKey::ROOT));
        assert_eq!(record.next_state.text_content(NodeKey::ROOT), "hello world");
        assert_eq!(record.prev_state.text_content(NodeKey::ROOT), "hello");
    }

    #[test]
    fn test_detach_and_collect() {
        let mut editor = Editor::new();
        let ((p, texts), _) = editor.update(&[], |u| paragraph_with(u, &["a"])).unwrap();

        let (_, record) = editor.update(&[], |u| u.remove(p)).unwrap();
        assert!(record.dirty.is_intentionally_dirty(NodeKey::ROOT));
        assert!(!editor.state().contains(p));
        assert!(!editor.state().contains(texts[0]));
        assert!(editor.state().check_integrity().is_ok());
    }

    #[test]
    fn test_normalization_merges_into_previous() {
        let mut editor = Editor::new();
        let ((p, texts), record) = editor
            .update(&[], |u| paragraph_with(u, &["Hello world", "Hello world"]))
            .unwrap();

        let children = editor.state().children_keys(p).unwrap();
        assert_eq!(children, vec![texts[0]]);
        assert_eq!(editor.state().text_content(p), "Hello worldHello world");
        assert!(record.normalized_nodes.contains(&texts[0]));
        assert!(record.normalized_nodes.contains(&texts[1]));
    }

    #[test]
    fn test_separate_node_is_not_merged_away() {
        let mut editor = Editor::new();
        let ((p, texts), _) = editor.update(&[], |u| paragraph_with(u, &["ab"])).unwrap();

        let (tail, _) = editor
            .update(&[], |u| {
                let tail = u.create_text("cd")?;
                u.keep_separate(tail);
                u.append(p, tail)?;
                Ok::<_, CoreError>(tail)
            })
            .unwrap();
        assert_eq!(editor.state().children_keys(p).unwrap(), vec![texts[0], tail]);

        // Without the mark the next write merges the pair.
        editor.update(&[], |u| u.splice_text(tail, 2, 0, "e")).unwrap();
        assert_eq!(editor.state().children_keys(p).unwrap(), vec![texts[0]]);
        assert_eq!(editor.state().text_content(p), "abcde");
    }

    #[test]
    fn test_normalization_keeps_different_formats_apart() {
        let mut editor = Editor::new();
        let ((p, _), _) = editor
            .update(&[], |u| {
                let (p, texts) = paragraph_with(u, &["bold", "plain"])?;
                u.set_prop(texts[0], "format", json!(1))?;
                Ok::<_, CoreError>((p, texts))
            })
            .unwrap();
        assert_eq!(editor.state().node(p).unwrap().child_count(), 2);
    }

    #[test]
    fn test_normalization_removes_empty_text() {
        let mut editor = Editor::new();
        let ((p, texts), _) = editor.update(&[], |u| paragraph_with(u, &["x"])).unwrap();

        let (_, record) = editor.update(&[], |u| u.set_text(texts[0], "")).unwrap();
        assert_eq!(editor.state().node(p).unwrap().child_count(), 0);
        assert!(record.normalized_nodes.contains(&texts[0]));
    }

    #[test]
    fn test_merge_moves_selection() {
        let mut editor = Editor::new();
        let ((_, texts), _) = editor
            .update(&[], |u| {
                let (p, texts) = paragraph_with(u, &["ab", "cd"])?;
                u.set_prop(texts[1], "format", json!(1))?;
                Ok::<_, CoreError>((p, texts))
            })
            .unwrap();

        editor
            .update(&[], |u| {
                u.set_selection(Some(RangeSelection::collapsed(Point::text(texts[1], 1))));
                u.set_prop(texts[1], "format", json!(0))
            })
            .unwrap();

        let selection = editor.state().selection().copied().unwrap();
        assert_eq!(selection.anchor, Point::text(texts[0], 3));
    }

    #[test]
    fn test_splice_text_clamps() {
        let mut editor = Editor::new();
        let ((_, texts), _) = editor.update(&[], |u| paragraph_with(u, &["héllo"])).unwrap();
        editor.update(&[], |u| u.splice_text(texts[0], 1, 100, "ey")).unwrap();
        assert_eq!(editor.state().node(texts[0]).unwrap().text(), Some("hey"));
    }

    #[test]
    fn test_link_rejects_attached_child() {
        let mut editor = Editor::new();
        let ((p, _), _) = editor.update(&[], |u| paragraph_with(u, &[])).unwrap();
        let err = editor.update(&[], |u| u.append(NodeKey::ROOT, p)).unwrap_err();
        assert_eq!(err, CoreError::AlreadyAttached(p));
    }

    #[test]
    fn test_tags() {
        let mut editor = Editor::new();
        let (_, record) = editor.update(&[COLLABORATION_TAG], |_| Ok::<_, CoreError>(())).unwrap();
        assert!(record.is_replayed());
        assert!(record.dirty.is_empty());
    }
}
