use super::binding::Binding;
use super::props::{any_str, json_to_any};
use super::shadow::{ShadowId, ShadowKind, ShadowNode};
use super::text_merge;
use super::{SyncError, KEY_AUTHOR, KEY_CATEGORY, KEY_CHILDREN, KEY_PROPS, KEY_TEXT, KEY_TYPE, KEY_UID};
use crate::editor::{DirtySet, UpdateRecord};
use crate::node::{Node, NodeCategory, NodeKey, NodeKind};
use crate::state::EditorState;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use uuid::Uuid;
use yrs::{Array, ArrayPrelim, GetString, Map as _, MapPrelim, Out, Text, TextPrelim, Transact, TransactionMut};

struct LocalPass<'r> {
    prev: &'r EditorState,
    next: &'r EditorState,
    dirty: &'r DirtySet,
    ops: usize,
}

impl Binding {
    /// Writes one committed local update into the replica and returns the
    /// encoded replica update, if anything was written.
    ///
    /// Replayed updates (collaboration or history) are not diffed; only the
    /// text normalization they triggered is pushed back.
    pub fn sync_local_update(&mut self, record: &UpdateRecord) -> Result<Option<Vec<u8>>, SyncError> {
        self.ensure_usable()?;
        let doc = self.doc.clone();
        let mut txn = doc.transact_mut_with(self.origin.clone());
        let mut pass = LocalPass { prev: &record.prev_state, next: &record.next_state, dirty: &record.dirty, ops: 0 };

        let result = if record.is_replayed() {
            self.handle_normalization_conflicts(&mut txn, &mut pass, record)
        } else {
            self.sync_root_from_local(&mut txn, &mut pass)
        };
        self.guard(result)?;
        if pass.ops > 0 {
            let result = self.write_root_tags(&mut txn);
            self.guard(result)?;
        }
        if !record.is_replayed() {
            self.capture_cursor(record.next_state.selection());
        }

        log::debug!("local to replica: {} replica operations", pass.ops);
        if pass.ops == 0 {
            return Ok(None);
        }
        let encoded = txn.encode_update_v1();
        drop(txn);
        if self.config.verify_after_sync {
            let result = self.verify(&record.next_state);
            self.guard(result)?;
        }
        Ok(Some(encoded))
    }

    /// Pushes a whole local tree into an empty replica.
    pub fn sync_full_to_replica(&mut self, state: &EditorState) -> Result<Option<Vec<u8>>, SyncError> {
        self.ensure_usable()?;
        if !self.shadows.node(self.root)?.children().is_empty() {
            return Err(SyncError::Invariant("replica already has content".to_string()));
        }
        let doc = self.doc.clone();
        let mut txn = doc.transact_mut_with(self.origin.clone());
        let dirty = DirtySet::default();
        let empty = EditorState::new();
        let mut pass = LocalPass { prev: &empty, next: state, dirty: &dirty, ops: 0 };
        let root = self.root;
        let result = self
            .sync_props_from_local(&mut txn, &mut pass, root, state.root())
            .and_then(|_| self.sync_children_from_local(&mut txn, &mut pass, root, true))
            .and_then(|_| self.write_root_tags(&mut txn));
        if self.guard(result)? {
            pass.ops += 1;
        }
        self.capture_cursor(state.selection());
        if pass.ops == 0 {
            return Ok(None);
        }
        Ok(Some(txn.encode_update_v1()))
    }

    fn sync_root_from_local(&mut self, txn: &mut TransactionMut, pass: &mut LocalPass<'_>) -> Result<(), SyncError> {
        if !pass.dirty.is_element_dirty(NodeKey::ROOT) {
            return Ok(());
        }
        let (root, next) = (self.root, pass.next);
        if pass.dirty.is_intentionally_dirty(NodeKey::ROOT) {
            self.sync_props_from_local(txn, pass, root, next.root())?;
        }
        self.sync_children_from_local(txn, pass, root, false)
    }

    /// Two-cursor diff of previous and next children of the element bound
    /// to `id`. With `fresh` the previous state and dirty sets are ignored
    /// and every child is created.
    fn sync_children_from_local(
        &mut self,
        txn: &mut TransactionMut,
        pass: &mut LocalPass<'_>,
        id: ShadowId,
        fresh: bool,
    ) -> Result<(), SyncError> {
        let key = self
            .shadows
            .node(id)?
            .key
            .ok_or_else(|| SyncError::Invariant(format!("element shadow {id} has no local node")))?;
        let prev_children = match pass.prev.get(key) {
            Some(node) if !fresh && node.is_element() => pass.prev.children_keys(key)?,
            _ => Vec::new(),
        };
        let next_children = pass.next.children_keys(key)?;

        let mut prev_set: Option<FxHashSet<NodeKey>> = None;
        let mut next_set: Option<FxHashSet<NodeKey>> = None;
        let (mut prev_index, mut next_index) = (0, 0);

        while prev_index < prev_children.len() && next_index < next_children.len() {
            let prev_key = prev_children[prev_index];
            let next_key = next_children[next_index];
            if prev_key == next_key {
                self.sync_child_from_local(txn, pass, id, next_index, next_key)?;
                prev_index += 1;
                next_index += 1;
                continue;
            }

            let next_has_prev = next_set
                .get_or_insert_with(|| next_children.iter().copied().collect())
                .contains(&prev_key);
            let prev_has_next = prev_set
                .get_or_insert_with(|| prev_children.iter().copied().collect())
                .contains(&next_key);

            if !next_has_prev {
                self.splice_remove(txn, pass, id, next_index, 1)?;
                prev_index += 1;
            } else if prev_has_next {
                self.splice_create(txn, pass, id, next_index, 1, next_key)?;
                prev_index += 1;
                next_index += 1;
            } else {
                self.splice_create(txn, pass, id, next_index, 0, next_key)?;
                next_index += 1;
            }
        }

        let append = prev_index >= prev_children.len();
        let truncate = next_index >= next_children.len();
        if append && !truncate {
            for next_key in &next_children[next_index..] {
                let at = self.shadows.node(id)?.children().len();
                self.splice_create(txn, pass, id, at, 0, *next_key)?;
            }
        } else if truncate && !append {
            let len = self.shadows.node(id)?.children().len();
            for index in (next_index..len).rev() {
                self.splice_remove(txn, pass, id, index, 1)?;
            }
        }
        Ok(())
    }

    // A child present at the same position before and after the update.
    fn sync_child_from_local(
        &mut self,
        txn: &mut TransactionMut,
        pass: &mut LocalPass<'_>,
        parent: ShadowId,
        index: usize,
        key: NodeKey,
    ) -> Result<(), SyncError> {
        let child = self
            .shadows
            .node(parent)?
            .children()
            .get(index)
            .copied()
            .ok_or_else(|| SyncError::Invariant(format!("shadow {parent} has no child at {index}")))?;
        let next = pass.next;
        let node = next.node(key)?;
        let shadow = self.shadows.node(child)?;
        if shadow.key != Some(key) {
            return Err(SyncError::Invariant(format!("shadow {child} at {index} is not bound to {key}")));
        }
        if shadow.category() != node.category() {
            return Err(SyncError::Invariant(format!("node {key} changed category under shadow {child}")));
        }

        let element_dirty = pass.dirty.is_element_dirty(key);
        match node.category() {
            NodeCategory::Element if element_dirty => {
                if pass.dirty.is_intentionally_dirty(key) {
                    self.sync_props_from_local(txn, pass, child, node)?;
                }
                self.sync_children_from_local(txn, pass, child, false)?;
            }
            NodeCategory::Text if pass.dirty.is_leaf_dirty(key) => {
                self.sync_props_from_local(txn, pass, child, node)?;
                self.sync_text_from_local(txn, pass, child, node)?;
            }
            NodeCategory::Decorator | NodeCategory::LineBreak if pass.dirty.is_leaf_dirty(key) => {
                self.sync_props_from_local(txn, pass, child, node)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Full key-set diff of the node properties against the props map.
    fn sync_props_from_local(
        &mut self,
        txn: &mut TransactionMut,
        pass: &mut LocalPass<'_>,
        id: ShadowId,
        node: &Node,
    ) -> Result<(), SyncError> {
        let props = self.shadows.node(id)?.props.clone();
        let existing: Vec<String> = props.keys(&*txn).map(str::to_string).collect();
        for (name, value) in &node.props {
            let next = json_to_any(value);
            let unchanged = matches!(props.get(&*txn, name), Some(Out::Any(prev)) if prev == next);
            if !unchanged {
                props.insert(txn, name.as_str(), next);
                pass.ops += 1;
            }
        }
        for name in existing {
            if !node.props.contains_key(&name) {
                props.remove(txn, &name);
                pass.ops += 1;
            }
        }
        Ok(())
    }

    fn sync_text_from_local(
        &mut self,
        txn: &mut TransactionMut,
        pass: &mut LocalPass<'_>,
        id: ShadowId,
        node: &Node,
    ) -> Result<(), SyncError> {
        let ShadowKind::Text { text } = &self.shadows.node(id)?.kind else {
            return Err(SyncError::Invariant(format!("shadow {id} is not a text shadow")));
        };
        let text = text.clone();
        let next = node.text().unwrap_or_default();
        match pass.prev.get(node.key).and_then(Node::text) {
            Some(prev) if prev == next => {}
            Some(prev) => {
                let bias = pass
                    .next
                    .selection()
                    .and_then(|s| s.caret_in(node.key))
                    .unwrap_or_else(|| next.chars().count());
                let edit = text_merge::diff(prev, next, bias);
                let (start, len) = edit.replica_range(prev, &self.config.offset_kind);
                if len > 0 {
                    text.remove_range(txn, start, len);
                }
                if !edit.insert.is_empty() {
                    text.insert(txn, start, &edit.insert);
                }
                pass.ops += 1;
            }
            None => {
                text.insert(txn, 0, next);
                pass.ops += 1;
            }
        }
        Ok(())
    }

    fn splice_remove(
        &mut self,
        txn: &mut TransactionMut,
        pass: &mut LocalPass<'_>,
        id: ShadowId,
        index: usize,
        count: usize,
    ) -> Result<(), SyncError> {
        let shared = self.shadows.shared_children(id)?;
        let children = self.shadows.children_mut(id)?;
        if index + count > children.len() {
            return Err(SyncError::Invariant(format!("removal of {count} at {index} overruns shadow {id}")));
        }
        let removed: Vec<ShadowId> = children.drain(index..index + count).collect();
        shared.remove_range(txn, index as u32, count as u32);
        for child in removed {
            self.shadows.destroy(child);
        }
        pass.ops += 1;
        Ok(())
    }

    /// Replaces `delete` children at `index` with a new replica node built
    /// from the local node `key` and its subtree.
    fn splice_create(
        &mut self,
        txn: &mut TransactionMut,
        pass: &mut LocalPass<'_>,
        id: ShadowId,
        index: usize,
        delete: usize,
        key: NodeKey,
    ) -> Result<(), SyncError> {
        if delete > 0 {
            self.splice_remove(txn, pass, id, index, delete)?;
        }
        let next = pass.next;
        let node = next.node(key)?;
        let shared = self.shadows.shared_children(id)?;
        if index > shared.len(&*txn) as usize {
            return Err(SyncError::Invariant(format!("insert at {index} past the end of shadow {id}")));
        }

        let map = shared.insert(txn, index as u32, MapPrelim::default());
        let uid = Uuid::new_v4().to_string();
        map.insert(txn, KEY_TYPE, any_str(&node.node_type));
        map.insert(txn, KEY_CATEGORY, any_str(node.category().as_str()));
        map.insert(txn, KEY_UID, any_str(&uid));
        map.insert(txn, KEY_AUTHOR, any_str(&self.author));
        let props = map.insert(txn, KEY_PROPS, MapPrelim::default());
        let mut text_ref = None;
        let kind = match &node.kind {
            NodeKind::Element { .. } => ShadowKind::Element {
                children: Vec::new(),
                shared_children: map.insert(txn, KEY_CHILDREN, ArrayPrelim::default()),
            },
            NodeKind::Text { .. } => {
                let text = map.insert(txn, KEY_TEXT, TextPrelim::new(""));
                text_ref = Some(text.clone());
                ShadowKind::Text { text }
            }
            NodeKind::Decorator => ShadowKind::Decorator,
            NodeKind::LineBreak => ShadowKind::LineBreak,
        };

        let child = self.shadows.insert(ShadowNode {
            key: Some(key),
            parent: Some(id),
            node_type: node.node_type.clone(),
            uid: Arc::from(uid),
            map,
            props,
            kind,
        });
        self.shadows.children_mut(id)?.insert(index, child);
        pass.ops += 1;

        self.sync_props_from_local(txn, pass, child, node)?;
        if let Some(text) = text_ref {
            if let Some(content) = node.text().filter(|t| !t.is_empty()) {
                text.insert(txn, 0, content);
            }
        }
        if node.is_element() {
            self.sync_children_from_local(txn, pass, child, true)?;
        }
        Ok(())
    }

    /// Pushes back the effect of text normalization that ran on top of a
    /// replayed update: surviving nodes get their merged content, merged-away
    /// nodes leave their parent sequence.
    fn handle_normalization_conflicts(
        &mut self,
        txn: &mut TransactionMut,
        pass: &mut LocalPass<'_>,
        record: &UpdateRecord,
    ) -> Result<(), SyncError> {
        let mut keys: Vec<NodeKey> = record.normalized_nodes.iter().copied().collect();
        keys.sort();
        let mut survivors = Vec::new();

        for key in keys {
            let Some(id) = self.shadows.lookup(key) else {
                continue;
            };
            let shadow = self.shadows.node(id)?;
            if !matches!(shadow.kind, ShadowKind::Text { .. }) {
                continue;
            }
            match record.next_state.get(key).and_then(Node::text) {
                Some(text) if record.next_state.is_attached(key) => survivors.push((id, text.to_string())),
                _ => {
                    let Some(parent) = shadow.parent else {
                        continue;
                    };
                    let Some(offset) = self.shadows.child_offset(parent, id) else {
                        log::debug!("merged text shadow {id} is no longer in its parent");
                        continue;
                    };
                    self.splice_remove(txn, pass, parent, offset, 1)?;
                }
            }
        }

        for (id, content) in survivors {
            let Some(ShadowNode { kind: ShadowKind::Text { text }, .. }) = self.shadows.get(id) else {
                continue;
            };
            let text = text.clone();
            let current = text.get_string(&*txn);
            if current == content {
                continue;
            }
            // Only the difference is written so edits other sessions made
            // to the survivor stay in place.
            let edit = text_merge::diff(&current, &content, content.chars().count());
            let (start, len) = edit.replica_range(&current, &self.config.offset_kind);
            if len > 0 {
                text.remove_range(txn, start, len);
            }
            if !edit.insert.is_empty() {
                text.insert(txn, start, &edit.insert);
            }
            pass.ops += 1;
        }
        Ok(())
    }
}
