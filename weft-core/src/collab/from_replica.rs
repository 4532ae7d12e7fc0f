use super::binding::Binding;
use super::cursor::SelectionRecovery;
use super::events::{ChildDelta, PathStep, ReplicaChange, ReplicaEvent};
use super::props::{read_props, read_tag};
use super::shadow::{ShadowId, ShadowKind, ShadowNode};
use super::{SyncError, KEY_CATEGORY, KEY_CHILDREN, KEY_PROPS, KEY_TEXT, KEY_TYPE, KEY_UID};
use crate::editor::EditorUpdate;
use crate::node::{NodeCategory, NodeKey};
use rustc_hash::FxHashSet;
use yrs::{Array, GetString, Map as _, MapRef, Out, ReadTxn, Transact};

/// Counters of one replica to local pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaPassStats {
    pub applied: usize,
    pub skipped: usize,
}

impl Binding {
    /// Replays captured replica events onto the pending editor state, then
    /// repairs the selection. Must run inside an update tagged as a
    /// collaboration update.
    pub fn sync_replica_to_local(
        &mut self,
        update: &mut EditorUpdate<'_>,
        events: &[ReplicaEvent],
    ) -> Result<(ReplicaPassStats, SelectionRecovery), SyncError> {
        self.ensure_usable()?;
        let doc = self.doc.clone();
        let txn = doc.transact();
        let mut stats = ReplicaPassStats::default();
        for event in events {
            let result = self.sync_event(&txn, update, event);
            if self.guard(result)? {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }
        self.keep_foreign_text_separate(&txn, update);
        drop(txn);
        let recovery = self.recover_selection(update);
        log::debug!(
            "replica to local: {} events applied, {} skipped, selection {:?}",
            stats.applied,
            stats.skipped,
            recovery
        );
        Ok((stats, recovery))
    }

    /// Marks text nodes created by other sessions next to written text so
    /// normalization leaves them in place. Concurrent inserts side by side
    /// are merged by the session that created the later node; it pushes the
    /// merge to everyone else.
    pub(super) fn keep_foreign_text_separate<T: ReadTxn>(&self, txn: &T, update: &mut EditorUpdate<'_>) {
        let parents: FxHashSet<NodeKey> = update
            .dirty()
            .leaves
            .iter()
            .filter_map(|key| update.get(*key))
            .filter(|node| node.is_text())
            .filter_map(|node| node.parent)
            .collect();
        for parent in parents {
            let Ok(children) = update.state().children_keys(parent) else {
                continue;
            };
            for child in children {
                let foreign = self
                    .shadows
                    .lookup(child)
                    .and_then(|id| self.shadows.get(id))
                    .is_some_and(|shadow| {
                        matches!(shadow.kind, ShadowKind::Text { .. }) && !self.is_own(&shadow.map, txn)
                    });
                if foreign {
                    update.keep_separate(child);
                }
            }
        }
    }

    // Returns false when the event's owner is no longer mirrored.
    fn sync_event<T: ReadTxn>(
        &mut self,
        txn: &T,
        update: &mut EditorUpdate<'_>,
        event: &ReplicaEvent,
    ) -> Result<bool, SyncError> {
        let Some(owner) = self.resolve_owner(txn, event)? else {
            log::debug!("skipping replica event without a live owner: {:?}", event.path);
            return Ok(false);
        };
        match &event.change {
            ReplicaChange::Props { changed_keys } => {
                if *changed_keys > 0 {
                    self.sync_props_from_replica(txn, update, owner)?;
                }
            }
            ReplicaChange::Text => {
                if !matches!(self.shadows.node(owner)?.kind, ShadowKind::Text { .. }) {
                    return Err(SyncError::UnexpectedEvent(format!("text change on non-text shadow {owner}")));
                }
                self.sync_text_from_replica(txn, update, owner)?;
            }
            ReplicaChange::Children(delta) => {
                let removed = self.apply_children_delta(txn, owner, delta)?;
                self.sync_children_from_replica(txn, update, owner)?;
                for id in removed {
                    self.shadows.destroy(id);
                }
            }
            ReplicaChange::Unsupported => {
                return Err(SyncError::UnexpectedEvent(format!("unsupported change at {:?}", event.path)));
            }
        }
        Ok(true)
    }

    /// Walks an event path to the node map owning the changed type.
    fn resolve_owner<T: ReadTxn>(&self, txn: &T, event: &ReplicaEvent) -> Result<Option<ShadowId>, SyncError> {
        if event.root_props {
            return Ok(Some(self.root));
        }
        let steps = match event.path.last() {
            Some(PathStep::Key(_)) => &event.path[..event.path.len() - 1],
            _ => &event.path[..],
        };
        if steps.is_empty() {
            return Ok(Some(self.root));
        }

        let mut current = Out::YArray(self.root_children.clone());
        for step in steps {
            let next = match (&current, step) {
                (Out::YArray(array), PathStep::Index(index)) => array.get(txn, *index),
                (Out::YMap(map), PathStep::Key(key)) => map.get(txn, key),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        let Out::YMap(map) = current else {
            return Err(SyncError::UnexpectedEvent(format!("event path {:?} does not end at a node map", event.path)));
        };
        let uid = read_tag(&map, txn, KEY_UID)?;
        Ok(self.shadows.lookup_uid(&uid))
    }

    fn sync_props_from_replica<T: ReadTxn>(
        &mut self,
        txn: &T,
        update: &mut EditorUpdate<'_>,
        id: ShadowId,
    ) -> Result<(), SyncError> {
        let shadow = self.shadows.node(id)?;
        let Some(key) = shadow.key else {
            return Ok(());
        };
        let props = read_props(&shadow.props, txn);
        let text = match &shadow.kind {
            ShadowKind::Text { text } => Some(text.get_string(txn)),
            _ => None,
        };
        let node = update.node(key)?;
        if node.category() != shadow.category() {
            return Err(SyncError::Invariant(format!("node {key} changed category under shadow {id}")));
        }
        if node.props != props {
            update.set_props(key, props)?;
        }
        if let Some(text) = text {
            if update.node(key)?.text() != Some(text.as_str()) {
                update.set_text(key, text)?;
            }
        }
        Ok(())
    }

    fn sync_text_from_replica<T: ReadTxn>(
        &mut self,
        txn: &T,
        update: &mut EditorUpdate<'_>,
        id: ShadowId,
    ) -> Result<(), SyncError> {
        let shadow = self.shadows.node(id)?;
        let (Some(key), ShadowKind::Text { text }) = (shadow.key, &shadow.kind) else {
            return Err(SyncError::Invariant(format!("text shadow {id} is not bound")));
        };
        let next = text.get_string(txn);
        let current = update.node(key)?;
        match current.text() {
            Some(existing) if existing == next => Ok(()),
            Some(_) => Ok(update.set_text(key, next)?),
            None => Err(SyncError::Invariant(format!("node {key} under text shadow {id} is not text"))),
        }
    }

    /// Applies a child delta to the shadow list. Returns the shadows that
    /// were removed; they stay alive until reconciliation is done.
    fn apply_children_delta<T: ReadTxn>(
        &mut self,
        txn: &T,
        owner: ShadowId,
        delta: &[ChildDelta],
    ) -> Result<Vec<ShadowId>, SyncError> {
        let shared = match &self.shadows.node(owner)?.kind {
            ShadowKind::Element { shared_children, .. } => shared_children.clone(),
            _ => return Err(SyncError::UnexpectedEvent(format!("child change on non-element shadow {owner}"))),
        };
        let mut removed = Vec::new();
        let mut index = 0usize;
        for step in delta {
            match *step {
                ChildDelta::Retain(len) => index += len as usize,
                ChildDelta::Delete(len) => {
                    let children = self.shadows.children_mut(owner)?;
                    let end = index + len as usize;
                    if end > children.len() {
                        return Err(SyncError::Invariant(format!(
                            "delete of {len} children at {index} overruns shadow {owner}"
                        )));
                    }
                    removed.extend(children.drain(index..end));
                }
                ChildDelta::Insert(len) => {
                    for offset in 0..len as usize {
                        let position = index + offset;
                        let Some(Out::YMap(map)) = shared.get(txn, position as u32) else {
                            return Err(SyncError::UnexpectedEvent(format!("inserted child {position} is not a map")));
                        };
                        let child = self.adopt_map(txn, map, owner)?;
                        let children = self.shadows.children_mut(owner)?;
                        if position > children.len() {
                            return Err(SyncError::Invariant(format!(
                                "insert at {position} past the end of shadow {owner}"
                            )));
                        }
                        children.insert(position, child);
                    }
                    index += len as usize;
                }
            }
        }
        Ok(removed)
    }

    /// Returns the shadow of a replica node map, creating an unbound one
    /// (with its whole subtree) when the map is new to this session.
    pub(super) fn adopt_map<T: ReadTxn>(&mut self, txn: &T, map: MapRef, parent: ShadowId) -> Result<ShadowId, SyncError> {
        let uid = read_tag(&map, txn, KEY_UID)?;
        if let Some(existing) = self.shadows.lookup_uid(&uid) {
            return Ok(existing);
        }
        let node_type = read_tag(&map, txn, KEY_TYPE)?;
        let category_tag = read_tag(&map, txn, KEY_CATEGORY)?;
        let category = NodeCategory::parse(&category_tag).ok_or(SyncError::UnknownCategory(category_tag))?;
        let Some(Out::YMap(props)) = map.get(txn, KEY_PROPS) else {
            return Err(SyncError::MissingAttribute(KEY_PROPS));
        };
        let kind = match category {
            NodeCategory::Element => match map.get(txn, KEY_CHILDREN) {
                Some(Out::YArray(shared_children)) => ShadowKind::Element { children: Vec::new(), shared_children },
                _ => return Err(SyncError::MissingAttribute(KEY_CHILDREN)),
            },
            NodeCategory::Text => match map.get(txn, KEY_TEXT) {
                Some(Out::YText(text)) => ShadowKind::Text { text },
                _ => return Err(SyncError::MissingAttribute(KEY_TEXT)),
            },
            NodeCategory::Decorator => ShadowKind::Decorator,
            NodeCategory::LineBreak => ShadowKind::LineBreak,
        };
        let nested = match &kind {
            ShadowKind::Element { shared_children, .. } => Some(shared_children.clone()),
            _ => None,
        };
        let id = self.shadows.insert(ShadowNode {
            key: None,
            parent: Some(parent),
            node_type,
            uid: uid.into(),
            map,
            props,
            kind,
        });
        if let Some(shared_children) = nested {
            for index in 0..shared_children.len(txn) {
                let Some(Out::YMap(child_map)) = shared_children.get(txn, index) else {
                    return Err(SyncError::UnexpectedEvent(format!("child {index} of shadow {id} is not a map")));
                };
                let child = self.adopt_map(txn, child_map, id)?;
                self.shadows.children_mut(id)?.push(child);
            }
        }
        Ok(id)
    }

    /// Reconciles the local children of an element with its shadow list.
    pub(super) fn sync_children_from_replica<T: ReadTxn>(
        &mut self,
        txn: &T,
        update: &mut EditorUpdate<'_>,
        id: ShadowId,
    ) -> Result<(), SyncError> {
        let key = self
            .shadows
            .node(id)?
            .key
            .ok_or_else(|| SyncError::Invariant(format!("element shadow {id} has no local node")))?;
        if !update.node(key)?.is_element() {
            return Err(SyncError::Invariant(format!("node {key} under element shadow {id} is not an element")));
        }
        let prev_keys = update.state().children_keys(key)?;
        let shadow_children = self.shadows.node(id)?.children().to_vec();
        let mut shadow_keys: Option<FxHashSet<NodeKey>> = None;
        let mut visited = FxHashSet::default();
        let mut prev_index = 0;
        let mut prev_child: Option<NodeKey> = None;
        let mut i = 0;

        while i < shadow_children.len() {
            let child = shadow_children[i];
            let shadow = self.shadows.node(child)?;
            let child_key = shadow.key;
            let category = shadow.category();
            let local_key = prev_keys.get(prev_index).copied();
            let has_local = child_key.is_some_and(|k| update.get(k).is_some_and(|n| n.category() == category));

            if has_local && local_key.is_some() && local_key == child_key {
                if let Some(k) = child_key {
                    visited.insert(k);
                    prev_child = Some(k);
                }
                prev_index += 1;
                i += 1;
                continue;
            }

            if has_local {
                if let Some(stale) = local_key {
                    let keys = shadow_keys.get_or_insert_with(|| {
                        shadow_children
                            .iter()
                            .filter_map(|c| self.shadows.get(*c).and_then(ShadowNode::key))
                            .collect()
                    });
                    if !keys.contains(&stale) {
                        // Deleted concurrently by a peer.
                        update.detach(stale)?;
                        prev_index += 1;
                        continue;
                    }
                }
            }

            let created = self.materialize(txn, update, child)?;
            update.link_after(key, prev_child, created)?;
            prev_child = Some(created);
            i += 1;
        }

        for stale in prev_keys {
            if !visited.contains(&stale) {
                if let Some(shadow) = self.shadows.lookup(stale) {
                    self.shadows.destroy(shadow);
                }
                update.detach(stale)?;
            }
        }
        Ok(())
    }

    /// Creates a fresh local node for a shadow and binds it, recursing into
    /// element children.
    fn materialize<T: ReadTxn>(
        &mut self,
        txn: &T,
        update: &mut EditorUpdate<'_>,
        id: ShadowId,
    ) -> Result<NodeKey, SyncError> {
        let shadow = self.shadows.node(id)?;
        let props = read_props(&shadow.props, txn);
        let text = match &shadow.kind {
            ShadowKind::Text { text } => Some(text.get_string(txn)),
            _ => None,
        };
        let is_element = matches!(shadow.kind, ShadowKind::Element { .. });
        let key = update.import_node(&shadow.node_type, shadow.category(), props, text)?;
        self.shadows.register(key, id);
        if is_element {
            self.sync_children_from_replica(txn, update, id)?;
        }
        Ok(key)
    }
}
