use super::SyncError;
use crate::node::{NodeCategory, NodeKey};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use yrs::{ArrayRef, MapRef, TextRef};

/// Arena handle of a shadow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShadowId(u64);

impl fmt::Display for ShadowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Category-specific half of a shadow. The variant never changes.
pub enum ShadowKind {
    Element {
        children: Vec<ShadowId>,
        shared_children: ArrayRef,
    },
    Text {
        text: TextRef,
    },
    Decorator,
    LineBreak,
}

impl ShadowKind {
    pub fn category(&self) -> NodeCategory {
        match self {
            ShadowKind::Element { .. } => NodeCategory::Element,
            ShadowKind::Text { .. } => NodeCategory::Text,
            ShadowKind::Decorator => NodeCategory::Decorator,
            ShadowKind::LineBreak => NodeCategory::LineBreak,
        }
    }
}

/// Pairs one local node with its replica node map.
pub struct ShadowNode {
    pub(crate) key: Option<NodeKey>,
    pub(crate) parent: Option<ShadowId>,
    pub(crate) node_type: String,
    pub(crate) uid: Arc<str>,
    pub(crate) map: MapRef,
    pub(crate) props: MapRef,
    pub(crate) kind: ShadowKind,
}

impl ShadowNode {
    pub fn key(&self) -> Option<NodeKey> {
        self.key
    }

    pub fn parent(&self) -> Option<ShadowId> {
        self.parent
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn category(&self) -> NodeCategory {
        self.kind.category()
    }

    pub fn children(&self) -> &[ShadowId] {
        match &self.kind {
            ShadowKind::Element { children, .. } => children,
            _ => &[],
        }
    }

    pub fn map(&self) -> &MapRef {
        &self.map
    }
}

impl fmt::Debug for ShadowNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowNode")
            .field("key", &self.key)
            .field("parent", &self.parent)
            .field("node_type", &self.node_type)
            .field("uid", &self.uid)
            .field("category", &self.category())
            .field("children", &self.children())
            .finish()
    }
}

/// Shadow arena plus the two identity indexes.
#[derive(Default)]
pub(crate) struct ShadowTree {
    nodes: FxHashMap<ShadowId, ShadowNode>,
    by_key: FxHashMap<NodeKey, ShadowId>,
    by_uid: FxHashMap<Arc<str>, ShadowId>,
    next_id: u64,
}

impl ShadowTree {
    pub fn insert(&mut self, node: ShadowNode) -> ShadowId {
        let id = ShadowId(self.next_id);
        self.next_id += 1;
        if let Some(key) = node.key {
            self.by_key.insert(key, id);
        }
        self.by_uid.insert(node.uid.clone(), id);
        self.nodes.insert(id, node);
        id
    }

    pub fn get(&self, id: ShadowId) -> Option<&ShadowNode> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: ShadowId) -> Result<&ShadowNode, SyncError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| SyncError::Invariant(format!("shadow {id} is not in the arena")))
    }

    pub fn node_mut(&mut self, id: ShadowId) -> Result<&mut ShadowNode, SyncError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| SyncError::Invariant(format!("shadow {id} is not in the arena")))
    }

    pub fn children_mut(&mut self, id: ShadowId) -> Result<&mut Vec<ShadowId>, SyncError> {
        match &mut self.node_mut(id)?.kind {
            ShadowKind::Element { children, .. } => Ok(children),
            _ => Err(SyncError::Invariant(format!("shadow {id} is not an element"))),
        }
    }

    pub fn shared_children(&self, id: ShadowId) -> Result<ArrayRef, SyncError> {
        match &self.node(id)?.kind {
            ShadowKind::Element { shared_children, .. } => Ok(shared_children.clone()),
            _ => Err(SyncError::Invariant(format!("shadow {id} is not an element"))),
        }
    }

    pub fn lookup(&self, key: NodeKey) -> Option<ShadowId> {
        self.by_key.get(&key).copied()
    }

    pub fn lookup_uid(&self, uid: &str) -> Option<ShadowId> {
        self.by_uid.get(uid).copied()
    }

    /// Binds `key` to the shadow, replacing any previous binding of either side.
    pub fn register(&mut self, key: NodeKey, id: ShadowId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(old) = node.key.replace(key) {
                if old != key && self.by_key.get(&old) == Some(&id) {
                    self.by_key.remove(&old);
                }
            }
            self.by_key.insert(key, id);
        }
    }

    /// Removes the binding of `key`, but only if it still points at `id`.
    pub fn unregister(&mut self, key: NodeKey, id: ShadowId) -> bool {
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
            true
        } else {
            false
        }
    }

    /// Drops a shadow and its whole subtree from the arena.
    pub fn destroy(&mut self, id: ShadowId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            if let Some(key) = node.key {
                self.unregister(key, current);
            }
            if self.by_uid.get(&node.uid) == Some(&current) {
                self.by_uid.remove(&node.uid);
            }
            if let ShadowKind::Element { children, .. } = node.kind {
                stack.extend(children);
            }
        }
    }

    pub fn child_offset(&self, parent: ShadowId, child: ShadowId) -> Option<usize> {
        self.get(parent)?.children().iter().position(|c| *c == child)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
