use super::cursor::ReplicaCursor;
use super::events::ReplicaEvent;
use super::props::{any_str, array_to_json, out_to_json, read_tag};
use super::shadow::{ShadowId, ShadowKind, ShadowNode, ShadowTree};
use super::{SyncError, KEY_AUTHOR, KEY_CATEGORY, KEY_TYPE, KEY_UID, ROOT_CHILDREN, ROOT_MAP, ROOT_PROPS, ROOT_UID};
use crate::editor::EditorUpdate;
use crate::node::{NodeCategory, NodeKey};
use crate::state::EditorState;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Array, ArrayRef, DeepObservable, Doc, GetString, Map as _, MapRef, Observable, OffsetKind, Options, Origin,
    Out, ReadTxn, StateVector, Subscription, Transact, TransactionMut, Update,
};

#[derive(Debug, Clone)]
pub struct BindingConfig {
    /// Identifies this session; its transactions carry it as origin.
    pub session_id: Uuid,
    /// Units used by the replica text type.
    pub offset_kind: OffsetKind,
    /// Keep deleted replica content around. Shadows hold handles to
    /// replica types until the next pass drops them.
    pub skip_gc: bool,
    /// Cross-check shadows against the replica and the editor after each pass.
    pub verify_after_sync: bool,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            offset_kind: OffsetKind::Bytes,
            skip_gc: true,
            verify_after_sync: cfg!(debug_assertions),
        }
    }
}

impl BindingConfig {
    /// A replica document set up the way the binding expects.
    pub fn create_doc(&self) -> Doc {
        let mut options = Options::default();
        options.offset_kind = self.offset_kind.clone();
        options.skip_gc = self.skip_gc;
        Doc::with_options(options)
    }
}

type EventQueue = Arc<Mutex<Vec<ReplicaEvent>>>;

/// Identity registry and sync state for one editor / replica pair.
pub struct Binding {
    pub(crate) doc: Doc,
    pub(crate) origin: Origin,
    pub(crate) config: BindingConfig,
    // Session id as written into the maps this session creates.
    pub(crate) author: Arc<str>,
    pub(crate) root: ShadowId,
    pub(crate) shadows: ShadowTree,
    pub(crate) root_children: ArrayRef,
    pub(crate) cursor: Option<ReplicaCursor>,
    pub(crate) needs_resync: bool,
    events: EventQueue,
    _subscriptions: Vec<Subscription>,
}

impl Binding {
    /// Opens a session on `doc`. Reserved root types are reused when they
    /// already exist. Nothing is written to the document here: root tags go
    /// out with the first local pass that changes the replica.
    pub fn new(doc: Doc, config: BindingConfig) -> Result<Self, SyncError> {
        let author: Arc<str> = Arc::from(config.session_id.to_string());
        let origin = Origin::from(&*author);
        let root_map = doc.get_or_insert_map(ROOT_MAP);
        let root_props = doc.get_or_insert_map(ROOT_PROPS);
        let root_children = doc.get_or_insert_array(ROOT_CHILDREN);

        let mut shadows = ShadowTree::default();
        let root = shadows.insert(ShadowNode {
            key: Some(NodeKey::ROOT),
            parent: None,
            node_type: "root".to_string(),
            uid: Arc::from(ROOT_UID),
            map: root_map,
            props: root_props.clone(),
            kind: ShadowKind::Element { children: Vec::new(), shared_children: root_children.clone() },
        });

        let events: EventQueue = Arc::new(Mutex::new(Vec::new()));
        let subscriptions = vec![
            observe_children(&root_children, origin.clone(), events.clone()),
            observe_root_props(&root_props, origin.clone(), events.clone()),
        ];

        let mut binding = Self {
            doc,
            origin,
            config,
            author,
            root,
            shadows,
            root_children,
            cursor: None,
            needs_resync: false,
            events,
            _subscriptions: subscriptions,
        };
        binding.adopt_existing_children()?;
        log::debug!(
            "binding opened for session {} with {} existing shadows",
            binding.config.session_id,
            binding.shadows.len()
        );
        Ok(binding)
    }

    // Mirrors content already present in the document as unbound shadows.
    fn adopt_existing_children(&mut self) -> Result<(), SyncError> {
        let doc = self.doc.clone();
        let txn = doc.transact();
        let len = self.root_children.len(&txn);
        for index in 0..len {
            let Some(Out::YMap(map)) = self.root_children.get(&txn, index) else {
                return Err(SyncError::UnexpectedEvent(format!("root child {index} is not a map")));
            };
            let child = self.adopt_map(&txn, map, self.root)?;
            self.shadows.children_mut(self.root)?.push(child);
        }
        Ok(())
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    pub fn session_origin(&self) -> &Origin {
        &self.origin
    }

    pub fn root(&self) -> ShadowId {
        self.root
    }

    pub fn shadow(&self, id: ShadowId) -> Option<&ShadowNode> {
        self.shadows.get(id)
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    pub fn lookup(&self, key: NodeKey) -> Option<ShadowId> {
        self.shadows.lookup(key)
    }

    pub fn lookup_uid(&self, uid: &str) -> Option<ShadowId> {
        self.shadows.lookup_uid(uid)
    }

    pub fn register(&mut self, key: NodeKey, id: ShadowId) {
        self.shadows.register(key, id);
    }

    /// Removes the binding of `key` if it still points at `id`.
    pub fn unregister(&mut self, key: NodeKey, id: ShadowId) -> bool {
        self.shadows.unregister(key, id)
    }

    /// Replica uid of a local node.
    pub fn uid_of(&self, key: NodeKey) -> Option<&str> {
        self.shadows.lookup(key).and_then(|id| self.shadows.get(id)).map(ShadowNode::uid)
    }

    /// Local key bound to a replica uid.
    pub fn key_of(&self, uid: &str) -> Option<NodeKey> {
        self.shadows.lookup_uid(uid).and_then(|id| self.shadows.get(id)).and_then(ShadowNode::key)
    }

    /// Writes the root tags when the document lacks them. Returns whether
    /// anything was written.
    pub(crate) fn write_root_tags(&self, txn: &mut TransactionMut) -> Result<bool, SyncError> {
        let root_map = &self.shadows.node(self.root)?.map;
        if root_map.get(&*txn, KEY_TYPE).is_some() {
            return Ok(false);
        }
        root_map.insert(txn, KEY_TYPE, any_str("root"));
        root_map.insert(txn, KEY_CATEGORY, any_str(NodeCategory::Element.as_str()));
        root_map.insert(txn, KEY_UID, any_str(ROOT_UID));
        Ok(true)
    }

    /// Whether the node map was created by this session.
    pub(crate) fn is_own<T: ReadTxn>(&self, map: &MapRef, txn: &T) -> bool {
        read_tag(map, txn, KEY_AUTHOR).is_ok_and(|author| author == *self.author)
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Records fatal failures. The two trees can no longer be trusted to
    /// match once a pass stopped halfway.
    pub(crate) fn guard<T>(&mut self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        if let Err(err) = &result {
            log::warn!("sync pass failed, session requires a full resync: {err}");
            self.needs_resync = true;
        }
        result
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), SyncError> {
        if self.needs_resync {
            Err(SyncError::ResyncRequired)
        } else {
            Ok(())
        }
    }

    /// Replica changes made by other sessions since the last call.
    pub fn take_events(&self) -> Vec<ReplicaEvent> {
        let mut queue = match self.events.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *queue)
    }

    pub fn pending_events(&self) -> usize {
        match self.events.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Applies an encoded update from a peer and returns the changes it produced.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<Vec<ReplicaEvent>, SyncError> {
        let decoded = Update::decode_v1(update).map_err(|e| SyncError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded).map_err(|e| SyncError::Apply(e.to_string()))?;
        }
        Ok(self.take_events())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    /// Rebuilds the local tree from the replica. Used when a session opens
    /// on a document that already has content.
    pub fn hydrate(&mut self, update: &mut EditorUpdate<'_>) -> Result<(), SyncError> {
        self.ensure_usable()?;
        let doc = self.doc.clone();
        let txn = doc.transact();
        let result = self.sync_children_from_replica(&txn, update, self.root);
        self.guard(result)?;
        self.keep_foreign_text_separate(&txn, update);
        Ok(())
    }

    /// JSON dump of the reserved root types.
    pub fn doc_json(&self) -> Value {
        let txn = self.doc.transact();
        let mut out = Map::new();
        if let Some(root) = self.shadows.get(self.root) {
            out.insert(ROOT_MAP.to_string(), out_to_json(&Out::YMap(root.map.clone()), &txn));
            out.insert(ROOT_PROPS.to_string(), out_to_json(&Out::YMap(root.props.clone()), &txn));
        }
        out.insert(ROOT_CHILDREN.to_string(), array_to_json(&self.root_children, &txn));
        Value::Object(out)
    }

    /// Debug dump of the shadow tree with local keys.
    pub fn shadow_json(&self) -> Value {
        let txn = self.doc.transact();
        self.shadow_node_json(&txn, self.root)
    }

    fn shadow_node_json<T: ReadTxn>(&self, txn: &T, id: ShadowId) -> Value {
        let Some(node) = self.shadows.get(id) else {
            return Value::Null;
        };
        let mut out = json!({
            "type": node.node_type,
            "uid": node.uid.as_ref(),
            "key": node.key.map(|k| k.0),
        });
        match &node.kind {
            ShadowKind::Element { children, .. } => {
                out["children"] = Value::Array(children.iter().map(|c| self.shadow_node_json(txn, *c)).collect());
            }
            ShadowKind::Text { text } => out["text"] = json!(text.get_string(txn)),
            ShadowKind::Decorator | ShadowKind::LineBreak => {}
        }
        out
    }

    /// Checks that every shadow matches both its replica map and its local node.
    pub fn verify(&self, state: &EditorState) -> Result<(), SyncError> {
        let txn = self.doc.transact();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.shadows.node(id)?;
            match read_tag(&node.map, &txn, KEY_UID) {
                Ok(uid) if uid == node.uid.as_ref() => {}
                // Root tags are absent until the first local write.
                Err(SyncError::MissingAttribute(_)) if id == self.root => {}
                _ => return Err(SyncError::Invariant(format!("shadow {id} uid differs from its map"))),
            }
            let key = node.key.ok_or_else(|| SyncError::Invariant(format!("shadow {id} has no local node")))?;
            let local = state.node(key)?;
            if local.category() != node.category() || local.node_type != node.node_type {
                return Err(SyncError::Invariant(format!("shadow {id} does not match node {key}")));
            }
            match &node.kind {
                ShadowKind::Element { children, shared_children } => {
                    if shared_children.len(&txn) as usize != children.len() {
                        return Err(SyncError::Invariant(format!("shadow {id} child count differs from replica")));
                    }
                    let local_children = state.children_keys(key)?;
                    let shadow_keys: Vec<Option<NodeKey>> =
                        children.iter().map(|c| self.shadows.get(*c).and_then(ShadowNode::key)).collect();
                    if shadow_keys != local_children.iter().copied().map(Some).collect::<Vec<_>>() {
                        return Err(SyncError::Invariant(format!("shadow {id} children differ from node {key}")));
                    }
                    stack.extend(children.iter().copied());
                }
                ShadowKind::Text { text } => {
                    if local.text() != Some(text.get_string(&txn).as_str()) {
                        return Err(SyncError::Invariant(format!("shadow {id} text differs from node {key}")));
                    }
                }
                ShadowKind::Decorator | ShadowKind::LineBreak => {}
            }
        }
        Ok(())
    }
}

fn observe_children(children: &ArrayRef, own: Origin, sink: EventQueue) -> Subscription {
    children.observe_deep(move |txn, events| {
        if txn.origin() == Some(&own) {
            log::trace!("ignoring replica events from own session");
            return;
        }
        let mut queue = match sink.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        for event in events.iter() {
            queue.push(ReplicaEvent::capture(txn, event));
        }
    })
}

fn observe_root_props(props: &MapRef, own: Origin, sink: EventQueue) -> Subscription {
    props.observe(move |txn, event| {
        if txn.origin() == Some(&own) {
            return;
        }
        let mut queue = match sink.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.push(ReplicaEvent::root_props(event.keys(txn).len()));
    })
}
