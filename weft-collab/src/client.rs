//! One collaborating peer: an editor, its binding and an outbox.
//!
//! Provides:
//! - Local edit batches pushed into the replica as deltas
//! - Remote updates replayed onto the editor, with selection repair
//! - The two-step state-vector handshake used on (re)connect
//! - Awareness pass-through
//!
//! The client does no I/O. Outgoing messages pile up in an outbox that the
//! transport drains with [`CollabClient::take_outgoing`]; edits made while
//! disconnected stay in the replica and travel with the next handshake.

use std::collections::VecDeque;

use thiserror::Error;
use uuid::Uuid;
use weft_core::collab::{Binding, BindingConfig, SelectionRecovery, SyncError};
use weft_core::{CoreError, Editor, EditorState, EditorUpdate, NodeKey, NodeTypes, COLLABORATION_TAG};
use yrs::updates::decoder::Decode;
use yrs::{Transact, Update};

use crate::presence::PresenceRoom;
use crate::protocol::{AwarenessState, MessageType, PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Node types the local editor accepts
    pub node_types: NodeTypes,
    /// Keep deleted replica content (see [`BindingConfig::skip_gc`])
    pub skip_gc: bool,
    /// Cross-check binding and editor after every pass
    pub verify_after_sync: bool,
    /// Give an empty document a first paragraph when the client opens
    pub bootstrap: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_types: NodeTypes::default(),
            skip_gc: true,
            verify_after_sync: cfg!(debug_assertions),
            bootstrap: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no client at index {0}")]
    UnknownClient(usize),
}

impl From<CoreError> for ClientError {
    fn from(err: CoreError) -> Self {
        ClientError::Sync(SyncError::Core(err))
    }
}

pub struct CollabClient {
    info: PeerInfo,
    doc_id: Uuid,
    editor: Editor,
    binding: Binding,
    state: ConnectionState,
    clock: u64,
    awareness: AwarenessState,
    presence: PresenceRoom,
    outbox: VecDeque<SyncMessage>,
}

impl CollabClient {
    pub fn new(info: PeerInfo, doc_id: Uuid, config: ClientConfig) -> Result<Self, ClientError> {
        let binding_config = BindingConfig {
            session_id: info.peer_id,
            skip_gc: config.skip_gc,
            verify_after_sync: config.verify_after_sync,
            ..BindingConfig::default()
        };
        let binding = Binding::new(binding_config.create_doc(), binding_config)?;
        let mut client = Self::assemble(info, doc_id, Editor::with_types(config.node_types), binding);
        if config.bootstrap {
            client.bootstrap()?;
        }
        Ok(client)
    }

    /// Opens a client on a document snapshot (a full replica update), building
    /// the local tree from it.
    pub fn open(info: PeerInfo, doc_id: Uuid, config: ClientConfig, snapshot: &[u8]) -> Result<Self, ClientError> {
        let binding_config = BindingConfig {
            session_id: info.peer_id,
            skip_gc: config.skip_gc,
            verify_after_sync: config.verify_after_sync,
            ..BindingConfig::default()
        };
        let doc = binding_config.create_doc();
        {
            let update = Update::decode_v1(snapshot).map_err(|e| SyncError::Decode(e.to_string()))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update).map_err(|e| SyncError::Apply(e.to_string()))?;
        }
        let mut binding = Binding::new(doc, binding_config)?;
        let mut editor = Editor::with_types(config.node_types);
        let (_, record) = editor.update(&[COLLABORATION_TAG], |u| binding.hydrate(u))?;
        binding.sync_local_update(&record)?;

        let mut client = Self::assemble(info, doc_id, editor, binding);
        if config.bootstrap {
            client.bootstrap()?;
        }
        Ok(client)
    }

    fn assemble(info: PeerInfo, doc_id: Uuid, editor: Editor, binding: Binding) -> Self {
        Self {
            awareness: AwarenessState::for_peer(&info),
            presence: PresenceRoom::new(info.peer_id),
            info,
            doc_id,
            editor,
            binding,
            state: ConnectionState::Disconnected,
            clock: 0,
            outbox: VecDeque::new(),
        }
    }

    /// Adds an empty paragraph when the root has no children.
    pub fn bootstrap(&mut self) -> Result<bool, ClientError> {
        if self.editor.state().root().child_count() > 0 {
            return Ok(false);
        }
        self.update(|u| {
            let paragraph = u.create_element("paragraph")?;
            u.append(NodeKey::ROOT, paragraph)
        })?;
        Ok(true)
    }

    pub fn peer_id(&self) -> Uuid {
        self.info.peer_id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn editor_state(&self) -> &EditorState {
        self.editor.state()
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Runs one local edit batch and forwards the resulting replica update.
    pub fn update<F, R>(&mut self, f: F) -> Result<R, ClientError>
    where
        F: FnOnce(&mut EditorUpdate<'_>) -> Result<R, CoreError>,
    {
        let (value, record) = self.editor.update(&[], f)?;
        if let Some(delta) = self.binding.sync_local_update(&record)? {
            self.emit_delta(delta);
        }
        self.refresh_awareness()?;
        Ok(value)
    }

    /// Applies a replica update from a peer and replays it onto the editor.
    ///
    /// Returns `None` when the update carried nothing new. Text nodes merged
    /// by normalization during the replay are written back and sent out.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<Option<SelectionRecovery>, ClientError> {
        let events = self.binding.apply_update(update)?;
        if events.is_empty() {
            log::trace!("peer {}: remote update carried no changes", self.info.name);
            return Ok(None);
        }
        let binding = &mut self.binding;
        let ((stats, recovery), record) = self
            .editor
            .update(&[COLLABORATION_TAG], |u| binding.sync_replica_to_local(u, &events))?;
        if let Some(cleanup) = self.binding.sync_local_update(&record)? {
            log::debug!("peer {}: sending normalization cleanup", self.info.name);
            self.emit_delta(cleanup);
        }
        log::debug!(
            "peer {}: applied {} remote events ({} skipped)",
            self.info.name,
            stats.applied,
            stats.skipped
        );
        self.refresh_awareness()?;
        Ok(Some(recovery))
    }

    /// Asks a peer for everything this client lacks.
    pub fn sync_step1(&self) -> SyncMessage {
        SyncMessage::sync_step1(self.info.peer_id, self.doc_id, self.binding.encode_state_vector())
    }

    /// Everything this client has that the owner of `state_vector` lacks.
    pub fn sync_step2(&self, state_vector: &[u8]) -> Result<SyncMessage, ClientError> {
        let diff = self.binding.encode_diff(state_vector)?;
        Ok(SyncMessage::sync_step2(self.info.peer_id, self.doc_id, diff))
    }

    /// Processes one incoming message. Returns the replies addressed to its
    /// sender; broadcasts go to the outbox.
    pub fn handle_message(&mut self, msg: &SyncMessage) -> Result<Vec<SyncMessage>, ClientError> {
        if msg.peer_id == self.info.peer_id {
            log::trace!("peer {}: skipping own message", self.info.name);
            return Ok(Vec::new());
        }
        if msg.doc_id != self.doc_id {
            return Err(ProtocolError::WrongDocument { expected: self.doc_id, got: msg.doc_id }.into());
        }

        match msg.msg_type {
            MessageType::SyncStep1 => return Ok(vec![self.sync_step2(&msg.payload)?]),
            MessageType::SyncStep2 | MessageType::Delta => {
                self.apply_remote_update(&msg.payload)?;
            }
            MessageType::Awareness => {
                let state = msg.awareness_state()?;
                self.presence.handle_awareness(msg.peer_id, msg.clock, state);
            }
            MessageType::PeerJoined => {
                let info = msg.peer_info()?;
                log::info!("peer {}: {} joined", self.info.name, info.name);
                self.presence.handle_join(&info);
            }
            MessageType::PeerLeft => {
                if let Some(peer) = self.presence.handle_leave(msg.peer_id) {
                    log::info!("peer {}: {} left", self.info.name, peer.name);
                }
            }
        }
        Ok(Vec::new())
    }

    /// Marks the client connected and queues its join and presence.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        self.state = ConnectionState::Connected;
        let intro = self.presence_messages()?;
        self.outbox.extend(intro);
        Ok(())
    }

    /// Join notice and current awareness, for peers that do not know this client yet.
    pub fn presence_messages(&self) -> Result<Vec<SyncMessage>, ClientError> {
        Ok(vec![
            SyncMessage::peer_joined(self.doc_id, &self.info)?,
            SyncMessage::awareness(self.info.peer_id, self.doc_id, self.clock, &self.awareness)?,
        ])
    }

    /// Drops queued messages and forgets remote presence. The returned
    /// message tells the others this client left.
    pub fn disconnect(&mut self) -> SyncMessage {
        self.state = ConnectionState::Disconnected;
        self.outbox.clear();
        self.presence.clear();
        SyncMessage::peer_left(self.info.peer_id, self.doc_id)
    }

    pub fn take_outgoing(&mut self) -> Vec<SyncMessage> {
        self.outbox.drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn awareness(&self) -> &AwarenessState {
        &self.awareness
    }

    /// Replaces the opaque application part of this client's presence.
    pub fn set_awareness_data(&mut self, data: Vec<u8>) -> Result<(), ClientError> {
        self.awareness.awareness_data = data;
        self.broadcast_awareness()
    }

    // Pushes the binding's cursor into the presence state when it moved.
    fn refresh_awareness(&mut self) -> Result<(), ClientError> {
        let cursor = self.binding.cursor().cloned();
        if cursor == self.awareness.cursor {
            return Ok(());
        }
        self.awareness.cursor = cursor;
        self.broadcast_awareness()
    }

    fn broadcast_awareness(&mut self) -> Result<(), ClientError> {
        self.clock += 1;
        if self.state == ConnectionState::Connected {
            let msg = SyncMessage::awareness(self.info.peer_id, self.doc_id, self.clock, &self.awareness)?;
            self.outbox.push_back(msg);
        }
        Ok(())
    }

    fn emit_delta(&mut self, delta: Vec<u8>) {
        self.clock += 1;
        if self.state == ConnectionState::Connected {
            self.outbox
                .push_back(SyncMessage::delta(self.info.peer_id, self.doc_id, self.clock, delta));
        } else {
            log::debug!(
                "peer {}: offline, {} byte delta kept for the next handshake",
                self.info.name,
                delta.len()
            );
        }
    }

    /// The local tree as JSON.
    pub fn content_json(&self) -> serde_json::Value {
        self.editor.state().to_json()
    }

    /// The replica document as JSON.
    pub fn doc_json(&self) -> serde_json::Value {
        self.binding.doc_json()
    }

    pub fn text_content(&self) -> String {
        self.editor.state().text_content(NodeKey::ROOT)
    }

    /// Checks the binding against the local tree.
    pub fn verify(&self) -> Result<(), ClientError> {
        Ok(self.binding.verify(self.editor.state())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str, doc: Uuid, bootstrap: bool) -> CollabClient {
        CollabClient::new(PeerInfo::new(name), doc, ClientConfig { bootstrap, ..ClientConfig::default() }).unwrap()
    }

    #[test]
    fn test_bootstrap_adds_paragraph_once() {
        let mut c = client("a", Uuid::new_v4(), true);
        assert_eq!(c.editor_state().root().child_count(), 1);
        assert!(!c.bootstrap().unwrap());
    }

    #[test]
    fn test_offline_edits_queue_nothing() {
        let mut c = client("a", Uuid::new_v4(), true);
        c.update(|u| {
            let t = u.create_text("x")?;
            let p = u.state().root().first_child().ok_or(CoreError::NodeNotFound(NodeKey::ROOT))?;
            u.append(p, t)
        })
        .unwrap();
        assert!(!c.has_outgoing());
        assert!(c.clock() > 0);
    }

    #[test]
    fn test_handshake_between_two_clients() {
        let doc = Uuid::new_v4();
        let mut a = client("a", doc, true);
        let mut b = client("b", doc, false);

        let replies = a.handle_message(&b.sync_step1()).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type, MessageType::SyncStep2);
        b.handle_message(&replies[0]).unwrap();

        assert_eq!(a.content_json(), b.content_json());
        b.verify().unwrap();
    }

    #[test]
    fn test_rejects_other_document() {
        let mut a = client("a", Uuid::new_v4(), false);
        let b = client("b", Uuid::new_v4(), false);
        assert!(matches!(
            a.handle_message(&b.sync_step1()),
            Err(ClientError::Protocol(ProtocolError::WrongDocument { .. }))
        ));
    }

    #[test]
    fn test_open_from_snapshot() {
        let doc = Uuid::new_v4();
        let a = client("a", doc, true);
        let snapshot = a.binding().encode_diff(&client("tmp", doc, false).binding().encode_state_vector()).unwrap();

        let b = CollabClient::open(PeerInfo::new("b"), doc, ClientConfig::default(), &snapshot).unwrap();
        assert_eq!(b.content_json(), a.content_json());
        b.verify().unwrap();
    }
}
