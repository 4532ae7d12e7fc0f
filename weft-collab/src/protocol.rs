//! Binary protocol exchanged between collaborating peers.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Replica payloads (state vectors, updates) are opaque bytes produced by
//! the binding. Awareness payloads are bincode-encoded [`AwarenessState`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_core::collab::ReplicaCursor;

use crate::presence::CursorColor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Replica state vector, asks the receiver for what the sender lacks
    SyncStep1 = 1,
    /// Replica diff answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental replica update
    Delta = 3,
    /// Presence state
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for remote carets
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: CursorColor::from_uuid(peer_id).to_array(),
        }
    }
}

/// What a peer shares about itself besides document content.
///
/// `awareness_data` is application-defined and passed through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AwarenessState {
    pub name: String,
    pub color: [f32; 4],
    pub cursor: Option<ReplicaCursor>,
    pub awareness_data: Vec<u8>,
}

impl AwarenessState {
    pub fn for_peer(info: &PeerInfo) -> Self {
        Self {
            name: info.name.clone(),
            color: info.color,
            cursor: None,
            awareness_data: Vec::new(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender-local counter, bumped for every delta and awareness change
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn delta(peer_id: Uuid, doc_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            peer_id,
            doc_id,
            clock,
            payload: update,
        }
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            doc_id,
            clock: 0,
            payload: state_vector,
        }
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            doc_id,
            clock: 0,
            payload: diff,
        }
    }

    pub fn awareness(
        peer_id: Uuid,
        doc_id: Uuid,
        clock: u64,
        state: &AwarenessState,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Awareness,
            peer_id,
            doc_id,
            clock,
            payload,
        })
    }

    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::PeerJoined,
            peer_id: info.peer_id,
            doc_id,
            clock: 0,
            payload,
        })
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (state, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(state)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType(MessageType),
    WrongDocument { expected: Uuid, got: Uuid },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType(t) => write!(f, "Invalid message type {t:?}"),
            Self::WrongDocument { expected, got } => {
                write!(f, "Message for document {got}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
