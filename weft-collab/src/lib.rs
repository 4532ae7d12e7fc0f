//! # weft-collab: peer-side glue around the `weft-core` binding
//!
//! Wraps an editor and its binding into a [`CollabClient`] that speaks a
//! small binary protocol, and provides an in-memory [`LocalHub`] that routes
//! messages between clients.
//!
//! ```text
//! ┌──────────────┐   SyncMessage (bincode)   ┌──────────────┐
//! │ CollabClient │ ◄───────────────────────► │   LocalHub   │
//! │ Editor       │                           │ (fan-out,    │
//! │ Binding      │                           │  handshakes) │
//! └──────────────┘                           └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages (sync handshake, deltas, awareness)
//! - [`presence`]: remote awareness tracking
//! - [`client`]: one collaborating peer
//! - [`hub`]: in-memory transport used by tests, benches and `weft-sim`

pub mod client;
pub mod hub;
pub mod presence;
pub mod protocol;

pub use client::{ClientConfig, ClientError, CollabClient, ConnectionState};
pub use hub::LocalHub;
pub use presence::{CursorColor, PresenceRoom, RemotePeer};
pub use protocol::{AwarenessState, MessageType, PeerInfo, ProtocolError, SyncMessage};
