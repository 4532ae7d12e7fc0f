//! Remote presence tracking.
//!
//! Awareness updates carry each peer's replica cursor and an opaque
//! application payload. The room keeps the latest state per peer and
//! ignores updates older than the one it already holds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weft_core::collab::ReplicaCursor;

use crate::protocol::{AwarenessState, PeerInfo};

/// RGBA color for remote carets and selections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, saturated color derived from a peer id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Last known presence of one remote peer.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub peer_id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub state: AwarenessState,
    /// Clock of the awareness message `state` came from
    pub clock: u64,
}

impl RemotePeer {
    fn new(peer_id: Uuid, name: String, color: CursorColor) -> Self {
        Self { peer_id, name, color, state: AwarenessState::default(), clock: 0 }
    }

    pub fn cursor(&self) -> Option<&ReplicaCursor> {
        self.state.cursor.as_ref()
    }
}

/// Presence state of every remote peer sharing a document.
pub struct PresenceRoom {
    local_user_id: Uuid,
    peers: HashMap<Uuid, RemotePeer>,
}

impl PresenceRoom {
    pub fn new(local_user_id: Uuid) -> Self {
        Self { local_user_id, peers: HashMap::new() }
    }

    pub fn handle_join(&mut self, info: &PeerInfo) {
        if info.peer_id == self.local_user_id {
            return;
        }
        let [r, g, b, a] = info.color;
        self.peers
            .entry(info.peer_id)
            .and_modify(|peer| peer.name = info.name.clone())
            .or_insert_with(|| RemotePeer::new(info.peer_id, info.name.clone(), CursorColor { r, g, b, a }));
    }

    pub fn handle_leave(&mut self, peer_id: Uuid) -> Option<RemotePeer> {
        self.peers.remove(&peer_id)
    }

    /// Stores an awareness update. Returns false when it was ignored.
    pub fn handle_awareness(&mut self, peer_id: Uuid, clock: u64, state: AwarenessState) -> bool {
        if peer_id == self.local_user_id {
            return false;
        }
        // The peer may have joined before we did, so it gets a placeholder.
        let peer = self.peers.entry(peer_id).or_insert_with(|| {
            RemotePeer::new(peer_id, format!("Peer-{}", &peer_id.to_string()[..8]), CursorColor::from_uuid(peer_id))
        });
        if clock < peer.clock {
            log::trace!("stale awareness from {peer_id}: {clock} < {}", peer.clock);
            return false;
        }
        if !state.name.is_empty() {
            peer.name = state.name.clone();
        }
        peer.clock = clock;
        peer.state = state;
        true
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&RemotePeer> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_color_from_uuid_stable() {
        let id = Uuid::new_v4();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
    }

    #[test]
    fn test_hsl_to_rgb_achromatic() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_room_ignores_self() {
        let me = PeerInfo::new("me");
        let mut room = PresenceRoom::new(me.peer_id);
        room.handle_join(&me);
        assert!(!room.handle_awareness(me.peer_id, 1, AwarenessState::for_peer(&me)));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_room_join_update_leave() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let alice = PeerInfo::new("Alice");
        room.handle_join(&alice);
        assert_eq!(room.peer(&alice.peer_id).unwrap().name, "Alice");

        let state = AwarenessState { awareness_data: vec![1], ..AwarenessState::for_peer(&alice) };
        assert!(room.handle_awareness(alice.peer_id, 2, state));
        assert_eq!(room.peer(&alice.peer_id).unwrap().state.awareness_data, vec![1]);

        assert!(room.handle_leave(alice.peer_id).is_some());
        assert!(room.peer(&alice.peer_id).is_none());
    }

    #[test]
    fn test_room_rejects_stale_awareness() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let bob = PeerInfo::new("Bob");
        let newer = AwarenessState { awareness_data: vec![2], ..AwarenessState::for_peer(&bob) };
        let older = AwarenessState { awareness_data: vec![1], ..AwarenessState::for_peer(&bob) };
        assert!(room.handle_awareness(bob.peer_id, 5, newer));
        assert!(!room.handle_awareness(bob.peer_id, 4, older));
        assert_eq!(room.peer(&bob.peer_id).unwrap().state.awareness_data, vec![2]);
    }

    #[test]
    fn test_awareness_from_unknown_peer_creates_placeholder() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let id = Uuid::new_v4();
        assert!(room.handle_awareness(id, 1, AwarenessState::default()));
        let peer = room.peer(&id).unwrap();
        assert!(peer.name.starts_with("Peer-"));
        assert_eq!(peer.color, CursorColor::from_uuid(id));
    }
}
