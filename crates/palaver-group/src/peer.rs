//! A single entry in a chat's peer table.

use palaver_types::peer::{PeerStatus, Role};
use palaver_types::PeerId;

use crate::conn::PeerConnection;

/// Application-visible peer attributes.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Display nick, unique within the group.
    pub nick: Vec<u8>,
    /// Self-reported status.
    pub status: PeerStatus,
    /// Validated role. `Invalid` until peer info has been exchanged.
    pub role: Role,
    /// Opaque random id handed to the host; unique within the chat.
    pub peer_id: PeerId,
    /// Local-only mute flag.
    pub ignore: bool,
}

impl Peer {
    /// A fresh, not yet validated peer.
    pub fn unvalidated(peer_id: PeerId) -> Self {
        Self {
            nick: Vec::new(),
            status: PeerStatus::None,
            role: Role::Invalid,
            peer_id,
            ignore: false,
        }
    }
}

/// A peer table slot: the peer plus its connection. Slot 0 is always
/// self and carries no connection.
pub struct PeerEntry {
    pub peer: Peer,
    pub conn: Option<PeerConnection>,
}
