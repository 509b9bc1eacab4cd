//! Events surfaced to the host through session callbacks.
//!
//! Packet handlers record events on the chat as they run; the session
//! drains them into the registered callbacks before the call that
//! produced them returns, so the host observes everything synchronously
//! within the tick.

use palaver_types::events::{MessageType, ModerationEvent, RejectReason};
use palaver_types::peer::{PeerStatus, Privacy};
use palaver_types::PeerId;

/// A host-visible group event.
#[derive(Clone, Debug)]
pub enum GroupEvent {
    /// A plain or action message from a peer.
    Message {
        peer_id: PeerId,
        kind: MessageType,
        message: Vec<u8>,
    },
    /// A private message addressed to us.
    PrivateMessage { peer_id: PeerId, message: Vec<u8> },
    /// An application-defined packet.
    CustomPacket { peer_id: PeerId, data: Vec<u8> },
    /// A moderation action was applied.
    Moderation {
        src_peer_id: PeerId,
        target_peer_id: PeerId,
        event: ModerationEvent,
    },
    /// A peer changed its nick.
    NickChange { peer_id: PeerId, nick: Vec<u8> },
    /// A peer changed its status.
    StatusChange { peer_id: PeerId, status: PeerStatus },
    /// The topic changed.
    TopicChange { peer_id: PeerId, topic: Vec<u8> },
    /// The founder changed the peer limit.
    PeerLimit { max_peers: u32 },
    /// The founder changed the privacy state.
    PrivacyState { privacy: Privacy },
    /// The founder changed the password.
    Password { password: Vec<u8> },
    /// A peer completed joining.
    PeerJoin { peer_id: PeerId },
    /// A peer left or was evicted.
    PeerExit {
        peer_id: PeerId,
        part_message: Vec<u8>,
    },
    /// Our own join completed.
    SelfJoin,
    /// Our join attempt was rejected.
    Rejected { reason: RejectReason },
}
