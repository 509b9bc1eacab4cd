//! Packet kind registries.
//!
//! Discriminants are stable across protocol versions; never renumber.

/// Outer packet kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Acked, retransmitted, delivered in order.
    Lossless = 0x5A,
    /// Best-effort datagram.
    Lossy = 0x5B,
    /// Asymmetrically encrypted pre-session packet.
    Handshake = 0x5C,
}

impl PacketKind {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x5A => Some(PacketKind::Lossless),
            0x5B => Some(PacketKind::Lossy),
            0x5C => Some(PacketKind::Handshake),
            _ => None,
        }
    }
}

/// Inner packet kinds carried inside the encrypted payload.
///
/// Values start at 1: the padding stripper treats leading zero bytes as
/// padding, so zero can never be a valid kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InnerKind {
    Ping = 1,
    MessageAck = 2,
    InviteRequest = 3,
    InviteResponse = 4,
    InviteResponseReject = 5,
    SyncRequest = 6,
    SyncResponse = 7,
    Topic = 8,
    SharedState = 9,
    ModList = 10,
    SanctionsList = 11,
    HsResponseAck = 12,
    PeerInfoRequest = 13,
    PeerInfoResponse = 14,
    PeerAnnounce = 15,
    TcpRelays = 16,
    IpPort = 17,
    CustomPacket = 18,
    Broadcast = 19,
}

impl InnerKind {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(InnerKind::Ping),
            2 => Some(InnerKind::MessageAck),
            3 => Some(InnerKind::InviteRequest),
            4 => Some(InnerKind::InviteResponse),
            5 => Some(InnerKind::InviteResponseReject),
            6 => Some(InnerKind::SyncRequest),
            7 => Some(InnerKind::SyncResponse),
            8 => Some(InnerKind::Topic),
            9 => Some(InnerKind::SharedState),
            10 => Some(InnerKind::ModList),
            11 => Some(InnerKind::SanctionsList),
            12 => Some(InnerKind::HsResponseAck),
            13 => Some(InnerKind::PeerInfoRequest),
            14 => Some(InnerKind::PeerInfoResponse),
            15 => Some(InnerKind::PeerAnnounce),
            16 => Some(InnerKind::TcpRelays),
            17 => Some(InnerKind::IpPort),
            18 => Some(InnerKind::CustomPacket),
            19 => Some(InnerKind::Broadcast),
            _ => None,
        }
    }

    /// True for kinds that may travel in a lossy packet.
    pub fn is_lossy(self) -> bool {
        matches!(
            self,
            InnerKind::Ping
                | InnerKind::MessageAck
                | InnerKind::IpPort
                | InnerKind::TcpRelays
                | InnerKind::InviteResponseReject
                | InnerKind::CustomPacket
        )
    }
}

/// Broadcast sub-types, carried after the broadcast header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BroadcastKind {
    Status = 0,
    Nick = 1,
    PlainMessage = 2,
    ActionMessage = 3,
    PrivateMessage = 4,
    PeerExit = 5,
    RemovePeer = 6,
    RemoveBan = 7,
    SetMod = 8,
    SetObserver = 9,
}

impl BroadcastKind {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BroadcastKind::Status),
            1 => Some(BroadcastKind::Nick),
            2 => Some(BroadcastKind::PlainMessage),
            3 => Some(BroadcastKind::ActionMessage),
            4 => Some(BroadcastKind::PrivateMessage),
            5 => Some(BroadcastKind::PeerExit),
            6 => Some(BroadcastKind::RemovePeer),
            7 => Some(BroadcastKind::RemoveBan),
            8 => Some(BroadcastKind::SetMod),
            9 => Some(BroadcastKind::SetObserver),
            _ => None,
        }
    }
}

/// Handshake packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    Request = 0,
    Response = 1,
}

impl HandshakeType {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HandshakeType::Request),
            1 => Some(HandshakeType::Response),
            _ => None,
        }
    }
}

/// What the handshake initiator intends to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeRequestType {
    /// Followed by an invite request (joining the group).
    InviteRequest = 0,
    /// Followed by a peer-info exchange (already a member).
    PeerInfoExchange = 1,
}

impl HandshakeRequestType {
    /// Decode a wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HandshakeRequestType::InviteRequest),
            1 => Some(HandshakeRequestType::PeerInfoExchange),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_kinds_are_nonzero_and_stable() {
        for value in 1..=19u8 {
            let kind = InnerKind::from_u8(value).expect("kind");
            assert_eq!(kind as u8, value);
        }
        assert!(InnerKind::from_u8(0).is_none());
        assert!(InnerKind::from_u8(20).is_none());
    }

    #[test]
    fn outer_kinds_round_trip() {
        for kind in [PacketKind::Lossless, PacketKind::Lossy, PacketKind::Handshake] {
            assert_eq!(PacketKind::from_u8(kind as u8), Some(kind));
        }
        assert!(PacketKind::from_u8(0x59).is_none());
    }

    #[test]
    fn lossy_classification() {
        assert!(InnerKind::Ping.is_lossy());
        assert!(InnerKind::MessageAck.is_lossy());
        assert!(!InnerKind::Broadcast.is_lossy());
        assert!(!InnerKind::SyncRequest.is_lossy());
    }

    #[test]
    fn broadcast_kinds_round_trip() {
        for value in 0..=9u8 {
            let kind = BroadcastKind::from_u8(value).expect("kind");
            assert_eq!(kind as u8, value);
        }
        assert!(BroadcastKind::from_u8(10).is_none());
    }
}
