//! # palaver-group
//!
//! The replicated-state core of the Palaver group-chat protocol.
//!
//! A [`Session`](session::Session) owns any number of group chats. Each
//! chat keeps an authoritative replica of the group's distributed state:
//! the peer table, the founder-signed shared state, the moderator list,
//! the sanctions list, and the topic. Peers talk over an unreliable
//! datagram overlay supplied by the embedder through the
//! [`Overlay`](overlay::Overlay) trait; a lossless, in-order,
//! exactly-once stream per peer pair is built on top of it with 64-slot
//! send and receive windows.
//!
//! ## Architecture
//!
//! ```text
//! Session (session.rs)      -- chat table, tick, callbacks, invites
//!     |
//! Chat (chat.rs)            -- per-group state machine
//!     |-- membership.rs     -- peer table, roles, nick policy
//!     |-- handshake.rs      -- 3-step handshake, rate limiting
//!     |-- transport.rs      -- lossless/lossy send, acks, dispatch
//!     |-- broadcast.rs      -- group-wide typed broadcasts
//!     |-- replication.rs    -- shared state / mod list / sanctions / topic
//!     |-- sync.rs           -- sync request/response, ping-driven sync
//!     |
//! PeerConnection (conn.rs)  -- session keys, send/recv windows, timers
//! ```
//!
//! Everything runs on the embedder's thread from a single `tick`; no
//! operation blocks and callbacks fire synchronously during the tick
//! that caused them.

pub mod broadcast;
pub mod chat;
pub mod conn;
pub mod events;
pub mod handshake;
pub mod membership;
pub mod moderation;
pub mod overlay;
pub mod peer;
pub mod replication;
pub mod saved;
pub mod session;
pub mod sync;
pub mod transport;

pub use chat::Chat;
pub use events::GroupEvent;
pub use overlay::Overlay;
pub use session::{Callbacks, Session};

/// Error types for group operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// Input ended before the expected field.
    #[error("short buffer")]
    ShortBuffer,

    /// A packet failed authenticated decryption.
    #[error("decrypt failed")]
    DecryptFailed,

    /// A signature did not verify.
    #[error("bad signature")]
    BadSignature,

    /// A versioned artifact was older than our replica, or a version
    /// counter cannot advance further.
    #[error("stale version")]
    VersionStale,

    /// The caller's role does not permit the operation.
    #[error("insufficient role")]
    RoleInsufficient,

    /// The nick is empty, oversized, or already taken.
    #[error("duplicate or invalid nick")]
    DuplicateNick,

    /// The group is at its peer limit.
    #[error("group full")]
    GroupFull,

    /// The supplied password did not match the shared state.
    #[error("invalid password")]
    InvalidPassword,

    /// No peer matches the given id or key.
    #[error("unknown peer")]
    PeerUnknown,

    /// The peer is already present.
    #[error("duplicate peer")]
    PeerDuplicate,

    /// The new-connection rate limiter is engaged.
    #[error("rate limited")]
    RateLimited,

    /// The overlay refused the send, or the send window is full.
    #[error("transport failure")]
    TransportFailure,

    /// Malformed or inconsistent data from a peer or the caller.
    #[error("malformed: {0}")]
    Malformed(String),

    /// No chat with the given group number or chat id.
    #[error("unknown group")]
    GroupUnknown,
}

impl From<palaver_wire::WireError> for GroupError {
    fn from(err: palaver_wire::WireError) -> Self {
        match err {
            palaver_wire::WireError::ShortBuffer => GroupError::ShortBuffer,
            palaver_wire::WireError::DecryptFailed => GroupError::DecryptFailed,
            palaver_wire::WireError::MalformedRecord(msg) => GroupError::Malformed(msg),
            palaver_wire::WireError::PayloadTooLarge(n) => {
                GroupError::Malformed(format!("payload too large: {n}"))
            }
        }
    }
}

impl From<palaver_crypto::CryptoError> for GroupError {
    fn from(err: palaver_crypto::CryptoError) -> Self {
        match err {
            palaver_crypto::CryptoError::SignatureVerification => GroupError::BadSignature,
            palaver_crypto::CryptoError::AeadDecryption => GroupError::DecryptFailed,
            other => GroupError::Malformed(other.to_string()),
        }
    }
}

/// Result type alias for group operations.
pub type Result<T> = std::result::Result<T, GroupError>;

/// Protocol timing constants, in seconds.
pub mod timing {
    /// Interval between pings to confirmed peers.
    pub const PING_INTERVAL: u64 = 12;
    /// A confirmed peer is evicted after this long without a ping.
    pub const CONFIRMED_PEER_TIMEOUT: u64 = 60;
    /// An unconfirmed peer is evicted after this long without a ping.
    pub const UNCONFIRMED_PEER_TIMEOUT: u64 = 24;
    /// Delay before a scheduled handshake is sent.
    pub const HANDSHAKE_SENDING_TIMEOUT: u64 = 3;
    /// A pending handshake is abandoned this long after its deadline.
    pub const PENDING_HANDSHAKE_MAX_INTERVAL: u64 = 10;
    /// Interval between join attempts while disconnected.
    pub const JOIN_ATTEMPT_INTERVAL: u64 = 20;
    /// Interval between sharing our TCP relays with a confirmed peer.
    pub const TCP_RELAYS_SHARE_INTERVAL: u64 = 300;
    /// Interval between sharing our ip+port with a confirmed peer.
    pub const IP_PORT_SHARE_INTERVAL: u64 = 120;
    /// An unacked lossless packet this old drops the connection.
    pub const UNACKED_DROP_TIMEOUT: u64 = 30;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_error_mapping() {
        assert!(matches!(
            GroupError::from(palaver_wire::WireError::ShortBuffer),
            GroupError::ShortBuffer
        ));
        assert!(matches!(
            GroupError::from(palaver_wire::WireError::DecryptFailed),
            GroupError::DecryptFailed
        ));
    }

    #[test]
    fn crypto_error_mapping() {
        assert!(matches!(
            GroupError::from(palaver_crypto::CryptoError::SignatureVerification),
            GroupError::BadSignature
        ));
    }
}
