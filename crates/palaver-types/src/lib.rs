//! # palaver-types
//!
//! Shared domain types used across the Palaver workspace: key and id
//! aliases, protocol size limits, the closed enumerations of the wire
//! protocol (roles, statuses, connection states), network address
//! records, and host-facing event types.

pub mod events;
pub mod identity;
pub mod network;
pub mod peer;
pub mod state;
pub mod time;

/// A 32-byte X25519 encryption public key.
pub type PublicKey = [u8; 32];

/// A 32-byte Ed25519 signing public key.
pub type SigPublicKey = [u8; 32];

/// A 64-byte detached Ed25519 signature.
pub type SignatureBytes = [u8; 64];

/// The 32-byte public signing key identifying a group chat.
pub type ChatId = [u8; 32];

/// The 4-byte routing hash of a chat id or peer public key.
pub type ChatIdHash = u32;

/// Opaque per-chat peer identifier, randomly assigned at insert.
pub type PeerId = u32;

/// Identifier of a friend on the underlying overlay, assigned by the host.
pub type FriendId = u32;

/// Identifier of a ban sanction, unique within a chat's sanctions list.
pub type BanId = u32;

/// Maximum size of any group packet, encrypted framing included.
pub const MAX_GROUP_PACKET_SIZE: usize = 65_507;

/// Encrypted packet sizes are padded to this alignment.
pub const MAX_PACKET_PADDING: usize = 8;

/// Maximum display nick length in bytes.
pub const MAX_NICK_SIZE: usize = 128;

/// Group name length bounds in bytes.
pub const MIN_GROUP_NAME_SIZE: usize = 1;
pub const MAX_GROUP_NAME_SIZE: usize = 48;

/// Maximum group password length in bytes.
pub const MAX_PASSWORD_SIZE: usize = 32;

/// Maximum topic length in bytes.
pub const MAX_TOPIC_SIZE: usize = 512;

/// Maximum plain/action message length in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1_372;

/// Maximum part message length in bytes.
pub const MAX_PART_MESSAGE_SIZE: usize = 128;

/// Maximum number of moderator entries in the mod list.
pub const MAX_MODERATORS: usize = 128;

/// Capacity of the confirmed-peers reconnect ring.
pub const MAX_CONFIRMED_PEERS: usize = 10;

/// Capacity of the saved outbound friend-invite ring.
pub const MAX_SAVED_INVITES: usize = 10;

/// Format a key or hash prefix for log output.
pub fn fmt_key(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(8)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_formatting() {
        let key = [0xABu8; 32];
        assert_eq!(fmt_key(&key), "abababababababab");
        assert_eq!(fmt_key(&key[..4]), "abababab");
    }
}
