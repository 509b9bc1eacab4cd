//! Identity records shared between the wire codec and the group core.

use serde::{Deserialize, Serialize};

use crate::{PublicKey, SigPublicKey};

/// An extended public key: the X25519 encryption half followed by the
/// Ed25519 signing half. This is the public identity of a peer within a
/// group, and of the group founder in the shared state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPublicKey {
    /// X25519 encryption public key.
    pub enc: PublicKey,
    /// Ed25519 signing public key.
    pub sig: SigPublicKey,
}

impl ExtendedPublicKey {
    /// Build from the two halves.
    pub fn new(enc: PublicKey, sig: SigPublicKey) -> Self {
        Self { enc, sig }
    }
}

/// The information a joining user supplies about itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelfPeerInfo {
    /// Display nick, 1..=MAX_NICK_SIZE bytes.
    pub nick: Vec<u8>,
    /// Initial user status.
    pub status: crate::peer::PeerStatus,
}

impl SelfPeerInfo {
    /// True if the nick is non-empty and within bounds.
    pub fn is_valid(&self) -> bool {
        !self.nick.is_empty() && self.nick.len() <= crate::MAX_NICK_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerStatus;

    #[test]
    fn self_info_validity() {
        let good = SelfPeerInfo {
            nick: b"alice".to_vec(),
            status: PeerStatus::None,
        };
        assert!(good.is_valid());

        let empty = SelfPeerInfo {
            nick: Vec::new(),
            status: PeerStatus::None,
        };
        assert!(!empty.is_valid());

        let oversize = SelfPeerInfo {
            nick: vec![b'a'; crate::MAX_NICK_SIZE + 1],
            status: PeerStatus::None,
        };
        assert!(!oversize.is_valid());
    }
}
