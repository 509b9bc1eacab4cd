//! # palaver-wire
//!
//! Wire codec for the Palaver group-chat protocol: outer packet framing,
//! authenticated encryption, padding, and the canonical big-endian
//! packing of every fixed-layout record.
//!
//! ## Outer framing
//!
//! ```text
//! [1]  packet kind (LOSSLESS | LOSSY | HANDSHAKE)
//! [4]  chat id hash (Jenkins one-at-a-time, big-endian)
//! [32] sender encryption public key
//! [24] nonce
//! [..] authenticated-encrypted payload
//! ```
//!
//! For LOSSLESS/LOSSY the payload is encrypted with the per-peer session
//! key and its plaintext is `[padding zeros | inner kind (1) |
//! message id (8, lossless only) | body]`. Padding aligns the packet to
//! an 8-byte boundary modulo the maximum packet size; the decoder strips
//! leading zero bytes, which is why inner kinds are never zero.
//!
//! For HANDSHAKE the payload is sealed to the recipient's long-term
//! encryption key, since no session key exists yet.

pub mod bytes;
pub mod kinds;
pub mod packet;
pub mod records;

/// Maximum size of any group packet on the wire.
pub const MAX_PACKET_SIZE: usize = palaver_types::MAX_GROUP_PACKET_SIZE;

/// Error types for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Input ended before the expected field.
    #[error("short buffer")]
    ShortBuffer,

    /// AEAD authentication failed.
    #[error("decrypt failed")]
    DecryptFailed,

    /// A record violated its layout or value constraints.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The payload cannot fit in a single packet.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

impl From<palaver_crypto::CryptoError> for WireError {
    fn from(_: palaver_crypto::CryptoError) -> Self {
        WireError::DecryptFailed
    }
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Jenkins one-at-a-time hash over a chat id or public key, used as the
/// 4-byte routing hash in the outer framing.
pub fn jenkins_hash(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in key {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jenkins_is_stable_and_spreads() {
        let a = jenkins_hash(&[0u8; 32]);
        let b = jenkins_hash(&[1u8; 32]);
        assert_eq!(a, jenkins_hash(&[0u8; 32]));
        assert_ne!(a, b);
    }

    #[test]
    fn error_display() {
        assert_eq!(WireError::ShortBuffer.to_string(), "short buffer");
        assert_eq!(
            WireError::MalformedRecord("bad role".into()).to_string(),
            "malformed record: bad role"
        );
    }
}
