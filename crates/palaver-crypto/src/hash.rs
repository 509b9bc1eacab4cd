//! Domain-separated BLAKE3 hashing for the Palaver protocol.
//!
//! BLAKE3 serves several distinct purposes: the moderator-list hash in the
//! shared state, the sanctions-list checksum, and key derivation for the
//! per-peer session key and the handshake sealed box. Cross-domain
//! collisions are prevented by mandatory domain separation via BLAKE3's
//! built-in mode flags.

/// Registered BLAKE3 context strings. Using an unregistered context
/// string is a protocol violation.
pub mod contexts {
    /// Per-peer symmetric session key from the session-keypair DH secret.
    pub const SESSION_KEY: &str = "Palaver v1 session-key";
    /// Handshake sealed-box key from the long-term-keypair DH secret.
    pub const HANDSHAKE_KEY: &str = "Palaver v1 handshake-key";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[SESSION_KEY, HANDSHAKE_KEY];
}

/// Pure BLAKE3 hash. Used for the moderator-list hash and the sanctions
/// checksum.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive a 32-byte key from `material` under a registered context string.
pub fn derive_key(context: &str, material: &[u8]) -> [u8; 32] {
    debug_assert!(
        contexts::ALL_CONTEXTS.contains(&context),
        "unregistered BLAKE3 context"
    );
    blake3::derive_key(context, material)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash(b"abc"), hash(b"abc"));
        assert_ne!(hash(b"abc"), hash(b"abd"));
    }

    #[test]
    fn contexts_are_domain_separated() {
        let material = [7u8; 32];
        let session = derive_key(contexts::SESSION_KEY, &material);
        let handshake = derive_key(contexts::HANDSHAKE_KEY, &material);
        assert_ne!(session, handshake);
    }
}
