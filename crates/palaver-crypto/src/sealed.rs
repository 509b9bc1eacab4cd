//! Static-key sealed boxes for handshake packets.
//!
//! Handshake packets are exchanged before a session key exists, so they
//! are encrypted to the recipient's *long-term* encryption key:
//!
//! ```text
//! Seal(recipient_pk, sender_sk, nonce, plaintext):
//!   1. shared = X25519(sender_sk, recipient_pk)
//!   2. key    = BLAKE3::derive_key("Palaver v1 handshake-key", shared)
//!   3. return XChaCha20-Poly1305.Encrypt(key, nonce, plaintext)
//! ```
//!
//! Both sides know each other's long-term keys, so unlike an ECIES
//! construction no ephemeral key is carried; the sender's public key is
//! already part of the packet framing.

use crate::aead;
use crate::hash::{self, contexts};
use crate::x25519::X25519StaticSecret;
use crate::Result;

/// Derive the handshake box key shared between two long-term keypairs.
pub fn box_key(self_secret: &X25519StaticSecret, peer_public: &[u8; 32]) -> [u8; 32] {
    let shared = self_secret.diffie_hellman(peer_public);
    hash::derive_key(contexts::HANDSHAKE_KEY, shared.as_bytes())
}

/// Encrypt a handshake plaintext to `recipient_pk`.
///
/// # Errors
///
/// Propagates AEAD failures from [`aead::encrypt`].
pub fn seal(
    recipient_pk: &[u8; 32],
    sender_sk: &X25519StaticSecret,
    nonce: &[u8; aead::NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    aead::encrypt(&box_key(sender_sk, recipient_pk), nonce, plaintext)
}

/// Decrypt a handshake ciphertext from `sender_pk`.
///
/// # Errors
///
/// Returns [`crate::CryptoError::AeadDecryption`] if authentication fails.
pub fn open(
    sender_pk: &[u8; 32],
    recipient_sk: &X25519StaticSecret,
    nonce: &[u8; aead::NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    aead::decrypt(&box_key(recipient_sk, sender_pk), nonce, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::X25519KeyPair;

    #[test]
    fn seal_open_round_trip() {
        let alice = X25519KeyPair::generate();
        let bob = X25519KeyPair::generate();
        let nonce = aead::random_nonce();

        let sealed = seal(&bob.public, &alice.secret, &nonce, b"handshake request")
            .expect("seal");
        let opened = open(&alice.public, &bob.secret, &nonce, &sealed).expect("open");
        assert_eq!(opened, b"handshake request");
    }

    #[test]
    fn third_party_cannot_open() {
        let alice = X25519KeyPair::generate();
        let bob = X25519KeyPair::generate();
        let eve = X25519KeyPair::generate();
        let nonce = aead::random_nonce();

        let sealed = seal(&bob.public, &alice.secret, &nonce, b"secret").expect("seal");
        assert!(open(&alice.public, &eve.secret, &nonce, &sealed).is_err());
    }
}
