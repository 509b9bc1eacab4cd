//! Extended identity keypairs.
//!
//! Every group participant owns an extended keypair: an X25519 encryption
//! half and an Ed25519 signing half. The group itself is identified by an
//! Ed25519 keypair whose verifying key is the public chat id; the chat's
//! encryption identity is derived from the chat id by Montgomery
//! conversion, so any joiner can compute it from the id alone.

use palaver_types::identity::ExtendedPublicKey;
use palaver_types::ChatId;

use crate::ed25519;
use crate::x25519::{X25519KeyPair, X25519StaticSecret};
use crate::Result;

/// A full extended keypair: both secret halves plus the public identity.
pub struct ExtendedKeyPair {
    /// X25519 encryption secret.
    pub enc_secret: X25519StaticSecret,
    /// Ed25519 signing secret.
    pub sig_secret: ed25519::SigningKey,
    /// The public identity.
    pub public: ExtendedPublicKey,
}

impl ExtendedKeyPair {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let enc = X25519KeyPair::generate();
        let sig = ed25519::KeyPair::generate();
        let public = ExtendedPublicKey::new(enc.public, sig.verifying_key.to_bytes());
        Self {
            enc_secret: enc.secret,
            sig_secret: sig.signing_key,
            public,
        }
    }

    /// Rebuild from stored secret halves.
    ///
    /// # Errors
    ///
    /// Never fails for well-formed 32-byte inputs; kept fallible to match
    /// the loading paths that feed it untrusted bytes.
    pub fn from_secret_bytes(enc_secret: [u8; 32], sig_secret: &[u8; 32]) -> Result<Self> {
        let enc_secret = X25519StaticSecret::from_bytes(enc_secret);
        let sig_secret = ed25519::SigningKey::from_bytes(sig_secret);
        let public = ExtendedPublicKey::new(
            enc_secret.public_key(),
            sig_secret.verifying_key().to_bytes(),
        );
        Ok(Self {
            enc_secret,
            sig_secret,
            public,
        })
    }
}

/// Expand a chat id into the chat's extended public key.
///
/// The signing half is the chat id itself; the encryption half is its
/// image on Curve25519.
///
/// # Errors
///
/// Returns [`crate::CryptoError::InvalidKey`] if the chat id is not a
/// valid Ed25519 point.
pub fn expand_chat_id(chat_id: &ChatId) -> Result<ExtendedPublicKey> {
    let sig_key = ed25519::VerifyingKey::from_bytes(chat_id)?;
    Ok(ExtendedPublicKey::new(sig_key.to_encryption_key(), *chat_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_is_consistent() {
        let pair = ExtendedKeyPair::generate();
        assert_eq!(pair.enc_secret.public_key(), pair.public.enc);
        assert_eq!(pair.sig_secret.verifying_key().to_bytes(), pair.public.sig);
    }

    #[test]
    fn secret_bytes_round_trip() {
        let pair = ExtendedKeyPair::generate();
        let restored = ExtendedKeyPair::from_secret_bytes(
            pair.enc_secret.to_bytes(),
            &pair.sig_secret.to_bytes(),
        )
        .expect("valid secrets");
        assert_eq!(restored.public, pair.public);
    }

    #[test]
    fn chat_id_expansion_matches_keypair() {
        let chat_key = ed25519::KeyPair::generate();
        let chat_id = chat_key.verifying_key.to_bytes();
        let expanded = expand_chat_id(&chat_id).expect("valid chat id");
        assert_eq!(expanded.sig, chat_id);
        assert_eq!(expanded.enc, chat_key.verifying_key.to_encryption_key());
    }
}
